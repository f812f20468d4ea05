//! End-to-end tests of the catalog drivers over the simulator.

use instr_core::prelude::*;
use instr_core::{load_instrument_config_from_str, ErrorKind};
use instr_sim::catalog::{self, FG100, FG200};
use instr_sim::{ExchangeKind, SimInstrument};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn fg100() -> (Driver, SimInstrument) {
    let sim = SimInstrument::preset(FG100).unwrap();
    let driver = Driver::open(catalog::fg100().unwrap(), sim.backend(), SessionOptions::default());
    (driver, sim)
}

fn fg200() -> (Driver, SimInstrument) {
    let sim = SimInstrument::preset(FG200).unwrap();
    let driver = Driver::open(catalog::fg200().unwrap(), sim.backend(), SessionOptions::default());
    (driver, sim)
}

#[tokio::test]
async fn test_frequency_scenario() {
    let (driver, sim) = fg100();

    driver.set("frequency", 250.5).await.unwrap();
    assert_eq!(sim.commands(), vec!["FREQ 250.50"]);
    assert_eq!(driver.get("frequency").await.unwrap(), Value::Float(250.5));
    assert_eq!(sim.exchange_count(), 1);

    let err = driver.set("frequency", 200_000.0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(sim.exchange_count(), 1);

    assert_eq!(driver.get("waveform").await.unwrap(), Value::from("sine"));
    driver.set("frequency", 50.0).await.unwrap();
    assert!(!driver.is_fresh("waveform"));
    assert_eq!(driver.get("waveform").await.unwrap(), Value::from("sine"));
    assert_eq!(
        sim.commands(),
        vec!["FREQ 250.50", "FUNC?", "FREQ 50.00", "FUNC?"]
    );
}

#[tokio::test]
async fn test_identity_is_read_once() {
    let (driver, sim) = fg100();

    let idn = driver.get("idn").await.unwrap();
    assert_eq!(idn, Value::from("SIMULATED,FG100,0001,1.0"));
    driver.invoke("reset", &[]).await.unwrap();
    driver.clear_all().await;
    driver.get("idn").await.unwrap();

    let idn_reads = sim.commands().iter().filter(|c| *c == "*IDN?").count();
    assert_eq!(idn_reads, 1);
}

#[tokio::test]
async fn test_reset_restores_power_on_state() {
    let (driver, sim) = fg100();

    driver.set("amplitude", 2.5).await.unwrap();
    assert_eq!(sim.register("VOLT?").as_deref(), Some("2.500"));
    driver.invoke("reset", &[]).await.unwrap();
    driver.clear_cache(&["amplitude"]).await.unwrap();
    assert_eq!(driver.get("amplitude").await.unwrap(), Value::Float(1.0));
}

#[tokio::test]
async fn test_options_gate() {
    let (driver, sim) = fg100();

    assert_eq!(driver.get("modulation_depth").await.unwrap(), Value::Float(50.0));
    let err = driver.set("sweep_time", 2.0).await.unwrap_err();
    assert!(matches!(err, InstrError::CapabilityUnavailable { .. }));
    assert!(!sim.commands().iter().any(|c| c.starts_with("SWE")));

    let (fg200, _) = fg200();
    fg200.set("sweep_time", 2.0).await.unwrap();
    assert_eq!(fg200.get("sweep_time").await.unwrap(), Value::Float(2.0));
}

#[tokio::test]
async fn test_status_register_is_never_cached() {
    let (driver, sim) = fg100();

    let status = driver.get("status").await.unwrap();
    assert_eq!(status.as_map().unwrap()["output_on"], Value::Bool(true));
    assert_eq!(status.as_map().unwrap()["error"], Value::Bool(false));

    sim.set_register("STAT?", "6");
    let status = driver.get("status").await.unwrap();
    assert_eq!(status.as_map().unwrap()["output_on"], Value::Bool(false));
    assert_eq!(status.as_map().unwrap()["triggered"], Value::Bool(true));
}

#[tokio::test]
async fn test_outputs() {
    let (driver, sim) = fg100();

    assert_eq!(
        driver.available_channels("output").await.unwrap(),
        vec![ChannelId::Index(1), ChannelId::Index(2)]
    );
    let main = driver.channel("output", "main").await.unwrap();
    assert!(Arc::ptr_eq(&main, &driver.channel("output", 1).await.unwrap()));

    main.set("enabled", true).await.unwrap();
    main.set("load", 10_000).await.unwrap();
    assert_eq!(sim.register("OUTP1?").as_deref(), Some("1"));
    assert_eq!(sim.register("OUTP1:LOAD?").as_deref(), Some("10000"));

    let err = main.set("load", 75).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = driver.channel("output", "rear").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownChannelId);

    let aux = driver.channel("output", "aux").await.unwrap();
    assert_eq!(aux.get("enabled").await.unwrap(), Value::Bool(false));
    assert_eq!(driver.instantiated_channels("output").len(), 2);
}

#[tokio::test]
async fn test_output_level_follows_load() {
    let (driver, sim) = fg100();
    let main = driver.channel("output", "main").await.unwrap();
    sim.clear_log();

    main.set("level", 4.0).await.unwrap();
    assert_eq!(sim.commands(), vec!["OUTP1:LOAD?", "OUTP1:VOLT 4.000"]);
    let err = main.set("level", 7.5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    main.set("load", 10_000).await.unwrap();
    assert!(main.cached_limits("level").is_none());
    main.set("level", 7.5).await.unwrap();
    assert_eq!(sim.register("OUTP1:VOLT?").as_deref(), Some("7.500"));
}

#[tokio::test]
async fn test_output_frequency_is_the_generator_frequency() {
    let (driver, sim) = fg100();
    let aux = driver.channel("output", "aux").await.unwrap();

    aux.set("frequency", 440.0).await.unwrap();
    assert_eq!(sim.register("FREQ?").as_deref(), Some("440.00"));
    assert_eq!(driver.get("frequency").await.unwrap(), Value::Float(440.0));
    assert!(aux.cached("frequency").is_none());
}

#[tokio::test]
async fn test_trigger_requires_bus_source() {
    let (driver, sim) = fg100();
    let trigger = driver.subsystem("trigger").await.unwrap();

    let err = trigger.invoke("fire", &[]).await.unwrap_err();
    assert!(matches!(err, InstrError::PreconditionFailed { .. }));

    trigger.set("source", "BUS").await.unwrap();
    trigger.invoke("fire", &[]).await.unwrap();
    let last = sim.exchanges().pop().unwrap();
    assert_eq!(last.kind, ExchangeKind::Write);
    assert_eq!(last.command, "*TRG");
}

#[tokio::test]
async fn test_fg200_overrides() {
    let (driver, sim) = fg200();

    driver.set("frequency", 150_000.0).await.unwrap();
    driver.set("phase", -90.0).await.unwrap();
    assert_eq!(
        sim.commands(),
        vec!["FREQ 150000.00", "SYST:ERR?", "PHAS -90.000", "SYST:ERR?"]
    );
}

#[tokio::test]
#[traced_test]
async fn test_fg200_error_queue_rejection() {
    let (driver, sim) = fg200();
    sim.reject_header("VOLT", "Data out of range");

    let err = driver.set("amplitude", 5.0).await.unwrap_err();
    match err {
        InstrError::DeviceRejected { member, token } => {
            assert_eq!(member, "SIM-FG200.amplitude");
            assert!(token.starts_with("-222"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(driver.cached("amplitude").is_none());
    assert!(logs_contain("instrument rejected write"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_instrument_times_out() {
    let sim = SimInstrument::preset(FG100).unwrap();
    let options = SessionOptions {
        timeout: Duration::from_millis(200),
        ..SessionOptions::default()
    };
    let driver = Driver::open(catalog::fg100().unwrap(), sim.backend(), options);

    driver.get("frequency").await.unwrap();
    sim.stall_for(Some(Duration::from_secs(5)));
    driver.clear_cache(&["frequency"]).await.unwrap();

    let err = driver.get("frequency").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    sim.stall_for(None);
    assert_eq!(driver.get("frequency").await.unwrap(), Value::Float(1000.0));
}

#[tokio::test]
async fn test_connect_through_registry() {
    let mut registry = DriverRegistry::new();
    instr_sim::register_all(&mut registry);
    assert_eq!(registry.driver_names(), vec![FG100, FG200]);
    assert_eq!(registry.backend_names(), vec!["sim"]);

    let config = load_instrument_config_from_str(
        r#"
driver = "SIM-FG200"
backend = "sim"

[interfaces.sim]
preset = "SIM-FG200"

[interfaces.sim.registers]
"FREQ?" = "12345.00"
"#,
    )
    .unwrap();

    let driver = registry.connect(&config).await.unwrap();
    assert_eq!(driver.get("frequency").await.unwrap(), Value::Float(12345.0));
    assert!(Arc::ptr_eq(driver.schema(), &registry.schema(FG200).unwrap()));
    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_registry_rejects_unknown_names() {
    let mut registry = DriverRegistry::new();
    instr_sim::register_all(&mut registry);

    let config = load_instrument_config_from_str("driver = \"SIM-FG999\"\nbackend = \"sim\"").unwrap();
    let err = registry.connect(&config).await.unwrap_err();
    assert!(err.to_string().contains("unknown driver"));

    let config = load_instrument_config_from_str("driver = \"SIM-FG100\"\nbackend = \"gpib\"").unwrap();
    let err = registry.connect(&config).await.unwrap_err();
    assert!(err.to_string().contains("unknown backend"));
}
