//! Driver schemas for the simulated function generators.
//!
//! - `SIM-FG100`: single generator with an options-gated modulation feature,
//!   a trigger subsystem and two outputs, acknowledging writes with `OK`.
//!   An output's level range depends on its load: 5 V into 50 Ω, 10 V into
//!   high impedance.
//! - `SIM-FG200`: derived from the FG100 with a wider frequency range, a
//!   phase feature and error-queue acknowledgement.

use instr_core::prelude::*;
use instr_core::registry::DriverRegistry;
use std::sync::Arc;

use crate::sim::SimBackendFactory;

/// Base function generator.
pub const FG100: &str = "SIM-FG100";
/// Wider range derivative of [`FG100`].
pub const FG200: &str = "SIM-FG200";

const FG100_REGISTERS: &[(&str, &str)] = &[
    ("*IDN?", "SIMULATED,FG100,0001,1.0"),
    ("*OPT?", "mod=1,sweep=0"),
    ("FREQ?", "1000.00"),
    ("FUNC?", "SIN"),
    ("VOLT?", "1.000"),
    ("STAT?", "1"),
    ("MOD:DEPT?", "50.0"),
    ("OUTP:LIST?", "1,2"),
    ("TRIG:SOUR?", "IMM"),
    ("TRIG:LEV?", "0.000"),
    ("OUTP1?", "0"),
    ("OUTP2?", "0"),
    ("OUTP1:OFFS?", "0.000"),
    ("OUTP2:OFFS?", "0.000"),
    ("OUTP1:LOAD?", "50"),
    ("OUTP2:LOAD?", "50"),
    ("OUTP1:VOLT?", "1.000"),
    ("OUTP2:VOLT?", "1.000"),
];

const FG200_REGISTERS: &[(&str, &str)] = &[
    ("*IDN?", "SIMULATED,FG200,0002,1.1"),
    ("*OPT?", "mod=1,sweep=1"),
    ("SWE:TIME?", "1.000"),
    ("PHAS?", "0.000"),
];

/// Power-on query responses of a catalog model.
pub fn preset_registers(model: &str) -> Option<Vec<(&'static str, &'static str)>> {
    match model {
        FG100 => Some(FG100_REGISTERS.to_vec()),
        FG200 => {
            let mut registers = FG100_REGISTERS.to_vec();
            for &(query, reply) in FG200_REGISTERS {
                match registers.iter_mut().find(|(q, _)| *q == query) {
                    Some(slot) => slot.1 = reply,
                    None => registers.push((query, reply)),
                }
            }
            Some(registers)
        }
        _ => None,
    }
}

/// Write acknowledgement sent by a catalog model.
pub fn preset_ack(model: &str) -> &'static str {
    match model {
        FG200 => "",
        _ => "OK",
    }
}

// =============================================================================
// Schemas
// =============================================================================

fn trigger() -> InstrResult<NodeDecl> {
    Ok(NodeDecl::new()
        .feature(
            Feature::new("source")
                .getter("TRIG:SOUR?")
                .setter("TRIG:SOUR {}")
                .one_of(["IMM", "EXT", "BUS"]),
        )
        .feature(
            Feature::new("level")
                .getter("TRIG:LEV?")
                .setter("TRIG:LEV {:.3f}")
                .float(FloatLimits::range(-5.0, 5.0)?),
        )
        .action(
            Action::new("fire", CommandOperation::write("*TRG")?)
                .check(FeatureCheck::equals("source", "BUS")),
        ))
}

fn output_level() -> DerivedLimits {
    DerivedLimits::new(["load"], |values| {
        let max = match values.get("load") {
            Some(Value::Int(50)) => 5.0,
            _ => 10.0,
        };
        Ok(Limits::Float(FloatLimits::range(0.0, max)?))
    })
}

fn output() -> InstrResult<NodeDecl> {
    Ok(NodeDecl::new()
        .limits("level", output_level())
        .feature(
            Feature::new("enabled")
                .getter("OUTP{ch_id}?")
                .setter("OUTP{ch_id} {}")
                .boolean(),
        )
        .feature(
            Feature::new("offset")
                .getter("OUTP{ch_id}:OFFS?")
                .setter("OUTP{ch_id}:OFFS {:.3f}")
                .float(FloatLimits::range(-5.0, 5.0)?),
        )
        .feature(
            Feature::new("load")
                .getter("OUTP{ch_id}:LOAD?")
                .setter("OUTP{ch_id}:LOAD {}")
                .one_of([50, 10_000])
                .discard_limits(["level"]),
        )
        .feature(
            Feature::new("level")
                .getter("OUTP{ch_id}:VOLT?")
                .setter("OUTP{ch_id}:VOLT {:.3f}")
                .float(FloatLimits::range(0.0, 10.0)?)
                .limits("level"),
        )
        .feature(Feature::alias("frequency", ".frequency", true)))
}

/// `SIM-FG100` schema.
pub fn fg100() -> InstrResult<Arc<DriverSchema>> {
    DriverSchema::builder(FG100)
        .ack(AckPolicy::expect("OK"))
        .feature(
            Feature::new("idn")
                .getter("*IDN?")
                .text()
                .cache(CachePolicy::InstanceLifetime),
        )
        .feature(Feature::options("opt", "*OPT?"))
        .feature(
            Feature::new("frequency")
                .getter("FREQ?")
                .setter("FREQ {:.2f}")
                .float(FloatLimits::range(1.0, 100_000.0)?)
                .dependents(["waveform"]),
        )
        .feature(
            Feature::new("waveform")
                .getter("FUNC?")
                .setter("FUNC {}")
                .mapping(Mapping::symmetric([
                    ("sine", "SIN"),
                    ("square", "SQU"),
                    ("ramp", "RAMP"),
                ])),
        )
        .feature(
            Feature::new("amplitude")
                .getter("VOLT?")
                .setter("VOLT {:.3f}")
                .float(FloatLimits::range(0.01, 10.0)?),
        )
        .feature(
            Feature::new("status")
                .getter("STAT?")
                .register(["output_on", "triggered", "error"])
                .cache(CachePolicy::None),
        )
        .feature(
            Feature::new("modulation_depth")
                .getter("MOD:DEPT?")
                .setter("MOD:DEPT {:.1f}")
                .float(FloatLimits::range(0.0, 100.0)?)
                .gate("opt['mod'] == 1"),
        )
        .feature(
            Feature::new("sweep_time")
                .getter("SWE:TIME?")
                .setter("SWE:TIME {:.3f}")
                .float(FloatLimits::range(0.001, 500.0)?)
                .gate("opt['sweep'] == 1"),
        )
        .action(Action::new("reset", CommandOperation::write("*RST")?))
        .action(
            Action::new("list_outputs", CommandOperation::query("OUTP:LIST?")?)
                .returns(Returns::list_of(Validator::Int(None))),
        )
        .subsystem(Subsystem::new("trigger", trigger()?))
        .channel(
            Channel::new("output", output()?)
                .listed_by("list_outputs")
                .alias("main", 1)
                .alias("aux", 2),
        )
        .build()
}

/// `SIM-FG200` schema, derived from [`fg100`].
pub fn fg200() -> InstrResult<Arc<DriverSchema>> {
    fg100()?
        .derive(FG200)
        .ack(AckPolicy::error_query("SYST:ERR?"))
        .override_feature(
            "frequency",
            FeatureOverride::new()
                .validator(Validator::Float(Some(FloatLimits::range(1.0, 200_000.0)?))),
        )
        .feature(
            Feature::new("phase")
                .getter("PHAS?")
                .setter("PHAS {:.3f}")
                .float(FloatLimits::range(-360.0, 360.0)?),
        )
        .build()
}

/// Register the catalog drivers and the `sim` backend.
pub fn register_all(registry: &mut DriverRegistry) {
    registry.register_driver(FG100, fg100);
    registry.register_driver(FG200, fg200);
    registry.register_backend(SimBackendFactory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_schemas_build() {
        let fg100 = fg100().unwrap();
        assert!(fg100.root().feature("phase").is_none());
        let fg200 = fg200().unwrap();
        assert!(fg200.root().feature("phase").is_some());
        assert!(fg200.root().channel("output").is_some());
        assert_eq!(fg200.ack(), &AckPolicy::error_query("SYST:ERR?"));
    }

    #[test]
    fn test_fg200_preset_overrides_fg100() {
        let registers = preset_registers(FG200).unwrap();
        let opt = registers.iter().find(|(q, _)| *q == "*OPT?").unwrap();
        assert_eq!(opt.1, "mod=1,sweep=1");
        assert!(registers.iter().any(|(q, _)| *q == "FREQ?"));
        assert!(preset_registers("SIM-XX").is_none());
    }
}
