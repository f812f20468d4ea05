//! Backend adapter boundary and the per-driver session.
//!
//! The engine never frames bytes itself. A [`BackendAdapter`] receives a
//! command whose channel placeholders are already substituted plus the
//! formatted value for writes, and returns the raw response text.
//!
//! One [`Session`] exists per driver tree. It owns the backend, applies the
//! exchange timeout and carries the acknowledgement policy. The session sits
//! behind the tree's single `tokio::sync::Mutex`, so holding `&mut Session`
//! is proof that no other exchange is in flight.

use crate::error::{BackendError, InstrError, InstrResult};
use crate::limits::DEFAULT_EXCHANGE_TIMEOUT;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Request/response transport used by a driver tree.
///
/// Implementations should not apply their own timeout, the session bounds
/// every call with the configured exchange timeout.
#[async_trait]
pub trait BackendAdapter: Send {
    /// Issue a command that may change instrument state.
    ///
    /// `template` contains at most one `{}` placeholder, filled with `value`
    /// (see [`substitute`]). Returns the raw response, which may be empty.
    async fn exchange(&mut self, template: &str, value: Option<&str>)
        -> Result<String, BackendError>;

    /// Issue a side-effect-free read.
    async fn query(&mut self, command: &str) -> Result<String, BackendError>;

    /// Release the transport.
    async fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Fill the `{}` placeholder of a resolved template and unescape braces.
pub fn substitute(template: &str, value: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len() + value.map_or(0, str::len));
    let mut chars = template.chars().peekable();
    let mut value = value;
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('{', Some('{')) | ('}', Some('}')) => {
                chars.next();
                out.push(c);
            }
            ('{', Some('}')) => {
                chars.next();
                if let Some(v) = value.take() {
                    out.push_str(v);
                }
            }
            _ => out.push(c),
        }
    }
    out.trim_end().to_string()
}

// =============================================================================
// Acknowledgement
// =============================================================================

/// How a write is confirmed by the instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AckPolicy {
    /// Any response counts as success.
    #[default]
    Ignore,
    /// The response must equal the token (after trimming).
    Expect {
        /// Expected acknowledgement, e.g. `OK`.
        token: String,
    },
    /// Query an error queue after the write. A reply of the form
    /// `0,...` means success; anything else is reported as the rejection
    /// token.
    ErrorQuery {
        /// Error queue query, e.g. `SYST:ERR?`.
        command: String,
    },
}

impl AckPolicy {
    /// Writes must be answered with `token`.
    pub fn expect(token: impl Into<String>) -> Self {
        AckPolicy::Expect {
            token: token.into(),
        }
    }

    /// Poll `command` after each write; an empty or zero code means success.
    pub fn error_query(command: impl Into<String>) -> Self {
        AckPolicy::ErrorQuery {
            command: command.into(),
        }
    }
}

/// Parse an SCPI style `code,"message"` error reply. `None` means no error.
fn scpi_error(reply: &str) -> Option<String> {
    let reply = reply.trim();
    let code = reply.split(',').next().unwrap_or("").trim();
    match code.parse::<i64>() {
        Ok(0) => None,
        _ => Some(reply.to_string()),
    }
}

// =============================================================================
// Session
// =============================================================================

/// Runtime settings of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Bound on every exchange.
    pub timeout: Duration,
    /// When false only options features are cached.
    pub caching_allowed: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
            caching_allowed: true,
        }
    }
}

/// Exclusive access to a driver's backend.
pub struct Session {
    backend: Box<dyn BackendAdapter>,
    options: SessionOptions,
    ack: AckPolicy,
    exchanges: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.options)
            .field("ack", &self.ack)
            .field("exchanges", &self.exchanges)
            .finish()
    }
}

impl Session {
    /// Session over `backend`.
    pub fn new(backend: Box<dyn BackendAdapter>, options: SessionOptions, ack: AckPolicy) -> Self {
        Self {
            backend,
            options,
            ack,
            exchanges: 0,
        }
    }

    /// Options the session was opened with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Number of backend calls issued through this session.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges
    }

    /// Raw exchange, bounded by the session timeout.
    pub async fn exchange(
        &mut self,
        template: &str,
        value: Option<&str>,
        member: &str,
    ) -> InstrResult<String> {
        self.exchanges += 1;
        debug!(member, template, value = ?value, "exchange");
        let timeout = self.options.timeout;
        match tokio::time::timeout(timeout, self.backend.exchange(template, value)).await {
            Ok(result) => result.map_err(|e| backend_failure(e, member)),
            Err(_) => Err(backend_failure(BackendError::Timeout(timeout), member)),
        }
    }

    /// Raw query, bounded by the session timeout.
    pub async fn query(&mut self, command: &str, member: &str) -> InstrResult<String> {
        self.exchanges += 1;
        debug!(member, command, "query");
        let timeout = self.options.timeout;
        match tokio::time::timeout(timeout, self.backend.query(command)).await {
            Ok(result) => result.map_err(|e| backend_failure(e, member)),
            Err(_) => Err(backend_failure(BackendError::Timeout(timeout), member)),
        }
    }

    /// Write and confirm according to the acknowledgement policy.
    pub async fn write(
        &mut self,
        template: &str,
        value: Option<&str>,
        member: &str,
    ) -> InstrResult<String> {
        let response = self.exchange(template, value, member).await?;
        let rejection = match self.ack.clone() {
            AckPolicy::Ignore => None,
            AckPolicy::Expect { token } => {
                let answer = response.trim();
                (answer != token).then(|| answer.to_string())
            }
            AckPolicy::ErrorQuery { command } => {
                let reply = self.query(&command, member).await?;
                scpi_error(&reply)
            }
        };
        match rejection {
            Some(token) => {
                warn!(member, token = %token, "instrument rejected write");
                Err(InstrError::DeviceRejected {
                    member: member.to_string(),
                    token,
                })
            }
            None => Ok(response),
        }
    }

    /// Close the backend.
    pub async fn close(&mut self) -> InstrResult<()> {
        self.backend
            .close()
            .await
            .map_err(|e| InstrError::from_backend(e, "session"))
    }
}

fn backend_failure(err: BackendError, member: &str) -> InstrError {
    if matches!(err, BackendError::Timeout(_)) {
        warn!(member, error = %err, "exchange timed out");
    }
    InstrError::from_backend(err, member)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute() {
        assert_eq!(substitute("FREQ {}", Some("250.50")), "FREQ 250.50");
        assert_eq!(substitute("*RST", None), "*RST");
        assert_eq!(substitute("DATA {{{}}}", Some("1")), "DATA {1}");
        assert_eq!(substitute("OUTP {}", None), "OUTP");
    }

    #[test]
    fn test_scpi_error_parsing() {
        assert_eq!(scpi_error("0,\"No error\""), None);
        assert_eq!(scpi_error("+0,\"No error\""), None);
        assert_eq!(
            scpi_error("-222,\"Data out of range\""),
            Some("-222,\"Data out of range\"".to_string())
        );
        assert!(scpi_error("garbage").is_some());
    }

    #[test]
    fn test_ack_policy_serde() {
        let policy: AckPolicy = toml::from_str("kind = \"expect\"\ntoken = \"OK\"").unwrap();
        assert_eq!(policy, AckPolicy::expect("OK"));
    }
}
