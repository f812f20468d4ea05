//! Shared timing limits for instrument sessions.
//!
//! Every exchange with a backend is bounded by the session timeout. The
//! defaults below apply when the instrument configuration does not name one.

use crate::error::{InstrError, InstrResult};
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default timeout for a single backend exchange (2 seconds).
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout in milliseconds, as written in configuration files.
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 2_000;

/// Upper bound accepted for a configured exchange timeout (5 minutes).
///
/// Slow instruments (long sweeps, self calibration) may need tens of seconds,
/// anything above this is treated as a configuration mistake.
pub const MAX_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Validate a configured timeout and convert it into a `Duration`.
pub fn exchange_timeout(timeout_ms: u64) -> InstrResult<Duration> {
    let timeout = Duration::from_millis(timeout_ms);
    if timeout.is_zero() {
        return Err(InstrError::Config("session.timeout_ms must be positive".into()));
    }
    if timeout > MAX_EXCHANGE_TIMEOUT {
        return Err(InstrError::Config(format!(
            "session.timeout_ms={} exceeds maximum of {} ms",
            timeout_ms,
            MAX_EXCHANGE_TIMEOUT.as_millis()
        )));
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_timeout_bounds() {
        assert_eq!(exchange_timeout(250).unwrap(), Duration::from_millis(250));
        assert!(exchange_timeout(0).is_err());
        assert!(exchange_timeout(301_000).is_err());
        assert_eq!(
            exchange_timeout(DEFAULT_EXCHANGE_TIMEOUT_MS).unwrap(),
            DEFAULT_EXCHANGE_TIMEOUT
        );
    }
}
