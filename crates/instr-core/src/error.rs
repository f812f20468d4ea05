//! Error types for attribute resolution.
//!
//! `InstrError` is the single error type returned by every resolution
//! operation (`get`, `set`, `invoke`, child lookup) and by schema
//! declaration. Backend adapters report failures with [`BackendError`],
//! which is converted into `InstrError` with the member being resolved
//! attached as context.
//!
//! ## Error Hierarchy
//!
//! - **Declaration errors** (`Declaration`, `GateSyntax`): raised while a
//!   driver schema is built, never at runtime.
//! - **Pre-I/O rejections** (`Validation`, `CapabilityUnavailable`,
//!   `PreconditionFailed`, `UnknownChannelId`, `UnknownMember`, ...): raised
//!   before anything reaches the backend. Cache state is untouched.
//! - **Exchange failures** (`ResponseFormat`, `DeviceRejected`,
//!   `CommunicationTimeout`, `Communication`): raised after the backend was
//!   involved. Cache state is left exactly as before the call so a caller
//!   may retry.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Kinds
// =============================================================================

/// Coarse classification of an [`InstrError`], mainly for logging and for
/// callers deciding whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Value rejected before any exchange.
    Validation,
    /// Malformed gate expression.
    GateSyntax,
    /// Gate evaluated false.
    CapabilityUnavailable,
    /// Check evaluated false.
    PreconditionFailed,
    /// Response could not be decoded.
    ResponseFormat,
    /// Write not acknowledged.
    DeviceRejected,
    /// Exchange timed out.
    Timeout,
    /// Transport failure.
    Communication,
    /// Channel id not offered by the instrument.
    UnknownChannelId,
    /// Unknown member, wrong kind or bad path.
    Lookup,
    /// Invalid driver declaration.
    Declaration,
    /// Invalid configuration.
    Configuration,
    /// Node outlived its driver.
    Detached,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::GateSyntax => "gate_syntax",
            ErrorKind::CapabilityUnavailable => "capability_unavailable",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::ResponseFormat => "response_format",
            ErrorKind::DeviceRejected => "device_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Communication => "communication",
            ErrorKind::UnknownChannelId => "unknown_channel_id",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Declaration => "declaration",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Detached => "detached",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Backend Errors
// =============================================================================

/// Failure reported by a [`BackendAdapter`](crate::session::BackendAdapter).
#[derive(Error, Debug)]
pub enum BackendError {
    /// The exchange did not complete within the session timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Transport level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device answered something the transport could not frame, or
    /// refused a command at the protocol level.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,
}

// =============================================================================
// Resolution Errors
// =============================================================================

/// Convenience alias for results using [`InstrError`].
pub type InstrResult<T> = std::result::Result<T, InstrError>;

/// Primary error type for the resolution engine.
///
/// Every variant that concerns a member carries its full path
/// (e.g. `SIM-FG100.output[1].offset`) so that errors surfacing from deep
/// inside a channel remain attributable.
///
/// # Error Categories
///
/// 1. **Declaration** - `Declaration`, `GateSyntax`
///    - Raised by [`DriverSchema::build`](crate::schema::DriverSchema::build)
///    - Permanent: the driver declaration must be fixed
///
/// 2. **Rejected before I/O** - `Validation`, `CapabilityUnavailable`,
///    `PreconditionFailed`, `UnknownChannelId`, `UnknownMember`,
///    `WrongMemberKind`, `Unsupported`, `InvalidPath`
///    - No exchange was issued, no cache entry was modified
///    - Recovery: change the request
///
/// 3. **Exchange failures** - `ResponseFormat`, `DeviceRejected`,
///    `CommunicationTimeout`, `Communication`
///    - Cache state is unchanged, a retry by the caller is safe
///    - Only `CommunicationTimeout` and `Communication` are considered
///      transient, see [`InstrError::is_transient`]
///
/// # Example
///
/// ```rust,ignore
/// match driver.set("frequency", 200_000.0).await {
///     Err(InstrError::Validation { member, message }) => eprintln!("{member}: {message}"),
///     Err(e) if e.is_transient() => retry_later(),
///     other => other?,
/// }
/// ```
#[derive(Error, Debug)]
pub enum InstrError {
    /// A value handed to `set` or `invoke` does not satisfy the member's
    /// validator. Raised before any I/O.
    #[error("Validation failed for {member}: {message}")]
    Validation {
        /// Full path of the member.
        member: String,
        /// Human readable reason.
        message: String,
    },

    /// A gate expression could not be parsed. Raised at declaration time.
    #[error("Invalid gate expression '{gate}': {message}")]
    GateSyntax {
        /// Source text of the gate.
        gate: String,
        /// Parser diagnostic.
        message: String,
    },

    /// The options gate guarding a member evaluated to false.
    ///
    /// **Error Type**: Permanent for the lifetime of the node, the gate
    /// result is memoized.
    #[error("{member} is not available on this instrument (requires {gate})")]
    CapabilityUnavailable {
        /// Full path of the member.
        member: String,
        /// Source text of the failing gate.
        gate: String,
    },

    /// A check attached to the member did not hold.
    #[error("Precondition failed for {member}: {check}")]
    PreconditionFailed {
        /// Full path of the member.
        member: String,
        /// Description of the failing check.
        check: String,
    },

    /// The raw response could not be converted to a value.
    #[error("Unexpected response for {member}: '{response}' ({message})")]
    ResponseFormat {
        /// Full path of the member.
        member: String,
        /// Raw response as received.
        response: String,
        /// Conversion diagnostic.
        message: String,
    },

    /// The device negatively acknowledged a write.
    #[error("Device rejected {member}: {token}")]
    DeviceRejected {
        /// Full path of the member.
        member: String,
        /// Error token reported by the device.
        token: String,
    },

    /// The exchange did not complete in time.
    ///
    /// **Error Type**: Transient.
    #[error("Timed out after {timeout:?} while accessing {member}")]
    CommunicationTimeout {
        /// Full path of the member.
        member: String,
        /// Timeout in force for the exchange.
        timeout: Duration,
    },

    /// Transport failure other than a timeout.
    ///
    /// **Error Type**: Transient.
    #[error("Communication error while accessing {member}: {message}")]
    Communication {
        /// Full path of the member.
        member: String,
        /// Backend diagnostic.
        message: String,
    },

    /// Neither a known channel id nor a declared alias.
    #[error("Unknown id '{id}' for channel {family}")]
    UnknownChannelId {
        /// Full path of the channel family.
        family: String,
        /// Id or alias as requested.
        id: String,
    },

    /// No member with this name is declared on the node.
    #[error("{node} has no member named '{member}'")]
    UnknownMember {
        /// Path of the node.
        node: String,
        /// Requested member name.
        member: String,
    },

    /// A member exists but is not of the requested kind.
    #[error("{node}.{member} is not a {expected}")]
    WrongMemberKind {
        /// Path of the node.
        node: String,
        /// Requested member name.
        member: String,
        /// Kind the caller asked for.
        expected: &'static str,
    },

    /// Reading a write-only feature or writing a read-only one.
    #[error("{member} does not support {operation}")]
    Unsupported {
        /// Full path of the member.
        member: String,
        /// `"get"` or `"set"`.
        operation: &'static str,
    },

    /// A member path could not be parsed.
    #[error("Invalid member path '{path}': {message}")]
    InvalidPath {
        /// Path as given.
        path: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A node whose ancestors were dropped was used.
    #[error("{node} is detached from its driver")]
    Detached {
        /// Path of the node.
        node: String,
    },

    /// Malformed driver declaration (duplicate member, bad template,
    /// dangling dependent, ...).
    #[error("Declaration error: {0}")]
    Declaration(String),

    /// Instrument configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver or backend lookup failed in the registry.
    #[error("Registry error: {0}")]
    Registry(String),
}

impl InstrError {
    /// Attach member context to a backend failure.
    pub fn from_backend(err: BackendError, member: impl Into<String>) -> Self {
        let member = member.into();
        match err {
            BackendError::Timeout(timeout) => InstrError::CommunicationTimeout { member, timeout },
            other => InstrError::Communication {
                member,
                message: other.to_string(),
            },
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstrError::Validation { .. } => ErrorKind::Validation,
            InstrError::GateSyntax { .. } => ErrorKind::GateSyntax,
            InstrError::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            InstrError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            InstrError::ResponseFormat { .. } => ErrorKind::ResponseFormat,
            InstrError::DeviceRejected { .. } => ErrorKind::DeviceRejected,
            InstrError::CommunicationTimeout { .. } => ErrorKind::Timeout,
            InstrError::Communication { .. } => ErrorKind::Communication,
            InstrError::UnknownChannelId { .. } => ErrorKind::UnknownChannelId,
            InstrError::UnknownMember { .. }
            | InstrError::WrongMemberKind { .. }
            | InstrError::Unsupported { .. }
            | InstrError::InvalidPath { .. } => ErrorKind::Lookup,
            InstrError::Detached { .. } => ErrorKind::Detached,
            InstrError::Declaration(_) => ErrorKind::Declaration,
            InstrError::Config(_) | InstrError::Registry(_) => ErrorKind::Configuration,
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Communication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_timeout_maps_to_communication_timeout() {
        let err = InstrError::from_backend(
            BackendError::Timeout(Duration::from_millis(50)),
            "FG.frequency",
        );
        assert!(matches!(
            err,
            InstrError::CommunicationTimeout { ref member, timeout }
                if member == "FG.frequency" && timeout == Duration::from_millis(50)
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_backend_protocol_maps_to_communication() {
        let err = InstrError::from_backend(BackendError::Protocol("garbled".into()), "FG.idn");
        assert_eq!(err.kind(), ErrorKind::Communication);
        assert!(err.to_string().contains("garbled"));
    }

    #[test]
    fn test_pre_io_errors_are_not_transient() {
        let err = InstrError::Validation {
            member: "FG.frequency".into(),
            message: "out of bound".into(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind().to_string(), "validation");
    }
}
