// Crate-wide error type and result alias.
//
// Every fallible operation in the proxy returns `Result<T>`. The error
// kinds mirror what a client can meaningfully react to: pool pressure,
// session staleness, XA protocol violations, admission timeouts and
// backend failures. Housekeeping errors (leak warnings, sweep failures)
// are logged at their call sites and never surface through this type.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OjpError>;

#[derive(Error, Debug, Clone)]
pub enum OjpError {
    #[error("Pool exhausted after {waited:?}: {active} active, {max} max")]
    PoolExhausted {
        waited: Duration,
        active: usize,
        max: usize,
    },

    #[error("Pool resize failed: {0}")]
    PoolResizeFailed(String),

    #[error("Stale session: {0}")]
    StaleSession(String),

    #[error("XA protocol violation: {0}")]
    XaProtocol(String),

    #[error("Xid not associated with any transaction branch: {0}")]
    NotAssociated(String),

    #[error("Transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    #[error("No {class} execution slot became available within {waited:?}")]
    SlotTimeout { class: &'static str, waited: Duration },

    #[error("Unresolved placeholder: ${{{0}}}")]
    UnresolvedPlaceholder(String),

    #[error("Security violation: placeholder name not permitted: {0}")]
    SecurityViolation(String),

    #[error("No registered driver accepts URL: {0}")]
    DriverMissing(String),

    #[error("Backend error [{sqlstate}]: {message}")]
    Backend { sqlstate: String, message: String },

    #[error("Transient backend failure: {0}")]
    TransientBackend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OjpError {
    /// Backend failure with an explicit SQLSTATE, propagated verbatim.
    pub fn backend(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        OjpError::Backend {
            sqlstate: sqlstate.into(),
            message: message.into(),
        }
    }

    /// Whether local recovery (invalidate + one retried borrow) is allowed.
    ///
    /// Everything else is surfaced to the client verbatim; the client owns
    /// retry and backoff decisions.
    pub fn is_transient(&self) -> bool {
        matches!(self, OjpError::TransientBackend(_))
    }

    /// Stable kind name carried on the wire so non-JVM clients can match
    /// without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            OjpError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            OjpError::PoolResizeFailed(_) => "POOL_RESIZE_FAILED",
            OjpError::StaleSession(_) => "STALE_SESSION",
            OjpError::XaProtocol(_) => "XA_PROTOCOL",
            OjpError::NotAssociated(_) => "XA_NOT_ASSOCIATED",
            OjpError::TransactionTimeout(_) => "TRANSACTION_TIMEOUT",
            OjpError::SlotTimeout { .. } => "SLOT_TIMEOUT",
            OjpError::UnresolvedPlaceholder(_) => "UNRESOLVED_PLACEHOLDER",
            OjpError::SecurityViolation(_) => "SECURITY_VIOLATION",
            OjpError::DriverMissing(_) => "DRIVER_MISSING",
            OjpError::Backend { .. } => "BACKEND",
            OjpError::TransientBackend(_) => "TRANSIENT_BACKEND",
            OjpError::Config(_) => "CONFIG",
            OjpError::Wire(_) => "WIRE",
            OjpError::Unavailable(_) => "UNAVAILABLE",
            OjpError::Io(_) => "IO",
            OjpError::Internal(_) => "INTERNAL",
        }
    }
}

impl OjpError {
    /// Rebuilds an error from its wire form. Kinds carrying structured
    /// payloads collapse to their message; the kind stays stable.
    pub fn from_wire(kind: &str, message: String, sqlstate: Option<String>) -> Self {
        match kind {
            "POOL_EXHAUSTED" => OjpError::PoolExhausted {
                waited: Duration::ZERO,
                active: 0,
                max: 0,
            },
            "POOL_RESIZE_FAILED" => OjpError::PoolResizeFailed(message),
            "STALE_SESSION" => OjpError::StaleSession(message),
            "XA_PROTOCOL" => OjpError::XaProtocol(message),
            "XA_NOT_ASSOCIATED" => OjpError::NotAssociated(message),
            "TRANSACTION_TIMEOUT" => OjpError::TransactionTimeout(Duration::ZERO),
            "SLOT_TIMEOUT" => OjpError::SlotTimeout {
                class: "unknown",
                waited: Duration::ZERO,
            },
            "UNRESOLVED_PLACEHOLDER" => OjpError::UnresolvedPlaceholder(message),
            "SECURITY_VIOLATION" => OjpError::SecurityViolation(message),
            "DRIVER_MISSING" => OjpError::DriverMissing(message),
            "BACKEND" => OjpError::Backend {
                sqlstate: sqlstate.unwrap_or_default(),
                message,
            },
            "TRANSIENT_BACKEND" => OjpError::TransientBackend(message),
            "CONFIG" => OjpError::Config(message),
            "WIRE" => OjpError::Wire(message),
            "UNAVAILABLE" => OjpError::Unavailable(message),
            "IO" => OjpError::Io(message),
            _ => OjpError::Internal(message),
        }
    }
}

impl From<std::io::Error> for OjpError {
    fn from(e: std::io::Error) -> Self {
        OjpError::Io(e.to_string())
    }
}
