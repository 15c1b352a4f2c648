//! PSRP-over-WSMan client: runspace pools and pipelines on top of a
//! SPNEGO-authenticated HTTP transport, with WinRM message encryption for
//! plain-HTTP endpoints.
//!
//! The layering mirrors the wire stack: [`transport`] pins HTTP connections
//! (Negotiate needs connection affinity), [`auth`] drives the
//! challenge-response loop and the `multipart/encrypted` wrapping,
//! [`runspace_pool`] and [`pipeline`] hold the PSRP state machines,
//! [`dispatch`] is the single-writer receive loop, and [`Client`] is the
//! stable facade with admission control, retry, and the circuit breaker.

pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod host;
pub mod pipeline;
pub mod retry;
pub mod runspace_pool;
pub mod session;
pub mod transport;

pub use client::Client;
pub use config::{AuthConfig, AuthScheme, ClientConfig, Endpoint, KerberosParams, TlsOptions};
pub use credentials::Credentials;
pub use dispatch::PoolSnapshot;
pub use pipeline::{ExecutionResult, PipelineHandle, PipelineStreams, StreamRecord};
pub use retry::{BreakerConfig, RetryPolicy};
pub use runspace_pool::PoolState;
pub use session::SessionState;

use ferrosh_psrp::FramingError;
use ferrosh_wsman::WsmanFault;

/// The client error taxonomy. Every failure a caller can observe maps to
/// exactly one of these kinds; transient ones answer `retryable()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Validation failure before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP/TLS/HTTP-layer failure.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The server answered 401 after authentication should have been
    /// settled.
    #[error("unauthenticated (HTTP 401)")]
    Unauthenticated,

    /// The server answered 403.
    #[error("forbidden (HTTP 403)")]
    Forbidden,

    /// The SPNEGO/NTLM exchange itself was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// SOAP parse failure or a response missing expected elements.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A WS-Management fault from the server. `operation_timeout` faults
    /// are benign and drive Receive re-issue instead of failing the pool.
    #[error("WS-Management fault: {fault}")]
    WsmanFault {
        fault: Box<WsmanFault>,
        operation_timeout: bool,
    },

    /// Fragment-level invariant violation.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A PSRP message arrived that the current pool/pipeline state cannot
    /// accept.
    #[error("PSRP state error: {0}")]
    PsrpState(String),

    /// The pipeline reached the Failed state; error records attached.
    #[error("pipeline failed: {message}")]
    Pipeline {
        message: String,
        records: Vec<ferrosh_psrp::ErrorRecordMsg>,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    /// Admission control rejected the request (queue full).
    #[error("too many queued pipeline requests")]
    Overloaded,

    /// The circuit breaker is open; calls fail fast until cooldown.
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("SSPI error: {0}")]
    Sspi(#[from] sspi::Error),
}

impl Error {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Kinds the retry policy may re-attempt. Benign WSMan operation
    /// timeouts are handled inside the dispatch loop and are retryable if
    /// they escape to a caller.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Transport { retryable, .. } => *retryable,
            Self::WsmanFault {
                operation_timeout, ..
            } => *operation_timeout,
            _ => false,
        }
    }
}

impl From<ferrosh_wsman::WsmanError> for Error {
    fn from(value: ferrosh_wsman::WsmanError) -> Self {
        match value {
            ferrosh_wsman::WsmanError::Fault(fault) => {
                let operation_timeout = fault.is_operation_timeout();
                Self::WsmanFault {
                    fault,
                    operation_timeout,
                }
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ferrosh_psrp::PsrpError> for Error {
    fn from(value: ferrosh_psrp::PsrpError) -> Self {
        match value {
            ferrosh_psrp::PsrpError::Framing(framing) => Self::Framing(framing),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::transport(value.to_string(), true)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
