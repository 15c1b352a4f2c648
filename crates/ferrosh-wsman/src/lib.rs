//! WS-Management (MS-WSMV) SOAP plumbing for the PowerShell shell resource:
//! request envelope construction for the shell lifecycle actions and
//! strongly-typed parsing of the responses, including the fault taxonomy.

pub mod duration;
pub mod envelope;
pub mod fault;
pub mod response;
pub mod shell;

pub use duration::Iso8601Duration;
pub use envelope::{Action, OptionSet, SelectorSet, WsMan};
pub use fault::WsmanFault;
pub use response::{
    CommandState, EnumeratedShell, ResponseBody, ResponseEnvelope, StreamChunk, parse_response,
};
pub use shell::{SIGNAL_CTRL_C, SIGNAL_TERMINATE, ShellRemote};

#[derive(Debug, thiserror::Error)]
pub enum WsmanError {
    #[error("SOAP envelope build failed: {0}")]
    Build(#[from] quick_xml::Error),

    #[error("SOAP parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("WS-Management fault: {0}")]
    Fault(Box<WsmanFault>),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("SOAP envelope write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl WsmanError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
