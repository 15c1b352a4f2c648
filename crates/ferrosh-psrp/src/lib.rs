//! PSRP wire layer: message headers, fragment framing, and the CLIXML
//! control payloads a client needs to drive a remote runspace pool.
//!
//! General CLIXML (de)serialization is deliberately not provided; data-plane
//! payloads travel as opaque bytes and only the handful of control messages
//! the pool state machine consumes are built and read here.

pub mod control;
pub mod fragmentation;
pub mod message;
pub mod script;

mod clixml;

pub use control::*;
pub use fragmentation::{Defragmenter, Fragment, Fragmenter, FRAGMENT_HEADER_LEN};
pub use message::{Destination, MessageType, PsrpMessage};
pub use script::encode_script_utf16le_base64;

/// Fragment-level invariant violations. Each failure mode gets its own
/// variant so the dispatch layer can report precisely what broke.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("fragment truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("fragment payload overruns buffer: declared {declared} bytes, {available} remain")]
    PayloadOverrun { declared: usize, available: usize },

    #[error("object {object_id}: expected fragment {expected}, got {got}")]
    FragmentOutOfOrder {
        object_id: u64,
        expected: u64,
        got: u64,
    },

    #[error("object {object_id}: first fragment is missing the start flag")]
    MissingStart { object_id: u64 },

    #[error("object {object_id}: start flag on fragment {fragment_id}")]
    UnexpectedStart { object_id: u64, fragment_id: u64 },

    #[error("object {object_id}: end flag seen twice")]
    DuplicateEnd { object_id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PsrpError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: 0x{0:08x}")]
    UnknownMessageType(u32),

    #[error("CLIXML payload error: {0}")]
    Payload(String),

    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
