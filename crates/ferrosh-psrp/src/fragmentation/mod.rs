//! Fragmenting of outbound messages and strict reassembly of inbound ones.
//!
//! Outbound: each [`PsrpMessage`](crate::PsrpMessage) is split into
//! length-prefixed fragments whose encoded size fits the negotiated budget.
//! Inbound: fragments are reassembled per object id; any deviation from the
//! contiguous 0..n fragment sequence is an error, not a reorder opportunity.

mod defragmenter;
mod fragment;
mod fragmenter;


pub use defragmenter::Defragmenter;
pub use fragment::{Fragment, FRAGMENT_HEADER_LEN};
pub use fragmenter::Fragmenter;
