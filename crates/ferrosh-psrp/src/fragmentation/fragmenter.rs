use tracing::trace;

use super::fragment::{Fragment, FRAGMENT_HEADER_LEN};
use crate::PsrpMessage;

/// Splits outbound messages into fragments whose *encoded* size stays within
/// the budget derived from the WSMan MaxEnvelopeSize.
///
/// Object ids are assigned from a per-sender monotonic counter; a message
/// that fits the budget becomes a single fragment with both start and end
/// set.
#[derive(Debug)]
pub struct Fragmenter {
    max_blob_size: usize,
    next_object_id: u64,
}

impl Fragmenter {
    /// `max_fragment_size` bounds the encoded fragment (header included) and
    /// must exceed the 21-byte header.
    pub fn new(max_fragment_size: usize) -> Self {
        let max_blob_size = max_fragment_size.saturating_sub(FRAGMENT_HEADER_LEN).max(1);
        Self {
            max_blob_size,
            next_object_id: 1,
        }
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_blob_size + FRAGMENT_HEADER_LEN
    }

    /// Fragment one message. Fragment ids start at 0 and increase by one;
    /// exactly one fragment carries the start flag and exactly one the end
    /// flag.
    pub fn fragment(&mut self, message: &PsrpMessage) -> Vec<Fragment> {
        let object_id = self.next_object_id;
        self.next_object_id += 1;

        let bytes = message.pack();
        let mut fragments = Vec::with_capacity(bytes.len().div_ceil(self.max_blob_size).max(1));

        if bytes.is_empty() {
            fragments.push(Fragment::new(object_id, 0, Vec::new(), true, true));
            return fragments;
        }

        let chunk_count = bytes.len().div_ceil(self.max_blob_size);
        for (fragment_id, chunk) in bytes.chunks(self.max_blob_size).enumerate() {
            let fragment_id = fragment_id as u64;
            fragments.push(Fragment::new(
                object_id,
                fragment_id,
                chunk.to_vec(),
                fragment_id == 0,
                fragment_id == chunk_count as u64 - 1,
            ));
        }

        trace!(
            object_id,
            message_type = ?message.message_type,
            fragment_count = fragments.len(),
            "fragmented outbound message"
        );

        fragments
    }

    /// Fragment several messages and group the packed fragments so that each
    /// group fits one WSMan request body. Consecutive small fragments share a
    /// group; a large message spreads its fragments over as many groups as it
    /// needs.
    ///
    /// Used for the Create negotiation batch (SESSION_CAPABILITY +
    /// INIT_RUNSPACEPOOL travel in one creationXml).
    pub fn fragment_batch(&mut self, messages: &[&PsrpMessage]) -> Vec<Vec<u8>> {
        let budget = self.max_fragment_size();
        let mut groups: Vec<Vec<u8>> = Vec::new();

        for message in messages {
            for fragment in self.fragment(message) {
                let packed = fragment.pack();
                match groups.last_mut() {
                    Some(last) if last.len() + packed.len() <= budget => {
                        last.extend_from_slice(&packed);
                    }
                    _ => groups.push(packed),
                }
            }
        }

        groups
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        // WinRM's default 512 KiB envelope leaves plenty of room after SOAP
        // overhead and base64 expansion.
        Self::new(32 * 1024)
    }
}
