use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::fragment::{FRAGMENT_HEADER_LEN, Fragment};
use crate::{FramingError, PsrpError, PsrpMessage};

#[derive(Debug)]
struct ReassemblySlot {
    next_fragment_id: u64,
    buffer: Vec<u8>,
}

/// Strict inbound reassembly keyed by object id.
///
/// Receive responses may cut a fragment anywhere, so raw bytes buffer until
/// a whole fragment is available. Fragment ordering, however, is strict:
/// ids must arrive as the contiguous sequence 0..n with the start flag only
/// on 0. Any gap, duplicate end, or stray start is a framing error the
/// dispatch loop treats as fatal for the pool.
#[derive(Debug, Default)]
pub struct Defragmenter {
    pending: Vec<u8>,
    slots: HashMap<u64, ReassemblySlot>,
    finished: HashSet<u64>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw stream bytes. Returns every message completed by this
    /// input; bytes of an unfinished trailing fragment are kept for the
    /// next feed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<PsrpMessage>, PsrpError> {
        self.pending.extend_from_slice(data);

        let mut completed = Vec::new();
        loop {
            if self.pending.len() < FRAGMENT_HEADER_LEN {
                break;
            }

            let declared = u32::from_be_bytes([
                self.pending[17],
                self.pending[18],
                self.pending[19],
                self.pending[20],
            ]) as usize;
            let total = FRAGMENT_HEADER_LEN + declared;
            if self.pending.len() < total {
                break;
            }

            let (fragment, rest) = Fragment::unpack(&self.pending[..total])?;
            debug_assert!(rest.is_empty());
            self.pending.drain(..total);

            trace!(
                object_id = fragment.object_id,
                fragment_id = fragment.fragment_id,
                start = fragment.start,
                end = fragment.end,
                blob_len = fragment.blob.len(),
                "reassembling fragment"
            );

            if let Some(message) = self.accept(fragment)? {
                completed.push(message);
            }
        }

        Ok(completed)
    }

    /// Number of objects still waiting for their end fragment.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// True while either raw bytes or an open object await more input; a
    /// closing pool with partial state lost data.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty() || !self.slots.is_empty()
    }

    fn accept(&mut self, fragment: Fragment) -> Result<Option<PsrpMessage>, PsrpError> {
        let object_id = fragment.object_id;

        if self.finished.contains(&object_id) {
            // The object already delivered its end fragment; anything more
            // for it is corruption.
            return Err(if fragment.end {
                FramingError::DuplicateEnd { object_id }.into()
            } else {
                FramingError::FragmentOutOfOrder {
                    object_id,
                    expected: 0,
                    got: fragment.fragment_id,
                }
                .into()
            });
        }

        // Fast path: self-contained message.
        if fragment.start && fragment.end {
            if self.slots.contains_key(&object_id) {
                return Err(FramingError::UnexpectedStart {
                    object_id,
                    fragment_id: fragment.fragment_id,
                }
                .into());
            }
            self.finished.insert(object_id);
            return PsrpMessage::parse(&fragment.blob).map(Some);
        }

        match self.slots.get_mut(&object_id) {
            None => {
                if !fragment.start || fragment.fragment_id != 0 {
                    return Err(FramingError::MissingStart { object_id }.into());
                }
                self.slots.insert(
                    object_id,
                    ReassemblySlot {
                        next_fragment_id: 1,
                        buffer: fragment.blob,
                    },
                );
                Ok(None)
            }
            Some(slot) => {
                if fragment.start {
                    return Err(FramingError::UnexpectedStart {
                        object_id,
                        fragment_id: fragment.fragment_id,
                    }
                    .into());
                }
                if fragment.fragment_id != slot.next_fragment_id {
                    return Err(FramingError::FragmentOutOfOrder {
                        object_id,
                        expected: slot.next_fragment_id,
                        got: fragment.fragment_id,
                    }
                    .into());
                }

                slot.next_fragment_id += 1;
                slot.buffer.extend_from_slice(&fragment.blob);

                if !fragment.end {
                    return Ok(None);
                }

                let buffer = std::mem::take(&mut slot.buffer);
                self.slots.remove(&object_id);
                self.finished.insert(object_id);
                PsrpMessage::parse(&buffer).map(Some)
            }
        }
    }
}
