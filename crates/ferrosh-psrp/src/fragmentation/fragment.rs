use base64::Engine;
use byteorder::{BigEndian, WriteBytesExt};

use crate::FramingError;

/// Encoded fragment header: object id (8) + fragment id (8) + flags (1) +
/// blob length (4).
pub const FRAGMENT_HEADER_LEN: usize = 21;

const FLAG_START: u8 = 0x01;
const FLAG_END: u8 = 0x02;

/// One wire-level fragment of a PSRP message (MS-PSRP 2.2.4).
#[derive(Debug, Clone)]
pub struct Fragment {
    pub object_id: u64,
    pub fragment_id: u64,
    pub start: bool,
    pub end: bool,
    pub blob: Vec<u8>,
}

fn array_at<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

impl Fragment {
    pub fn new(object_id: u64, fragment_id: u64, blob: Vec<u8>, start: bool, end: bool) -> Self {
        Self {
            object_id,
            fragment_id,
            start,
            end,
            blob,
        }
    }

    /// Encoded size of this fragment on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAGMENT_HEADER_LEN + self.blob.len()
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_len());

        // Vec writes are infallible.
        let _ = buffer.write_u64::<BigEndian>(self.object_id);
        let _ = buffer.write_u64::<BigEndian>(self.fragment_id);

        let mut flags = 0u8;
        if self.start {
            flags |= FLAG_START;
        }
        if self.end {
            flags |= FLAG_END;
        }
        buffer.push(flags);

        let _ = buffer.write_u32::<BigEndian>(self.blob.len() as u32);
        buffer.extend_from_slice(&self.blob);

        buffer
    }

    pub fn pack_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.pack())
    }

    /// Decode one fragment from the front of `data`, returning it together
    /// with the remaining bytes.
    pub fn unpack(data: &[u8]) -> Result<(Self, &[u8]), FramingError> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(FramingError::Truncated {
                needed: FRAGMENT_HEADER_LEN,
                available: data.len(),
            });
        }

        let object_id = u64::from_be_bytes(array_at(data, 0));
        let fragment_id = u64::from_be_bytes(array_at(data, 8));
        let flags = data[16];
        let blob_len = u32::from_be_bytes(array_at(data, 17)) as usize;

        let remaining = &data[FRAGMENT_HEADER_LEN..];
        if remaining.len() < blob_len {
            return Err(FramingError::PayloadOverrun {
                declared: blob_len,
                available: remaining.len(),
            });
        }

        let fragment = Self {
            object_id,
            fragment_id,
            start: flags & FLAG_START != 0,
            end: flags & FLAG_END != 0,
            blob: remaining[..blob_len].to_vec(),
        };

        Ok((fragment, &remaining[blob_len..]))
    }
}
