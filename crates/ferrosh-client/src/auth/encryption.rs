//! The WinRM `multipart/encrypted` MIME wrapping used when SOAP travels
//! over plain HTTP. Exact byte discipline matters here: CRLF line endings,
//! no blank line before the binary part, and the closing boundary directly
//! after the ciphertext.

use tracing::{debug, trace};

use crate::auth::AuthProvider;
use crate::{Error, Result};

pub const ENCRYPTION_BOUNDARY: &str = "Encrypted Boundary";

pub const ENCRYPTED_CONTENT_TYPE: &str = "multipart/encrypted;\
protocol=\"application/HTTP-SPNEGO-session-encrypted\";\
boundary=\"Encrypted Boundary\"";

pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// Seal a SOAP payload: provider wrap, then the multipart framing around
/// `[SigLen u32 LE][Signature][EncLen u32 LE][EncryptedBody]`.
pub fn seal(provider: &mut dyn AuthProvider, soap: &[u8]) -> Result<Vec<u8>> {
    let original_len = soap.len();
    let wrapped = provider.wrap(soap)?;

    debug!(
        original_len,
        signature_len = wrapped.signature.len(),
        sealed_len = wrapped.sealed.len(),
        "sealed outbound SOAP body"
    );

    let mut body = Vec::with_capacity(wrapped.sealed.len() + wrapped.signature.len() + 256);

    push_line(&mut body, &format!("--{ENCRYPTION_BOUNDARY}"));
    push_line(&mut body, "Content-Type: application/HTTP-SPNEGO-session-encrypted");
    push_line(
        &mut body,
        &format!("OriginalContent: type=application/soap+xml;charset=UTF-8;Length={original_len}"),
    );
    push_line(&mut body, &format!("--{ENCRYPTION_BOUNDARY}"));
    push_line(&mut body, "Content-Type: application/octet-stream");

    body.extend_from_slice(&(wrapped.signature.len() as u32).to_le_bytes());
    body.extend_from_slice(&wrapped.signature);
    body.extend_from_slice(&(wrapped.sealed.len() as u32).to_le_bytes());
    body.extend_from_slice(&wrapped.sealed);

    body.extend_from_slice(b"--");
    body.extend_from_slice(ENCRYPTION_BOUNDARY.as_bytes());
    body.extend_from_slice(b"--\r\n");

    Ok(body)
}

/// Open a `multipart/encrypted` response body back into cleartext SOAP.
pub fn open(provider: &mut dyn AuthProvider, body: &[u8]) -> Result<String> {
    let binary = extract_binary_part(body)?;

    if binary.len() < 4 {
        return Err(Error::protocol("encrypted part shorter than its length prefix"));
    }
    let signature_len = u32::from_le_bytes([binary[0], binary[1], binary[2], binary[3]]) as usize;
    if binary.len() < 4 + signature_len + 4 {
        return Err(Error::protocol(format!(
            "encrypted part truncated: signature length {signature_len}, {} bytes total",
            binary.len()
        )));
    }

    let signature = &binary[4..4 + signature_len];
    let enc_len_offset = 4 + signature_len;
    let declared = u32::from_le_bytes([
        binary[enc_len_offset],
        binary[enc_len_offset + 1],
        binary[enc_len_offset + 2],
        binary[enc_len_offset + 3],
    ]) as usize;

    let sealed = &binary[enc_len_offset + 4..];
    if sealed.len() != declared {
        return Err(Error::protocol(format!(
            "encrypted body length mismatch: declared {declared}, found {}",
            sealed.len()
        )));
    }

    trace!(
        signature_len,
        sealed_len = sealed.len(),
        "opening encrypted response body"
    );

    let cleartext = provider.unwrap(signature, sealed)?;
    String::from_utf8(cleartext)
        .map_err(|e| Error::protocol(format!("decrypted body is not UTF-8: {e}")))
}

/// True when the response Content-Type announces encrypted multipart.
pub fn is_encrypted_content_type(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .contains("multipart/encrypted")
}

fn push_line(buffer: &mut Vec<u8>, line: &str) {
    buffer.extend_from_slice(line.as_bytes());
    buffer.extend_from_slice(b"\r\n");
}

/// Locate the binary payload between the octet-stream part header and the
/// trailing boundary.
fn extract_binary_part(body: &[u8]) -> Result<&[u8]> {
    const OCTET_HEADER: &[u8] = b"Content-Type: application/octet-stream\r\n";

    let start = find(body, OCTET_HEADER)
        .map(|pos| pos + OCTET_HEADER.len())
        .ok_or_else(|| Error::protocol("multipart body has no octet-stream part"))?;

    let closing = format!("--{ENCRYPTION_BOUNDARY}--");
    let end = find(&body[start..], closing.as_bytes())
        .map(|pos| start + pos)
        .ok_or_else(|| Error::protocol("multipart body has no closing boundary"))?;

    Ok(&body[start..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StepResult, WrappedMessage};

    /// XOR "encryption" with a fixed signature; enough to test framing.
    struct XorProvider;

    impl AuthProvider for XorProvider {
        fn http_scheme(&self) -> &'static str {
            "Negotiate"
        }

        fn step(
            &mut self,
            _input: Option<&[u8]>,
            _bindings: Option<&crate::auth::ChannelBindingToken>,
        ) -> Result<StepResult> {
            Ok(StepResult {
                token: None,
                continue_needed: false,
            })
        }

        fn complete(&self) -> bool {
            true
        }

        fn wrap(&mut self, data: &[u8]) -> Result<WrappedMessage> {
            Ok(WrappedMessage {
                signature: vec![0xAA; 16],
                sealed: data.iter().map(|b| b ^ 0x5A).collect(),
            })
        }

        fn unwrap(&mut self, signature: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
            assert_eq!(signature, &[0xAA; 16]);
            Ok(sealed.iter().map(|b| b ^ 0x5A).collect())
        }

        fn process_response(&mut self, _final_token: &[u8]) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn sealed_body_has_the_exact_multipart_layout() {
        let mut provider = XorProvider;
        let soap = b"<s:Envelope>payload</s:Envelope>";
        let body = seal(&mut provider, soap).expect("seal");

        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--Encrypted Boundary\r\n"));
        assert!(text.contains(
            "Content-Type: application/HTTP-SPNEGO-session-encrypted\r\n"
        ));
        assert!(text.contains(&format!(
            "OriginalContent: type=application/soap+xml;charset=UTF-8;Length={}\r\n",
            soap.len()
        )));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert!(text.ends_with("--Encrypted Boundary--\r\n"));

        // Binary section: sig len, signature, enc len, ciphertext.
        let marker = b"Content-Type: application/octet-stream\r\n";
        let offset = find(&body, marker).unwrap() + marker.len();
        let sig_len =
            u32::from_le_bytes([body[offset], body[offset + 1], body[offset + 2], body[offset + 3]]);
        assert_eq!(sig_len, 16);
        let enc_len_offset = offset + 4 + 16;
        let enc_len = u32::from_le_bytes([
            body[enc_len_offset],
            body[enc_len_offset + 1],
            body[enc_len_offset + 2],
            body[enc_len_offset + 3],
        ]);
        assert_eq!(enc_len as usize, soap.len());
    }

    #[test]
    fn seal_then_open_round_trips() {
        let mut provider = XorProvider;
        let soap = b"<s:Envelope><s:Body/></s:Envelope>";
        let sealed = seal(&mut provider, soap).expect("seal");
        let opened = open(&mut provider, &sealed).expect("open");
        assert_eq!(opened.as_bytes(), soap);
    }

    #[test]
    fn missing_octet_stream_part_is_a_protocol_error() {
        let mut provider = XorProvider;
        let err = open(&mut provider, b"--Encrypted Boundary--\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut provider = XorProvider;
        let soap = b"<xml/>";
        let mut sealed = seal(&mut provider, soap).expect("seal");
        // Corrupt the declared ciphertext length.
        let marker = b"Content-Type: application/octet-stream\r\n";
        let offset = find(&sealed, marker).unwrap() + marker.len() + 4 + 16;
        sealed[offset] ^= 0xFF;
        assert!(matches!(
            open(&mut provider, &sealed).unwrap_err(),
            Error::Protocol(_)
        ));
    }

    #[test]
    fn encrypted_content_type_detection() {
        assert!(is_encrypted_content_type(ENCRYPTED_CONTENT_TYPE));
        assert!(is_encrypted_content_type(
            "Multipart/Encrypted;protocol=\"application/HTTP-SPNEGO-session-encrypted\""
        ));
        assert!(!is_encrypted_content_type("application/soap+xml"));
    }
}
