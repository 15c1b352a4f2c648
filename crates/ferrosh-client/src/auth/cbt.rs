use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_cert::der::Decode;

use crate::{Error, Result};

const TLS_SERVER_END_POINT_PREFIX: &[u8] = b"tls-server-end-point:";

/// An RFC 5929 `tls-server-end-point` channel binding token: the hash of the
/// server certificate, prefixed, carried as the application data of a
/// SEC_CHANNEL_BINDINGS structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBindingToken {
    application_data: Vec<u8>,
}

impl ChannelBindingToken {
    /// Derive the binding from the peer's DER certificate. The hash follows
    /// the certificate's signature algorithm family: SHA-256 by default,
    /// SHA-384/512 when the certificate is signed with those.
    pub fn tls_server_end_point(cert_der: &[u8]) -> Result<Self> {
        let hash = hash_for_cert(cert_der)?;

        let mut application_data =
            Vec::with_capacity(TLS_SERVER_END_POINT_PREFIX.len() + hash.len());
        application_data.extend_from_slice(TLS_SERVER_END_POINT_PREFIX);
        application_data.extend_from_slice(&hash);

        Ok(Self { application_data })
    }

    pub fn application_data(&self) -> &[u8] {
        &self.application_data
    }

    /// The full SEC_CHANNEL_BINDINGS layout (MS-NLMP 2.2.2.10 /
    /// RFC 2744 gss_channel_bindings): five zeroed address fields, then the
    /// application data length and offset, then the data itself.
    pub fn sec_channel_bindings(&self) -> Vec<u8> {
        const HEADER_LEN: u32 = 32;

        let mut out = Vec::with_capacity(HEADER_LEN as usize + self.application_data.len());
        // initiator_addtype, initiator_length, acceptor_addtype,
        // acceptor_length, and their offsets are all zero.
        out.extend_from_slice(&[0u8; 24]);
        out.extend_from_slice(&(self.application_data.len() as u32).to_le_bytes());
        out.extend_from_slice(&HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&self.application_data);
        out
    }
}

/// Hash the certificate DER with the digest its signature algorithm
/// dictates (RFC 5929 §4.1: MD5/SHA-1 upgrade to SHA-256).
fn hash_for_cert(cert_der: &[u8]) -> Result<Vec<u8>> {
    let cert = x509_cert::Certificate::from_der(cert_der)
        .map_err(|e| Error::Tls(format!("cannot parse peer certificate: {e}")))?;

    let oid = cert.signature_algorithm.oid.to_string();

    // RFC 8017 signature algorithm OIDs plus their ECDSA equivalents.
    let hash: Vec<u8> = match oid.as_str() {
        // sha384WithRSAEncryption / ecdsa-with-SHA384
        "1.2.840.113549.1.1.12" | "1.2.840.10045.4.3.3" => {
            Sha384::digest(cert_der).to_vec()
        }
        // sha512WithRSAEncryption / ecdsa-with-SHA512
        "1.2.840.113549.1.1.13" | "1.2.840.10045.4.3.4" => {
            Sha512::digest(cert_der).to_vec()
        }
        // Everything else, including SHA-1 and MD5 signatures, binds with
        // SHA-256.
        _ => Sha256::digest(cert_der).to_vec(),
    };

    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal self-signed RSA/SHA-256 certificate, DER, for hash-shape
    // assertions. Generated once with openssl; the contents don't matter,
    // only that it parses.
    const TEST_CERT_DER: &[u8] = include_bytes!("../../test_data/test_cert.der");

    #[test]
    fn application_data_has_the_rfc5929_prefix() {
        let token = ChannelBindingToken::tls_server_end_point(TEST_CERT_DER).expect("token");
        let data = token.application_data();

        assert!(data.starts_with(b"tls-server-end-point:"));
        // SHA-256 for a sha256WithRSAEncryption signature.
        assert_eq!(data.len(), b"tls-server-end-point:".len() + 32);

        let expected = Sha256::digest(TEST_CERT_DER);
        assert_eq!(&data[b"tls-server-end-point:".len()..], expected.as_slice());
    }

    #[test]
    fn sec_channel_bindings_layout() {
        let token = ChannelBindingToken::tls_server_end_point(TEST_CERT_DER).expect("token");
        let bindings = token.sec_channel_bindings();

        // 24 zero bytes of address fields.
        assert!(bindings[..24].iter().all(|&b| b == 0));
        // Application data length, little-endian.
        let len = u32::from_le_bytes([bindings[24], bindings[25], bindings[26], bindings[27]]);
        assert_eq!(len as usize, token.application_data().len());
        // Offset points just past the 32-byte header.
        let offset = u32::from_le_bytes([bindings[28], bindings[29], bindings[30], bindings[31]]);
        assert_eq!(offset, 32);
        assert_eq!(&bindings[32..], token.application_data());
    }

    #[test]
    fn garbage_certificate_is_a_tls_error() {
        let err = ChannelBindingToken::tls_server_end_point(b"not a certificate").unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
