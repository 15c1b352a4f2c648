//! SSPI-backed [`AuthProvider`] over the pure-Rust `sspi` crate's NTLM,
//! Kerberos, and Negotiate packages.
//!
//! Kerberos legs that need the KDC suspend sspi's generator with a
//! [`NetworkRequest`]; those are resolved inline over TCP (RFC 4120 §7.2.2
//! length-prefixed framing) so `step` stays synchronous for the caller.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use sspi::generator::{GeneratorState, NetworkRequest};
use sspi::network_client::NetworkProtocol;
use sspi::{
    BufferType, ClientRequestFlags, CredentialUse, Credentials, DataRepresentation,
    EncryptionFlags, Kerberos, KerberosConfig, Negotiate, NegotiateConfig, Ntlm, SecurityBuffer,
    SecurityBufferFlags, SecurityBufferRef, SecurityStatus, Sspi, SspiImpl,
};
use tracing::{debug, instrument, trace, warn};

use crate::auth::{AuthProvider, ChannelBindingToken, StepResult, WrappedMessage};
use crate::config::AuthConfig;
use crate::credentials::Credentials as ClientCredentials;
use crate::{Error, Result};

const KDC_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_COMPUTER_NAME: &str = "ferrosh-client";

/// Normalize the target SPN: WinRM authenticates against `HTTP/<host>`.
fn service_principal(spn_override: Option<&str>, host: &str) -> String {
    match spn_override {
        Some(spn) if !spn.trim().is_empty() => {
            let spn = spn.trim();
            if spn.contains('/') {
                spn.to_owned()
            } else {
                format!("HTTP/{spn}")
            }
        }
        _ => format!("HTTP/{host}"),
    }
}

/// One SSPI security context. Generic over the package, erased behind
/// `Box<dyn AuthProvider>` for the middleware.
pub struct SspiProvider<P>
where
    P: Sspi + SspiImpl,
{
    provider: P,
    credentials: P::CredentialsHandle,
    target_name: String,
    require_encryption: bool,
    complete: bool,
    bindings: Option<ChannelBindingToken>,
    send_seq: u32,
    recv_seq: u32,
}

impl<P> std::fmt::Debug for SspiProvider<P>
where
    P: Sspi + SspiImpl,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SspiProvider")
            .field("target_name", &self.target_name)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl SspiProvider<Ntlm> {
    pub fn ntlm(
        credentials: &ClientCredentials,
        spn: Option<&str>,
        host: &str,
        require_encryption: bool,
    ) -> Result<Self> {
        let identity = credentials.to_sspi_identity()?;
        let mut provider = Ntlm::new();
        let handle = provider
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&identity)
            .execute(&mut provider)?
            .credentials_handle;

        Ok(Self::new_inner(
            provider,
            handle,
            service_principal(spn, host),
            require_encryption,
        ))
    }
}

impl SspiProvider<Kerberos> {
    pub fn kerberos(
        config: &AuthConfig,
        host: &str,
        require_encryption: bool,
    ) -> Result<Self> {
        let identity = config.credentials.to_sspi_identity()?;
        let kerberos_config = KerberosConfig {
            kdc_url: config.kerberos.as_ref().and_then(|k| k.kdc_url.clone()),
            client_computer_name: computer_name(config),
        };

        let mut provider = Kerberos::new_client_from_config(kerberos_config)?;
        let sspi_credentials = Credentials::AuthIdentity(identity);
        let handle = provider
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&sspi_credentials)
            .execute(&mut provider)?
            .credentials_handle;

        let spn = config.kerberos.as_ref().and_then(|k| k.spn.as_deref());
        Ok(Self::new_inner(
            provider,
            handle,
            service_principal(spn, host),
            require_encryption,
        ))
    }
}

impl SspiProvider<Negotiate> {
    pub fn negotiate(
        config: &AuthConfig,
        host: &str,
        require_encryption: bool,
    ) -> Result<Self> {
        let identity = config.credentials.to_sspi_identity()?;
        let kerberos_config = KerberosConfig {
            kdc_url: config.kerberos.as_ref().and_then(|k| k.kdc_url.clone()),
            client_computer_name: computer_name(config),
        };
        let negotiate_config = NegotiateConfig {
            protocol_config: Box::new(kerberos_config),
            package_list: None,
            client_computer_name: computer_name(config),
        };

        let mut provider = Negotiate::new_client(negotiate_config)?;
        let sspi_credentials = Credentials::AuthIdentity(identity);
        let handle = provider
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&sspi_credentials)
            .execute(&mut provider)?
            .credentials_handle;

        let spn = config.kerberos.as_ref().and_then(|k| k.spn.as_deref());
        Ok(Self::new_inner(
            provider,
            handle,
            service_principal(spn, host),
            require_encryption,
        ))
    }
}

fn computer_name(config: &AuthConfig) -> String {
    config
        .client_computer_name
        .clone()
        .unwrap_or_else(|| FALLBACK_COMPUTER_NAME.to_owned())
}

impl<P> SspiProvider<P>
where
    P: Sspi + SspiImpl,
{
    fn new_inner(
        provider: P,
        credentials: P::CredentialsHandle,
        target_name: String,
        require_encryption: bool,
    ) -> Self {
        Self {
            provider,
            credentials,
            target_name,
            require_encryption,
            complete: false,
            bindings: None,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    fn next_send_seq(&mut self) -> u32 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    fn next_recv_seq(&mut self) -> u32 {
        let seq = self.recv_seq;
        self.recv_seq = self.recv_seq.wrapping_add(1);
        seq
    }

    /// One InitializeSecurityContext round, resolving any KDC exchange the
    /// generator suspends on.
    #[instrument(skip_all, fields(target = %self.target_name))]
    fn one_round(&mut self, input_token: Option<&[u8]>) -> Result<StepResult> {
        let flags = if self.require_encryption {
            ClientRequestFlags::ALLOCATE_MEMORY
                | ClientRequestFlags::MUTUAL_AUTH
                | ClientRequestFlags::CONFIDENTIALITY
                | ClientRequestFlags::INTEGRITY
        } else {
            ClientRequestFlags::ALLOCATE_MEMORY | ClientRequestFlags::MUTUAL_AUTH
        };

        let mut output = [SecurityBuffer::new(Vec::new(), BufferType::Token)];
        let mut input = input_token
            .map(|token| [SecurityBuffer::new(token.to_vec(), BufferType::Token)]);

        let mut builder = self
            .provider
            .initialize_security_context()
            .with_credentials_handle(&mut self.credentials)
            .with_context_requirements(flags)
            .with_target_data_representation(DataRepresentation::Native)
            .with_target_name(&self.target_name)
            .with_output(&mut output);
        if let Some(input) = input.as_mut() {
            builder = builder.with_input(input);
        }

        let mut generator = self.provider.initialize_security_context_impl(&mut builder)?;

        let mut state = generator.start();
        let result = loop {
            match state {
                GeneratorState::Suspended(request) => {
                    debug!(url = %request.url, "security package needs a KDC exchange");
                    let response = resolve_kdc_request(&request)?;
                    state = generator.resume(Ok(response));
                }
                GeneratorState::Completed(result) => break result?,
            }
        };
        drop(generator);
        drop(builder);

        let token = std::mem::take(&mut output[0].buffer);
        let token = if token.is_empty() { None } else { Some(token) };

        debug!(status = ?result.status, token_present = token.is_some(), "ISC round finished");

        match result.status {
            SecurityStatus::ContinueNeeded => Ok(StepResult {
                token,
                continue_needed: true,
            }),
            SecurityStatus::Ok => {
                self.complete = true;
                Ok(StepResult {
                    token,
                    continue_needed: false,
                })
            }
            other => Err(Error::AuthFailed(format!(
                "InitializeSecurityContext returned {other:?}"
            ))),
        }
    }
}

impl<P> AuthProvider for SspiProvider<P>
where
    P: Sspi + SspiImpl + Send,
    P::CredentialsHandle: Send,
{
    fn http_scheme(&self) -> &'static str {
        "Negotiate"
    }

    fn step(
        &mut self,
        input_token: Option<&[u8]>,
        bindings: Option<&ChannelBindingToken>,
    ) -> Result<StepResult> {
        if let Some(bindings) = bindings {
            // Recorded per-step; backends consume the application data when
            // they assemble their channel-binding checksum.
            trace!(
                application_data_len = bindings.application_data().len(),
                "channel bindings supplied"
            );
            self.bindings = Some(bindings.clone());
        }

        self.one_round(input_token)
    }

    fn complete(&self) -> bool {
        self.complete
    }

    fn wrap(&mut self, data: &[u8]) -> Result<WrappedMessage> {
        if !self.complete {
            return Err(Error::AuthFailed(
                "wrap called before the security context completed".into(),
            ));
        }

        let sizes = self.provider.query_context_sizes()?;
        trace!(security_trailer = sizes.security_trailer, "sealing message");

        let mut token_buffer = vec![0u8; sizes.security_trailer as usize];
        let mut payload = data.to_vec();
        let mut buffers = [
            SecurityBufferRef::token_buf(&mut token_buffer),
            SecurityBufferRef::data_buf(&mut payload).with_flags(SecurityBufferFlags::NONE),
        ];

        let _sequence_number = self.next_send_seq();
        let status = self
            .provider
            .encrypt_message(EncryptionFlags::empty(), &mut buffers)?;
        if status != SecurityStatus::Ok {
            return Err(Error::AuthFailed(format!(
                "EncryptMessage returned {status:?}"
            )));
        }

        Ok(WrappedMessage {
            signature: buffers[0].data().to_vec(),
            sealed: buffers[1].data().to_vec(),
        })
    }

    fn unwrap(&mut self, signature: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(Error::AuthFailed(
                "unwrap called before the security context completed".into(),
            ));
        }

        let mut token_buffer = signature.to_vec();
        let mut payload = sealed.to_vec();
        let mut buffers = [
            SecurityBufferRef::token_buf(&mut token_buffer),
            SecurityBufferRef::data_buf(&mut payload),
        ];

        let _sequence_number = self.next_recv_seq();
        self.provider.decrypt_message(&mut buffers)?;

        Ok(buffers[1].data().to_vec())
    }

    fn process_response(&mut self, final_token: &[u8]) -> Result<()> {
        // Feed the server's final token (Kerberos AP-REP inside SPNEGO) back
        // through ISC for mutual authentication.
        match self.one_round(Some(final_token)) {
            Ok(step) => {
                if step.continue_needed {
                    warn!("server's final token left the context incomplete");
                }
                Ok(())
            }
            Err(e) => Err(Error::AuthFailed(format!(
                "mutual authentication failed: {e}"
            ))),
        }
    }

    fn close(&mut self) {
        self.complete = false;
    }
}

/// Resolve a suspended KDC exchange. Plain KRB-over-TCP only; KKDCP proxies
/// would need an HTTP round-trip this client does not make for auth.
fn resolve_kdc_request(request: &NetworkRequest) -> Result<Vec<u8>> {
    match request.protocol {
        NetworkProtocol::Tcp => send_kdc_tcp(request),
        other => Err(Error::AuthFailed(format!(
            "KDC transport {other:?} is not supported; configure a TCP KDC URL"
        ))),
    }
}

fn send_kdc_tcp(request: &NetworkRequest) -> Result<Vec<u8>> {
    let host = request
        .url
        .host_str()
        .ok_or_else(|| Error::AuthFailed("KDC URL has no host".into()))?;
    let port = request.url.port().unwrap_or(88);

    debug!(host, port, data_len = request.data.len(), "KDC exchange over TCP");

    let mut stream = TcpStream::connect((host, port))
        .map_err(|e| Error::AuthFailed(format!("connect to KDC {host}:{port}: {e}")))?;
    stream.set_read_timeout(Some(KDC_TIMEOUT)).ok();
    stream.set_write_timeout(Some(KDC_TIMEOUT)).ok();

    stream
        .write_all(&request.data)
        .map_err(|e| Error::AuthFailed(format!("write to KDC: {e}")))?;
    stream
        .flush()
        .map_err(|e| Error::AuthFailed(format!("flush to KDC: {e}")))?;

    // 4-byte big-endian length prefix; the caller expects it included.
    let response_len = stream
        .read_u32::<BigEndian>()
        .map_err(|e| Error::AuthFailed(format!("read KDC response length: {e}")))?;

    let mut response = vec![0u8; response_len as usize + 4];
    response[..4].copy_from_slice(&response_len.to_be_bytes());
    stream
        .read_exact(&mut response[4..])
        .map_err(|e| Error::AuthFailed(format!("read KDC response: {e}")))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spn_normalization() {
        assert_eq!(service_principal(None, "srv01"), "HTTP/srv01");
        assert_eq!(service_principal(Some("srv02"), "srv01"), "HTTP/srv02");
        assert_eq!(
            service_principal(Some("HTTP/srv.contoso.com"), "srv01"),
            "HTTP/srv.contoso.com"
        );
        assert_eq!(
            service_principal(Some("  "), "srv01"),
            "HTTP/srv01"
        );
    }

    #[test]
    fn ntlm_provider_emits_a_first_token_without_io() {
        let credentials =
            ClientCredentials::new("jdoe", "hunter2").with_domain("CONTOSO");
        let mut provider =
            SspiProvider::ntlm(&credentials, None, "srv01", true).expect("provider");

        assert!(!provider.complete());
        let step = provider.step(None, None).expect("first step");
        // NTLM NEGOTIATE message is produced locally.
        let token = step.token.expect("token");
        assert!(token.starts_with(b"NTLMSSP\0"));
        assert!(step.continue_needed);
        assert!(!provider.complete());
    }

    #[test]
    fn wrap_before_completion_is_refused() {
        let credentials = ClientCredentials::new("jdoe", "hunter2");
        let mut provider =
            SspiProvider::ntlm(&credentials, None, "srv01", true).expect("provider");
        assert!(matches!(
            provider.wrap(b"data").unwrap_err(),
            Error::AuthFailed(_)
        ));
    }
}
