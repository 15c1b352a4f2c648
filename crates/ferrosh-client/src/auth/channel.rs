//! The authenticating middleware over one pinned transport connection.
//!
//! Drives the SPNEGO challenge-response loop (bounded legs, empty-body
//! handshake first), injects channel bindings, and — over plain HTTP —
//! seals every payload after the context completes. No cleartext SOAP
//! leaves this type once a security context exists.

use base64::Engine;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthProvider, ChannelBindingToken, encryption};
use crate::config::{AuthConfig, AuthScheme};
use crate::transport::{Transport, WireRequest, WireResponse, status_error};
use crate::{Error, Result};

/// Maximum challenge-response legs before giving up.
const MAX_HANDSHAKE_LEGS: usize = 5;

type ProviderFactory = Box<dyn Fn() -> Result<Box<dyn AuthProvider>> + Send + Sync>;

enum ChannelAuth {
    Basic {
        header: String,
    },
    Spnego {
        provider: Box<dyn AuthProvider>,
        factory: ProviderFactory,
        /// Transport generation this security context was established on; a
        /// reconnect invalidates the context.
        context_generation: u64,
        channel_binding: bool,
    },
}

/// One authenticated HTTP channel: transport + auth state + encryption
/// policy. Cheap to create; each lives for the life of one connection
/// conversation.
pub struct AuthChannel {
    transport: Transport,
    auth: ChannelAuth,
    /// Seal/unseal message bodies (plain HTTP with a SPNEGO context).
    encrypt: bool,
}

impl std::fmt::Debug for AuthChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthChannel")
            .field("transport", &self.transport)
            .field("encrypt", &self.encrypt)
            .finish_non_exhaustive()
    }
}

impl AuthChannel {
    /// Build a channel for the configured scheme. Plain-HTTP SPNEGO
    /// channels encrypt message bodies; plain-HTTP Basic gets a loud
    /// warning instead because there is nothing to encrypt with.
    pub fn new(transport: Transport, config: &AuthConfig) -> Result<Self> {
        config.validate()?;
        let tls = transport.endpoint().tls();
        let host = transport.endpoint().host().to_owned();
        let encrypt = !tls && config.scheme != AuthScheme::Basic;

        let auth = match config.scheme {
            AuthScheme::Basic => {
                if !tls {
                    warn!(
                        "Basic authentication over plain HTTP sends credentials \
                         in the clear"
                    );
                }
                let credentials = format!(
                    "{}:{}",
                    config.credentials.basic_username(),
                    config.credentials.password.expose()
                );
                let header = format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                );
                ChannelAuth::Basic { header }
            }
            scheme => {
                let factory = provider_factory(scheme, config.clone(), host, encrypt);
                let provider = factory()?;
                ChannelAuth::Spnego {
                    provider,
                    factory,
                    context_generation: 0,
                    channel_binding: config.channel_binding,
                }
            }
        };

        Ok(Self {
            transport,
            auth,
            encrypt,
        })
    }

    /// Build a channel around a caller-supplied provider back end (platform
    /// SSPI, GSSAPI, or a test double). The factory is invoked again
    /// whenever the connection — and with it the security context — is
    /// replaced.
    pub fn with_provider_factory<F>(
        transport: Transport,
        factory: F,
        channel_binding: bool,
        encrypt: bool,
    ) -> Result<Self>
    where
        F: Fn() -> Result<Box<dyn AuthProvider>> + Send + Sync + 'static,
    {
        let factory: ProviderFactory = Box::new(factory);
        let provider = factory()?;
        Ok(Self {
            transport,
            auth: ChannelAuth::Spnego {
                provider,
                factory,
                context_generation: 0,
                channel_binding,
            },
            encrypt,
        })
    }

    /// POST a SOAP payload and return the (decrypted) SOAP response.
    #[instrument(skip_all, fields(payload_len = soap.len()))]
    pub async fn send_soap(&mut self, soap: &str) -> Result<String> {
        match &self.auth {
            ChannelAuth::Basic { header } => {
                let request = WireRequest::soap(soap.as_bytes().to_vec())
                    .with_authorization(header.clone());
                let response = self.transport.send(&request).await?;
                if !(200..300).contains(&response.status) {
                    return Err(self.error_from_response(&response));
                }
                Ok(String::from_utf8_lossy(&response.body).into_owned())
            }
            ChannelAuth::Spnego { .. } => self.send_spnego(soap).await,
        }
    }

    async fn send_spnego(&mut self, soap: &str) -> Result<String> {
        // One stale-context retry: a server that dropped the connection (or
        // its auth state) yields 401 once; a second 401 is terminal.
        for attempt in 0..2 {
            self.transport.ensure_connected().await?;
            self.refresh_context_if_reconnected()?;

            if !self.provider().complete() {
                // Handshake-first: establish the context on empty-body
                // exchanges before any payload (encrypted or not) is sent.
                self.handshake().await?;
            }

            let request = self.build_payload_request(soap)?;
            let response = self.transport.send(&request).await?;

            if response.status == 401 && attempt == 0 {
                debug!("payload request met a 401; rebuilding security context");
                self.transport.disconnect();
                self.reset_context()?;
                continue;
            }
            if !(200..300).contains(&response.status) {
                return Err(self.error_from_response(&response));
            }

            return self.read_response_body(&response);
        }

        Err(Error::AuthFailed(
            "server rejected the authenticated request twice".into(),
        ))
    }

    /// The bounded challenge-response loop on empty-body requests.
    #[instrument(skip_all)]
    async fn handshake(&mut self) -> Result<()> {
        let scheme = self.provider().http_scheme();

        // Leg 0 carries no Authorization; the 401 challenge seeds the loop.
        let mut response = self.transport.send(&WireRequest::empty()).await?;
        let mut sent_token = false;

        for leg in 0..MAX_HANDSHAKE_LEGS {
            match response.status {
                200..=299 => {
                    if let Some(final_token) = challenge_token(&response, scheme)? {
                        // Mutual auth: the server's closing token is
                        // validated exactly once.
                        self.provider_mut().process_response(&final_token)?;
                    }
                    info!(legs = leg, "authentication handshake complete");
                    return Ok(());
                }
                401 => {
                    let server_token = challenge_token(&response, scheme)?;
                    if server_token.is_none() && sent_token {
                        // A bare challenge after we presented a token means
                        // the exchange was rejected (SPN mismatch or
                        // policy).
                        return Err(Error::AuthFailed(format!(
                            "{scheme} token rejected by the server"
                        )));
                    }

                    let bindings = self.current_bindings()?;
                    let step = self
                        .provider_mut()
                        .step(server_token.as_deref(), bindings.as_ref())?;

                    let Some(token) = step.token else {
                        return Err(Error::AuthFailed(
                            "security package produced no token for the next leg".into(),
                        ));
                    };

                    let header = format!(
                        "{scheme} {}",
                        base64::engine::general_purpose::STANDARD.encode(&token)
                    );
                    debug!(leg, continue_needed = step.continue_needed, "sending auth leg");
                    sent_token = true;
                    response = self
                        .transport
                        .send(&WireRequest::empty().with_authorization(header))
                        .await?;
                }
                _ => return Err(status_error(&response)),
            }
        }

        Err(Error::AuthFailed(format!(
            "authentication did not converge within {MAX_HANDSHAKE_LEGS} legs"
        )))
    }

    fn build_payload_request(&mut self, soap: &str) -> Result<WireRequest> {
        if self.encrypt {
            let provider = match &mut self.auth {
                ChannelAuth::Spnego { provider, .. } => provider.as_mut(),
                ChannelAuth::Basic { .. } => unreachable!("encrypt is never set for Basic"),
            };
            let body = encryption::seal(provider, soap.as_bytes())?;
            Ok(WireRequest {
                body,
                content_type: encryption::ENCRYPTED_CONTENT_TYPE.to_owned(),
                authorization: None,
            })
        } else {
            Ok(WireRequest::soap(soap.as_bytes().to_vec()))
        }
    }

    /// WinRM reports SOAP faults on HTTP 500; lift those into the fault
    /// taxonomy (benign OperationTimeout included) instead of a bare
    /// status error.
    fn error_from_response(&mut self, response: &WireResponse) -> Error {
        if response.status == 500
            && let Ok(body) = self.read_response_body(response)
            && let Err(error @ ferrosh_wsman::WsmanError::Fault(_)) =
                ferrosh_wsman::parse_response(&body)
        {
            return error.into();
        }
        status_error(response)
    }

    fn read_response_body(&mut self, response: &WireResponse) -> Result<String> {
        let encrypted = response
            .header("content-type")
            .is_some_and(encryption::is_encrypted_content_type);

        if encrypted {
            let provider = match &mut self.auth {
                ChannelAuth::Spnego { provider, .. } => provider.as_mut(),
                ChannelAuth::Basic { .. } => {
                    return Err(Error::protocol(
                        "server sent an encrypted body on a Basic channel",
                    ));
                }
            };
            encryption::open(provider, &response.body)
        } else {
            Ok(String::from_utf8_lossy(&response.body).into_owned())
        }
    }

    /// Channel bindings for the current TLS session, when enabled.
    fn current_bindings(&self) -> Result<Option<ChannelBindingToken>> {
        let ChannelAuth::Spnego {
            channel_binding, ..
        } = &self.auth
        else {
            return Ok(None);
        };
        if !channel_binding {
            return Ok(None);
        }
        match self.transport.peer_cert_der() {
            Some(der) => ChannelBindingToken::tls_server_end_point(der).map(Some),
            None => Ok(None),
        }
    }

    fn refresh_context_if_reconnected(&mut self) -> Result<()> {
        let generation = self.transport.generation();
        if let ChannelAuth::Spnego {
            provider,
            factory,
            context_generation,
            ..
        } = &mut self.auth
            && *context_generation != generation
        {
            if *context_generation != 0 {
                debug!(
                    old = *context_generation,
                    new = generation,
                    "connection replaced; recreating security context"
                );
                provider.close();
                *provider = factory()?;
            }
            *context_generation = generation;
        }
        Ok(())
    }

    fn reset_context(&mut self) -> Result<()> {
        if let ChannelAuth::Spnego {
            provider,
            factory,
            context_generation,
            ..
        } = &mut self.auth
        {
            provider.close();
            *provider = factory()?;
            *context_generation = 0;
        }
        Ok(())
    }

    fn provider(&self) -> &dyn AuthProvider {
        match &self.auth {
            ChannelAuth::Spnego { provider, .. } => provider.as_ref(),
            ChannelAuth::Basic { .. } => unreachable!("no provider on a Basic channel"),
        }
    }

    fn provider_mut(&mut self) -> &mut dyn AuthProvider {
        match &mut self.auth {
            ChannelAuth::Spnego { provider, .. } => provider.as_mut(),
            ChannelAuth::Basic { .. } => unreachable!("no provider on a Basic channel"),
        }
    }
}

/// Extract this scheme's token from the WWW-Authenticate headers.
/// `Ok(None)` means a bare challenge (scheme named, no token).
fn challenge_token(response: &WireResponse, scheme: &str) -> Result<Option<Vec<u8>>> {
    for value in response.headers_named("www-authenticate") {
        let value = value.trim();
        if value.eq_ignore_ascii_case(scheme) {
            return Ok(None);
        }
        if value.len() > scheme.len()
            && value[..scheme.len()].eq_ignore_ascii_case(scheme)
            && value.as_bytes()[scheme.len()] == b' '
        {
            let encoded = value[scheme.len() + 1..].trim();
            let token = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    Error::AuthFailed(format!("malformed {scheme} challenge token: {e}"))
                })?;
            return Ok(Some(token));
        }
    }
    Ok(None)
}

/// Build a factory producing fresh providers for this scheme; the channel
/// recreates the context whenever the connection is replaced.
fn provider_factory(
    scheme: AuthScheme,
    config: AuthConfig,
    host: String,
    require_encryption: bool,
) -> ProviderFactory {
    use crate::auth::SspiProvider;

    Box::new(move || {
        let provider: Box<dyn AuthProvider> = match scheme {
            AuthScheme::Ntlm => {
                let spn = config.kerberos.as_ref().and_then(|k| k.spn.as_deref());
                Box::new(SspiProvider::ntlm(
                    &config.credentials,
                    spn,
                    &host,
                    require_encryption,
                )?)
            }
            AuthScheme::Kerberos => {
                Box::new(SspiProvider::kerberos(&config, &host, require_encryption)?)
            }
            AuthScheme::Negotiate => {
                Box::new(SspiProvider::negotiate(&config, &host, require_encryption)?)
            }
            AuthScheme::Basic => {
                return Err(Error::config("Basic does not use a token provider"));
            }
        };
        Ok(provider)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_challenges(values: &[&str]) -> WireResponse {
        WireResponse {
            status: 401,
            headers: values
                .iter()
                .map(|v| ("WWW-Authenticate".to_owned(), (*v).to_owned()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn bare_challenge_yields_none() {
        let response = response_with_challenges(&["Negotiate", "Basic realm=\"x\""]);
        assert_eq!(challenge_token(&response, "Negotiate").unwrap(), None);
    }

    #[test]
    fn token_challenge_decodes() {
        let token = base64::engine::general_purpose::STANDARD.encode(b"server-token");
        let header = format!("Negotiate {token}");
        let response = response_with_challenges(&[header.as_str()]);
        assert_eq!(
            challenge_token(&response, "Negotiate").unwrap(),
            Some(b"server-token".to_vec())
        );
    }

    #[test]
    fn foreign_schemes_are_ignored() {
        let response = response_with_challenges(&["NTLM dG9rZW4=", "Basic realm=\"x\""]);
        assert_eq!(challenge_token(&response, "Negotiate").unwrap(), None);
    }

    #[test]
    fn malformed_base64_is_auth_failed() {
        let response = response_with_challenges(&["Negotiate !!!not-base64!!!"]);
        assert!(matches!(
            challenge_token(&response, "Negotiate").unwrap_err(),
            Error::AuthFailed(_)
        ));
    }
}
