//! HTTP transport with pinned connections.
//!
//! Negotiate and NTLM authenticate a *connection*, not a request, so the
//! transport drives hyper's low-level http1 client over a single TCP/TLS
//! stream and only replaces it when the peer hangs up. The peer certificate
//! is captured at handshake time for channel binding.

mod tls;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{Endpoint, TlsOptions};
use crate::{Error, Result};

/// One outbound POST: SOAP or sealed bytes plus the headers the auth layer
/// decided on.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub body: Vec<u8>,
    pub content_type: String,
    pub authorization: Option<String>,
}

impl WireRequest {
    pub fn soap(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/soap+xml;charset=UTF-8".to_owned(),
            authorization: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            body: Vec::new(),
            content_type: "application/soap+xml;charset=UTF-8".to_owned(),
            authorization: None,
        }
    }

    pub fn with_authorization(mut self, header: impl Into<String>) -> Self {
        self.authorization = Some(header.into());
        self
    }
}

#[derive(Debug)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values of a repeatable header (WWW-Authenticate in particular).
    pub fn headers_named(&self, name: &str) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text_truncated(&self, limit: usize) -> String {
        let slice = &self.body[..self.body.len().min(limit)];
        String::from_utf8_lossy(slice).into_owned()
    }
}

struct Conn {
    sender: http1::SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    peer_cert_der: Option<Vec<u8>>,
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// A transport bound to one endpoint, owning at most one live connection.
/// `generation` increments whenever the connection is replaced so the auth
/// layer knows its security context died with the old socket.
pub struct Transport {
    endpoint: Endpoint,
    tls_options: TlsOptions,
    conn: Option<Conn>,
    generation: u64,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint.url())
            .field("connected", &self.conn.is_some())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Transport {
    pub fn new(endpoint: Endpoint, tls_options: TlsOptions) -> Self {
        Self {
            endpoint,
            tls_options,
            conn: None,
            generation: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connection generation; bumps when a new TCP/TLS session replaces the
    /// old one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// DER certificate of the current connection's peer, when TLS.
    pub fn peer_cert_der(&self) -> Option<&[u8]> {
        self.conn
            .as_ref()
            .and_then(|c| c.peer_cert_der.as_deref())
    }

    /// Dial (and TLS-handshake) if there is no live connection.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if let Some(conn) = &self.conn {
            if !conn.sender.is_closed() {
                return Ok(());
            }
            debug!("pinned connection is closed; reconnecting");
            self.conn = None;
        }

        let address = (self.endpoint.host().to_owned(), self.endpoint.port());
        let stream = TcpStream::connect(address).await.map_err(|e| {
            Error::transport(
                format!("connect to {}: {e}", self.endpoint.url()),
                true,
            )
        })?;
        stream.set_nodelay(true).ok();

        let conn = if self.endpoint.tls() {
            let connector = tls::build_connector(&self.tls_options)?;
            let server_name = ServerName::try_from(self.endpoint.host().to_owned())
                .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::Tls(format!("TLS handshake: {e}")))?;

            let peer_cert_der = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());

            if peer_cert_der.is_none() {
                warn!("TLS session has no peer certificate; channel binding unavailable");
            }

            Self::spawn_http1(tls_stream, peer_cert_der).await?
        } else {
            Self::spawn_http1(stream, None).await?
        };

        self.conn = Some(conn);
        self.generation += 1;
        debug!(generation = self.generation, "established pinned connection");
        Ok(())
    }

    async fn spawn_http1<S>(stream: S, peer_cert_der: Option<Vec<u8>>) -> Result<Conn>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::transport(format!("HTTP handshake: {e}"), true))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(error = %e, "pinned connection terminated");
            }
        });

        Ok(Conn {
            sender,
            driver,
            peer_cert_der,
        })
    }

    /// POST one request over the pinned connection. A send error tears the
    /// connection down so the next call re-dials; the caller decides whether
    /// to retry (a fresh connection also means a fresh auth context).
    pub async fn send(&mut self, request: &WireRequest) -> Result<WireResponse> {
        self.ensure_connected().await?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::transport("connection vanished after connect", true))?;

        let host = format!("{}:{}", self.endpoint.host(), self.endpoint.port());
        let mut builder = Request::post("/wsman")
            .header(hyper::header::HOST, host)
            .header(hyper::header::CONTENT_TYPE, &request.content_type)
            .header(hyper::header::CONNECTION, "Keep-Alive");
        if let Some(authorization) = &request.authorization {
            builder = builder.header(hyper::header::AUTHORIZATION, authorization);
        }

        let http_request = builder
            .body(Full::new(Bytes::from(request.body.clone())))
            .map_err(|e| Error::transport(format!("build request: {e}"), false))?;

        trace!(
            body_len = request.body.len(),
            content_type = %request.content_type,
            "sending POST /wsman"
        );

        if let Err(e) = conn.sender.ready().await {
            self.conn = None;
            return Err(Error::transport(format!("connection not ready: {e}"), true));
        }

        let response = match conn.sender.send_request(http_request).await {
            Ok(response) => response,
            Err(e) => {
                // The connection is not reusable after an error.
                self.conn = None;
                return Err(Error::transport(format!("send request: {e}"), true));
            }
        };

        let (parts, body) = response.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = body
            .collect()
            .await
            .map_err(|e| {
                self.conn = None;
                Error::transport(format!("read response body: {e}"), true)
            })?
            .to_bytes()
            .to_vec();

        trace!(status = parts.status.as_u16(), body_len = body.len(), "received response");

        Ok(WireResponse {
            status: parts.status.as_u16(),
            headers,
            body,
        })
    }

    /// Drop the pinned connection (e.g. after auth failure on a stale
    /// context).
    pub fn disconnect(&mut self) {
        self.conn = None;
    }
}

/// Map a non-success HTTP status onto the error taxonomy. 401 is its own
/// kind because the auth layer reacts to it; everything else carries a
/// truncated body for diagnostics.
pub fn status_error(response: &WireResponse) -> Error {
    match response.status {
        401 => Error::Unauthenticated,
        403 => Error::Forbidden,
        status => Error::transport(
            format!(
                "HTTP {status}: {}",
                response.body_text_truncated(512)
            ),
            (500..=599).contains(&status),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = WireResponse {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/soap+xml".into()),
                ("WWW-Authenticate".into(), "Negotiate abc".into()),
                ("www-authenticate".into(), "NTLM".into()),
            ],
            body: Vec::new(),
        };
        assert_eq!(
            response.header("content-type"),
            Some("application/soap+xml")
        );
        let values: Vec<&str> = response.headers_named("WWW-AUTHENTICATE").collect();
        assert_eq!(values, vec!["Negotiate abc", "NTLM"]);
    }

    #[test]
    fn status_errors_map_to_the_taxonomy() {
        let response = |status| WireResponse {
            status,
            headers: Vec::new(),
            body: b"details".to_vec(),
        };
        assert!(matches!(
            status_error(&response(401)),
            Error::Unauthenticated
        ));
        assert!(matches!(status_error(&response(403)), Error::Forbidden));

        let err = status_error(&response(500));
        assert!(err.retryable());
        let err = status_error(&response(400));
        assert!(!err.retryable());
    }

    #[test]
    fn body_truncation_bounds_diagnostics() {
        let response = WireResponse {
            status: 500,
            headers: Vec::new(),
            body: vec![b'x'; 4096],
        };
        assert_eq!(response.body_text_truncated(512).len(), 512);
    }
}
