use std::time::Duration;

use url::Url;

use crate::credentials::Credentials;
use crate::retry::{BreakerConfig, RetryPolicy};
use crate::{Error, Result};

/// Where the WSMan endpoint lives. Immutable once constructed; the derived
/// URL is always `http(s)://host:port/wsman`.
#[derive(Debug, Clone)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
    configuration_name: String,
}

impl Endpoint {
    pub const DEFAULT_HTTP_PORT: u16 = 5985;
    pub const DEFAULT_HTTPS_PORT: u16 = 5986;

    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::config("endpoint host cannot be empty"));
        }
        Ok(Self {
            host,
            port,
            tls,
            configuration_name: "Microsoft.PowerShell".to_owned(),
        })
    }

    pub fn http(host: impl Into<String>) -> Result<Self> {
        Self::new(host, Self::DEFAULT_HTTP_PORT, false)
    }

    pub fn https(host: impl Into<String>) -> Result<Self> {
        Self::new(host, Self::DEFAULT_HTTPS_PORT, true)
    }

    pub fn with_configuration_name(mut self, name: impl Into<String>) -> Self {
        self.configuration_name = name.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn configuration_name(&self) -> &str {
        &self.configuration_name
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/wsman", self.host, self.port)
    }
}

/// Authentication scheme selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Ntlm,
    Negotiate,
    Kerberos,
}

impl AuthScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Ntlm => "NTLM",
            Self::Negotiate => "Negotiate",
            Self::Kerberos => "Kerberos",
        }
    }
}

/// Kerberos specifics. `spn` overrides the `HTTP/<host>` default; the
/// ccache/keytab paths are consumed by GSSAPI-style providers, the KDC URL
/// by the in-process one.
#[derive(Debug, Clone, Default)]
pub struct KerberosParams {
    pub realm: Option<String>,
    pub kdc_url: Option<Url>,
    pub krb5_conf_path: Option<String>,
    pub ccache_path: Option<String>,
    pub keytab_path: Option<String>,
    pub spn: Option<String>,
}

/// Everything needed to authenticate one connection.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub scheme: AuthScheme,
    pub credentials: Credentials,
    pub kerberos: Option<KerberosParams>,
    /// Bind the auth context to the TLS channel (RFC 5929).
    pub channel_binding: bool,
    /// Identifies this machine in SPNEGO exchanges.
    pub client_computer_name: Option<String>,
}

impl AuthConfig {
    pub fn new(scheme: AuthScheme, credentials: Credentials) -> Self {
        Self {
            scheme,
            credentials,
            kerberos: None,
            channel_binding: true,
            client_computer_name: None,
        }
    }

    pub fn with_kerberos(mut self, params: KerberosParams) -> Self {
        self.kerberos = Some(params);
        self
    }

    /// Scheme-specific credential validation, before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        let creds = &self.credentials;
        match self.scheme {
            AuthScheme::Basic | AuthScheme::Ntlm => {
                if creds.username.is_empty() || creds.password.is_empty() {
                    return Err(Error::config(format!(
                        "{} authentication requires a username and password",
                        self.scheme.as_str()
                    )));
                }
            }
            AuthScheme::Negotiate => {
                if creds.username.is_empty() {
                    return Err(Error::config(
                        "Negotiate authentication requires a username",
                    ));
                }
            }
            AuthScheme::Kerberos => {
                if creds.username.is_empty() {
                    return Err(Error::config("Kerberos authentication requires a username"));
                }
                let has_secret = !creds.password.is_empty()
                    || self
                        .kerberos
                        .as_ref()
                        .is_some_and(|k| k.ccache_path.is_some() || k.keytab_path.is_some());
                if !has_secret {
                    return Err(Error::config(
                        "Kerberos authentication requires a password, ccache, or keytab",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// TLS knobs. The 1.2 floor is not negotiable downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub min_version: TlsVersion,
    /// Skip certificate verification. Loud, on purpose: the transport warns
    /// once when the first connection uses this.
    pub accept_invalid_certs: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
            accept_invalid_certs: false,
        }
    }
}

/// Client-wide tunables. Built once, shared by the facade and the pool.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct ClientConfig {
    #[builder(default = 1)]
    pub min_runspaces: usize,
    #[builder(default = 1)]
    pub max_runspaces: usize,
    /// Pipeline requests queued beyond the runspace cap before `Overloaded`.
    #[builder(default = 16)]
    pub max_queue: usize,
    /// Overall timeout for pool open and other control operations.
    #[builder(default = Duration::from_secs(120))]
    pub operation_timeout: Duration,
    /// Long-poll Receive timeout; WSMan OperationTimeout faults at this
    /// cadence are the keepalive.
    #[builder(default = Duration::from_secs(60))]
    pub receive_timeout: Duration,
    /// Server-side shell idle timeout (None = server default).
    #[builder(default, setter(strip_option))]
    pub idle_timeout: Option<Duration>,
    /// Periodic pool keepalive ping (None = disabled).
    #[builder(default, setter(strip_option))]
    pub keepalive: Option<Duration>,
    #[builder(default = 512_000)]
    pub max_envelope_size: usize,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub breaker: BreakerConfig,
    #[builder(default)]
    pub tls: TlsOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_runspaces == 0 {
            return Err(Error::config("max_runspaces must be at least 1"));
        }
        if self.min_runspaces > self.max_runspaces {
            return Err(Error::config("min_runspaces exceeds max_runspaces"));
        }
        if self.max_envelope_size < 32 * 1024 {
            return Err(Error::config("max_envelope_size below the 32 KiB minimum"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_derivation() {
        let endpoint = Endpoint::http("srv01").unwrap();
        assert_eq!(endpoint.url(), "http://srv01:5985/wsman");

        let endpoint = Endpoint::https("srv01").unwrap();
        assert_eq!(endpoint.url(), "https://srv01:5986/wsman");

        let endpoint = Endpoint::new("srv01", 8443, true).unwrap();
        assert_eq!(endpoint.url(), "https://srv01:8443/wsman");
    }

    #[test]
    fn empty_host_is_rejected() {
        assert!(matches!(Endpoint::http("  "), Err(Error::Config(_))));
    }

    #[test]
    fn basic_requires_password() {
        let config = AuthConfig::new(AuthScheme::Basic, Credentials::new("user", ""));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = AuthConfig::new(AuthScheme::Basic, Credentials::new("user", "pw"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kerberos_accepts_keytab_instead_of_password() {
        let mut config = AuthConfig::new(AuthScheme::Kerberos, Credentials::new("user", ""));
        assert!(config.validate().is_err());

        config = config.with_kerberos(KerberosParams {
            keytab_path: Some("/etc/krb5.keytab".into()),
            ..KerberosParams::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_bounds_are_checked() {
        let config = ClientConfig::builder().max_runspaces(0).build();
        assert!(config.validate().is_err());

        let config = ClientConfig::builder()
            .min_runspaces(4)
            .max_runspaces(2)
            .build();
        assert!(config.validate().is_err());

        assert!(ClientConfig::default().validate().is_ok());
    }
}
