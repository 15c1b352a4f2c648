use std::fmt;

use crate::Error;

/// A password (or other secret) that never appears in Debug output.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl<T: Into<String>> From<T> for Secret {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// Username/password/domain as the caller supplies them. Conversion into an
/// sspi identity picks the down-level (`DOMAIN\user`) form when a domain is
/// present and otherwise lets sspi parse UPN/bare names.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
    pub domain: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// `user`, `DOMAIN\user`, or `user@realm` as appropriate for the Basic
    /// authorization header.
    pub fn basic_username(&self) -> String {
        match &self.domain {
            Some(domain) if !domain.is_empty() => format!("{domain}\\{}", self.username),
            _ => self.username.clone(),
        }
    }

    pub(crate) fn to_sspi_identity(&self) -> Result<sspi::AuthIdentity, Error> {
        let username = match &self.domain {
            Some(domain) if !domain.is_empty() => {
                sspi::Username::new_down_level_logon_name(&self.username, domain)
                    .map_err(|e| Error::config(format!("invalid username/domain: {e}")))?
            }
            _ => sspi::Username::parse(&self.username)
                .map_err(|e| Error::config(format!("invalid username: {e}")))?,
        };

        Ok(sspi::AuthIdentity {
            username,
            password: self.password.expose().to_owned().into(),
        })
    }
}
