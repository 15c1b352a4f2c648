//! Authentication: the pluggable token-exchange provider contract, the
//! SSPI-backed implementation, channel binding tokens, and the WinRM
//! `multipart/encrypted` message wrapping used over plain HTTP.

pub mod cbt;
pub mod channel;
pub mod encryption;
pub mod sspi_provider;

pub use cbt::ChannelBindingToken;
pub use channel::AuthChannel;
pub use sspi_provider::SspiProvider;

use crate::Result;

/// Outcome of one provider step.
#[derive(Debug)]
pub struct StepResult {
    /// Token to send in the next `Authorization: Negotiate …` header.
    pub token: Option<Vec<u8>>,
    /// True while the exchange needs more legs.
    pub continue_needed: bool,
}

/// A sealed message: the per-message signature (security trailer) and the
/// encrypted payload, kept separate because MS-WSMV frames them separately.
#[derive(Debug)]
pub struct WrappedMessage {
    pub signature: Vec<u8>,
    pub sealed: Vec<u8>,
}

/// The token-exchange engine behind Negotiate/NTLM/Kerberos.
///
/// Implementations are per-connection and single-threaded; the middleware
/// serializes calls. `step(None, _)` initializes the context and returns the
/// first client token. `wrap`/`unwrap` are only legal after `complete()`
/// returns true, and never over TLS.
pub trait AuthProvider: Send {
    /// Scheme label for the Authorization header ("Negotiate", "NTLM").
    fn http_scheme(&self) -> &'static str;

    fn step(
        &mut self,
        input_token: Option<&[u8]>,
        bindings: Option<&ChannelBindingToken>,
    ) -> Result<StepResult>;

    fn complete(&self) -> bool;

    fn wrap(&mut self, data: &[u8]) -> Result<WrappedMessage>;

    fn unwrap(&mut self, signature: &[u8], sealed: &[u8]) -> Result<Vec<u8>>;

    /// Mutual-auth validation of the final server token on a 200 response.
    fn process_response(&mut self, final_token: &[u8]) -> Result<()>;

    fn close(&mut self);
}
