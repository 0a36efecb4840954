//! Authentication strategy trait definition.
//!
//! Defines the interface the SSH adapter uses to decide whether a client may
//! log in, one implementation per authentication method.

use async_trait::async_trait;
use russh::keys::PublicKey;

/// What the client presented during an authentication attempt.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    Password(&'a str),
    PublicKey(&'a PublicKey),
}

impl Credential<'_> {
    /// SSH method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey(_) => "publickey",
        }
    }
}

/// Trait for SSH server authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`): one strategy is
/// shared by every connection of the adapter.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Check a credential presented by `user`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Credential accepted
    /// * `Ok(false)` - Credential rejected, or a method this strategy does not handle
    /// * `Err(message)` - The attempt could not be evaluated (unknown user)
    async fn authenticate(&self, user: &str, credential: Credential<'_>) -> Result<bool, String>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}
