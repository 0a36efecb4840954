//! Public key SSH authentication.

use async_trait::async_trait;
use russh::keys::PublicKey;

use crate::console::error::ConsoleError;
use crate::console::ssh::keys::parse_authorized_keys;

use super::traits::{AuthStrategy, Credential};

/// Public key authentication strategy.
///
/// Accepts any user presenting one of the authorized keys.
pub struct KeyAuth {
    authorized: Vec<PublicKey>,
}

impl KeyAuth {
    pub fn new(authorized: Vec<PublicKey>) -> Self {
        Self { authorized }
    }

    /// Build from the text of an `authorized_keys` file.
    pub fn from_authorized_keys(text: &str) -> Result<Self, ConsoleError> {
        Ok(Self::new(parse_authorized_keys(text)?))
    }

    pub fn len(&self) -> usize {
        self.authorized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorized.is_empty()
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(&self, _user: &str, credential: Credential<'_>) -> Result<bool, String> {
        let Credential::PublicKey(presented) = credential else {
            return Ok(false);
        };
        Ok(self.authorized.iter().any(|key| key == presented))
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
