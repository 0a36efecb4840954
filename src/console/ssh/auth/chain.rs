//! Authentication chain for trying multiple strategies.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{AuthStrategy, Credential};
use super::{KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first strategy
/// accepting the credential stops the chain and returns success.
///
/// # Example
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_password([("admin", "secret")])
///     .with_keys(KeyAuth::from_authorized_keys(&text)?);
/// ```
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Arc<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Create a new empty authentication chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add password authentication to the chain.
    pub fn with_password<U, P>(self, users: impl IntoIterator<Item = (U, P)>) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.with(PasswordAuth::new(users))
    }

    /// Add public key authentication to the chain.
    pub fn with_keys(self, keys: KeyAuth) -> Self {
        self.with(keys)
    }

    /// Add any strategy to the chain.
    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// Check if the chain has any authentication strategies.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(&self, user: &str, credential: Credential<'_>) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            match strategy.authenticate(user, credential).await {
                Ok(true) => {
                    debug!(strategy = strategy.name(), user, "Authentication accepted");
                    return Ok(true);
                }
                Ok(false) => {
                    debug!(strategy = strategy.name(), user, "Authentication rejected");
                }
                Err(e) => {
                    debug!(strategy = strategy.name(), user, error = %e, "Authentication error");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
