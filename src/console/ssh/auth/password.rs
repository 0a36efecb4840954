//! Password-based SSH authentication.

use std::collections::HashMap;

use async_trait::async_trait;

use super::traits::{AuthStrategy, Credential};

/// Password authentication strategy.
///
/// Checks the presented password against a user to password table.
pub struct PasswordAuth {
    users: HashMap<String, String>,
}

impl PasswordAuth {
    /// Create a new password authentication strategy.
    pub fn new<U, P>(users: impl IntoIterator<Item = (U, P)>) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(user, password)| (user.into(), password.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(&self, user: &str, credential: Credential<'_>) -> Result<bool, String> {
        let Credential::Password(password) = credential else {
            return Ok(false);
        };

        match self.users.get(user) {
            Some(expected) => Ok(expected == password),
            None => Err(format!("unknown user: {user:?}")),
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
