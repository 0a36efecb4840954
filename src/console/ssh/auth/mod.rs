//! SSH server authentication strategies.
//!
//! This module provides a trait-based approach to deciding SSH logins,
//! following the Strategy pattern. The adapter holds one
//! `Arc<dyn AuthStrategy>`; each `auth_password` / `auth_publickey`
//! callback is answered by it.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: user to password table
//! - [`KeyAuth`]: set of authorized public keys
//! - [`AuthChain`]: tries several strategies in order

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::{AuthStrategy, Credential};
