//! SSH adapter.
//!
//! This module is organized into the following submodules:
//!
//! - `server`: listener, connection/channel bookkeeping, [`SshConsole`]
//! - `handler`: russh handler answering auth and channel requests
//! - `channel`: console stream over one session channel
//! - `auth`: authentication strategies
//! - `keys`: host key and authorized key parsing

pub mod auth;
mod channel;
mod handler;
pub mod keys;
mod server;

pub use auth::{AuthChain, AuthStrategy, Credential, KeyAuth, PasswordAuth};
pub use server::{SshConsole, SshConsoleOptions};
