//! Storage abstractions for adapter bookkeeping.
//!
//! This module provides trait-based storage abstractions that enable:
//! - Dependency injection for testability
//! - Lock-free concurrent access via DashMap implementations

mod client;
mod traits;

pub use client::DashMapClientStorage;
pub use traits::{ClientRef, ClientStorage};
