#![deny(clippy::unwrap_used)]

pub mod console;

pub use console::*;
