//! Interactive line console served over several transports.
//!
//! This module is organized into the following submodules:
//!
//! - `command`: command registry, user levels, dispatch errors
//! - `stream`: the byte stream a console runs over
//! - `session`: the per-connection console engine
//! - `config`: configuration resolution with environment variable support
//! - `error`: error taxonomy and retry classification
//! - `telnet`: one TCP connection per console
//! - `ssh`: one SSH session channel per console
//! - `mqtt`: one virtual client per console over a pub/sub link
//! - `storage`: client bookkeeping for the MQTT adapter
//! - `stdio`: the process terminal as a console (feature-gated)

pub mod command;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod session;
pub mod ssh;
#[cfg(feature = "stdio")]
pub mod stdio;
pub mod storage;
pub mod stream;
pub mod telnet;

pub use command::{Command, CommandError, CommandRegistry, CommandResult, UserLevel};
pub use error::ConsoleError;
pub use mqtt::{ChatLink, ChatTopics, MqttConsole, MqttConsoleOptions, MqttJsonData, MqttOutMessage};
pub use session::{CloseReason, Console, ConsoleInfo, ConsoleOptions, SessionState};
pub use ssh::{SshConsole, SshConsoleOptions};
#[cfg(feature = "stdio")]
pub use stdio::StdioConsole;
pub use stream::{ConsoleIo, ConsoleReader, ConsoleWriter, ReadMode, StreamCapabilities};
pub use telnet::TelnetConsole;
