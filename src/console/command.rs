//! Console commands and the registry they are dispatched from.
//!
//! A [`Command`] is an immutable `{name, help, minimum level}` triple plus an
//! async handler. Commands live in a [`CommandRegistry`], an insertion-ordered
//! list shared by reference (cloning the registry shares it).
//!
//! Lookup is by exact name and is *not* first-match: every registered command
//! whose name matches and whose level the caller satisfies is invoked.
//! Dispatch always runs over a snapshot of the registry, so commands added or
//! removed while a line is being handled only take effect for the next line.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::Console;

/// Privilege level of a session. Commands declare the minimum level they need.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum UserLevel {
    Guest,
    #[default]
    Root,
}

impl fmt::Display for UserLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserLevel::Guest => write!(f, "Guest"),
            UserLevel::Root => write!(f, "Root"),
        }
    }
}

/// Failure reported by command dispatch.
///
/// `NotFound` is never returned by a handler itself; the session synthesises
/// it when no registered command matched the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Bad Format!")]
    BadFormat,
    #[error("Command Not Found!")]
    NotFound,
}

pub type CommandResult = Result<(), CommandError>;

type Handler =
    Arc<dyn Fn(Console, Arc<Command>, Vec<String>) -> BoxFuture<'static, CommandResult> + Send + Sync>;

/// A named console command.
pub struct Command {
    name: String,
    help: String,
    level: UserLevel,
    handler: Handler,
}

impl Command {
    /// Create a command requiring [`UserLevel::Root`].
    ///
    /// The handler receives a handle to the invoking session, the command
    /// itself and the whitespace-separated arguments that followed its name.
    ///
    /// ```ignore
    /// let echo = Command::new("echo", "repeat the arguments", |console, _cmd, args| async move {
    ///     console.print(args.join(" ")).await;
    ///     Ok(())
    /// });
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, help: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Console, Arc<Command>, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            help: help.into(),
            level: UserLevel::Root,
            handler: Arc::new(move |console, command, args| {
                Box::pin(handler(console, command, args)) as BoxFuture<'static, CommandResult>
            }),
        }
    }

    /// Set the minimum level a session needs to run this command.
    pub fn with_level(mut self, level: UserLevel) -> Self {
        self.level = level;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn level(&self) -> UserLevel {
        self.level
    }

    /// Whether a session at `level` may invoke this command.
    pub fn permits(&self, level: UserLevel) -> bool {
        level >= self.level
    }

    pub(crate) async fn invoke(self: &Arc<Self>, console: Console, args: Vec<String>) -> CommandResult {
        (self.handler)(console, Arc::clone(self), args).await
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("help", &self.help)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered, shared set of commands.
///
/// Removal is by identity (`Arc` pointer), not by name, so two commands may
/// share a name and be removed independently.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Arc<RwLock<Vec<Arc<Command>>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command, returning the handle needed to remove it later.
    pub fn add(&self, command: Command) -> Arc<Command> {
        let command = Arc::new(command);
        self.add_shared(Arc::clone(&command));
        command
    }

    /// Append an already shared command.
    pub fn add_shared(&self, command: Arc<Command>) -> bool {
        match self.commands.write() {
            Ok(mut commands) => {
                commands.push(command);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove a command by identity. Returns `false` if it was not registered.
    pub fn remove(&self, command: &Arc<Command>) -> bool {
        let Ok(mut commands) = self.commands.write() else {
            return false;
        };
        match commands.iter().position(|c| Arc::ptr_eq(c, command)) {
            Some(index) => {
                commands.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copy of the current command list.
    pub fn snapshot(&self) -> Vec<Arc<Command>> {
        self.commands
            .read()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Command {
        Command::new(name, "does nothing", |_console, _cmd, _args| async { Ok(()) })
    }

    mod user_level {
        use super::*;

        #[test]
        fn test_ordering() {
            assert!(UserLevel::Guest < UserLevel::Root);
        }

        #[test]
        fn test_default_is_highest() {
            assert_eq!(UserLevel::default(), UserLevel::Root);
        }

        #[test]
        fn test_display() {
            assert_eq!(UserLevel::Guest.to_string(), "Guest");
            assert_eq!(UserLevel::Root.to_string(), "Root");
        }
    }

    mod command_error {
        use super::*;

        #[test]
        fn test_messages() {
            assert_eq!(CommandError::BadFormat.to_string(), "Bad Format!");
            assert_eq!(CommandError::NotFound.to_string(), "Command Not Found!");
        }
    }

    mod command {
        use super::*;

        #[test]
        fn test_default_level_is_root() {
            let cmd = noop("status");
            assert_eq!(cmd.level(), UserLevel::Root);
            assert!(!cmd.permits(UserLevel::Guest));
            assert!(cmd.permits(UserLevel::Root));
        }

        #[test]
        fn test_guest_level_permits_everyone() {
            let cmd = noop("ping").with_level(UserLevel::Guest);
            assert!(cmd.permits(UserLevel::Guest));
            assert!(cmd.permits(UserLevel::Root));
        }

        #[test]
        fn test_accessors() {
            let cmd = noop("uptime");
            assert_eq!(cmd.name(), "uptime");
            assert_eq!(cmd.help(), "does nothing");
        }
    }

    mod registry {
        use super::*;

        #[test]
        fn test_insertion_order_preserved() {
            let registry = CommandRegistry::new();
            registry.add(noop("a"));
            registry.add(noop("b"));
            registry.add(noop("c"));
            let names: Vec<_> = registry
                .snapshot()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }

        #[test]
        fn test_remove_by_identity_not_name() {
            let registry = CommandRegistry::new();
            let first = registry.add(noop("dup"));
            let second = registry.add(noop("dup"));

            assert!(registry.remove(&second));
            let remaining = registry.snapshot();
            assert_eq!(remaining.len(), 1);
            assert!(Arc::ptr_eq(&remaining[0], &first));
        }

        #[test]
        fn test_remove_unknown_reports_failure() {
            let registry = CommandRegistry::new();
            registry.add(noop("kept"));
            let stranger = Arc::new(noop("kept"));
            assert!(!registry.remove(&stranger));
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn test_clones_share_contents() {
            let registry = CommandRegistry::new();
            let shared = registry.clone();
            shared.add(noop("x"));
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn test_snapshot_is_detached() {
            let registry = CommandRegistry::new();
            registry.add(noop("x"));
            let snapshot = registry.snapshot();
            registry.add(noop("y"));
            assert_eq!(snapshot.len(), 1);
            assert_eq!(registry.len(), 2);
        }
    }
}
