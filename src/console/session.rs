//! Transport-agnostic console session.
//!
//! A [`Console`] owns one [`ConsoleIo`] stream and runs the login/command
//! state machine over it:
//!
//! ```text
//!   start ──► AwaitingPassword ──(password)──► Authenticated ──► Closed
//!                 │   ▲ (mismatch)                  │
//!                 └───┘                             └─ each line: dispatch
//! ```
//!
//! `AwaitingPassword` is only entered when login was enabled before the
//! session started. Any state moves to `Closed` on [`Console::stop`],
//! end-of-stream, a read or write error, or idle timeout. The transition
//! happens once: the on-close callback runs exactly once and the stream is
//! released afterwards.
//!
//! # Tasks
//!
//! [`Console::start`] spawns the read/dispatch loop and an idle watchdog.
//! The watchdog polls every `watchdog_interval` and calls the same
//! [`Console::stop`] path when the session has been idle for `timeout`.
//! `stop` cancels the pending read through a cancellation token and then
//! writes a terminator, flushes and closes the stream.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{Command, CommandError, CommandRegistry, UserLevel};
use super::config::{DEFAULT_WATCHDOG_INTERVAL_SECS, resolve_timeout, resolve_watchdog_interval};
use super::error::ConsoleError;
use super::stream::{ConsoleIo, ConsoleReader, ConsoleWriter, ReadMode, StreamCapabilities};

pub const PROMPT: &str = "> ";
pub const DEFAULT_EOL: &str = "\r\n";
pub const PASSWORD_PROMPT: &str = "Password?";
pub const AUTHENTICATED_MESSAGE: &str = "Authenticated";
pub const TIMEOUT_MESSAGE: &str = "Timeout Expired";

/// Upper bound for the stream release performed by [`Console::stop`].
const STOP_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_WELCOME: &str = concat!(
    "============================================================\r\n",
    "           ______________________________________           \r\n",
    "  ________|                                      |_______  \r\n",
    "  \\       |                Welcome               |      / \r\n",
    "   \\      |                                      |     / \r\n",
    "   /      |______________________________________|     \\ \r\n",
    "  /__________)                                (_________\\ \r\n",
    " \r\n",
    "============================================================\r\n",
);

/// Callback run once when the session terminates.
pub type OnClose = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callback run by adapters for every console they create, before it starts.
pub type OnNewConsole = Arc<dyn Fn(&Console) + Send + Sync>;

/// Observable state of the login/command state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingPassword,
    Authenticated,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Stopped,
    EndOfStream,
    ReadError,
    WriteError,
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Stopped => "stopped",
            CloseReason::EndOfStream => "end of stream",
            CloseReason::ReadError => "read error",
            CloseReason::WriteError => "write error",
            CloseReason::IdleTimeout => "idle timeout",
        };
        f.write_str(text)
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub id: String,
    pub level: UserLevel,
    pub state: SessionState,
    pub login_enabled: bool,
    pub authenticated: bool,
    pub timeout_secs: u64,
    pub created_at: String,
}

/// Options applied when a console is created.
#[derive(Clone)]
pub struct ConsoleOptions {
    id: Option<String>,
    eol: String,
    welcome: String,
    timeout: Duration,
    watchdog_interval: Duration,
    level: UserLevel,
    shared_commands: Option<CommandRegistry>,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            id: None,
            eol: DEFAULT_EOL.to_string(),
            welcome: DEFAULT_WELCOME.to_string(),
            timeout: Duration::ZERO,
            watchdog_interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            level: UserLevel::default(),
            shared_commands: None,
        }
    }
}

impl ConsoleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller supplied session id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_eol(mut self, eol: impl Into<String>) -> Self {
        self.eol = eol.into();
        self
    }

    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = welcome.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_level(mut self, level: UserLevel) -> Self {
        self.level = level;
        self
    }

    /// Dispatch commands from a registry shared with other sessions as well.
    pub fn with_shared_commands(mut self, registry: CommandRegistry) -> Self {
        self.shared_commands = Some(registry);
        self
    }
}

struct State {
    login_enabled: bool,
    authenticated: bool,
    password: Option<String>,
    prompt: bool,
    welcome: String,
    eol: String,
    timeout: Duration,
    watchdog_interval: Duration,
    level: UserLevel,
    last_activity: Instant,
    close_reason: Option<CloseReason>,
}

struct Inner {
    id: String,
    created_at: DateTime<Utc>,
    state: Mutex<State>,
    commands: CommandRegistry,
    shared_commands: Option<CommandRegistry>,
    capabilities: StreamCapabilities,
    reader: Mutex<Option<Box<dyn ConsoleReader>>>,
    writer: tokio::sync::Mutex<Option<Box<dyn ConsoleWriter>>>,
    on_close: Mutex<Option<OnClose>>,
    started: AtomicBool,
    terminated: AtomicBool,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

/// Handle to a console session. Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct Console {
    inner: Arc<Inner>,
}

enum ReadOutcome {
    Line(String),
    Eof,
    Failed(ConsoleError),
    Cancelled,
}

impl Console {
    /// Create a console over `io`. The console does nothing until [`start`](Self::start).
    pub fn new(io: ConsoleIo, options: ConsoleOptions) -> Self {
        let ConsoleIo { reader, writer } = io;
        let capabilities = writer.capabilities();
        let id = options
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let console = Self {
            inner: Arc::new(Inner {
                id,
                created_at: Utc::now(),
                state: Mutex::new(State {
                    login_enabled: false,
                    authenticated: false,
                    password: None,
                    prompt: true,
                    welcome: options.welcome,
                    eol: options.eol,
                    timeout: options.timeout,
                    watchdog_interval: options.watchdog_interval,
                    level: options.level,
                    last_activity: Instant::now(),
                    close_reason: None,
                }),
                commands: CommandRegistry::new(),
                shared_commands: options.shared_commands,
                capabilities,
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(Some(writer)),
                on_close: Mutex::new(None),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        };

        console.inner.commands.add(
            Command::new("help", "show help", |console, _command, _args| async move {
                console.print_help().await;
                Ok(())
            })
            .with_level(UserLevel::Guest),
        );
        console.inner.commands.add(
            Command::new("whoAmI", "user level", |console, _command, _args| async move {
                console
                    .print(format!("User Level = {}", console.user_level()))
                    .await;
                Ok(())
            })
            .with_level(UserLevel::Guest),
        );

        info!(console_id = %console.inner.id, "Open console");
        console
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Require `password` before any command is accepted. Hides the prompt
    /// until the session authenticates. Calling it again only replaces the
    /// password.
    pub fn enable_login(&self, password: impl Into<String>) {
        let password = password.into();
        self.with_state(|s| {
            s.login_enabled = true;
            s.prompt = s.authenticated;
            s.password = Some(password);
        });
    }

    pub fn disable_login(&self) {
        self.with_state(|s| {
            s.login_enabled = false;
            s.prompt = true;
        });
    }

    pub fn is_login_enabled(&self) -> bool {
        self.with_state(|s| s.login_enabled)
    }

    pub fn is_authenticated(&self) -> bool {
        self.with_state(|s| s.authenticated)
    }

    pub fn state(&self) -> SessionState {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return SessionState::Closed;
        }
        self.with_state(|s| {
            if s.login_enabled && !s.authenticated {
                SessionState::AwaitingPassword
            } else {
                SessionState::Authenticated
            }
        })
    }

    /// Idle timeout; zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.with_state(|s| s.timeout = timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.with_state(|s| s.timeout)
    }

    pub fn set_watchdog_interval(&self, interval: Duration) {
        self.with_state(|s| s.watchdog_interval = interval);
    }

    pub fn set_welcome_message(&self, welcome: impl Into<String>) {
        let welcome = welcome.into();
        self.with_state(|s| s.welcome = welcome);
    }

    pub fn set_eol(&self, eol: impl Into<String>) {
        let eol = eol.into();
        self.with_state(|s| s.eol = eol);
    }

    /// Set the privilege level. Only meaningful before [`start`](Self::start).
    pub fn set_user_level(&self, level: UserLevel) {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!(console_id = %self.inner.id, "User level change ignored on a started console");
            return;
        }
        self.with_state(|s| s.level = level);
    }

    pub fn user_level(&self) -> UserLevel {
        self.with_state(|s| s.level)
    }

    pub fn info(&self) -> ConsoleInfo {
        let state = self.state();
        self.with_state(|s| ConsoleInfo {
            id: self.inner.id.clone(),
            level: s.level,
            state,
            login_enabled: s.login_enabled,
            authenticated: s.authenticated,
            timeout_secs: s.timeout.as_secs(),
            created_at: self.inner.created_at.to_rfc3339(),
        })
    }

    /// Register a command on this session only.
    pub fn add_command(&self, command: Command) -> Arc<Command> {
        self.inner.commands.add(command)
    }

    pub fn add_shared_command(&self, command: Arc<Command>) -> bool {
        self.inner.commands.add_shared(command)
    }

    /// Remove a command by identity from this session, or from the shared
    /// registry if it was registered there. Returns `false` if not found.
    pub fn remove_command(&self, command: &Arc<Command>) -> bool {
        if self.inner.commands.remove(command) {
            return true;
        }
        self.inner
            .shared_commands
            .as_ref()
            .is_some_and(|shared| shared.remove(command))
    }

    /// Every command this session can see, session commands first.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        let mut commands = self.inner.commands.snapshot();
        if let Some(shared) = &self.inner.shared_commands {
            commands.extend(shared.snapshot());
        }
        commands
    }

    /// Replace the on-close callback.
    pub fn set_on_close<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: OnClose = Box::new(move || Box::pin(callback()));
        if let Ok(mut slot) = self.inner.on_close.lock() {
            *slot = Some(callback);
        }
    }

    pub fn remove_on_close(&self) {
        if let Ok(mut slot) = self.inner.on_close.lock() {
            *slot = None;
        }
    }

    /// Launch the read/dispatch loop and the idle watchdog.
    ///
    /// Must be called from within a tokio runtime. A console starts at most
    /// once; later calls log a warning and return `false`.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(console_id = %self.inner.id, "Console already started");
            return false;
        }

        let reader = match self.inner.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            return false;
        };

        let console = self.clone();
        tokio::spawn(async move { console.run(reader).await });

        let console = self.clone();
        tokio::spawn(async move { console.watchdog().await });

        true
    }

    /// Request termination. Does not wait for the session task to finish;
    /// use [`closed`](Self::closed) for that.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        if !self.inner.started.swap(true, Ordering::SeqCst) {
            // Never started: there is no task to run the close path.
            self.terminate(CloseReason::Stopped).await;
            return;
        }

        let eol = self.with_state(|s| s.eol.clone());
        let release = async {
            let mut guard = self.inner.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.write(eol.as_bytes()).await;
                if self.inner.capabilities.flush {
                    let _ = writer.flush().await;
                }
            }
            drop(guard);
            self.release_stream().await;
        };
        if tokio::time::timeout(STOP_RELEASE_TIMEOUT, release)
            .await
            .is_err()
        {
            debug!(console_id = %self.inner.id, "Stream release timed out during stop");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session reached its terminal state.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.with_state(|s| s.close_reason)
    }

    /// Print `text` followed by the line terminator.
    pub async fn print(&self, text: impl AsRef<str>) {
        let eol = self.with_state(|s| s.eol.clone());
        let mut data = String::with_capacity(text.as_ref().len() + eol.len());
        data.push_str(text.as_ref());
        data.push_str(&eol);
        self.emit(data.as_bytes()).await;
    }

    /// Print `text` without a terminator.
    pub async fn print_raw(&self, text: impl AsRef<str>) {
        self.emit(text.as_ref().as_bytes()).await;
    }

    pub async fn println(&self) {
        self.print("").await;
    }

    /// Write and flush. A failed write terminates the session.
    async fn emit(&self, data: &[u8]) -> bool {
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        let mut result = writer.write(data).await;
        if result.is_ok() && self.inner.capabilities.flush {
            result = writer.flush().await;
        }
        drop(guard);

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(console_id = %self.inner.id, error = %e, "Console write failed");
                self.record_close_reason(CloseReason::WriteError);
                self.inner.shutdown.cancel();
                false
            }
        }
    }

    async fn flush(&self) {
        if !self.inner.capabilities.flush {
            return;
        }
        let mut guard = self.inner.writer.lock().await;
        let result = match guard.as_mut() {
            Some(writer) => writer.flush().await,
            None => return,
        };
        drop(guard);

        if let Err(e) = result {
            warn!(console_id = %self.inner.id, error = %e, "Console flush failed");
            self.record_close_reason(CloseReason::WriteError);
            self.inner.shutdown.cancel();
        }
    }

    fn record_close_reason(&self, reason: CloseReason) {
        self.with_state(|s| {
            s.close_reason.get_or_insert(reason);
        });
    }

    async fn print_help(&self) {
        let level = self.user_level();
        let eol = self.with_state(|s| s.eol.clone());
        self.print("######   LIST OF CONSOLE'S CMD  #######").await;
        for command in self.commands() {
            if command.permits(level) {
                self.print("---------------------------------------").await;
                self.print_raw(format!(
                    "+ {} {eol} # {} #{eol}",
                    command.name(),
                    command.help()
                ))
                .await;
            }
        }
    }

    async fn read(&self, reader: &mut Box<dyn ConsoleReader>, mode: ReadMode) -> ReadOutcome {
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => ReadOutcome::Cancelled,
            result = reader.read_line(mode) => match result {
                Ok(Some(line)) => ReadOutcome::Line(line),
                Ok(None) => ReadOutcome::Eof,
                Err(e) => ReadOutcome::Failed(e),
            },
        }
    }

    fn touch(&self) {
        let now = Instant::now();
        self.with_state(|s| s.last_activity = now);
    }

    /// Returns true when `line` matched the password.
    async fn handle_login(&self, line: &str) -> bool {
        let matched = self.with_state(|s| {
            let matched = s.password.as_deref() == Some(line);
            if matched {
                s.authenticated = true;
                s.prompt = true;
            }
            matched
        });
        if matched {
            info!(console_id = %self.inner.id, "Console authenticated");
            self.print(AUTHENTICATED_MESSAGE).await;
        }
        matched
    }

    async fn handle_command(&self, line: &str) {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            self.flush().await;
            return;
        };
        let args: Vec<String> = words.map(str::to_string).collect();
        let level = self.user_level();

        let mut result = Err(CommandError::NotFound);
        for command in self.commands() {
            if command.name() == name && command.permits(level) {
                debug!(console_id = %self.inner.id, command = %name, "Dispatch command");
                result = command.invoke(self.clone(), args.clone()).await;
            }
        }

        if let Err(e) = result {
            self.print(e.to_string()).await;
        }
    }

    fn awaiting_password(&self) -> bool {
        self.with_state(|s| s.login_enabled && !s.authenticated)
    }

    async fn serve(&self, reader: &mut Box<dyn ConsoleReader>) -> CloseReason {
        let welcome = self.with_state(|s| s.welcome.clone());
        self.print(welcome).await;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return CloseReason::Stopped;
            }

            if self.awaiting_password() {
                self.print_raw(PASSWORD_PROMPT).await;
                match self.read(reader, ReadMode::Password).await {
                    ReadOutcome::Line(password) => {
                        if !password.is_empty() {
                            self.touch();
                        }
                        self.handle_login(&password).await;
                    }
                    ReadOutcome::Eof => return CloseReason::EndOfStream,
                    ReadOutcome::Failed(e) => {
                        warn!(console_id = %self.inner.id, error = %e, "Console read failed");
                        return CloseReason::ReadError;
                    }
                    ReadOutcome::Cancelled => return CloseReason::Stopped,
                }
                continue;
            }

            if self.with_state(|s| s.prompt) {
                self.print_raw(PROMPT).await;
            }

            let line = match self.read(reader, ReadMode::Line).await {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Eof => {
                    info!(console_id = %self.inner.id, "Quit console, end of stream");
                    return CloseReason::EndOfStream;
                }
                ReadOutcome::Failed(e) => {
                    warn!(console_id = %self.inner.id, error = %e, "Quit console, read failed");
                    return CloseReason::ReadError;
                }
                ReadOutcome::Cancelled => return CloseReason::Stopped,
            };

            if line.is_empty() {
                self.flush().await;
                continue;
            }
            self.touch();

            if self.awaiting_password() {
                self.handle_login(&line).await;
            } else {
                self.handle_command(&line).await;
            }
        }
    }

    async fn run(self, mut reader: Box<dyn ConsoleReader>) {
        let reason = self.serve(&mut reader).await;
        drop(reader);
        self.record_close_reason(reason);
        let reason = self.close_reason().unwrap_or(reason);
        info!(console_id = %self.inner.id, reason = %reason, "Quit console");
        self.terminate(reason).await;
    }

    /// Single transition into `Closed`.
    async fn terminate(&self, reason: CloseReason) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record_close_reason(reason);
        self.inner.shutdown.cancel();

        let callback = match self.inner.on_close.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback().await;
        }

        self.release_stream().await;
        self.inner.closed.cancel();
    }

    /// Drop the writer, closing it first when supported. Idempotent.
    async fn release_stream(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer
            && self.inner.capabilities.close
            && let Err(e) = writer.close().await
        {
            debug!(console_id = %self.inner.id, error = %e, "Stream close failed");
        }
    }

    fn idle_expired(&self) -> bool {
        self.with_state(|s| !s.timeout.is_zero() && s.last_activity.elapsed() >= s.timeout)
    }

    async fn watchdog(self) {
        let interval = self
            .with_state(|s| s.watchdog_interval)
            .max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    debug!(console_id = %self.inner.id, "Watchdog exit");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.idle_expired() {
                info!(console_id = %self.inner.id, "Idle timeout expired");
                self.record_close_reason(CloseReason::IdleTimeout);
                self.print(TIMEOUT_MESSAGE).await;
                self.stop().await;
                return;
            }
        }
    }
}

/// Per-adapter settings applied to every console the adapter creates.
pub(crate) struct SessionDefaults {
    timeout: Mutex<Duration>,
    watchdog_interval: Duration,
    on_new_console: Mutex<Option<OnNewConsole>>,
    commands: CommandRegistry,
}

impl SessionDefaults {
    pub(crate) fn new() -> Self {
        Self {
            timeout: Mutex::new(resolve_timeout(None)),
            watchdog_interval: resolve_watchdog_interval(None),
            on_new_console: Mutex::new(None),
            commands: CommandRegistry::new(),
        }
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        if let Ok(mut slot) = self.timeout.lock() {
            *slot = timeout;
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout.lock().map(|t| *t).unwrap_or_default()
    }

    pub(crate) fn set_on_new_console(&self, callback: Option<OnNewConsole>) {
        if let Ok(mut slot) = self.on_new_console.lock() {
            *slot = callback;
        }
    }

    /// Registry shared by every console of the adapter.
    pub(crate) fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub(crate) fn options(&self) -> ConsoleOptions {
        ConsoleOptions::new()
            .with_watchdog_interval(self.watchdog_interval)
            .with_shared_commands(self.commands.clone())
    }

    /// Apply the idle timeout and run the on-new-console callback.
    pub(crate) fn prepare(&self, console: &Console) {
        let callback = self.on_new_console.lock().ok().and_then(|cb| cb.clone());
        if let Some(callback) = callback {
            callback(console);
        }
        console.set_timeout(self.timeout());
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn console_over_duplex(options: ConsoleOptions) -> (Console, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let io = ConsoleIo::from_stream(server, StreamCapabilities::ALL);
        (Console::new(io, options.with_welcome("hi")), client)
    }

    /// Read from `client` until the accumulated output contains `needle`.
    async fn read_until(client: &mut DuplexStream, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if String::from_utf8_lossy(&out).contains(needle) {
                    return;
                }
                let n = client.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                out.extend_from_slice(&buf[..n]);
            }
        });
        deadline.await.expect("output did not arrive in time");
        String::from_utf8_lossy(&out).into_owned()
    }

    fn counter_command(name: &str, counter: Arc<AtomicUsize>) -> Command {
        Command::new(name, "counts calls", move |_console, _cmd, _args| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    mod options {
        use super::*;

        #[tokio::test]
        async fn test_custom_id() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new().with_id("abc"));
            assert_eq!(console.id(), "abc");
        }

        #[tokio::test]
        async fn test_generated_ids_are_unique() {
            let (a, _ca) = console_over_duplex(ConsoleOptions::new());
            let (b, _cb) = console_over_duplex(ConsoleOptions::new());
            assert_ne!(a.id(), b.id());
        }

        #[tokio::test]
        async fn test_builtins_installed() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new());
            let names: Vec<_> = console
                .commands()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            assert_eq!(names, vec!["help", "whoAmI"]);
        }
    }

    mod dispatch {
        use super::*;

        #[tokio::test]
        async fn test_unknown_command_reports_not_found_once() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"nope\n").await.unwrap();
            let out = read_until(&mut client, "Command Not Found!\r\n> ").await;
            assert_eq!(out.matches("Command Not Found!").count(), 1);
        }

        #[tokio::test]
        async fn test_empty_line_does_not_dispatch() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"\n   \nwhoAmI\n").await.unwrap();
            let out = read_until(&mut client, "User Level = Root").await;
            assert!(!out.contains("Command Not Found!"));
        }

        #[tokio::test]
        async fn test_every_matching_command_runs() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            let counter = Arc::new(AtomicUsize::new(0));
            console.add_command(counter_command("tick", counter.clone()));
            console.add_command(counter_command("tick", counter.clone()));
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"tick\nwhoAmI\n").await.unwrap();
            read_until(&mut client, "User Level").await;
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn test_bad_format_is_printed() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.add_command(Command::new("strict", "needs one arg", |_c, _cmd, args| async move {
                if args.len() != 1 {
                    return Err(CommandError::BadFormat);
                }
                Ok(())
            }));
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"strict a b\n").await.unwrap();
            read_until(&mut client, "Bad Format!").await;
        }

        #[tokio::test]
        async fn test_arguments_split_on_whitespace() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.add_command(Command::new("echo", "echo", |c, _cmd, args| async move {
                c.print(args.join("|")).await;
                Ok(())
            }));
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"echo  a \t b\n").await.unwrap();
            read_until(&mut client, "a|b").await;
        }

        #[tokio::test]
        async fn test_root_command_hidden_from_guest() {
            let (console, mut client) =
                console_over_duplex(ConsoleOptions::new().with_level(UserLevel::Guest));
            let counter = Arc::new(AtomicUsize::new(0));
            console.add_command(counter_command("reboot", counter.clone()));
            console.add_command(
                counter_command("ping", counter.clone()).with_level(UserLevel::Guest),
            );
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"reboot\n").await.unwrap();
            read_until(&mut client, "Command Not Found!").await;
            assert_eq!(counter.load(Ordering::SeqCst), 0);

            client.write_all(b"ping\nhelp\n").await.unwrap();
            let out = read_until(&mut client, "# counts calls #").await;
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert!(!out.contains("+ reboot"));
        }

        #[tokio::test]
        async fn test_shared_registry_commands_visible() {
            let shared = CommandRegistry::new();
            let counter = Arc::new(AtomicUsize::new(0));
            let cmd = shared.add(counter_command("shared", counter.clone()));
            let (console, mut client) =
                console_over_duplex(ConsoleOptions::new().with_shared_commands(shared.clone()));
            console.start();
            read_until(&mut client, PROMPT).await;

            client.write_all(b"shared\nwhoAmI\n").await.unwrap();
            read_until(&mut client, "User Level").await;
            assert_eq!(counter.load(Ordering::SeqCst), 1);

            assert!(console.remove_command(&cmd));
            assert!(shared.is_empty());
            assert!(!console.remove_command(&cmd));
        }
    }

    mod login {
        use super::*;

        #[tokio::test]
        async fn test_no_dispatch_before_password() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            let counter = Arc::new(AtomicUsize::new(0));
            console.add_command(counter_command("tick", counter.clone()));
            console.enable_login("s3cret");
            console.start();
            read_until(&mut client, PASSWORD_PROMPT).await;
            assert_eq!(console.state(), SessionState::AwaitingPassword);

            client.write_all(b"tick\n").await.unwrap();
            read_until(&mut client, PASSWORD_PROMPT).await;
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            assert!(!console.is_authenticated());

            client.write_all(b"s3cret\n").await.unwrap();
            read_until(&mut client, AUTHENTICATED_MESSAGE).await;
            assert_eq!(console.state(), SessionState::Authenticated);

            client.write_all(b"tick\nwhoAmI\n").await.unwrap();
            read_until(&mut client, "User Level").await;
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_disable_login_shows_prompt() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.enable_login("pw");
            console.disable_login();
            assert!(!console.is_login_enabled());
            console.start();
            read_until(&mut client, PROMPT).await;
            assert_eq!(console.state(), SessionState::Authenticated);
        }

        #[tokio::test]
        async fn test_new_password_keeps_authenticated_session() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.enable_login("old");
            console.start();
            read_until(&mut client, PASSWORD_PROMPT).await;
            client.write_all(b"old\n").await.unwrap();
            read_until(&mut client, AUTHENTICATED_MESSAGE).await;

            console.enable_login("new");
            assert!(console.is_authenticated());
            client.write_all(b"whoAmI\n").await.unwrap();
            read_until(&mut client, "User Level = Root\r\n> ").await;
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_on_close_runs_once_on_repeated_stop() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new());
            let calls = Arc::new(AtomicUsize::new(0));
            let c = calls.clone();
            console.set_on_close(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
            console.start();

            console.stop().await;
            console.stop().await;
            console.closed().await;
            console.stop().await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(console.state(), SessionState::Closed);
        }

        #[tokio::test]
        async fn test_remote_eof_closes() {
            let (console, client) = console_over_duplex(ConsoleOptions::new());
            let calls = Arc::new(AtomicUsize::new(0));
            let c = calls.clone();
            console.set_on_close(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
            console.start();
            drop(client);

            tokio::time::timeout(Duration::from_secs(5), console.closed())
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(console.close_reason(), Some(CloseReason::EndOfStream));
        }

        #[tokio::test]
        async fn test_replaced_callback_wins() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new());
            let first = Arc::new(AtomicUsize::new(0));
            let second = Arc::new(AtomicUsize::new(0));
            let f = first.clone();
            console.set_on_close(move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
            let s = second.clone();
            console.set_on_close(move || async move {
                s.fetch_add(1, Ordering::SeqCst);
            });
            console.start();
            console.stop().await;
            console.closed().await;

            assert_eq!(first.load(Ordering::SeqCst), 0);
            assert_eq!(second.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_stop_before_start_closes() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new());
            console.stop().await;
            assert!(console.is_closed());
            assert!(!console.start());
        }

        #[tokio::test]
        async fn test_second_start_refused() {
            let (console, _client) = console_over_duplex(ConsoleOptions::new());
            assert!(console.start());
            assert!(!console.start());
            console.stop().await;
        }

        #[tokio::test]
        async fn test_stop_from_handler() {
            let (console, mut client) = console_over_duplex(ConsoleOptions::new());
            console.add_command(Command::new("quit", "leave", |c, _cmd, _args| async move {
                c.stop().await;
                Ok(())
            }));
            console.start();
            read_until(&mut client, PROMPT).await;
            client.write_all(b"quit\n").await.unwrap();

            tokio::time::timeout(Duration::from_secs(5), console.closed())
                .await
                .unwrap();
        }
    }

    mod idle_timeout {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_idle_session_times_out() {
            let (console, mut client) = console_over_duplex(
                ConsoleOptions::new()
                    .with_timeout(Duration::from_secs(10))
                    .with_watchdog_interval(Duration::from_secs(1)),
            );
            console.start();
            read_until(&mut client, PROMPT).await;

            tokio::time::timeout(Duration::from_secs(12), console.closed())
                .await
                .expect("session should time out");
            assert_eq!(console.close_reason(), Some(CloseReason::IdleTimeout));
            let out = read_until(&mut client, TIMEOUT_MESSAGE).await;
            assert!(out.contains(TIMEOUT_MESSAGE));
        }

        #[tokio::test(start_paused = true)]
        async fn test_activity_defers_timeout() {
            let (console, mut client) = console_over_duplex(
                ConsoleOptions::new()
                    .with_timeout(Duration::from_secs(10))
                    .with_watchdog_interval(Duration::from_secs(1)),
            );
            console.start();
            read_until(&mut client, PROMPT).await;

            tokio::time::sleep(Duration::from_secs(8)).await;
            client.write_all(b"whoAmI\n").await.unwrap();
            read_until(&mut client, "User Level").await;
            tokio::time::sleep(Duration::from_secs(8)).await;
            assert!(!console.is_closed());

            tokio::time::timeout(Duration::from_secs(5), console.closed())
                .await
                .expect("session should time out after inactivity");
        }

        #[tokio::test(start_paused = true)]
        async fn test_zero_timeout_never_expires() {
            let (console, mut client) = console_over_duplex(
                ConsoleOptions::new().with_watchdog_interval(Duration::from_secs(1)),
            );
            console.start();
            read_until(&mut client, PROMPT).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            assert!(!console.is_closed());
            console.stop().await;
        }
    }

    mod info {
        use super::*;

        #[tokio::test]
        async fn test_info_snapshot() {
            let (console, _client) = console_over_duplex(
                ConsoleOptions::new()
                    .with_id("info-1")
                    .with_timeout(Duration::from_secs(30)),
            );
            console.enable_login("x");
            let info = console.info();
            assert_eq!(info.id, "info-1");
            assert_eq!(info.state, SessionState::AwaitingPassword);
            assert!(info.login_enabled);
            assert_eq!(info.timeout_secs, 30);
            assert_eq!(info.level, UserLevel::Root);
        }
    }
}
