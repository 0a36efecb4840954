//! SSH console server and its connection bookkeeping.
//!
//! Every accepted TCP connection gets a record, keyed by a generated
//! connection id, holding the russh [`Handle`] and the consoles of its open
//! session channels. The record is created at accept time, so connections
//! still in their handshake count toward `max_connections`. A connection is
//! disconnected when its last channel closes, and its record is dropped when
//! the russh session ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::server::Handle;
use russh::{ChannelId, Disconnect};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{AuthStrategy, KeyAuth, PasswordAuth};
use super::handler::SshHandler;
use super::keys::parse_host_key;
use crate::console::command::{Command, CommandRegistry};
use crate::console::error::ConsoleError;
use crate::console::session::{Console, OnNewConsole, SessionDefaults};

/// Options for [`SshConsole`] construction.
#[derive(Debug, Clone, Default)]
pub struct SshConsoleOptions {
    key_passphrase: Option<String>,
    timeout: Option<Duration>,
}

impl SshConsoleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passphrase protecting the host key.
    pub fn with_key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.key_passphrase = Some(passphrase.into());
        self
    }

    /// Idle timeout for consoles on this adapter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct ConnectionRecord {
    peer: SocketAddr,
    handle: Option<Handle>,
    channels: HashMap<ChannelId, Console>,
}

pub(crate) struct SshInner {
    pub(crate) auth: Arc<dyn AuthStrategy>,
    pub(crate) defaults: SessionDefaults,
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    shutdown: CancellationToken,
}

impl SshInner {
    /// Add a channel console to its connection. Returns `false` when the
    /// connection record is gone (adapter stopping).
    pub(crate) async fn register_channel(
        &self,
        conn_id: &str,
        channel: ChannelId,
        console: Console,
        handle: Handle,
    ) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(conn_id) {
            Some(record) => {
                record.handle.get_or_insert(handle);
                record.channels.insert(channel, console);
                true
            }
            None => false,
        }
    }

    /// On-close path of a channel console: close the channel, and the whole
    /// connection once it has no channel left.
    pub(crate) async fn close_channel(&self, conn_id: &str, channel: ChannelId) {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(conn_id) else {
            debug!(conn_id, "Connection not found, already closed");
            return;
        };

        record.channels.remove(&channel);
        let handle = record.handle.clone();
        let last = record.channels.is_empty();
        if last && let Some(record) = connections.remove(conn_id) {
            info!(conn_id, peer = %record.peer, "Last channel closed, closing SSH connection");
        }
        drop(connections);

        if let Some(handle) = handle {
            let _ = handle.close(channel).await;
            if last {
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "console closed".to_string(),
                        "en".to_string(),
                    )
                    .await;
            }
        }
    }

    async fn forget_connection(&self, conn_id: &str) -> Option<ConnectionRecord> {
        self.connections.write().await.remove(conn_id)
    }
}

/// SSH console server. Each session channel of an authenticated connection
/// is one console.
pub struct SshConsole {
    inner: Arc<SshInner>,
    config: Arc<russh::server::Config>,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<Result<(), ConsoleError>>>>,
}

impl SshConsole {
    /// Authenticate with a user to password table.
    pub fn new_with_password<U, P>(
        host_key: &str,
        users: impl IntoIterator<Item = (U, P)>,
        options: SshConsoleOptions,
    ) -> Result<Self, ConsoleError>
    where
        U: Into<String>,
        P: Into<String>,
    {
        Self::new_with_auth(host_key, Arc::new(PasswordAuth::new(users)), options)
    }

    /// Authenticate with the keys listed in `authorized_keys` text.
    pub fn new_with_keys(
        host_key: &str,
        authorized_keys: &str,
        options: SshConsoleOptions,
    ) -> Result<Self, ConsoleError> {
        let keys = KeyAuth::from_authorized_keys(authorized_keys)?;
        Self::new_with_auth(host_key, Arc::new(keys), options)
    }

    /// Authenticate with any strategy, such as an [`AuthChain`](super::auth::AuthChain).
    pub fn new_with_auth(
        host_key: &str,
        auth: Arc<dyn AuthStrategy>,
        options: SshConsoleOptions,
    ) -> Result<Self, ConsoleError> {
        let key = parse_host_key(host_key, options.key_passphrase.as_deref())?;

        let config = russh::server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };

        let defaults = SessionDefaults::new();
        if let Some(timeout) = options.timeout {
            defaults.set_timeout(timeout);
        }

        Ok(Self {
            inner: Arc::new(SshInner {
                auth,
                defaults,
                connections: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
            config: Arc::new(config),
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.defaults.set_timeout(timeout);
    }

    /// Run `callback` for every new console before it starts.
    pub fn set_on_new_console<F>(&self, callback: F)
    where
        F: Fn(&Console) + Send + Sync + 'static,
    {
        let callback: OnNewConsole = Arc::new(callback);
        self.inner.defaults.set_on_new_console(Some(callback));
    }

    pub fn remove_on_new_console(&self) {
        self.inner.defaults.set_on_new_console(None);
    }

    /// Commands visible to every SSH console.
    pub fn commands(&self) -> &CommandRegistry {
        self.inner.defaults.commands()
    }

    pub fn add_command(&self, command: Command) -> Arc<Command> {
        self.inner.defaults.commands().add(command)
    }

    /// Bind `addr` and accept connections in the background.
    pub async fn bind(&self, addr: &str, max_connections: usize) -> Result<SocketAddr, ConsoleError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConsoleError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(local_addr);
        }
        info!(addr = %local_addr, max_connections, "SSH console listening");

        let task = tokio::spawn(accept_loop(
            self.inner.clone(),
            self.config.clone(),
            listener,
            local_addr,
            max_connections,
        ));
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        Ok(local_addr)
    }

    /// Listen on `host:port` and serve until [`stop`](Self::stop) or a
    /// listener failure.
    pub async fn start(&self, host: &str, port: u16, max_connections: usize) -> Result<(), ConsoleError> {
        self.bind(&format!("{host}:{port}"), max_connections).await?;
        self.join().await
    }

    /// Wait for the accept loop to end and return its result.
    pub async fn join(&self) -> Result<(), ConsoleError> {
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        match task {
            Some(task) => task
                .await
                .map_err(|e| ConsoleError::Io(std::io::Error::other(e)))?,
            None => Ok(()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .await
            .values()
            .map(|record| record.channels.len())
            .sum()
    }

    /// Stop accepting, stop every console and disconnect every client.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let records: Vec<ConnectionRecord> = self
            .inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, record)| record)
            .collect();

        for record in records {
            for console in record.channels.values() {
                console.stop().await;
            }
            if let Some(handle) = record.handle {
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "server shutting down".to_string(),
                        "en".to_string(),
                    )
                    .await;
            }
        }
        info!("SSH console stopped");
    }
}

async fn accept_loop(
    inner: Arc<SshInner>,
    config: Arc<russh::server::Config>,
    listener: TcpListener,
    local_addr: SocketAddr,
    max_connections: usize,
) -> Result<(), ConsoleError> {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                info!(addr = %local_addr, "SSH console stopped accepting");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(source) => {
                error!(addr = %local_addr, error = %source, "SSH accept failed");
                return Err(ConsoleError::Accept {
                    addr: local_addr,
                    source,
                });
            }
        };

        let mut connections = inner.connections.write().await;
        if connections.len() >= max_connections {
            warn!(peer = %peer, max = max_connections, "Max clients reached, connection refused");
            drop(connections);
            drop(stream);
            continue;
        }

        let conn_id = Uuid::new_v4().simple().to_string();
        connections.insert(
            conn_id.clone(),
            ConnectionRecord {
                peer,
                handle: None,
                channels: HashMap::new(),
            },
        );
        drop(connections);
        info!(peer = %peer, conn_id = %conn_id, "New SSH connection");

        tokio::spawn(serve_connection(inner.clone(), config.clone(), stream, peer, conn_id));
    }
}

async fn serve_connection(
    inner: Arc<SshInner>,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: String,
) {
    let handler = SshHandler::new(inner.clone(), conn_id.clone(), peer);
    match russh::server::run_stream(config, stream, handler).await {
        Ok(running) => {
            if let Some(record) = inner.connections.write().await.get_mut(&conn_id) {
                record.handle.get_or_insert_with(|| running.handle());
            }
            if let Err(e) = running.await {
                debug!(conn_id = %conn_id, error = %e, "SSH session ended with error");
            }
        }
        Err(e) => {
            warn!(peer = %peer, conn_id = %conn_id, error = %e, "SSH handshake failed");
        }
    }

    if let Some(record) = inner.forget_connection(&conn_id).await {
        for console in record.channels.values() {
            console.stop().await;
        }
    }
    info!(peer = %peer, conn_id = %conn_id, "SSH connection closed");
}
