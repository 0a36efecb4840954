//! Telnet adapter: one TCP connection, one console.
//!
//! The listener is bound before [`TelnetConsole::bind`] returns, so address
//! errors reach the caller. Each accepted connection is registered in the
//! live client set before the next accept, which keeps the capacity check
//! exact. A client record is removed when its console's on-close fires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::command::{Command, CommandRegistry};
use super::error::ConsoleError;
use super::session::{Console, OnNewConsole, SessionDefaults};
use super::stream::{ConsoleIo, StreamCapabilities};

struct TelnetClient {
    console: Console,
    peer: SocketAddr,
}

struct TelnetInner {
    local_addr: SocketAddr,
    max_clients: usize,
    clients: RwLock<HashMap<String, TelnetClient>>,
    defaults: SessionDefaults,
    shutdown: CancellationToken,
}

/// Telnet console server.
pub struct TelnetConsole {
    inner: Arc<TelnetInner>,
    task: Mutex<Option<JoinHandle<Result<(), ConsoleError>>>>,
}

impl TelnetConsole {
    /// Listen on every IPv4 interface at `port`.
    pub async fn new(port: u16, max_clients: usize) -> Result<Self, ConsoleError> {
        Self::bind(&format!("0.0.0.0:{port}"), max_clients).await
    }

    /// Listen on `addr` and start accepting clients.
    pub async fn bind(addr: &str, max_clients: usize) -> Result<Self, ConsoleError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConsoleError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, max_clients, "Telnet console listening");

        let inner = Arc::new(TelnetInner {
            local_addr,
            max_clients,
            clients: RwLock::new(HashMap::new()),
            defaults: SessionDefaults::new(),
            shutdown: CancellationToken::new(),
        });

        let task = tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Idle timeout applied to consoles created from now on.
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

    /// Commands visible to every telnet console.
    pub fn commands(&self) -> &CommandRegistry {
        self.inner.defaults.commands()
    }

    pub fn add_command(&self, command: Command) -> Arc<Command> {
        self.inner.defaults.commands().add(command)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Stop accepting and stop every live console.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let consoles: Vec<Console> = self
            .inner
            .clients
            .read()
            .await
            .values()
            .map(|client| client.console.clone())
            .collect();
        for console in consoles {
            console.stop().await;
        }
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
}

async fn accept_loop(inner: Arc<TelnetInner>, listener: TcpListener) -> Result<(), ConsoleError> {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                info!(addr = %inner.local_addr, "Telnet console stopped accepting");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(source) => {
                error!(addr = %inner.local_addr, error = %source, "Telnet accept failed");
                return Err(ConsoleError::Accept {
                    addr: inner.local_addr,
                    source,
                });
            }
        };

        let live = inner.clients.read().await.len();
        if live >= inner.max_clients {
            warn!(peer = %peer, live, max = inner.max_clients, "MAX clients reached, connection refused");
            drop(stream);
            continue;
        }

        register_client(&inner, stream, peer).await;
    }
}

async fn register_client(inner: &Arc<TelnetInner>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let io = ConsoleIo::from_stream(stream, StreamCapabilities::ALL);
    let console = Console::new(io, inner.defaults.options());
    let id = console.id().to_string();

    inner.clients.write().await.insert(
        id.clone(),
        TelnetClient {
            console: console.clone(),
            peer,
        },
    );
    info!(peer = %peer, console_id = %id, "Telnet client connected");

    inner.defaults.prepare(&console);

    let (quit_tx, quit_rx) = oneshot::channel::<()>();
    console.set_on_close(move || async move {
        let _ = quit_tx.send(());
    });
    console.start();

    let inner = inner.clone();
    tokio::spawn(async move {
        // The sender is dropped without sending only if the console is
        // dropped unclosed; either way the client is gone.
        let _ = quit_rx.await;
        if let Some(client) = inner.clients.write().await.remove(&id) {
            info!(peer = %client.peer, console_id = %id, "Telnet client disconnected");
        }
    });
}
