//! MQTT adapter: one pub/sub link, many virtual clients.
//!
//! This module is organized into the following submodules:
//!
//! - `chat`: topics, wire messages and the [`ChatLink`] boundary
//! - `connection`: per-client virtual connection and its console stream
//!
//! Inbound messages are demultiplexed by client identity. An unknown client
//! gets a new virtual connection and console; a known client's payload is
//! queued to its console. Every console writes to one shared outbound queue
//! drained by a single publisher task.

mod chat;
mod connection;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use chat::{ChatLink, ChatTopics, MqttJsonData, MqttOutMessage, TOPIC_PREFIX};
pub use connection::{INBOUND_QUEUE_CAPACITY, PRESENTATION_SENTINEL, VirtualConnection};

use connection::{OutboundMessage, VirtualReader, VirtualWriter};

use super::command::{Command, CommandRegistry};
use super::config::{MAX_PUBLISH_RETRY_DELAY, resolve_publish_retries, resolve_publish_retry_delay};
use super::error::{ConsoleError, is_retryable_error};
use super::session::{Console, OnNewConsole, SessionDefaults};
use super::storage::{ClientRef, ClientStorage, DashMapClientStorage};
use super::stream::ConsoleIo;

/// Capacity of the outbound queue shared by every client.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

pub const MQTT_WELCOME: &str = "***    Welcome MQTT Console    ***";

/// Stripped from every outbound body.
pub const PROMPT_MARKER: char = '>';

/// Options for [`MqttConsole`] construction.
#[derive(Clone, Default)]
pub struct MqttConsoleOptions {
    max_connections: usize,
    timeout: Option<Duration>,
    publish_retries: Option<u32>,
    publish_retry_delay: Option<Duration>,
    storage: Option<Arc<dyn ClientStorage>>,
}

impl MqttConsoleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on live virtual clients; 0 means unbounded.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_publish_retries(mut self, retries: u32) -> Self {
        self.publish_retries = Some(retries);
        self
    }

    pub fn with_publish_retry_delay(mut self, delay: Duration) -> Self {
        self.publish_retry_delay = Some(delay);
        self
    }

    /// Replace the default `DashMap` client storage.
    pub fn with_storage(mut self, storage: Arc<dyn ClientStorage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

struct MqttInner {
    link: Arc<dyn ChatLink>,
    topics: ChatTopics,
    clients: Arc<dyn ClientStorage>,
    defaults: SessionDefaults,
    max_connections: usize,
    /// Serializes the capacity check with the insert of a new client.
    admission: Mutex<()>,
    publish_retries: u32,
    publish_retry_delay: Duration,
    outbound: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// MQTT console server. Cloning shares the adapter.
#[derive(Clone)]
pub struct MqttConsole {
    inner: Arc<MqttInner>,
}

impl MqttConsole {
    pub fn new(link: Arc<dyn ChatLink>, instance_id: &str, options: MqttConsoleOptions) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let defaults = SessionDefaults::new();
        if let Some(timeout) = options.timeout {
            defaults.set_timeout(timeout);
        }

        Self {
            inner: Arc::new(MqttInner {
                link,
                topics: ChatTopics::for_instance(instance_id),
                clients: options
                    .storage
                    .unwrap_or_else(|| Arc::new(DashMapClientStorage::new())),
                defaults,
                max_connections: options.max_connections,
                admission: Mutex::new(()),
                publish_retries: resolve_publish_retries(options.publish_retries),
                publish_retry_delay: resolve_publish_retry_delay(options.publish_retry_delay),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                publisher: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn topics(&self) -> &ChatTopics {
        &self.inner.topics
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

    /// Commands visible to every MQTT console.
    pub fn commands(&self) -> &CommandRegistry {
        self.inner.defaults.commands()
    }

    pub fn add_command(&self, command: Command) -> Arc<Command> {
        self.inner.defaults.commands().add(command)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Console of a live client.
    pub fn console(&self, client_uuid: &str) -> Option<Console> {
        self.inner
            .clients
            .get(client_uuid)
            .map(|client| client.console)
    }

    /// Start the outbound publisher, then the chat link.
    pub async fn start(&self) -> Result<(), ConsoleError> {
        let outbound_rx = self.inner.outbound_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(outbound_rx) = outbound_rx else {
            warn!("MQTT console already started");
            return Ok(());
        };

        info!(rx = %self.inner.topics.rx, tx = %self.inner.topics.tx, "START - MQTT Console");
        let publisher = tokio::spawn(publish_loop(
            self.inner.link.clone(),
            outbound_rx,
            self.inner.publish_retries,
            self.inner.publish_retry_delay,
            self.inner.shutdown.clone(),
        ));
        if let Ok(mut slot) = self.inner.publisher.lock() {
            *slot = Some(publisher);
        }

        self.inner.link.start(&self.inner.topics).await
    }

    /// Stop the publisher and every client console.
    pub async fn stop(&self) {
        let clients = self.inner.clients.drain();
        for client in clients {
            client.console.stop().await;
        }
        self.inner.shutdown.cancel();
        let publisher = self.inner.publisher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(publisher) = publisher {
            let _ = publisher.await;
        }
        info!("STOP - MQTT Console");
    }

    /// Inbound data callback, invoked by the chat link for every message.
    pub async fn on_data_rx(&self, data: MqttJsonData) {
        if !data.is_complete() {
            debug!(client_uuid = %data.client_uuid, "Discarding incomplete message");
            return;
        }

        if let Some(client) = self.inner.clients.get(&data.client_uuid) {
            route(&client, data).await;
            return;
        }

        if self.is_full() {
            warn!(client_uuid = %data.client_uuid, max = self.inner.max_connections, "Max number of connection reached");
            return;
        }

        self.open_client(data).await;
    }

    fn is_full(&self) -> bool {
        let max = self.inner.max_connections;
        max > 0 && self.inner.clients.len() >= max
    }

    async fn open_client(&self, data: MqttJsonData) {
        let client_uuid = data.client_uuid.clone();
        let (connection, inbound) =
            VirtualConnection::new(&client_uuid, &data.cmd_uuid, self.inner.outbound.downgrade());
        let io = ConsoleIo::new(
            VirtualReader::new(inbound),
            VirtualWriter::new(connection.clone()),
        );
        let console = Console::new(
            io,
            self.inner
                .defaults
                .options()
                .with_id(client_uuid.clone())
                .with_welcome(MQTT_WELCOME),
        );

        let client = ClientRef {
            connection: connection.clone(),
            console: console.clone(),
        };
        let admission = {
            let _admission = self
                .inner
                .admission
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.clients.contains(&client_uuid) {
                Admission::Exists
            } else if self.is_full() {
                Admission::Full
            } else if self.inner.clients.insert_new(&client_uuid, client) {
                Admission::Opened
            } else {
                Admission::Exists
            }
        };
        match admission {
            Admission::Opened => {}
            Admission::Exists => {
                // Another message from the same client created it first.
                if let Some(existing) = self.inner.clients.get(&client_uuid) {
                    route(&existing, data).await;
                }
                return;
            }
            Admission::Full => {
                warn!(client_uuid = %client_uuid, max = self.inner.max_connections, "Max number of connection reached");
                return;
            }
        }

        self.inner.defaults.prepare(&console);

        let inner: Weak<MqttInner> = Arc::downgrade(&self.inner);
        let id = client_uuid.clone();
        console.set_on_close(move || async move {
            if let Some(inner) = inner.upgrade()
                && inner.clients.remove_connection(&id, &connection).is_some()
            {
                info!(client_uuid = %id, "Close mqtt connection with client");
            }
        });

        info!(client_uuid = %client_uuid, "Open mqtt connection with client");

        let ack = OutboundMessage {
            body: " \r\n".to_string(),
            client_uuid,
            cmd_uuid: data.cmd_uuid,
        };
        if self.inner.outbound.send(ack).await.is_err() {
            debug!("Outbound queue closed");
        }
        console.start();
    }
}

enum Admission {
    Opened,
    Exists,
    Full,
}

async fn route(client: &ClientRef, data: MqttJsonData) {
    client.connection.set_last_cmd_uuid(&data.cmd_uuid);
    if !client.connection.deliver(data.data).await {
        debug!(client_uuid = %data.client_uuid, "Client console already closed");
    }
}

/// Body as published: a bare terminator becomes empty and prompt markers
/// are removed.
pub(crate) fn outbound_payload(body: &str) -> String {
    let body = if body == "\r\n" { "" } else { body };
    body.replace(PROMPT_MARKER, "")
}

async fn publish_loop(
    link: Arc<dyn ChatLink>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    retries: u32,
    retry_delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let out = MqttOutMessage {
            payload: outbound_payload(&message.body),
            cmd_uuid: message.cmd_uuid,
            client_uuid: message.client_uuid,
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(retry_delay)
            .with_max_delay(MAX_PUBLISH_RETRY_DELAY)
            .with_max_times(retries as usize)
            .with_jitter();

        let result = (|| async { link.transmit(&out).await })
            .retry(backoff)
            .when(|e| is_retryable_error(&e.to_string()))
            .notify(|err, dur| {
                debug!(error = %err, delay = ?dur, "Publish failed, retrying");
            })
            .await;

        if let Err(e) = result {
            warn!(client_uuid = %out.client_uuid, error = %e, "Dropping MQTT response");
        }
    }
    debug!("MQTT publisher exit");
}
