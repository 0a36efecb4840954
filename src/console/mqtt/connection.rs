//! Virtual connection: one remote MQTT client seen as a console stream.
//!
//! Inbound payloads for the client are queued on a bounded per-client
//! queue. Output is tagged with the client identity and the correlation id
//! of the client's latest command, then pushed to the adapter's shared
//! outbound queue. The connection only holds a weak sender to that queue;
//! the adapter owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::console::error::ConsoleError;
use crate::console::stream::{ConsoleReader, ConsoleWriter, ReadMode, StreamCapabilities};

/// Capacity of each client's inbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 20;

/// Payload a client sends to introduce itself; read as an empty line.
pub const PRESENTATION_SENTINEL: &str = "whoami";

#[derive(Debug)]
pub(crate) enum Inbound {
    Data(String),
    Close,
}

/// Message waiting on the shared outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundMessage {
    pub(crate) body: String,
    pub(crate) client_uuid: String,
    pub(crate) cmd_uuid: String,
}

pub struct VirtualConnection {
    client_uuid: String,
    last_cmd_uuid: RwLock<String>,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::WeakSender<OutboundMessage>,
    up: AtomicBool,
}

impl VirtualConnection {
    pub(crate) fn new(
        client_uuid: &str,
        cmd_uuid: &str,
        outbound: mpsc::WeakSender<OutboundMessage>,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let connection = Arc::new(Self {
            client_uuid: client_uuid.to_string(),
            last_cmd_uuid: RwLock::new(cmd_uuid.to_string()),
            inbound,
            outbound,
            up: AtomicBool::new(true),
        });
        (connection, inbound_rx)
    }

    /// A connection whose outbound queue is already gone.
    #[cfg(test)]
    pub(crate) fn detached(client_uuid: &str) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (outbound, _) = mpsc::channel(1);
        Self::new(client_uuid, "", outbound.downgrade())
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn last_cmd_uuid(&self) -> String {
        self.last_cmd_uuid
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_last_cmd_uuid(&self, cmd_uuid: &str) {
        if let Ok(mut id) = self.last_cmd_uuid.write() {
            *id = cmd_uuid.to_string();
        }
    }

    /// Queue a payload for the console. Waits while the queue is full.
    pub(crate) async fn deliver(&self, payload: String) -> bool {
        self.inbound.send(Inbound::Data(payload)).await.is_ok()
    }

    /// Tag `body` and push it to the outbound queue. Dropped once down.
    pub(crate) async fn transmit(&self, body: String) {
        if !self.is_up() {
            return;
        }
        let Some(outbound) = self.outbound.upgrade() else {
            return;
        };
        let message = OutboundMessage {
            body,
            client_uuid: self.client_uuid.clone(),
            cmd_uuid: self.last_cmd_uuid(),
        };
        let _ = outbound.send(message).await;
    }

    /// Mark down and wake the reader with the close sentinel.
    pub(crate) fn close(&self) {
        self.up.store(false, Ordering::SeqCst);
        let _ = self.inbound.try_send(Inbound::Close);
    }
}

pub(crate) struct VirtualReader {
    inbound: mpsc::Receiver<Inbound>,
}

impl VirtualReader {
    pub(crate) fn new(inbound: mpsc::Receiver<Inbound>) -> Self {
        Self { inbound }
    }
}

#[async_trait]
impl ConsoleReader for VirtualReader {
    async fn read_line(&mut self, _mode: ReadMode) -> Result<Option<String>, ConsoleError> {
        match self.inbound.recv().await {
            Some(Inbound::Data(payload)) if payload == PRESENTATION_SENTINEL => Ok(Some(String::new())),
            Some(Inbound::Data(payload)) => {
                Ok(Some(payload.trim_end_matches(['\r', '\n']).to_string()))
            }
            Some(Inbound::Close) | None => {
                self.inbound.close();
                Ok(None)
            }
        }
    }
}

pub(crate) struct VirtualWriter {
    connection: Arc<VirtualConnection>,
}

impl VirtualWriter {
    pub(crate) fn new(connection: Arc<VirtualConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ConsoleWriter for VirtualWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConsoleError> {
        let text = String::from_utf8_lossy(data);
        let body = text.trim_matches(['\r', '\n']).to_string();
        self.connection.transmit(body).await;
        Ok(())
    }

    fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities {
            flush: false,
            close: true,
        }
    }

    async fn close(&mut self) -> Result<(), ConsoleError> {
        self.connection.close();
        Ok(())
    }
}
