//! Boundary with the pub/sub messaging link.
//!
//! The broker connection itself lives behind [`ChatLink`]. The adapter only
//! needs to start the link with its topic set and to publish tagged
//! responses; received data messages are handed back by the host through
//! [`MqttConsole::on_data_rx`](super::MqttConsole::on_data_rx).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::console::error::ConsoleError;

pub const TOPIC_PREFIX: &str = "/mqtt-shell/";

/// Topics derived from an instance discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTopics {
    /// Inbound commands, `<prefix><instance>/cmd`.
    pub rx: String,
    /// Outbound responses, `<prefix><instance>/cmd/res`.
    pub tx: String,
    /// Presence beacon, `<prefix><instance>/event`.
    pub beacon_event: String,
    /// Presence request shared by every instance, `<prefix>whoami`.
    pub beacon_request: String,
    /// Link version string announced in beacons.
    pub version: String,
}

impl ChatTopics {
    pub fn for_instance(instance_id: &str) -> Self {
        Self {
            rx: format!("{TOPIC_PREFIX}{instance_id}/cmd"),
            tx: format!("{TOPIC_PREFIX}{instance_id}/cmd/res"),
            beacon_event: format!("{TOPIC_PREFIX}{instance_id}/event"),
            beacon_request: format!("{TOPIC_PREFIX}whoami"),
            version: format!("mqtt-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Inbound data message.
///
/// Missing fields decode as empty strings; incomplete messages are
/// discarded by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttJsonData {
    #[serde(rename = "clientUUID")]
    pub client_uuid: String,
    #[serde(rename = "cmdUUID")]
    pub cmd_uuid: String,
    pub cmd: String,
    pub data: String,
}

impl MqttJsonData {
    pub fn new(
        client_uuid: impl Into<String>,
        cmd_uuid: impl Into<String>,
        cmd: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            client_uuid: client_uuid.into(),
            cmd_uuid: cmd_uuid.into(),
            cmd: cmd.into(),
            data: data.into(),
        }
    }

    /// Decode a received payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, ConsoleError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Every field is required to be non-empty.
    pub fn is_complete(&self) -> bool {
        !self.client_uuid.is_empty()
            && !self.cmd_uuid.is_empty()
            && !self.cmd.is_empty()
            && !self.data.is_empty()
    }
}

/// Outbound response message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttOutMessage {
    pub payload: String,
    #[serde(rename = "cmdUUID")]
    pub cmd_uuid: String,
    #[serde(rename = "clientUUID")]
    pub client_uuid: String,
}

impl MqttOutMessage {
    pub fn to_json(&self) -> Result<String, ConsoleError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messaging transport the MQTT adapter publishes through.
///
/// Implementations own the broker connection. Errors are reported as
/// [`ConsoleError::ChatLink`]; their text decides whether a publish is
/// retried.
#[async_trait]
pub trait ChatLink: Send + Sync {
    /// Connect and subscribe to `topics.rx` and `topics.beacon_request`.
    async fn start(&self, topics: &ChatTopics) -> Result<(), ConsoleError>;

    /// Publish one response on the tx topic.
    async fn transmit(&self, message: &MqttOutMessage) -> Result<(), ConsoleError>;
}
