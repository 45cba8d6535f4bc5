pub mod client;

use rumqttc::QoS;

use crate::error::PublishError;

pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const RPC_REQUEST_SUBSCRIPTION: &str = "v1/devices/me/rpc/request/+";
pub const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

/// An inbound publish, as handed from the session to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Discrete events produced by a broker session. Lifecycle events carry the
/// generation of the session that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { generation: u64 },
    MessageReceived(MqttMessage),
    Disconnected { generation: u64, reason: String },
}

/// Fire-and-forget publishing. Implementations must not block or await delivery.
pub trait Publish: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Extract the correlation id from `v1/devices/me/rpc/request/{id}`.
pub fn correlation_id(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix(RPC_REQUEST_PREFIX)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

pub fn response_topic(correlation_id: &str) -> String {
    format!("{RPC_RESPONSE_PREFIX}{correlation_id}")
}
