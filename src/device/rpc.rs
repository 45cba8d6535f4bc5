use std::ops::RangeInclusive;

use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::mqtt::{MqttMessage, Publish, correlation_id, response_topic};

use super::{AIR_FLOW_RANGE, DeviceState, HvacState, TARGET_TEMPERATURE_RANGE};

/// A parsed inbound request, before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
    pub correlation_id: Option<String>,
}

/// Reply to a query-style request. `body` is sent bare, without an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub correlation_id: String,
    pub body: String,
}

impl RpcResponse {
    pub fn topic(&self) -> String {
        response_topic(&self.correlation_id)
    }
}

/// Closed set of device operations reachable over RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetEnabled(bool),
    SetTemperature(i32),
    SetAirFlow(i32),
    GetTemperature,
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetEnabled(_) => "setEnabled",
            Command::SetTemperature(_) => "setTemperature",
            Command::SetAirFlow(_) => "setAirFlow",
            Command::GetTemperature => "getTemperature",
            Command::Unknown(_) => "unknown",
        }
    }
}

/// Result of a request that made it to `Applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub changed: bool,
    pub reply: Option<RpcResponse>,
}

#[derive(Deserialize)]
struct RawRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Parse, route and apply inbound RPC messages against the device state.
pub struct RpcDispatcher<P> {
    publisher: P,
}

impl<P: Publish> RpcDispatcher<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// Handle one inbound message. Rejections are logged and leave the state
    /// untouched; at most one reply is published. Returns whether state changed.
    pub fn handle(&self, state: &mut DeviceState, msg: &MqttMessage) -> bool {
        let applied = match dispatch(state, msg) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Rejected RPC on {}: {}", msg.topic, e);
                return false;
            }
        };

        if let Some(reply) = applied.reply {
            let topic = reply.topic();
            match self
                .publisher
                .publish(&topic, QoS::AtLeastOnce, reply.body.into_bytes())
            {
                Ok(()) => debug!("Replied on {}", topic),
                Err(e) => warn!("Failed to publish reply on {}: {}", topic, e),
            }
        }
        applied.changed
    }
}

/// Received → Parsed → Routed → Applied, or an error at the first failing stage.
pub fn dispatch(state: &mut DeviceState, msg: &MqttMessage) -> Result<Applied, RpcError> {
    let request = parse(msg)?;
    let command = route(&request)?;
    info!("RPC {} on {}", command.name(), msg.topic);
    apply(state, command, request.correlation_id.as_deref(), &msg.topic)
}

pub fn parse(msg: &MqttMessage) -> Result<RpcRequest, RpcError> {
    let raw: RawRequest =
        serde_json::from_slice(&msg.payload).map_err(|e| RpcError::Parse(e.to_string()))?;
    Ok(RpcRequest {
        method: raw.method,
        params: raw.params,
        correlation_id: correlation_id(&msg.topic).map(str::to_string),
    })
}

pub fn route(request: &RpcRequest) -> Result<Command, RpcError> {
    let method = request.method.as_str();
    let is = |name: &str| method.eq_ignore_ascii_case(name);

    let command = if is("setEnabled") {
        Command::SetEnabled(bool_param("setEnabled", &request.params)?)
    } else if is("setTemperature") {
        Command::SetTemperature(int_param(
            "setTemperature",
            &request.params,
            &TARGET_TEMPERATURE_RANGE,
        )?)
    } else if is("setAirFlow") {
        Command::SetAirFlow(int_param("setAirFlow", &request.params, &AIR_FLOW_RANGE)?)
    } else if is("getTemperature") {
        Command::GetTemperature
    } else {
        Command::Unknown(request.method.clone())
    };
    Ok(command)
}

pub fn apply(
    state: &mut DeviceState,
    command: Command,
    correlation_id: Option<&str>,
    topic: &str,
) -> Result<Applied, RpcError> {
    let method = command.name();
    let changed = match command {
        Command::Unknown(name) => return Err(RpcError::UnknownMethod(name)),
        Command::SetEnabled(on) => {
            let hvac = hvac_of(state, method)?;
            std::mem::replace(&mut hvac.enabled, on) != on
        }
        Command::SetTemperature(t) => {
            let hvac = hvac_of(state, method)?;
            std::mem::replace(&mut hvac.target_temperature, t) != t
        }
        Command::SetAirFlow(f) => {
            let hvac = hvac_of(state, method)?;
            std::mem::replace(&mut hvac.air_flow, f) != f
        }
        Command::GetTemperature => {
            let hvac = hvac_of(state, method)?;
            let id = correlation_id.ok_or_else(|| RpcError::MissingCorrelationId(topic.into()))?;
            return Ok(Applied {
                changed: false,
                reply: Some(RpcResponse {
                    correlation_id: id.to_string(),
                    body: hvac.target_temperature.to_string(),
                }),
            });
        }
    };
    Ok(Applied {
        changed,
        reply: None,
    })
}

fn hvac_of<'a>(
    state: &'a mut DeviceState,
    method: &'static str,
) -> Result<&'a mut HvacState, RpcError> {
    let kind = state.kind().name();
    state
        .hvac_mut()
        .ok_or(RpcError::Unsupported { method, kind })
}

// Dashboard widgets send either a bare value or {"value": ...}
fn param_value(params: &Value) -> &Value {
    match params {
        Value::Object(map) => map.get("value").unwrap_or(params),
        other => other,
    }
}

fn bool_param(method: &'static str, params: &Value) -> Result<bool, RpcError> {
    param_value(params)
        .as_bool()
        .ok_or_else(|| RpcError::ParamType {
            method,
            reason: format!("expected boolean, got {params}"),
        })
}

fn int_param(
    method: &'static str,
    params: &Value,
    range: &RangeInclusive<i32>,
) -> Result<i32, RpcError> {
    let n = param_value(params)
        .as_i64()
        .ok_or_else(|| RpcError::ParamType {
            method,
            reason: format!("expected integer, got {params}"),
        })?;
    i32::try_from(n)
        .ok()
        .filter(|v| range.contains(v))
        .ok_or_else(|| RpcError::ParamType {
            method,
            reason: format!(
                "{n} outside [{}, {}]",
                range.start(),
                range.end()
            ),
        })
}
