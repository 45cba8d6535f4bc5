use thiserror::Error;

/// Failure of a `connect` attempt. Reported on the status channel, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("broker rejected credentials: {0}")]
    Auth(String),

    #[error("broker unreachable: {0}")]
    Network(String),

    #[error("handshake did not complete within {0:?}")]
    Timeout(std::time::Duration),

    #[error("broker refused connection: {0}")]
    Refused(String),
}

/// Why an inbound RPC was discarded. None of these produce a reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("malformed RPC payload: {0}")]
    Parse(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("bad params for {method}: {reason}")]
    ParamType { method: &'static str, reason: String },

    #[error("{method} is not supported by a {kind} device")]
    Unsupported {
        method: &'static str,
        kind: &'static str,
    },

    #[error("no correlation id in topic '{0}'")]
    MissingCorrelationId(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no active session")]
    NotConnected,

    #[error("client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
}
