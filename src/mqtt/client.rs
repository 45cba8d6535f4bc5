use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    NetworkOptions, Outgoing, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, Profile};
use crate::error::{ConnectError, PublishError};

use super::{MqttMessage, Publish, RPC_REQUEST_SUBSCRIPTION, SessionEvent};

const REQUEST_CAPACITY: usize = 64;

/// Operator-visible connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// A successfully established broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub client_id: String,
    pub session_present: bool,
    /// Tags every `SessionEvent` lifecycle event this session emits.
    pub generation: u64,
}

struct Live {
    client: AsyncClient,
    generation: u64,
}

/// Publish handle shared by the scheduler and the dispatcher. Publishing
/// without a live session fails with `NotConnected` and sends nothing.
#[derive(Clone, Default)]
pub struct SessionPublisher {
    slot: Arc<Mutex<Option<Live>>>,
}

impl SessionPublisher {
    fn lock(&self) -> MutexGuard<'_, Option<Live>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    fn install(&self, client: AsyncClient, generation: u64) {
        *self.lock() = Some(Live { client, generation });
    }

    fn take(&self) -> Option<AsyncClient> {
        self.lock().take().map(|live| live.client)
    }

    /// Clear the slot only if it still belongs to `generation`.
    fn release(&self, generation: u64) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|l| l.generation == generation) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl Publish for SessionPublisher {
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
        let slot = self.lock();
        let live = slot.as_ref().ok_or(PublishError::NotConnected)?;
        live.client.try_publish(topic, qos, false, payload)?;
        Ok(())
    }
}

/// Session lifecycle as seen by the agent.
pub trait Connection: Send {
    fn connect(&mut self) -> impl Future<Output = Result<Session, ConnectError>> + Send;

    /// Idempotent; returns whether a live session was torn down.
    fn disconnect(&mut self) -> bool;
}

/// Owns the broker session for one device profile. Never reconnects on its own.
pub struct ConnectionManager {
    config: MqttConfig,
    profile: Profile,
    events: mpsc::Sender<SessionEvent>,
    publisher: SessionPublisher,
    pump: Option<JoinHandle<()>>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(config: MqttConfig, profile: Profile, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            profile,
            events,
            publisher: SessionPublisher::default(),
            pump: None,
            generation: 0,
        }
    }

    pub fn publisher(&self) -> SessionPublisher {
        self.publisher.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    /// Connect, authenticate and subscribe to the RPC request topic.
    /// Any existing session is torn down first.
    pub async fn connect(&mut self) -> Result<Session, ConnectError> {
        self.disconnect();

        let mut mqttopts = MqttOptions::new(
            &self.profile.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        mqttopts.set_keep_alive(self.config.keep_alive);
        mqttopts.set_clean_session(true);
        mqttopts.set_credentials(&self.profile.username, &self.profile.password);

        let (client, mut eventloop) = AsyncClient::new(mqttopts, REQUEST_CAPACITY);
        let mut netopts = NetworkOptions::new();
        netopts.set_connection_timeout(self.config.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(netopts);

        info!(
            "Connecting to {}:{} as {} (profile {})",
            self.config.broker_host,
            self.config.broker_port,
            self.profile.client_id,
            self.profile.name
        );

        let timeout = self.config.connect_timeout;
        let mut pending = Vec::new();
        let session_present = tokio::time::timeout(
            timeout,
            handshake(&client, &mut eventloop, &mut pending, timeout),
        )
        .await
        .map_err(|_| ConnectError::Timeout(timeout))??;

        self.generation += 1;
        self.publisher.install(client, self.generation);
        self.pump = Some(tokio::spawn(pump(
            eventloop,
            self.events.clone(),
            self.publisher.clone(),
            self.generation,
            pending,
        )));

        info!("Connected, subscribed to {}", RPC_REQUEST_SUBSCRIPTION);
        Ok(Session {
            client_id: self.profile.client_id.clone(),
            session_present,
            generation: self.generation,
        })
    }

    /// Tear down the session if there is one. Safe to call in any state.
    pub fn disconnect(&mut self) -> bool {
        let mut graceful = false;
        let had_session = match self.publisher.take() {
            Some(client) => {
                match client.try_disconnect() {
                    Ok(()) => graceful = true,
                    Err(e) => debug!("Disconnect request not sent: {}", e),
                }
                true
            }
            None => false,
        };
        // A pump with a queued DISCONNECT flushes it and exits by itself
        if let Some(pump) = self.pump.take() {
            if !graceful {
                pump.abort();
            }
        }
        if had_session {
            info!("Disconnected from {}", self.config.broker_host);
        }
        had_session
    }
}

impl Connection for ConnectionManager {
    async fn connect(&mut self) -> Result<Session, ConnectError> {
        ConnectionManager::connect(self).await
    }

    fn disconnect(&mut self) -> bool {
        ConnectionManager::disconnect(self)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drive the event loop until CONNACK and the RPC SUBACK have both arrived.
async fn handshake(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    pending: &mut Vec<MqttMessage>,
    timeout: Duration,
) -> Result<bool, ConnectError> {
    let mut session_present = None;

    loop {
        let event = eventloop
            .poll()
            .await
            .map_err(|e| classify(e, timeout))?;

        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(refusal(ack.code));
                }
                debug!("CONNACK received (session_present={})", ack.session_present);
                session_present = Some(ack.session_present);
                client
                    .subscribe(RPC_REQUEST_SUBSCRIPTION, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| ConnectError::Network(e.to_string()))?;
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|c| matches!(c, SubscribeReasonCode::Failure))
                {
                    return Err(ConnectError::Refused(format!(
                        "subscription to {RPC_REQUEST_SUBSCRIPTION} rejected"
                    )));
                }
                if let Some(present) = session_present {
                    return Ok(present);
                }
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                pending.push(MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            _ => {}
        }
    }
}

/// Forward session traffic to the agent until the connection drops.
async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    publisher: SessionPublisher,
    generation: u64,
    pending: Vec<MqttMessage>,
) {
    if events.send(SessionEvent::Connected { generation }).await.is_err() {
        return;
    }
    for msg in pending {
        if events.send(SessionEvent::MessageReceived(msg)).await.is_err() {
            return;
        }
    }

    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                debug!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                let msg = MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(SessionEvent::MessageReceived(msg)).await.is_err() {
                    warn!("Session event channel closed");
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                break "broker sent DISCONNECT".to_string();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break "disconnect requested".to_string();
            }
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };

    // A newer session may already own the publisher; leave it alone.
    if publisher.release(generation) {
        error!("MQTT session lost: {}. Not reconnecting.", reason);
        let _ = events
            .send(SessionEvent::Disconnected { generation, reason })
            .await;
    }
}

fn classify(err: ConnectionError, timeout: Duration) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(code) => refusal(code),
        ConnectionError::NetworkTimeout => ConnectError::Timeout(timeout),
        ConnectionError::Io(e) => ConnectError::Network(e.to_string()),
        other => ConnectError::Network(other.to_string()),
    }
}

fn refusal(code: ConnectReturnCode) -> ConnectError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectError::Auth(format!("{code:?}"))
        }
        other => ConnectError::Refused(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentEvent, OperatorCommand};
    use crate::device::DeviceKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn profile() -> Profile {
        Profile {
            name: "TestDV2".into(),
            client_id: "dv2-client".into(),
            username: "dv2".into(),
            password: "secret".into(),
        }
    }

    fn mqtt_config(port: u16, timeout: Duration) -> MqttConfig {
        MqttConfig {
            broker_host: "127.0.0.1".into(),
            broker_port: port,
            connect_timeout: timeout,
            keep_alive: Duration::from_secs(30),
            auto_connect: false,
        }
    }

    /// Read one MQTT packet: (first header byte, body).
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let b = stream.read_u8().await.unwrap();
            len |= ((b & 0x7f) as usize) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Accepts one client, answers CONNECT with `connack_code` and, on success,
    /// acknowledges the subscription and pushes one RPC request.
    async fn fake_broker(connack_code: u8) -> (u16, JoinHandle<Vec<(u8, Vec<u8>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let connect = read_packet(&mut stream).await;
            assert_eq!(connect.0 >> 4, 1, "expected CONNECT");
            stream.write_all(&[0x20, 0x02, 0x00, connack_code]).await.unwrap();
            if connack_code != 0 {
                return seen;
            }

            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header >> 4, 8, "expected SUBSCRIBE");
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                .await
                .unwrap();

            let topic = b"v1/devices/me/rpc/request/7";
            let payload = br#"{"method":"getTemperature"}"#;
            let mut publish = vec![0x30, (2 + topic.len() + payload.len()) as u8, 0x00];
            publish.push(topic.len() as u8);
            publish.extend_from_slice(topic);
            publish.extend_from_slice(payload);
            stream.write_all(&publish).await.unwrap();

            // Collect until the client goes away
            loop {
                let mut next = [0u8; 1];
                match stream.peek(&mut next).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let packet = read_packet(&mut stream).await;
                        let disconnect = packet.0 >> 4 == 14;
                        seen.push(packet);
                        if disconnect {
                            break;
                        }
                    }
                }
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn bad_credentials_are_auth_errors() {
        assert!(matches!(
            refusal(ConnectReturnCode::BadUserNamePassword),
            ConnectError::Auth(_)
        ));
        assert!(matches!(
            refusal(ConnectReturnCode::NotAuthorized),
            ConnectError::Auth(_)
        ));
        assert!(matches!(
            refusal(ConnectReturnCode::ServiceUnavailable),
            ConnectError::Refused(_)
        ));
    }

    #[test]
    fn io_failures_are_network_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let timeout = Duration::from_secs(60);
        assert!(matches!(
            classify(ConnectionError::Io(io), timeout),
            ConnectError::Network(_)
        ));
        assert_eq!(
            classify(ConnectionError::NetworkTimeout, timeout),
            ConnectError::Timeout(timeout)
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_before_connect() {
        let (tx, _rx) = mpsc::channel(8);
        let config = mqtt_config(1883, Duration::from_secs(1));
        let mut manager = ConnectionManager::new(config, profile(), tx);
        assert!(!manager.disconnect());
        assert!(!manager.disconnect());
        assert!(matches!(
            manager.publisher().publish("t", QoS::AtMostOnce, vec![]),
            Err(PublishError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_is_network_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, _rx) = mpsc::channel(8);
        let config = mqtt_config(port, Duration::from_secs(5));
        let mut manager = ConnectionManager::new(config, profile(), tx);
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Network(_)), "{err:?}");
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let timeout = Duration::from_millis(300);
        let (tx, _rx) = mpsc::channel(8);
        let mut manager = ConnectionManager::new(mqtt_config(port, timeout), profile(), tx);
        assert_eq!(manager.connect().await.unwrap_err(), ConnectError::Timeout(timeout));
    }

    #[tokio::test]
    async fn rejected_credentials_are_auth_errors() {
        let (port, broker) = fake_broker(0x04).await;
        let (tx, _rx) = mpsc::channel(8);
        let config = mqtt_config(port, Duration::from_secs(5));
        let mut manager = ConnectionManager::new(config, profile(), tx);
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Auth(_)), "{err:?}");
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn connect_subscribes_and_forwards_requests() {
        let (port, broker) = fake_broker(0x00).await;
        let (tx, mut rx) = mpsc::channel(8);
        let config = mqtt_config(port, Duration::from_secs(5));
        let mut manager = ConnectionManager::new(config, profile(), tx);

        let session = manager.connect().await.expect("connect");
        assert_eq!(session.client_id, "dv2-client");
        assert!(manager.is_connected());

        assert_eq!(session.generation, 1);
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected { generation: 1 }));
        match rx.recv().await {
            Some(SessionEvent::MessageReceived(msg)) => {
                assert_eq!(msg.topic, "v1/devices/me/rpc/request/7");
                assert_eq!(msg.payload, br#"{"method":"getTemperature"}"#);
            }
            other => panic!("unexpected event {other:?}"),
        }

        manager
            .publisher()
            .publish(crate::mqtt::TELEMETRY_TOPIC, QoS::AtMostOnce, b"{}".to_vec())
            .expect("publish");
        // Give the pump a moment to flush before tearing down
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.disconnect());
        assert!(!manager.disconnect());

        let seen = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .expect("broker finished")
            .unwrap();
        assert!(seen.iter().any(|(h, body)| {
            h >> 4 == 3 && body.windows(23).any(|w| w == b"v1/devices/me/telemetry")
        }));
    }

    #[tokio::test]
    async fn late_pump_events_do_not_revive_a_closed_session() {
        let (port, _broker) = fake_broker(0x00).await;
        let (tx, mut rx) = mpsc::channel(8);
        let config = mqtt_config(port, Duration::from_secs(5));
        let manager = ConnectionManager::new(config, profile(), tx);
        let publisher = manager.publisher();
        let mut agent = Agent::new(DeviceKind::Hvac.initial_state(), manager, publisher.clone());
        let status = agent.status();

        agent.apply(AgentEvent::Operator(OperatorCommand::Connect)).await;
        assert_eq!(*status.borrow(), ConnectionStatus::Connected);
        agent.apply(AgentEvent::Operator(OperatorCommand::Disconnect)).await;
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);

        // The pump was already running and still reports its session
        let late = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("pump event")
            .expect("channel open");
        assert_eq!(late, SessionEvent::Connected { generation: 1 });
        agent.apply(AgentEvent::Session(late)).await;

        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
        assert!(!publisher.is_connected());
    }
}
