//! The device agent: sole owner of `DeviceState`.
//!
//! Session traffic, sampled readings, presentation edits and operator
//! commands all arrive as events and are applied one at a time. Every change
//! is broadcast on a watch channel, which doubles as the presentation
//! adapter's refresh signal and the telemetry scheduler's snapshot source.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::device::rpc::RpcDispatcher;
use crate::device::{DeviceState, LocalEdit, Readings};
use crate::mqtt::client::{Connection, ConnectionStatus};
use crate::mqtt::{Publish, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Connect,
    Disconnect,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Session(SessionEvent),
    Sampled(Readings),
    Local(LocalEdit),
    Operator(OperatorCommand),
}

pub struct Agent<C, P> {
    state: DeviceState,
    state_tx: watch::Sender<DeviceState>,
    status_tx: watch::Sender<ConnectionStatus>,
    dispatcher: RpcDispatcher<P>,
    connection: C,
    /// Generation of the session this agent established and has not torn down.
    live: Option<u64>,
}

impl<C: Connection, P: Publish> Agent<C, P> {
    pub fn new(initial: DeviceState, connection: C, publisher: P) -> Self {
        let (state_tx, _) = watch::channel(initial.clone());
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            state: initial,
            state_tx,
            status_tx,
            dispatcher: RpcDispatcher::new(publisher),
            connection,
            live: None,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn snapshots(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Presentation-side handle feeding `events`, which must reach `run`.
    pub fn device_handle(&self, events: mpsc::Sender<AgentEvent>) -> DeviceHandle {
        DeviceHandle {
            events,
            state: self.snapshots(),
            status: self.status(),
        }
    }

    /// Apply one event. Returns false once the agent should stop.
    pub async fn apply(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::Session(SessionEvent::Connected { generation }) => {
                if self.live == Some(generation) {
                    self.set_status(ConnectionStatus::Connected);
                } else {
                    debug!("Ignoring Connected from stale session {}", generation);
                }
            }
            AgentEvent::Session(SessionEvent::MessageReceived(msg)) => {
                if self.dispatcher.handle(&mut self.state, &msg) {
                    self.broadcast();
                }
            }
            AgentEvent::Session(SessionEvent::Disconnected { generation, reason }) => {
                if self.live != Some(generation) {
                    debug!("Ignoring loss of stale session {} ({})", generation, reason);
                    return true;
                }
                self.live = None;
                warn!("Session dropped ({}); waiting for operator to reconnect", reason);
                self.set_status(ConnectionStatus::Failed(format!("session lost: {reason}")));
            }
            AgentEvent::Sampled(readings) => {
                if self.state.record(readings) {
                    self.broadcast();
                }
            }
            AgentEvent::Local(edit) => {
                if self.state.apply_local(edit) {
                    self.broadcast();
                }
            }
            AgentEvent::Operator(OperatorCommand::Connect) => {
                self.set_status(ConnectionStatus::Connecting);
                self.live = None;
                match self.connection.connect().await {
                    Ok(session) => {
                        info!("Session established for {}", session.client_id);
                        self.live = Some(session.generation);
                        self.set_status(ConnectionStatus::Connected);
                    }
                    Err(e) => {
                        error!("Connect failed: {}", e);
                        self.set_status(ConnectionStatus::Failed(e.to_string()));
                    }
                }
            }
            AgentEvent::Operator(OperatorCommand::Disconnect) => {
                self.live = None;
                self.connection.disconnect();
                self.set_status(ConnectionStatus::Disconnected);
            }
            AgentEvent::Operator(OperatorCommand::Shutdown) => return false,
        }
        true
    }

    pub async fn run(
        mut self,
        mut sessions: mpsc::Receiver<SessionEvent>,
        mut sampled: mpsc::Receiver<Readings>,
        mut events: mpsc::Receiver<AgentEvent>,
    ) {
        loop {
            let event = tokio::select! {
                Some(ev) = sessions.recv() => AgentEvent::Session(ev),
                Some(readings) = sampled.recv() => AgentEvent::Sampled(readings),
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            if !self.apply(event).await {
                break;
            }
        }

        self.connection.disconnect();
        self.set_status(ConnectionStatus::Disconnected);
        info!("Agent stopped");
    }

    fn broadcast(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// What the presentation layer sees: getters over the latest snapshot,
/// setters that enqueue edits, and change notification.
#[derive(Clone)]
pub struct DeviceHandle {
    events: mpsc::Sender<AgentEvent>,
    state: watch::Receiver<DeviceState>,
    status: watch::Receiver<ConnectionStatus>,
}

impl DeviceHandle {
    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn enabled(&self) -> Option<bool> {
        self.state.borrow().hvac().map(|h| h.enabled)
    }

    pub fn target_temperature(&self) -> Option<i32> {
        self.state.borrow().hvac().map(|h| h.target_temperature)
    }

    pub fn air_flow(&self) -> Option<i32> {
        self.state.borrow().hvac().map(|h| h.air_flow)
    }

    pub async fn set_enabled(&self, on: bool) -> bool {
        self.edit(LocalEdit::SetEnabled(on)).await
    }

    pub async fn set_target_temperature(&self, value: i32) -> bool {
        self.edit(LocalEdit::SetTargetTemperature(value)).await
    }

    pub async fn set_air_flow(&self, value: i32) -> bool {
        self.edit(LocalEdit::SetAirFlow(value)).await
    }

    /// Returns false if the agent is gone.
    pub async fn edit(&self, edit: LocalEdit) -> bool {
        self.events.send(AgentEvent::Local(edit)).await.is_ok()
    }

    pub async fn operator(&self, command: OperatorCommand) -> bool {
        self.events.send(AgentEvent::Operator(command)).await.is_ok()
    }

    /// Receiver that wakes on every state change.
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}
