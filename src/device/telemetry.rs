use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rumqttc::QoS;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::mqtt::{Publish, TELEMETRY_TOPIC};

use super::{DeviceState, Readings};

/// Publishes a snapshot of the device state every `interval`.
pub struct TelemetryScheduler<P> {
    publisher: P,
    snapshots: watch::Receiver<DeviceState>,
    sampled: mpsc::Sender<Readings>,
    task: Option<JoinHandle<()>>,
}

impl<P: Publish + Clone + 'static> TelemetryScheduler<P> {
    /// `sampled` receives the simulated readings of each tick so the state
    /// owner can record them.
    pub fn new(
        publisher: P,
        snapshots: watch::Receiver<DeviceState>,
        sampled: mpsc::Sender<Readings>,
    ) -> Self {
        Self {
            publisher,
            snapshots,
            sampled,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start ticking. A running schedule is replaced.
    pub fn start(&mut self, interval: Duration) {
        self.stop();
        info!("Publishing telemetry every {:?}", interval);

        let publisher = self.publisher.clone();
        let snapshots = self.snapshots.clone();
        let sampled = self.sampled.clone();

        self.task = Some(tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the first publish is one interval out
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = snapshots.borrow().clone();
                publish_snapshot(&publisher, &snapshot, &mut rng, &sampled);
            }
        }));
    }

    /// Cancel future ticks. Safe to call repeatedly.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                debug!("Telemetry scheduler stopped");
                true
            }
            None => false,
        }
    }
}

impl<P> Drop for TelemetryScheduler<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn publish_snapshot<P: Publish>(
    publisher: &P,
    snapshot: &DeviceState,
    rng: &mut StdRng,
    sampled: &mpsc::Sender<Readings>,
) {
    let (message, readings) = snapshot.telemetry(rng);

    match serde_json::to_vec(&message) {
        Ok(payload) => match publisher.publish(TELEMETRY_TOPIC, QoS::AtLeastOnce, payload) {
            Ok(()) => debug!("Telemetry published: {}", snapshot),
            Err(PublishError::NotConnected) => debug!("No active session, telemetry dropped"),
            Err(e) => warn!("Failed to publish telemetry: {}", e),
        },
        Err(e) => warn!("Failed to serialize telemetry: {}", e),
    }

    if let Some(readings) = readings {
        if sampled.try_send(readings).is_err() {
            debug!("Readings channel full or closed, state not updated");
        }
    }
}
