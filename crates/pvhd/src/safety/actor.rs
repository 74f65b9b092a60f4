//! Safety actor - sole writer of circuit state and alarm level.
//!
//! The actor drains every queued command before evaluating, applies all
//! facts, then all proposals, runs the decision table once and only then
//! answers acknowledgments and queries. A CRITICAL fact therefore always
//! beats a proposal queued ahead of it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel send failures are logged but don't panic
//! - An invariant violation ends the actor with an error after all
//!   circuits have been forced off and published

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pvh_core::{CircuitId, StateEvent, TankId};

use super::commands::{AckOutcome, CircuitMap, SafetyCommand, SafetyError};
use super::state::{SafetySettings, SafetyState};
use crate::config::DaemonConfig;

/// Maximum commands handled in one cycle, so a flood cannot starve the
/// evaluation tick.
const MAX_BATCH: usize = 256;

pub struct SafetyActor {
    receiver: mpsc::Receiver<SafetyCommand>,
    state: SafetyState,
    commanded: watch::Sender<CircuitMap>,
    event_publisher: broadcast::Sender<StateEvent>,
    shutoffs: mpsc::UnboundedSender<CircuitId>,
    saturation_acks: mpsc::UnboundedSender<TankId>,
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
}

impl SafetyActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: mpsc::Receiver<SafetyCommand>,
        commanded: watch::Sender<CircuitMap>,
        event_publisher: broadcast::Sender<StateEvent>,
        shutoffs: mpsc::UnboundedSender<CircuitId>,
        saturation_acks: mpsc::UnboundedSender<TankId>,
        config: watch::Receiver<Arc<DaemonConfig>>,
        cancel_token: CancellationToken,
    ) -> Self {
        let settings = SafetySettings::from_config(&config.borrow());
        Self {
            receiver,
            state: SafetyState::new(settings, Instant::now()),
            commanded,
            event_publisher,
            shutoffs,
            saturation_acks,
            config,
            cancel_token,
        }
    }

    /// Runs until cancelled or until every command sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` when state corruption was detected.
    pub async fn run(mut self) -> Result<(), SafetyError> {
        let period = self.config.borrow().evaluation_interval();
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut config_open = true;

        info!(interval_ms = period.as_millis() as u64, "Safety monitor starting");

        let result = loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => break Ok(()),

                cmd = self.receiver.recv() => {
                    let Some(first) = cmd else {
                        debug!("All safety handles dropped");
                        break Ok(());
                    };
                    let mut batch = vec![first];
                    while batch.len() < MAX_BATCH {
                        match self.receiver.try_recv() {
                            Ok(cmd) => batch.push(cmd),
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = self.process(batch) {
                        break Err(e);
                    }
                }

                _ = tick.tick() => {
                    if let Err(e) = self.process(Vec::new()) {
                        break Err(e);
                    }
                }

                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let settings = SafetySettings::from_config(&self.config.borrow_and_update());
                    self.state.update_settings(settings);
                }
            }
        };

        match &result {
            Ok(()) => {
                self.state.force_all_off("shutdown");
                self.publish();
                info!("Safety monitor stopped");
            }
            Err(e) => {
                error!(error = %e, "Safety monitor terminating");
                self.publish();
            }
        }
        result
    }

    /// One evaluation cycle over a drained batch of commands.
    fn process(&mut self, mut batch: Vec<SafetyCommand>) -> Result<(), SafetyError> {
        let now = Instant::now();
        let wall = Utc::now();

        // Stable: arrival order is kept within a stage.
        batch.sort_by_key(SafetyCommand::stage);

        let mut requests = Vec::new();
        for cmd in batch {
            match cmd {
                SafetyCommand::SensorBatch(b) => self.state.apply_sensor_batch(b, now, wall),
                SafetyCommand::LinkReport(link) => self.state.apply_link_report(link, now),
                SafetyCommand::FaultReported { circuit, side } => {
                    self.state.apply_fault_report(circuit, side)
                }
                SafetyCommand::ShutoffConfirmed { circuit } => {
                    self.state.apply_shutoff_confirmed(circuit)
                }
                SafetyCommand::Alive(subsystem) => self.state.mark_alive(subsystem, now),
                SafetyCommand::HeatProposals(p) => self.state.apply_heat_proposals(p, now),
                request => requests.push(request),
            }
        }

        if let Err(e) = self.state.evaluate(now, wall) {
            fail_requests(requests, &e);
            return Err(e);
        }

        for request in requests {
            match request {
                SafetyCommand::AcknowledgeAlarm {
                    event_id,
                    respond_to,
                } => {
                    let outcome = match self.state.acknowledge(event_id) {
                        Ok(()) => {
                            if let Err(e) = self.state.evaluate(now, wall) {
                                let _ = respond_to.send(Err(e.clone()));
                                return Err(e);
                            }
                            Ok(AckOutcome {
                                event_id,
                                cleared: self.state.alarm(event_id).is_none(),
                            })
                        }
                        Err(e) => Err(e),
                    };
                    let _ = respond_to.send(outcome);
                }
                SafetyCommand::GetSnapshot { respond_to } => {
                    let _ = respond_to.send(self.state.snapshot(now, wall));
                }
                SafetyCommand::GetHistory {
                    sensor,
                    from,
                    to,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.state.history(&sensor, from, to, wall));
                }
                other => debug!(command = ?other.stage(), "Unexpected command in request stage"),
            }
        }

        self.publish();
        Ok(())
    }

    /// Forwards side effects and the commanded circuit map.
    fn publish(&mut self) {
        let outbox = self.state.take_outbox();

        for event in outbox.events {
            // No subscribers is fine.
            let _ = self.event_publisher.send(event);
        }
        for circuit in outbox.shutoffs {
            if self.shutoffs.send(circuit).is_err() {
                warn!(circuit = %circuit, "GFCI link monitor gone, shutoff not sent");
            }
        }
        for tank in outbox.saturation_acks {
            if self.saturation_acks.send(tank.clone()).is_err() {
                warn!(tank = %tank, "Thermostat gone, saturation acknowledgment dropped");
            }
        }

        let circuits = self.state.circuits();
        self.commanded.send_if_modified(|current| {
            if *current != *circuits {
                current.clone_from(circuits);
                true
            } else {
                false
            }
        });
    }
}

/// Answers pending requests after a fatal evaluation error.
fn fail_requests(requests: Vec<SafetyCommand>, error: &SafetyError) {
    for request in requests {
        match request {
            SafetyCommand::AcknowledgeAlarm { respond_to, .. } => {
                let _ = respond_to.send(Err(error.clone()));
            }
            SafetyCommand::GetHistory { respond_to, .. } => {
                let _ = respond_to.send(Err(error.clone()));
            }
            // Dropping the sender reports ChannelClosed to the caller.
            _ => {}
        }
    }
}
