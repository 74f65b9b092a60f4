//! Authoritative safety state and the decision table.
//!
//! `SafetyState` holds everything the safety monitor owns: commanded circuit
//! states, alarm events, the overall alarm level, the last known link
//! state, the latest reading per sensor with a bounded history, the latest
//! heat proposal per tank and subsystem liveness. It performs no I/O. The
//! actor feeds it facts and proposals, calls [`SafetyState::evaluate`] once
//! per cycle and forwards whatever ended up in the [`Outbox`].
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()` or indexing that can panic. Impossible
//! transitions surface as [`SafetyError::InvariantViolation`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvh_core::{
    AlarmCause, AlarmEvent, AlarmEventId, AlarmLevel, CircuitId, CircuitState, CircuitView,
    FaultSide, LinkState, SensorId, SensorReading, StaleReason, StateEvent, Subsystem,
    SubsystemStatus, SystemSnapshot, TankId, TankView, ThermostatState,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::commands::{CircuitMap, SafetyError};
use crate::config::DaemonConfig;
use crate::sensor_hub::SensorBatch;
use crate::thermostat::HeatProposal;

// ============================================================================
// Settings
// ============================================================================

/// How a tank is wired: its driving sensor, its circuit and its hard limit.
#[derive(Debug, Clone, PartialEq)]
pub struct TankWiring {
    pub tank: TankId,
    pub sensor: SensorId,
    pub circuit: CircuitId,
    pub hard_limit: f64,
    pub setpoint: f64,
    pub hysteresis: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetySettings {
    /// Maximum silence from the link monitor before the link counts as down.
    pub link_timeout: Duration,
    /// History retention horizon.
    pub retention: Duration,
    /// Maximum readings kept per sensor.
    pub history_capacity: usize,
    /// Configured sensors; these have a (possibly empty) history.
    pub sensors: Vec<SensorId>,
    pub tanks: Vec<TankWiring>,
    /// Expected reporting interval per subsystem.
    pub expected: BTreeMap<Subsystem, Duration>,
}

impl SafetySettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        let tanks = config
            .tanks
            .iter()
            .filter_map(|t| {
                Some(TankWiring {
                    tank: TankId::new(t.id.clone()),
                    sensor: SensorId::new(t.sensor.clone()),
                    circuit: CircuitId::from_number(t.circuit)?,
                    hard_limit: t.hard_limit,
                    setpoint: t.setpoint,
                    hysteresis: t.hysteresis,
                })
            })
            .collect();

        let expected = BTreeMap::from([
            (Subsystem::SensorHub, config.poll_interval()),
            (Subsystem::GfciLink, config.heartbeat_interval()),
            (Subsystem::Thermostat, config.poll_interval()),
            (Subsystem::SafetyMonitor, config.evaluation_interval()),
            (Subsystem::HealthRecorder, config.health_interval()),
        ]);

        Self {
            link_timeout: Duration::from_millis(config.safety.link_timeout_ms),
            retention: config.retention(),
            history_capacity: config.safety.history_capacity,
            sensors: config
                .sensors
                .iter()
                .map(|s| SensorId::new(s.id.clone()))
                .collect(),
            tanks,
            expected,
        }
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// Side effects produced by state changes, drained by the actor.
#[derive(Debug, Default)]
pub struct Outbox {
    pub events: Vec<StateEvent>,
    /// Circuits for which a SHUTOFF_CMD must be sent to the bridge.
    pub shutoffs: Vec<CircuitId>,
    /// Tanks whose SATURATED state was acknowledged by an operator.
    pub saturation_acks: Vec<TankId>,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_report: Option<Instant>,
    counter: u64,
}

// ============================================================================
// Safety State
// ============================================================================

#[derive(Debug)]
pub struct SafetyState {
    settings: SafetySettings,
    started: Instant,
    circuits: CircuitMap,
    fault_sides: BTreeMap<CircuitId, BTreeSet<FaultSide>>,
    /// Ground faults reported since the last evaluation.
    reported_faults: BTreeSet<(CircuitId, FaultSide)>,
    alarms: BTreeMap<AlarmEventId, AlarmEvent>,
    next_alarm_id: u64,
    level: AlarmLevel,
    link: LinkState,
    last_link_report: Option<Instant>,
    latest: BTreeMap<SensorId, SensorReading>,
    history: HashMap<SensorId, VecDeque<SensorReading>>,
    unavailable: BTreeSet<SensorId>,
    checksum_failures: bool,
    proposals: BTreeMap<TankId, HeatProposal>,
    liveness: BTreeMap<Subsystem, Liveness>,
    outbox: Outbox,
}

impl SafetyState {
    /// Creates the state with every circuit OFF and the link CONNECTING.
    pub fn new(settings: SafetySettings, now: Instant) -> Self {
        Self {
            settings,
            started: now,
            circuits: CircuitId::ALL
                .iter()
                .map(|c| (*c, CircuitState::Off))
                .collect(),
            fault_sides: BTreeMap::new(),
            reported_faults: BTreeSet::new(),
            alarms: BTreeMap::new(),
            next_alarm_id: 1,
            level: AlarmLevel::Normal,
            link: LinkState::Connecting,
            last_link_report: None,
            latest: BTreeMap::new(),
            history: HashMap::new(),
            unavailable: BTreeSet::new(),
            checksum_failures: false,
            proposals: BTreeMap::new(),
            liveness: Subsystem::ALL
                .iter()
                .map(|s| {
                    (
                        *s,
                        Liveness {
                            last_report: None,
                            counter: 0,
                        },
                    )
                })
                .collect(),
            outbox: Outbox::default(),
        }
    }

    pub fn circuits(&self) -> &CircuitMap {
        &self.circuits
    }

    pub fn level(&self) -> AlarmLevel {
        self.level
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn alarm(&self, id: AlarmEventId) -> Option<&AlarmEvent> {
        self.alarms.get(&id)
    }

    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    pub fn update_settings(&mut self, settings: SafetySettings) {
        self.proposals
            .retain(|tank, _| settings.tanks.iter().any(|t| &t.tank == tank));
        self.settings = settings;
        info!("Safety settings updated");
    }

    // ========================================================================
    // Facts
    // ========================================================================

    pub fn apply_sensor_batch(&mut self, batch: SensorBatch, now: Instant, wall: DateTime<Utc>) {
        let cutoff = wall - chrono_duration(self.settings.retention);
        let capacity = self.settings.history_capacity.max(1);

        for reading in batch.readings {
            let history = self.history.entry(reading.sensor_id().clone()).or_default();
            history.push_back(reading.clone());
            while history.len() > capacity
                || history.front().is_some_and(|r| r.timestamp() < cutoff)
            {
                history.pop_front();
            }
            self.latest.insert(reading.sensor_id().clone(), reading);
        }

        for sensor in batch.unavailable.difference(&self.unavailable) {
            warn!(sensor = %sensor, "Sensor unavailable");
        }
        self.unavailable = batch.unavailable;
        self.checksum_failures = batch.checksum_failures;
        self.mark_alive(Subsystem::SensorHub, now);
    }

    pub fn apply_link_report(&mut self, state: LinkState, now: Instant) {
        self.last_link_report = Some(now);
        self.mark_alive(Subsystem::GfciLink, now);

        let from = self.link;
        if from == state {
            return;
        }
        self.link = state;
        if state == LinkState::Down {
            warn!(from = %from, "GFCI link down");
        } else {
            info!(from = %from, to = %state, "GFCI link state changed");
        }
        self.outbox
            .events
            .push(StateEvent::LinkChanged { from, to: state });
    }

    /// Handles a ground fault report. Every report is acted on: the circuit
    /// is forced off, a shutoff is sent to the bridge and the next
    /// evaluation raises an unacknowledged alarm for it.
    pub fn apply_fault_report(&mut self, circuit: CircuitId, side: FaultSide) {
        error!(circuit = %circuit, side = %side, "Ground fault reported");
        let sides = self.fault_sides.entry(circuit).or_default();
        // A latched fault was already confirmed; only the new side is pending.
        if self.circuits.get(&circuit) == Some(&CircuitState::FaultLatched) {
            sides.clear();
        }
        sides.insert(side);
        self.reported_faults.insert((circuit, side));
        let next = self.state_of(circuit).fault_reported();
        self.set_circuit(circuit, next);
        self.outbox.shutoffs.push(circuit);
    }

    pub fn apply_shutoff_confirmed(&mut self, circuit: CircuitId) {
        let current = self.state_of(circuit);
        let next = current.shutoff_confirmed();
        if next == current {
            debug!(circuit = %circuit, state = %current, "Shutoff confirmation without pending fault");
            return;
        }
        info!(circuit = %circuit, "Shutoff confirmed by bridge, fault latched");
        self.set_circuit(circuit, next);
    }

    pub fn apply_heat_proposals(&mut self, proposals: Vec<HeatProposal>, now: Instant) {
        self.mark_alive(Subsystem::Thermostat, now);
        for proposal in proposals {
            let previous = self.proposals.get(&proposal.tank);
            let prev_state = previous.map_or(ThermostatState::Idle, |p| p.state);
            let prev_setpoint = previous.map(|p| p.setpoint);

            if prev_state != proposal.state {
                self.outbox.events.push(StateEvent::ThermostatChanged {
                    tank: proposal.tank.clone(),
                    from: prev_state,
                    to: proposal.state,
                });
            }
            if prev_setpoint.is_some_and(|s| s != proposal.setpoint) {
                self.outbox.events.push(StateEvent::SetpointChanged {
                    tank: proposal.tank.clone(),
                    setpoint: proposal.setpoint,
                });
            }
            self.proposals.insert(proposal.tank.clone(), proposal);
        }
    }

    pub fn mark_alive(&mut self, subsystem: Subsystem, now: Instant) {
        let entry = self.liveness.entry(subsystem).or_insert(Liveness {
            last_report: None,
            counter: 0,
        });
        entry.last_report = Some(now);
        entry.counter = entry.counter.saturating_add(1);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Marks an alarm acknowledged. It is removed by the next evaluation if
    /// its condition no longer holds.
    pub fn acknowledge(&mut self, id: AlarmEventId) -> Result<(), SafetyError> {
        let alarm = self
            .alarms
            .get_mut(&id)
            .ok_or(SafetyError::AlarmNotFound(id))?;
        alarm.acknowledge();
        info!(alarm = %id, cause = %alarm.cause.description(), "Alarm acknowledged");

        if let AlarmCause::HeatingSaturated { tank } = &alarm.cause {
            self.outbox.saturation_acks.push(tank.clone());
        }
        Ok(())
    }

    pub fn history(
        &self,
        sensor: &SensorId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        wall: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, SafetyError> {
        let Some(history) = self.history.get(sensor) else {
            if self.settings.sensors.contains(sensor) {
                return Ok(Vec::new());
            }
            return Err(SafetyError::UnknownSensor(sensor.clone()));
        };
        let cutoff = wall - chrono_duration(self.settings.retention);
        Ok(history
            .iter()
            .filter(|r| r.timestamp() >= cutoff)
            .filter(|r| from.map_or(true, |f| r.timestamp() >= f))
            .filter(|r| to.map_or(true, |t| r.timestamp() <= t))
            .cloned()
            .collect())
    }

    pub fn subsystem_statuses(&self, now: Instant) -> BTreeMap<String, SubsystemStatus> {
        self.liveness
            .iter()
            .map(|(subsystem, live)| {
                let since = live.last_report.unwrap_or(self.started);
                let expected = self
                    .settings
                    .expected
                    .get(subsystem)
                    .copied()
                    .unwrap_or(Duration::from_secs(1));
                (
                    subsystem.name().to_string(),
                    SubsystemStatus {
                        uptime_secs: now.saturating_duration_since(self.started).as_secs(),
                        last_report_age_ms: millis(now.saturating_duration_since(since)),
                        counter: live.counter,
                        expected_interval_ms: millis(expected),
                    },
                )
            })
            .collect()
    }

    pub fn snapshot(&self, now: Instant, wall: DateTime<Utc>) -> SystemSnapshot {
        let link = if self.link_silent(now) {
            LinkState::Down
        } else {
            self.link
        };

        let tanks = self
            .settings
            .tanks
            .iter()
            .map(|wiring| {
                let proposal = self.proposals.get(&wiring.tank);
                TankView {
                    tank: wiring.tank.clone(),
                    sensor: wiring.sensor.clone(),
                    circuit: wiring.circuit,
                    setpoint: proposal.map_or(wiring.setpoint, |p| p.setpoint),
                    hysteresis: proposal.map_or(wiring.hysteresis, |p| p.hysteresis),
                    thermostat: proposal.map_or(ThermostatState::Idle, |p| p.state),
                    temperature: self
                        .latest
                        .get(&wiring.sensor)
                        .and_then(SensorReading::usable_value),
                }
            })
            .collect();

        SystemSnapshot {
            timestamp: wall,
            alarm_level: self.level,
            circuits: self
                .circuits
                .iter()
                .map(|(circuit, state)| CircuitView {
                    circuit: *circuit,
                    state: *state,
                })
                .collect(),
            tanks,
            link,
            alarms: self.alarms.values().cloned().collect(),
            sensors: self.latest.values().cloned().collect(),
            subsystems: self.subsystem_statuses(now),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Runs the decision table once.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if a circuit ends up energized in a state
    /// that forbids it. All circuits have been forced off by then.
    pub fn evaluate(&mut self, now: Instant, wall: DateTime<Utc>) -> Result<(), SafetyError> {
        let silent = self.link_silent(now);
        let over_temperature = self.over_temperature_tanks();
        let causes = self.active_causes(silent, &over_temperature);

        self.reconcile_alarms(&causes, wall)?;
        self.update_level();
        self.decide_circuits(now, silent, &over_temperature)?;
        self.mark_alive(Subsystem::SafetyMonitor, now);
        self.check_invariants(now)
    }

    /// Turns every circuit that is not in a fault state off.
    pub fn force_all_off(&mut self, reason: &str) {
        for circuit in CircuitId::ALL {
            let current = self.state_of(circuit);
            if current.is_energized() {
                warn!(circuit = %circuit, reason, "Forcing circuit off");
            }
            self.set_circuit(circuit, current.turn_off());
        }
    }

    fn link_silent(&self, now: Instant) -> bool {
        let since = self.last_link_report.unwrap_or(self.started);
        now.saturating_duration_since(since) > self.settings.link_timeout
    }

    fn subsystem_fresh(&self, subsystem: Subsystem, now: Instant) -> bool {
        let Some(last) = self.liveness.get(&subsystem).and_then(|l| l.last_report) else {
            return false;
        };
        let expected = self
            .settings
            .expected
            .get(&subsystem)
            .copied()
            .unwrap_or(Duration::from_secs(1));
        now.saturating_duration_since(last) < expected.saturating_mul(2)
    }

    /// Tanks whose driving sensor reports a value above the hard limit.
    ///
    /// Out-of-range readings count: a value beyond the valid range is
    /// more likely to mean too hot than a broken probe. Timed-out readings
    /// carry an old value and do not count.
    fn over_temperature_tanks(&self) -> BTreeSet<TankId> {
        self.settings
            .tanks
            .iter()
            .filter(|wiring| {
                self.latest.get(&wiring.sensor).is_some_and(|r| {
                    r.stale_reason() != Some(StaleReason::Timeout)
                        && r.calibrated_value().is_some_and(|v| v > wiring.hard_limit)
                })
            })
            .map(|wiring| wiring.tank.clone())
            .collect()
    }

    fn active_causes(&self, silent: bool, over_temperature: &BTreeSet<TankId>) -> Vec<AlarmCause> {
        let mut causes = Vec::new();

        match self.link {
            LinkState::Down => causes.push(AlarmCause::LinkDown),
            LinkState::Degraded => causes.push(AlarmCause::LinkDegraded),
            LinkState::Up | LinkState::Connecting => {}
        }
        if silent {
            causes.push(AlarmCause::LinkSilent);
        }

        for sensor in &self.unavailable {
            causes.push(AlarmCause::SensorUnavailable {
                sensor: sensor.clone(),
            });
        }
        // Driving sensors whose latest reading timed out or left the valid
        // range, before the retry budget marks them unavailable.
        let stale: BTreeSet<&SensorId> = self
            .settings
            .tanks
            .iter()
            .map(|wiring| &wiring.sensor)
            .filter(|sensor| !self.unavailable.contains(*sensor))
            .filter(|sensor| self.latest.get(*sensor).is_some_and(|r| !r.is_fresh()))
            .collect();
        for sensor in stale {
            causes.push(AlarmCause::SensorStale {
                sensor: sensor.clone(),
            });
        }
        if self.checksum_failures {
            causes.push(AlarmCause::ChecksumFailures);
        }

        // A ground fault is resolved once the bridge confirmed the shutoff.
        for (circuit, state) in &self.circuits {
            if *state == CircuitState::FaultPending {
                for side in self.fault_sides.get(circuit).into_iter().flatten() {
                    causes.push(AlarmCause::GroundFault {
                        circuit: *circuit,
                        side: *side,
                    });
                }
            }
        }

        for tank in over_temperature {
            causes.push(AlarmCause::OverTemperature { tank: tank.clone() });
        }

        for proposal in self.proposals.values() {
            if proposal.state == ThermostatState::Saturated {
                causes.push(AlarmCause::HeatingSaturated {
                    tank: proposal.tank.clone(),
                });
            }
        }

        causes
    }

    fn reconcile_alarms(
        &mut self,
        causes: &[AlarmCause],
        wall: DateTime<Utc>,
    ) -> Result<(), SafetyError> {
        let reported = std::mem::take(&mut self.reported_faults);
        for cause in causes {
            let new_report = matches!(
                cause,
                AlarmCause::GroundFault { circuit, side } if reported.contains(&(*circuit, *side))
            );
            match self.alarms.values_mut().find(|a| &a.cause == cause) {
                Some(alarm) => {
                    if !alarm.active || new_report {
                        alarm.recur(wall);
                        warn!(alarm = %alarm.id, cause = %cause.description(), "Alarm condition recurred");
                        self.outbox.events.push(StateEvent::AlarmRaised {
                            alarm: alarm.clone(),
                        });
                    }
                }
                None => {
                    let id = AlarmEventId(self.next_alarm_id);
                    self.next_alarm_id = self.next_alarm_id.saturating_add(1);
                    let alarm = AlarmEvent::raise(id, cause.clone(), wall);
                    match alarm.level {
                        AlarmLevel::Critical => {
                            error!(alarm = %id, cause = %cause.description(), "Critical alarm raised")
                        }
                        _ => warn!(alarm = %id, cause = %cause.description(), "Alarm raised"),
                    }
                    self.outbox.events.push(StateEvent::AlarmRaised {
                        alarm: alarm.clone(),
                    });
                    self.alarms.insert(id, alarm);
                }
            }
        }

        for alarm in self.alarms.values_mut() {
            if alarm.active && !causes.contains(&alarm.cause) {
                alarm.active = false;
                info!(alarm = %alarm.id, cause = %alarm.cause.description(), "Alarm condition cleared");
            }
        }

        let clearable: Vec<AlarmEventId> = self
            .alarms
            .values()
            .filter(|a| a.is_clearable())
            .map(|a| a.id)
            .collect();
        for id in clearable {
            let Some(alarm) = self.alarms.remove(&id) else {
                continue;
            };
            info!(alarm = %id, "Alarm cleared");
            if let AlarmCause::GroundFault { circuit, .. } = alarm.cause {
                self.release_latch(circuit)?;
            }
            self.outbox.events.push(StateEvent::AlarmCleared { alarm });
        }

        Ok(())
    }

    /// Clears a latched ground fault once no alarm for the circuit remains.
    fn release_latch(&mut self, circuit: CircuitId) -> Result<(), SafetyError> {
        let still_alarmed = self.alarms.values().any(
            |a| matches!(&a.cause, AlarmCause::GroundFault { circuit: c, .. } if *c == circuit),
        );
        if still_alarmed || self.state_of(circuit) != CircuitState::FaultLatched {
            return Ok(());
        }
        let next = self
            .state_of(circuit)
            .fault_cleared()
            .map_err(|e| SafetyError::InvariantViolation(e.to_string()))?;
        info!(circuit = %circuit, "Ground fault latch released");
        self.fault_sides.remove(&circuit);
        self.set_circuit(circuit, next);
        Ok(())
    }

    fn update_level(&mut self) {
        let level = self
            .alarms
            .values()
            .map(|a| a.level)
            .max()
            .unwrap_or(AlarmLevel::Normal);
        if level == self.level {
            return;
        }
        let from = self.level;
        self.level = level;
        if level > from {
            warn!(from = %from, to = %level, "Alarm level raised");
        } else {
            info!(from = %from, to = %level, "Alarm level lowered");
        }
        self.outbox
            .events
            .push(StateEvent::AlarmLevelChanged { from, to: level });
    }

    fn decide_circuits(
        &mut self,
        now: Instant,
        silent: bool,
        over_temperature: &BTreeSet<TankId>,
    ) -> Result<(), SafetyError> {
        let link_lost = silent || self.link == LinkState::Down;
        let thermostat_fresh = self.subsystem_fresh(Subsystem::Thermostat, now);
        let block_new_on = link_lost
            || !self.link.permits_power()
            || self.level == AlarmLevel::Critical
            || self
                .alarms
                .values()
                .any(|a| a.active && a.level >= AlarmLevel::Warning);

        for circuit in CircuitId::ALL {
            let current = self.state_of(circuit);
            if current.is_faulted() {
                continue;
            }

            let wired: Vec<&TankWiring> = self
                .settings
                .tanks
                .iter()
                .filter(|t| t.circuit == circuit)
                .collect();
            let too_hot = wired.iter().any(|t| over_temperature.contains(&t.tank));
            let demand = thermostat_fresh
                && wired.iter().any(|t| {
                    self.proposals
                        .get(&t.tank)
                        .is_some_and(|p| p.heat && p.circuit == circuit)
                });

            let next = if link_lost || too_hot || !demand {
                current.turn_off()
            } else if current.is_energized() || block_new_on {
                current
            } else {
                current
                    .turn_on()
                    .map_err(|e| SafetyError::InvariantViolation(e.to_string()))?
            };

            if next != current {
                if link_lost && current.is_energized() {
                    warn!(circuit = %circuit, "Link lost, forcing circuit off");
                } else if too_hot && current.is_energized() {
                    warn!(circuit = %circuit, "Over temperature, forcing circuit off");
                }
            }
            self.set_circuit(circuit, next);
        }
        Ok(())
    }

    fn check_invariants(&mut self, now: Instant) -> Result<(), SafetyError> {
        let silent = self.link_silent(now);
        let over_temperature = self.over_temperature_tanks();

        let violation = self.circuits.iter().find_map(|(circuit, state)| {
            if !state.is_energized() {
                return None;
            }
            if silent || !matches!(self.link, LinkState::Up | LinkState::Degraded) {
                return Some(format!("{circuit} on while link is {}", self.link));
            }
            self.settings
                .tanks
                .iter()
                .find(|t| t.circuit == *circuit && over_temperature.contains(&t.tank))
                .map(|t| format!("{circuit} on while {} is over temperature", t.tank))
        });

        match violation {
            None => Ok(()),
            Some(detail) => {
                error!(detail = %detail, "Safety invariant violated");
                self.force_all_off("invariant violation");
                Err(SafetyError::InvariantViolation(detail))
            }
        }
    }

    fn state_of(&self, circuit: CircuitId) -> CircuitState {
        self.circuits.get(&circuit).copied().unwrap_or_default()
    }

    fn set_circuit(&mut self, circuit: CircuitId, to: CircuitState) {
        let from = self.state_of(circuit);
        if from == to {
            return;
        }
        info!(circuit = %circuit, from = %from, to = %to, "Circuit state changed");
        self.circuits.insert(circuit, to);
        self.outbox
            .events
            .push(StateEvent::CircuitChanged { circuit, from, to });
    }

    #[cfg(test)]
    pub(crate) fn corrupt_circuit(&mut self, circuit: CircuitId, state: CircuitState) {
        self.circuits.insert(circuit, state);
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvh_core::{CalibrationProfile, ValueRange};

    const LINK_TIMEOUT: Duration = Duration::from_secs(3);

    fn settings() -> SafetySettings {
        SafetySettings {
            link_timeout: LINK_TIMEOUT,
            retention: Duration::from_secs(3600),
            history_capacity: 4,
            sensors: vec![SensorId::new("t1"), SensorId::new("t2")],
            tanks: vec![
                TankWiring {
                    tank: TankId::new("tank1"),
                    sensor: SensorId::new("t1"),
                    circuit: CircuitId::One,
                    hard_limit: 85.0,
                    setpoint: 50.0,
                    hysteresis: 2.0,
                },
                TankWiring {
                    tank: TankId::new("tank2"),
                    sensor: SensorId::new("t2"),
                    circuit: CircuitId::Two,
                    hard_limit: 85.0,
                    setpoint: 45.0,
                    hysteresis: 2.0,
                },
            ],
            expected: Subsystem::ALL
                .iter()
                .map(|s| (*s, Duration::from_secs(1)))
                .collect(),
        }
    }

    fn profile(id: &str, channel: u8) -> CalibrationProfile {
        CalibrationProfile::new(SensorId::new(id), channel, 0.0, 1.0, ValueRange::new(-20.0, 110.0))
    }

    fn batch(t1: f64, t2: f64) -> SensorBatch {
        let wall = Utc::now();
        SensorBatch {
            readings: vec![
                SensorReading::from_sample(&profile("t1", 1), t1, wall),
                SensorReading::from_sample(&profile("t2", 2), t2, wall),
            ],
            ..SensorBatch::default()
        }
    }

    fn heat(tank: &str, circuit: CircuitId, state: ThermostatState) -> HeatProposal {
        HeatProposal {
            tank: TankId::new(tank),
            sensor: SensorId::new(if circuit == CircuitId::One { "t1" } else { "t2" }),
            circuit,
            state,
            heat: state == ThermostatState::Heating,
            setpoint: 50.0,
            hysteresis: 2.0,
            temperature: Some(40.0),
        }
    }

    fn both_heating() -> Vec<HeatProposal> {
        vec![
            heat("tank1", CircuitId::One, ThermostatState::Heating),
            heat("tank2", CircuitId::Two, ThermostatState::Heating),
        ]
    }

    /// Feeds a nominal cycle: link up, fresh readings, heat requested.
    fn nominal_cycle(state: &mut SafetyState, now: Instant) {
        state.apply_link_report(LinkState::Up, now);
        state.apply_sensor_batch(batch(40.0, 40.0), now, Utc::now());
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();
    }

    fn on(state: &SafetyState, circuit: CircuitId) -> bool {
        state.circuits()[&circuit].is_energized()
    }

    #[tokio::test(start_paused = true)]
    async fn test_nominal_honors_heat_proposals() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);
        assert!(on(&state, CircuitId::One));
        assert!(on(&state, CircuitId::Two));
        assert_eq!(state.level(), AlarmLevel::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_power_before_link_up() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        state.apply_link_report(LinkState::Connecting, now);
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();
        assert!(!on(&state, CircuitId::One));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_forces_both_off() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_link_report(LinkState::Down, now);
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();

        assert!(!on(&state, CircuitId::One));
        assert!(!on(&state, CircuitId::Two));
        assert_eq!(state.level(), AlarmLevel::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link_reports_force_off() {
        let start = Instant::now();
        let mut state = SafetyState::new(settings(), start);
        nominal_cycle(&mut state, start);

        let later = start + LINK_TIMEOUT + Duration::from_millis(1);
        state.apply_heat_proposals(both_heating(), later);
        state.evaluate(later, Utc::now()).unwrap();

        assert!(!on(&state, CircuitId::One));
        assert!(!on(&state, CircuitId::Two));
        assert!(state
            .snapshot(later, Utc::now())
            .alarms
            .iter()
            .any(|a| a.cause == AlarmCause::LinkSilent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_holds_on_but_blocks_new_on() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        state.apply_link_report(LinkState::Up, now);
        state.apply_heat_proposals(
            vec![
                heat("tank1", CircuitId::One, ThermostatState::Heating),
                heat("tank2", CircuitId::Two, ThermostatState::Idle),
            ],
            now,
        );
        state.evaluate(now, Utc::now()).unwrap();
        assert!(on(&state, CircuitId::One));

        state.apply_link_report(LinkState::Degraded, now);
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();

        assert!(on(&state, CircuitId::One), "held");
        assert!(!on(&state, CircuitId::Two), "new ON disallowed");
        assert_eq!(state.level(), AlarmLevel::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_proposal_honored_while_warning() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_link_report(LinkState::Degraded, now);
        state.apply_heat_proposals(
            vec![
                heat("tank1", CircuitId::One, ThermostatState::Idle),
                heat("tank2", CircuitId::Two, ThermostatState::Heating),
            ],
            now,
        );
        state.evaluate(now, Utc::now()).unwrap();
        assert!(!on(&state, CircuitId::One));
        assert!(on(&state, CircuitId::Two));
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_monotonic_until_ack_and_clear() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_link_report(LinkState::Down, now);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.level(), AlarmLevel::Critical);
        let id = state
            .snapshot(now, Utc::now())
            .alarms
            .iter()
            .find(|a| a.cause == AlarmCause::LinkDown)
            .map(|a| a.id)
            .unwrap();

        // Condition cleared without acknowledgment: level stays.
        state.apply_link_report(LinkState::Up, now);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.level(), AlarmLevel::Critical);

        // Acknowledged and cleared: alarm removed.
        state.acknowledge(id).unwrap();
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_none());
        assert_eq!(state.level(), AlarmLevel::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_while_condition_persists_keeps_level() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);
        state.apply_link_report(LinkState::Down, now);
        state.evaluate(now, Utc::now()).unwrap();
        let id = state.snapshot(now, Utc::now()).alarms[0].id;

        state.acknowledge(id).unwrap();
        state.apply_link_report(LinkState::Down, now);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.level(), AlarmLevel::Critical);
        assert!(state.alarm(id).is_some_and(|a| a.acknowledged && a.active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurrence_after_ack_is_unacknowledged() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);
        state.apply_link_report(LinkState::Degraded, now);
        state.evaluate(now, Utc::now()).unwrap();
        let id = state.snapshot(now, Utc::now()).alarms[0].id;

        state.acknowledge(id).unwrap();
        state.apply_link_report(LinkState::Up, now);
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_none());

        state.apply_link_report(LinkState::Degraded, now);
        state.evaluate(now, Utc::now()).unwrap();
        let alarms = state.snapshot(now, Utc::now()).alarms;
        assert_eq!(alarms.len(), 1);
        assert_ne!(alarms[0].id, id);
        assert!(!alarms[0].acknowledged);
        assert_eq!(state.level(), AlarmLevel::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_inactive_alarm_is_reused() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);
        state.apply_link_report(LinkState::Degraded, now);
        state.evaluate(now, Utc::now()).unwrap();
        state.apply_link_report(LinkState::Up, now);
        state.evaluate(now, Utc::now()).unwrap();
        let id = state.snapshot(now, Utc::now()).alarms[0].id;
        assert!(state.alarm(id).is_some_and(|a| !a.active));

        state.apply_link_report(LinkState::Degraded, now);
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_some_and(|a| a.active));
        assert_eq!(state.snapshot(now, Utc::now()).alarms.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ground_fault_lifecycle() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_fault_report(CircuitId::One, FaultSide::Load);
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.circuits()[&CircuitId::One], CircuitState::FaultPending);
        assert!(on(&state, CircuitId::Two), "other circuit unaffected");
        assert_eq!(state.level(), AlarmLevel::Critical);
        assert_eq!(state.take_outbox().shutoffs, vec![CircuitId::One]);

        state.apply_shutoff_confirmed(CircuitId::One);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.circuits()[&CircuitId::One], CircuitState::FaultLatched);

        let id = state.snapshot(now, Utc::now()).alarms[0].id;
        state.acknowledge(id).unwrap();
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_none());
        assert_ne!(state.circuits()[&CircuitId::One], CircuitState::FaultLatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_fault_on_latched_circuit_keeps_it_off() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_fault_report(CircuitId::One, FaultSide::Load);
        state.evaluate(now, Utc::now()).unwrap();
        state.apply_shutoff_confirmed(CircuitId::One);
        state.evaluate(now, Utc::now()).unwrap();
        let first = state.snapshot(now, Utc::now()).alarms[0].id;
        state.take_outbox();

        state.apply_fault_report(CircuitId::One, FaultSide::Line);
        assert_eq!(state.circuits()[&CircuitId::One], CircuitState::FaultPending);
        state.acknowledge(first).unwrap();
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();

        let outbox = state.take_outbox();
        assert_eq!(outbox.shutoffs, vec![CircuitId::One]);
        let raised: Vec<&AlarmEvent> = outbox
            .events
            .iter()
            .filter_map(|e| match e {
                StateEvent::AlarmRaised { alarm } => Some(alarm),
                _ => None,
            })
            .collect();
        assert_eq!(raised.len(), 1);
        assert_eq!(
            raised[0].cause,
            AlarmCause::GroundFault {
                circuit: CircuitId::One,
                side: FaultSide::Line
            }
        );
        assert!(state.alarm(first).is_none());

        assert!(state.circuits()[&CircuitId::One].is_faulted());
        assert_eq!(state.level(), AlarmLevel::Critical);

        // Confirming and acknowledging the new fault releases the latch.
        state.apply_shutoff_confirmed(CircuitId::One);
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.circuits()[&CircuitId::One], CircuitState::FaultLatched);
        state.acknowledge(raised[0].id).unwrap();
        state.evaluate(now, Utc::now()).unwrap();
        assert!(!state.circuits()[&CircuitId::One].is_faulted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_fault_report_is_raised_again() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_fault_report(CircuitId::Two, FaultSide::Load);
        state.evaluate(now, Utc::now()).unwrap();
        let id = state.snapshot(now, Utc::now()).alarms[0].id;
        state.acknowledge(id).unwrap();
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_some_and(|a| a.acknowledged && a.active));
        state.take_outbox();

        state.apply_fault_report(CircuitId::Two, FaultSide::Load);
        state.evaluate(now, Utc::now()).unwrap();
        assert!(state.alarm(id).is_some_and(|a| !a.acknowledged && a.active));
        assert!(state
            .take_outbox()
            .events
            .iter()
            .any(|e| matches!(e, StateEvent::AlarmRaised { alarm } if alarm.id == id)));
    }

    fn stale_batch(t1: f64) -> SensorBatch {
        let wall = Utc::now();
        SensorBatch {
            readings: vec![
                SensorReading::from_sample(&profile("t1", 1), t1, wall),
                SensorReading::timed_out(&profile("t2", 2), Some(40.0), wall),
            ],
            ..SensorBatch::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tank_sensor_raises_warning() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);
        assert_eq!(state.level(), AlarmLevel::Normal);
        state.take_outbox();

        state.apply_sensor_batch(stale_batch(40.0), now, Utc::now());
        state.evaluate(now, Utc::now()).unwrap();
        let outbox = state.take_outbox();
        assert_eq!(state.level(), AlarmLevel::Warning);
        assert!(outbox.events.iter().any(|e| matches!(
            e,
            StateEvent::AlarmRaised { alarm }
                if alarm.cause == AlarmCause::SensorStale { sensor: SensorId::new("t2") }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_tank_sensor_is_stale() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_sensor_batch(batch(40.0, 500.0), now, Utc::now());
        state.evaluate(now, Utc::now()).unwrap();
        assert_eq!(state.level(), AlarmLevel::Warning);
        assert!(state
            .snapshot(now, Utc::now())
            .alarms
            .iter()
            .any(|a| a.active && a.cause == AlarmCause::SensorStale { sensor: SensorId::new("t2") }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_temperature_forces_tank_circuit_off() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        nominal_cycle(&mut state, now);

        state.apply_sensor_batch(batch(90.0, 40.0), now, Utc::now());
        state.apply_heat_proposals(both_heating(), now);
        state.evaluate(now, Utc::now()).unwrap();

        assert!(!on(&state, CircuitId::One));
        assert!(on(&state, CircuitId::Two));
        assert_eq!(state.level(), AlarmLevel::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_ack_reaches_thermostat() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        state.apply_link_report(LinkState::Up, now);
        state.apply_heat_proposals(
            vec![heat("tank1", CircuitId::One, ThermostatState::Saturated)],
            now,
        );
        state.evaluate(now, Utc::now()).unwrap();
        let id = state.snapshot(now, Utc::now()).alarms[0].id;
        state.take_outbox();

        state.acknowledge(id).unwrap();
        assert_eq!(state.take_outbox().saturation_acks, vec![TankId::new("tank1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_thermostat_means_no_demand() {
        let start = Instant::now();
        let mut state = SafetyState::new(settings(), start);
        nominal_cycle(&mut state, start);

        let later = start + Duration::from_secs(2);
        state.apply_link_report(LinkState::Up, later);
        state.evaluate(later, Utc::now()).unwrap();
        assert!(!on(&state, CircuitId::One));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invariant_violation_forces_all_off() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        state.apply_link_report(LinkState::Connecting, now);
        state.corrupt_circuit(CircuitId::Two, CircuitState::On);

        let result = state.check_invariants(now);
        assert!(matches!(result, Err(SafetyError::InvariantViolation(_))));
        assert!(!on(&state, CircuitId::Two));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded_and_filtered() {
        let now = Instant::now();
        let mut state = SafetyState::new(settings(), now);
        for t in [40.0, 41.0, 42.0, 43.0, 44.0, 45.0] {
            state.apply_sensor_batch(batch(t, t), now, Utc::now());
        }
        let all = state
            .history(&SensorId::new("t1"), None, None, Utc::now())
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].calibrated_value(), Some(42.0));

        let future = state
            .history(
                &SensorId::new("t1"),
                Some(Utc::now() + chrono::Duration::hours(1)),
                None,
                Utc::now(),
            )
            .unwrap();
        assert!(future.is_empty());

        let mut fresh = SafetyState::new(settings(), now);
        assert!(fresh
            .history(&SensorId::new("t2"), None, None, Utc::now())
            .unwrap()
            .is_empty());
        fresh.settings.sensors.clear();
        assert_eq!(
            fresh.history(&SensorId::new("t2"), None, None, Utc::now()),
            Err(SafetyError::UnknownSensor(SensorId::new("t2")))
        );

        assert_eq!(
            state.history(&SensorId::new("nope"), None, None, Utc::now()),
            Err(SafetyError::UnknownSensor(SensorId::new("nope")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subsystem_statuses_report_age() {
        let start = Instant::now();
        let mut state = SafetyState::new(settings(), start);
        state.mark_alive(Subsystem::SensorHub, start);
        let later = start + Duration::from_millis(1500);
        let statuses = state.subsystem_statuses(later);
        let hub = &statuses["sensor_hub"];
        assert_eq!(hub.last_report_age_ms, 1500);
        assert_eq!(hub.counter, 1);
        assert!(hub.is_fresh());
        assert_eq!(statuses.len(), Subsystem::ALL.len());
    }
}
