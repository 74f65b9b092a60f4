//! GFCI bridge link monitor.
//!
//! Keeps a TCP connection to the exterior-panel bridge, exchanges
//! heartbeats, relays ground fault reports to the safety monitor and sends
//! shutoff commands on its behalf.
//!
//! ```text
//!            ┌─────────── heartbeat tick ───────────┐
//!            ▼                                      │
//!   HEARTBEAT(seq) ──▶ bridge ──▶ ACK(seq) ──▶ exchange ok
//!   FAULT_REPORT   ◀── bridge                 ──▶ SafetyMonitor, ACK back
//!   SHUTOFF_CMD    ──▶ bridge ──▶ ACK(seq) ──▶ shutoff confirmed
//! ```
//!
//! The link state is reported to the safety monitor on every heartbeat tick
//! in every phase (connecting, connected, backing off); a missing report is
//! itself treated as a lost link by the safety monitor.
//!
//! # Panic-Free Guarantees
//!
//! Transport errors end the current connection and trigger a reconnect.
//! Nothing in this module panics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use pvh_core::{CircuitId, LinkState};
use pvh_protocol::{BridgeCodec, BridgeMessage, Decoded};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Interval, MissedTickBehavior};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod backoff;
mod link_state;

pub use backoff::Backoff;
pub use link_state::LinkStateMachine;

use crate::config::DaemonConfig;
use crate::safety::SafetyHandle;

/// Write timeout for a single bridge frame.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a connection phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    SafetyGone,
    Lost,
}

struct LinkMonitor {
    address: String,
    safety: SafetyHandle,
    shutoffs: mpsc::UnboundedReceiver<CircuitId>,
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
    machine: LinkStateMachine,
    backoff: Backoff,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    next_seq: u16,
    /// Shutoffs sent but not yet acknowledged, with the sequence they used.
    pending_shutoffs: BTreeMap<CircuitId, u16>,
}

/// Spawns the link monitor.
pub fn spawn_gfci_link(
    safety: SafetyHandle,
    shutoffs: mpsc::UnboundedReceiver<CircuitId>,
    config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let (address, machine, backoff) = {
        let current = config.borrow();
        (
            current.bridge.address.clone(),
            LinkStateMachine::new(current.bridge.max_missed_heartbeats),
            Backoff::from_config(&current.bridge),
        )
    };
    let mut monitor = LinkMonitor {
        address,
        safety,
        shutoffs,
        config,
        cancel_token,
        machine,
        backoff,
        heartbeat_interval: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(2),
        next_seq: 0,
        pending_shutoffs: BTreeMap::new(),
    };
    monitor.refresh_settings();
    tokio::spawn(monitor.run())
}

impl LinkMonitor {
    async fn run(mut self) {
        info!(address = %self.address, "GFCI link monitor starting");

        loop {
            self.refresh_settings();

            let exit = match self.connect().await {
                Ok(Some(stream)) => {
                    info!(address = %self.address, "Connected to GFCI bridge");
                    self.backoff.reset();
                    let change = self.machine.on_connected();
                    if !self.transition(change).await {
                        break;
                    }
                    self.serve(stream).await
                }
                Ok(None) => Exit::Lost,
                Err(exit) => exit,
            };

            match exit {
                Exit::Cancelled | Exit::SafetyGone => break,
                Exit::Lost => {
                    let change = self.machine.on_transport_lost();
                    if !self.transition(change).await {
                        break;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to GFCI bridge after delay");
            if let Err(_exit) = self.wait(delay).await {
                break;
            }
        }

        info!("GFCI link monitor stopped");
    }

    fn refresh_settings(&mut self) {
        let config = Arc::clone(&self.config.borrow_and_update());
        self.heartbeat_interval = config.heartbeat_interval();
        self.connect_timeout = Duration::from_millis(config.bridge.connect_timeout_ms);
        self.machine
            .set_max_missed(config.bridge.max_missed_heartbeats);
    }

    fn ticker(&self) -> Interval {
        let mut tick = interval(self.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    }

    fn seq(&mut self) -> u16 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    /// Logs a transition and reports it at once. Returns false if the
    /// safety monitor is gone.
    async fn transition(&mut self, change: Option<(LinkState, LinkState)>) -> bool {
        let Some((from, to)) = change else {
            return true;
        };
        match to {
            LinkState::Down => warn!(from = %from, missed = self.machine.missed(), "GFCI link down"),
            LinkState::Degraded => warn!(from = %from, "GFCI heartbeat missed, link degraded"),
            _ => info!(from = %from, to = %to, "GFCI link state changed"),
        }
        self.report().await
    }

    async fn report(&self) -> bool {
        self.safety.report_link(self.machine.state()).await.is_ok()
    }

    fn queue_shutoff(&mut self, circuit: CircuitId) -> u16 {
        let seq = self.seq();
        self.pending_shutoffs.insert(circuit, seq);
        seq
    }

    /// Connects with a timeout, reporting the link state while waiting.
    async fn connect(&mut self) -> Result<Option<TcpStream>, Exit> {
        let attempt = timeout(self.connect_timeout, TcpStream::connect(self.address.clone()));
        tokio::pin!(attempt);
        let mut tick = self.ticker();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(Exit::Cancelled),
                result = &mut attempt => {
                    return Ok(match result {
                        Ok(Ok(stream)) => Some(stream),
                        Ok(Err(e)) => {
                            debug!(address = %self.address, error = %e, "GFCI bridge connect failed");
                            None
                        }
                        Err(_) => {
                            debug!(address = %self.address, "GFCI bridge connect timed out");
                            None
                        }
                    });
                }
                _ = tick.tick() => {
                    if !self.report().await {
                        return Err(Exit::SafetyGone);
                    }
                }
                Some(circuit) = self.shutoffs.recv() => {
                    self.queue_shutoff(circuit);
                }
            }
        }
    }

    /// Waits out a backoff delay, still reporting and collecting shutoffs.
    async fn wait(&mut self, delay: Duration) -> Result<(), Exit> {
        let pause = sleep(delay);
        tokio::pin!(pause);
        let mut tick = self.ticker();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(Exit::Cancelled),
                _ = &mut pause => return Ok(()),
                _ = tick.tick() => {
                    if !self.report().await {
                        return Err(Exit::SafetyGone);
                    }
                }
                Some(circuit) = self.shutoffs.recv() => {
                    warn!(circuit = %circuit, "Shutoff queued while GFCI bridge unreachable");
                    self.queue_shutoff(circuit);
                }
            }
        }
    }

    /// Runs one connection until it is lost or the daemon stops.
    async fn serve(&mut self, stream: TcpStream) -> Exit {
        let (mut reader, mut writer) = stream.into_split();
        let mut codec = BridgeCodec;
        let mut buf = BytesMut::with_capacity(256);
        let mut tick = self.ticker();
        let mut outstanding: Option<u16> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => return Exit::Cancelled,

                _ = tick.tick() => {
                    if outstanding.take().is_some() {
                        let change = self.machine.on_heartbeat_missed();
                        if !self.transition(change).await {
                            return Exit::SafetyGone;
                        }
                        if self.machine.state() == LinkState::Down {
                            return Exit::Lost;
                        }
                    }

                    let seq = self.seq();
                    if send(&mut writer, BridgeMessage::Heartbeat { seq }).await.is_err() {
                        return Exit::Lost;
                    }
                    outstanding = Some(seq);

                    let pending: Vec<(CircuitId, u16)> =
                        self.pending_shutoffs.iter().map(|(c, s)| (*c, *s)).collect();
                    for (circuit, seq) in pending {
                        debug!(circuit = %circuit, seq, "Retransmitting shutoff");
                        if send(&mut writer, BridgeMessage::ShutoffCmd { seq, circuit }).await.is_err() {
                            return Exit::Lost;
                        }
                    }

                    if !self.report().await {
                        return Exit::SafetyGone;
                    }
                }

                Some(circuit) = self.shutoffs.recv() => {
                    let seq = self.queue_shutoff(circuit);
                    info!(circuit = %circuit, seq, "Sending shutoff command");
                    if send(&mut writer, BridgeMessage::ShutoffCmd { seq, circuit }).await.is_err() {
                        return Exit::Lost;
                    }
                }

                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            warn!("GFCI bridge closed the connection");
                            return Exit::Lost;
                        }
                        Err(e) => {
                            warn!(error = %e, "GFCI bridge read error");
                            return Exit::Lost;
                        }
                        Ok(_) => {}
                    }

                    loop {
                        let item = match codec.decode(&mut buf) {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "GFCI bridge decode error");
                                return Exit::Lost;
                            }
                        };
                        let message = match item {
                            Decoded::Frame(message) => message,
                            Decoded::Rejected { error, .. } => {
                                warn!(error = %error, "Dropped malformed bridge frame");
                                continue;
                            }
                        };
                        if let Some(exit) = self.handle(message, &mut writer, &mut outstanding).await {
                            return exit;
                        }
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        message: BridgeMessage,
        writer: &mut OwnedWriteHalf,
        outstanding: &mut Option<u16>,
    ) -> Option<Exit> {
        match message {
            BridgeMessage::Ack { seq } if *outstanding == Some(seq) => {
                *outstanding = None;
                let change = self.machine.on_exchange_ok();
                if !self.transition(change).await {
                    return Some(Exit::SafetyGone);
                }
            }
            BridgeMessage::Ack { seq } => {
                let confirmed = self
                    .pending_shutoffs
                    .iter()
                    .find(|(_, s)| **s == seq)
                    .map(|(c, _)| *c);
                match confirmed {
                    Some(circuit) => {
                        self.pending_shutoffs.remove(&circuit);
                        info!(circuit = %circuit, seq, "Shutoff acknowledged by bridge");
                        if self.safety.shutoff_confirmed(circuit).await.is_err() {
                            return Some(Exit::SafetyGone);
                        }
                    }
                    None => debug!(seq, "ACK for unknown sequence"),
                }
            }
            BridgeMessage::FaultReport { seq, circuit, side } => {
                error!(circuit = %circuit, side = %side, seq, "Ground fault report from bridge");
                if self.safety.fault_reported(circuit, side).await.is_err() {
                    return Some(Exit::SafetyGone);
                }
                if send(writer, BridgeMessage::Ack { seq }).await.is_err() {
                    return Some(Exit::Lost);
                }
            }
            BridgeMessage::Heartbeat { seq } => {
                if send(writer, BridgeMessage::Ack { seq }).await.is_err() {
                    return Some(Exit::Lost);
                }
            }
            BridgeMessage::ShutoffCmd { seq, circuit } => {
                warn!(seq, circuit = %circuit, "Unexpected shutoff command from bridge");
            }
        }
        None
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: BridgeMessage) -> std::io::Result<()> {
    match timeout(WRITE_TIMEOUT, writer.write_all(&message.to_bytes())).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "bridge write timed out",
        )),
    }
}
