//! Satellite link and sensor hub.
//!
//! One task owns the UDP socket. It decodes incoming datagrams into the
//! hub's sample table, polls the hub on `poll_interval`, forwards each batch
//! to the thermostat and the safety monitor, and writes relay frames for
//! the commanded circuit states. Relay frames are written on every change
//! and re-asserted every poll so a satellite that restarts converges on the
//! commanded state. On shutdown both relays are written OFF.
//!
//! # Panic-Free Guarantees
//!
//! Socket errors are logged and the loop continues; a closed safety channel
//! ends the task.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use pvh_core::{CalibrationSet, CircuitId, CircuitState, DomainError};
use pvh_protocol::{SatelliteCodec, SatelliteFrame};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod hub;

pub use hub::{HubSettings, SensorBatch, SensorHub};

use crate::config::DaemonConfig;
use crate::safety::{CircuitMap, SafetyHandle};
use crate::thermostat::ThermostatHandle;

/// Largest datagram accepted from a satellite.
const MAX_DATAGRAM: usize = 1024;

/// Writes one relay frame per circuit.
async fn write_relays(socket: &UdpSocket, peer: SocketAddr, circuits: &CircuitMap) {
    for circuit in CircuitId::ALL {
        let energize = circuits.get(&circuit).is_some_and(|s| s.is_energized());
        let frame = SatelliteFrame::Relay {
            circuit: circuit.number(),
            energize,
        };
        if let Err(e) = socket.send_to(&frame.to_bytes(), peer).await {
            warn!(circuit = %circuit, peer = %peer, error = %e, "Relay frame write failed");
        }
    }
}

/// Starts the satellite link task on an already bound socket.
pub fn spawn_sensor_hub(
    socket: UdpSocket,
    safety: SafetyHandle,
    thermostat: ThermostatHandle,
    mut config: watch::Receiver<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> Result<JoinHandle<()>, DomainError> {
    let initial = Arc::clone(&config.borrow_and_update());
    let calibration = CalibrationSet::from_profiles(initial.calibration_profiles())?;
    let mut hub = SensorHub::new(calibration, HubSettings::from_config(&initial));
    let peer = initial.satellite.peer;
    let period = initial.poll_interval();

    Ok(tokio::spawn(async move {
        let mut commanded = safety.commanded();
        let mut codec = SatelliteCodec;
        let mut datagram = [0u8; MAX_DATAGRAM];
        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut config_open = true;

        info!(peer = %peer, poll_ms = period.as_millis() as u64, "Sensor hub starting");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                received = socket.recv_from(&mut datagram) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "Satellite receive error");
                            continue;
                        }
                    };
                    let now = Instant::now();
                    buf.clear();
                    buf.extend_from_slice(&datagram[..len]);
                    loop {
                        match codec.decode_eof(&mut buf) {
                            Ok(Some(item)) => hub.ingest(item, now),
                            Ok(None) => break,
                            Err(e) => {
                                debug!(from = %from, error = %e, "Undecodable datagram");
                                break;
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    let batch = hub.poll(Instant::now(), Utc::now());
                    if thermostat.readings(batch.readings.clone()).await.is_err() {
                        debug!("Thermostat gone, readings not forwarded");
                    }
                    if safety.sensor_batch(batch).await.is_err() {
                        warn!("Safety monitor gone, sensor hub stopping");
                        break;
                    }
                    let circuits = commanded.borrow().clone();
                    write_relays(&socket, peer, &circuits).await;
                }

                changed = commanded.changed() => {
                    if changed.is_err() {
                        warn!("Commanded state channel closed, sensor hub stopping");
                        break;
                    }
                    let circuits = commanded.borrow_and_update().clone();
                    debug!(?circuits, "Commanded state changed");
                    write_relays(&socket, peer, &circuits).await;
                }

                changed = config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let next = Arc::clone(&config.borrow_and_update());
                    hub.set_settings(HubSettings::from_config(&next));
                    if let Err(e) = hub.update_calibration(next.calibration_profiles()) {
                        warn!(error = %e, "Calibration update rejected");
                    }
                }
            }
        }

        let off: CircuitMap = CircuitId::ALL
            .iter()
            .map(|c| (*c, CircuitState::Off))
            .collect();
        write_relays(&socket, peer, &off).await;
        info!("Sensor hub stopped, relays written off");
    }))
}

/// Binds the satellite socket.
pub async fn bind_satellite(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    info!(addr = %addr, "Satellite socket bound");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::safety::spawn_safety_monitor;
    use crate::thermostat::spawn_thermostat;
    use std::time::Duration;

    async fn recv_frames(socket: &UdpSocket, count: usize) -> Vec<SatelliteFrame> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 64];
        while frames.len() < count {
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .expect("frame within timeout")
                .unwrap();
            let mut bytes = BytesMut::from(&buf[..len]);
            while let Some(item) = SatelliteCodec.decode_eof(&mut bytes).unwrap() {
                if let Some(frame) = item.frame() {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_relays_reasserted_and_written_off_on_shutdown() {
        let satellite = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = satellite.local_addr().unwrap();
        let mut config = crate::config::DaemonConfig::from_toml_str(SAMPLE).unwrap();
        config.satellite.peer = peer;
        config.satellite.poll_interval_ms = 50;
        let (_config_tx, config_rx) = watch::channel(Arc::new(config));

        let cancel = CancellationToken::new();
        let (safety, outputs, _safety_join) =
            spawn_safety_monitor(config_rx.clone(), cancel.clone());
        let (thermostat, _thermo_join) = spawn_thermostat(
            safety.clone(),
            outputs.saturation_acks,
            config_rx.clone(),
            cancel.clone(),
        );

        let socket = bind_satellite("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let hub_join =
            spawn_sensor_hub(socket, safety, thermostat, config_rx, cancel.clone()).unwrap();

        // Without a link the relays are re-asserted OFF every poll.
        let frames = recv_frames(&satellite, 4).await;
        assert!(frames
            .iter()
            .all(|f| matches!(f, SatelliteFrame::Relay { energize: false, .. })));

        cancel.cancel();
        hub_join.await.unwrap();
    }
}
