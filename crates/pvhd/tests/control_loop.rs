//! End-to-end tests of the control loop.
//!
//! Runs the whole daemon against a fake satellite (UDP) and a fake GFCI
//! bridge (TCP) on loopback, and drives it through the control socket with
//! `pvh-client`.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use pvh_client::{ClientConfig, ControlClient};
use pvh_core::{AlarmLevel, CircuitId, CircuitState, LinkState, SystemSnapshot, TankId};
use pvh_protocol::{BridgeCodec, BridgeMessage, SatelliteCodec, SatelliteFrame};
use pvhd::auth::sha256_hex;
use pvhd::config::DaemonConfig;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const TOKEN: &str = "operator-token";
const WAIT_STEP: Duration = Duration::from_millis(25);
const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Below both tank setpoints minus hysteresis.
const COLD_WATER: f32 = 40.0;

// ============================================================================
// Fake satellite
// ============================================================================

/// Streams samples for channels 1 and 2 and records the relay frames it
/// receives, indexed by circuit number minus one.
struct FakeSatellite {
    relays: watch::Receiver<[bool; 2]>,
    _task: JoinHandle<()>,
}

impl FakeSatellite {
    async fn start(daemon: SocketAddr) -> (Self, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let (tx, relays) = watch::channel([false; 2]);

        let task = tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(50));
            let mut datagram = [0u8; 256];
            let mut codec = SatelliteCodec;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut out = Vec::new();
                        for channel in [1u8, 2] {
                            let sample = SatelliteFrame::Sample { channel, value: COLD_WATER };
                            out.extend_from_slice(&sample.to_bytes());
                        }
                        let _ = socket.send_to(&out, daemon).await;
                    }
                    received = socket.recv_from(&mut datagram) => {
                        let Ok((len, _)) = received else { continue };
                        let mut buf = BytesMut::from(&datagram[..len]);
                        while let Ok(Some(item)) = codec.decode_eof(&mut buf) {
                            if let Some(SatelliteFrame::Relay { circuit, energize }) = item.frame() {
                                if let Some(index) = usize::from(circuit).checked_sub(1).filter(|i| *i < 2) {
                                    tx.send_modify(|relays| relays[index] = energize);
                                }
                            }
                        }
                    }
                }
            }
        });

        (
            Self {
                relays,
                _task: task,
            },
            local,
        )
    }

    async fn wait_for_relays(&mut self, expected: [bool; 2]) {
        let result = timeout(WAIT_LIMIT, async {
            while *self.relays.borrow_and_update() != expected {
                if self.relays.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "relays did not reach {expected:?}, last {:?}",
            *self.relays.borrow()
        );
    }
}

// ============================================================================
// Fake GFCI bridge
// ============================================================================

/// Acknowledges heartbeats and shutoff commands while `answering` is set.
async fn fake_bridge(listener: TcpListener, answering: Arc<AtomicBool>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else { return };
        tokio::spawn(serve_bridge(stream, Arc::clone(&answering)));
    }
}

async fn serve_bridge(mut stream: TcpStream, answering: Arc<AtomicBool>) {
    let mut buf = BytesMut::new();
    let mut codec = BridgeCodec;
    loop {
        if stream.read_buf(&mut buf).await.unwrap_or(0) == 0 {
            return;
        }
        while let Ok(Some(item)) = codec.decode(&mut buf) {
            if !answering.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(BridgeMessage::Heartbeat { seq } | BridgeMessage::ShutoffCmd { seq, .. }) =
                item.frame()
            {
                let _ = stream.write_all(&BridgeMessage::Ack { seq }.to_bytes()).await;
            }
        }
    }
}

// ============================================================================
// Daemon harness
// ============================================================================

fn free_udp_port() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

fn config_text(
    socket: &Path,
    satellite_bind: SocketAddr,
    peer: SocketAddr,
    bridge: SocketAddr,
) -> String {
    format!(
        r#"
        [daemon]
        socket_path = "{socket}"
        shutdown_grace_ms = 1000

        [satellite]
        bind = "{satellite_bind}"
        peer = "{peer}"
        poll_interval_ms = 50
        sensor_timeout_ms = 1000

        [bridge]
        address = "{bridge}"
        heartbeat_interval_ms = 50
        max_missed_heartbeats = 3
        connect_timeout_ms = 200
        backoff_initial_ms = 50
        backoff_max_ms = 200

        [safety]
        evaluation_interval_ms = 20
        link_timeout_ms = 400

        [auth]
        token_sha256 = ["{digest}"]

        [[sensors]]
        id = "tank1_top"
        channel = 1
        valid_min = -20.0
        valid_max = 110.0

        [[sensors]]
        id = "tank2_top"
        channel = 2
        valid_min = -20.0
        valid_max = 110.0

        [[tanks]]
        id = "tank1"
        sensor = "tank1_top"
        circuit = 1
        setpoint = 50.0

        [[tanks]]
        id = "tank2"
        sensor = "tank2_top"
        circuit = 2
        setpoint = 45.0
        "#,
        socket = socket.display(),
        digest = sha256_hex(TOKEN),
    )
}

struct Harness {
    satellite: FakeSatellite,
    answering: Arc<AtomicBool>,
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    daemon: JoinHandle<Result<(), pvhd::daemon::DaemonError>>,
    _bridge: JoinHandle<()>,
    _temp_dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("pvhd.sock");

        let satellite_bind = free_udp_port();
        let (satellite, peer) = FakeSatellite::start(satellite_bind).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = listener.local_addr().unwrap();
        let answering = Arc::new(AtomicBool::new(true));
        let bridge = tokio::spawn(fake_bridge(listener, Arc::clone(&answering)));

        let config = DaemonConfig::from_toml_str(&config_text(
            &socket_path,
            satellite_bind,
            peer,
            bridge_addr,
        ))
        .expect("valid config");

        let cancel_token = CancellationToken::new();
        let daemon = tokio::spawn(pvhd::daemon::run(config, None, cancel_token.clone()));

        let start = tokio::time::Instant::now();
        while start.elapsed() < WAIT_LIMIT && !socket_path.exists() {
            sleep(WAIT_STEP).await;
        }
        assert!(socket_path.exists(), "control socket never appeared");

        Self {
            satellite,
            answering,
            socket_path,
            cancel_token,
            daemon,
            _bridge: bridge,
            _temp_dir: temp_dir,
        }
    }

    async fn client(&self) -> ControlClient {
        let config = ClientConfig {
            socket_path: self.socket_path.clone(),
            client_id: Some("test".to_string()),
            ..ClientConfig::default()
        };
        ControlClient::connect(&config).await.expect("connect")
    }

    /// Polls state until `pred` holds, acknowledging any alarm raised while
    /// the system settles.
    async fn settle<F>(&self, client: &mut ControlClient, mut pred: F) -> SystemSnapshot
    where
        F: FnMut(&SystemSnapshot) -> bool,
    {
        let start = tokio::time::Instant::now();
        loop {
            let snapshot = client.get_state().await.unwrap();
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(
                start.elapsed() < WAIT_LIMIT,
                "condition not reached, last snapshot {snapshot:?}"
            );
            for alarm in snapshot.alarms.iter().filter(|a| !a.acknowledged) {
                let _ = client.ack_alarm(alarm.id, TOKEN).await;
            }
            sleep(WAIT_STEP).await;
        }
    }

    async fn shutdown(self) -> (FakeSatellite, PathBuf, Result<(), pvhd::daemon::DaemonError>) {
        self.cancel_token.cancel();
        let result = timeout(WAIT_LIMIT, self.daemon)
            .await
            .expect("daemon stopped in time")
            .expect("daemon task joined");
        (self.satellite, self.socket_path, result)
    }
}

fn both_on(snapshot: &SystemSnapshot) -> bool {
    CircuitId::ALL
        .iter()
        .all(|c| snapshot.circuit_state(*c) == Some(CircuitState::On))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_tanks_heat_while_link_is_up() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    let snapshot = harness.settle(&mut client, both_on).await;
    assert_eq!(snapshot.link, LinkState::Up);
    let tank = snapshot.tank(&TankId::new("tank1")).unwrap();
    assert_eq!(tank.temperature, Some(f64::from(COLD_WATER)));

    harness.satellite.wait_for_relays([true, true]).await;

    let (_, _, result) = harness.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_bridge_forces_circuits_off() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    harness.settle(&mut client, both_on).await;
    harness.satellite.wait_for_relays([true, true]).await;

    harness.answering.store(false, Ordering::SeqCst);
    harness.satellite.wait_for_relays([false, false]).await;

    let snapshot = client.get_state().await.unwrap();
    assert_ne!(snapshot.link, LinkState::Up);
    assert_eq!(snapshot.alarm_level, AlarmLevel::Critical);
    assert!(CircuitId::ALL
        .iter()
        .all(|c| snapshot.circuit_state(*c) != Some(CircuitState::On)));

    let (_, _, result) = harness.shutdown().await;
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setpoint_above_temperature_stops_heating() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    harness.settle(&mut client, both_on).await;

    // Water at 40 is already above 30 + hysteresis.
    let accepted = client
        .set_setpoint(TankId::new("tank1"), 30.0, TOKEN)
        .await
        .unwrap();
    assert_eq!(accepted, 30.0);

    harness
        .settle(&mut client, |s| {
            s.circuit_state(CircuitId::One) == Some(CircuitState::Off)
                && s.circuit_state(CircuitId::Two) == Some(CircuitState::On)
        })
        .await;
    harness.satellite.wait_for_relays([false, true]).await;

    let _ = harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_turns_relays_off_and_removes_socket() {
    let mut harness = Harness::start().await;
    let mut client = harness.client().await;

    harness.settle(&mut client, both_on).await;
    harness.satellite.wait_for_relays([true, true]).await;
    drop(client);

    let (mut satellite, socket_path, result) = harness.shutdown().await;
    assert!(result.is_ok());
    satellite.wait_for_relays([false, false]).await;
    assert!(!socket_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_reports_every_subsystem() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let report = client.get_health(Some(5)).await.unwrap();
    assert_eq!(report.subsystems.len(), 5);
    for name in ["sensor_hub", "gfci_link", "thermostat", "safety_monitor", "health_recorder"] {
        assert!(report.subsystems.contains_key(name), "missing {name}");
    }

    let _ = harness.shutdown().await;
}
