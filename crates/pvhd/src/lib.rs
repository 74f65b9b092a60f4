//! PVH Daemon - Control and safety daemon for a PV hot-water installation
//!
//! This crate provides every task the daemon runs:
//! - `sensor_hub` - Satellite link: sensor samples in, relay frames out
//! - `gfci` - Persistent link to the exterior-panel GFCI bridge
//! - `thermostat` - Per-tank hysteresis control, proposals only
//! - `safety` - Sole owner of circuit states and the alarm level
//! - `health` - Periodic health records and the "currently healthy" verdict
//! - `server` - Unix socket control gateway
//! - `auth` - Operator token checks for privileged requests
//! - `monitor` - Memory and CPU of the daemon process
//! - `config` - TOML configuration with hot reload
//! - `daemon` - Task wiring and shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            pvhd                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐ readings  ┌────────────┐ proposals              │
//! │  │ SensorHub  │──────────▶│ Thermostat │──────────┐             │
//! │  └─────┬──────┘           └────────────┘          ▼             │
//! │        │ batches                          ┌───────────────┐     │
//! │        └─────────────────────────────────▶│ SafetyMonitor │     │
//! │  ┌────────────┐ link state, faults        │ (state owner) │     │
//! │  │ GFCI link  │──────────────────────────▶│               │     │
//! │  └────────────┘◀──────── shutoffs ────────└───────┬───────┘     │
//! │                                                   │ snapshots   │
//! │  ┌────────────────┐   ┌──────────────────┐        │ events      │
//! │  │ HealthRecorder │◀──┤  ControlServer   │◀───────┘             │
//! │  └────────────────┘   │  (Unix socket)   │                      │
//! │                       └──────────────────┘                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod auth;
pub mod config;
pub mod daemon;
pub mod gfci;
pub mod health;
pub mod monitor;
pub mod safety;
pub mod sensor_hub;
pub mod server;
pub mod thermostat;
