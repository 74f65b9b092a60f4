//! PVH Protocol - Wire formats for the hot-water daemon
//!
//! This crate provides:
//! - the satellite link frames (UDP, sensor samples and relay commands)
//! - the GFCI bridge frames (TCP, heartbeats, fault reports, shutoffs)
//! - the local control protocol spoken over the daemon's Unix socket
//!
//! The binary codecs plug into `tokio_util::codec` and never fail on
//! malformed input: bad frames are yielded as [`Decoded::Rejected`] so the
//! caller can count them, and decoding resynchronizes on the next sync byte.

pub mod bridge;
pub mod checksum;
pub mod framing;
pub mod message;
pub mod satellite;
pub mod version;

pub use bridge::{BridgeCodec, BridgeMessage};
pub use checksum::crc8;
pub use framing::{Decoded, FrameError};
pub use message::{error_code, ClientMessage, DaemonMessage, MessageType};
pub use satellite::{SatelliteCodec, SatelliteFrame};
pub use version::ProtocolVersion;
