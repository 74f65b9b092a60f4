//! GFCI bridge frames.
//!
//! Fixed 7-byte frames over TCP:
//!
//! ```text
//! ┌──────┬──────┬─────────────┬─────────┬──────┬──────┐
//! │ 0x5A │ type │ seq u16 LE  │ circuit │ side │ crc8 │
//! └──────┴──────┴─────────────┴─────────┴──────┴──────┘
//! ```
//!
//! circuit is 1 or 2 (0 when not applicable), side is 1 = line, 2 = load
//! (0 when not applicable).

use crate::framing::{seal, split_frame, Decoded, FrameError};
use bytes::{BufMut, BytesMut};
use pvh_core::{CircuitId, FaultSide};
use tokio_util::codec::{Decoder, Encoder};

pub const SYNC: u8 = 0x5A;
pub const FRAME_LEN: usize = 7;

const TYPE_HEARTBEAT: u8 = 0x01;
const TYPE_FAULT_REPORT: u8 = 0x02;
const TYPE_SHUTOFF: u8 = 0x03;
const TYPE_ACK: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMessage {
    Heartbeat { seq: u16 },
    FaultReport { seq: u16, circuit: CircuitId, side: FaultSide },
    ShutoffCmd { seq: u16, circuit: CircuitId },
    Ack { seq: u16 },
}

impl BridgeMessage {
    pub fn seq(&self) -> u16 {
        match *self {
            Self::Heartbeat { seq }
            | Self::FaultReport { seq, .. }
            | Self::ShutoffCmd { seq, .. }
            | Self::Ack { seq } => seq,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let (kind, circuit, side) = match *self {
            Self::Heartbeat { .. } => (TYPE_HEARTBEAT, 0, 0),
            Self::FaultReport { circuit, side, .. } => {
                (TYPE_FAULT_REPORT, circuit.number(), side.code())
            }
            Self::ShutoffCmd { circuit, .. } => (TYPE_SHUTOFF, circuit.number(), 0),
            Self::Ack { .. } => (TYPE_ACK, 0, 0),
        };
        let [s0, s1] = self.seq().to_le_bytes();
        seal(&[SYNC, kind, s0, s1, circuit, side])
    }

    fn from_bytes(frame: [u8; FRAME_LEN]) -> Result<Self, FrameError> {
        let [_sync, kind, s0, s1, circuit, side, _crc] = frame;
        let seq = u16::from_le_bytes([s0, s1]);
        let circuit_of = |value: u8| {
            CircuitId::from_number(value).ok_or(FrameError::InvalidField {
                field: "circuit",
                value,
            })
        };

        match kind {
            TYPE_HEARTBEAT => Ok(Self::Heartbeat { seq }),
            TYPE_FAULT_REPORT => Ok(Self::FaultReport {
                seq,
                circuit: circuit_of(circuit)?,
                side: FaultSide::from_code(side).ok_or(FrameError::InvalidField {
                    field: "side",
                    value: side,
                })?,
            }),
            TYPE_SHUTOFF => Ok(Self::ShutoffCmd {
                seq,
                circuit: circuit_of(circuit)?,
            }),
            TYPE_ACK => Ok(Self::Ack { seq }),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Codec for the bridge TCP stream, meant for `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeCodec;

impl Decoder for BridgeCodec {
    type Item = Decoded<BridgeMessage>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(split_frame::<FRAME_LEN>(src, SYNC).map(|result| {
            match result.and_then(BridgeMessage::from_bytes) {
                Ok(message) => Decoded::Frame(message),
                Err(error) => Decoded::rejected(error),
            }
        }))
    }
}

impl Encoder<BridgeMessage> for BridgeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: BridgeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}
