//! Satellite link frames.
//!
//! Every UDP datagram carries one or more 8-byte frames:
//!
//! ```text
//! ┌──────┬──────┬─────────┬──────────────┬──────┐
//! │ 0xA5 │ kind │ channel │ value f32 LE │ crc8 │
//! └──────┴──────┴─────────┴──────────────┴──────┘
//! ```
//!
//! kind 0x01 is a sensor sample sent by the satellite. kind 0x02 is a relay
//! command sent by the daemon: channel is the circuit number, value 1.0
//! energizes and 0.0 de-energizes.

use crate::framing::{seal, split_frame, Decoded, FrameError};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const SYNC: u8 = 0xA5;
pub const FRAME_LEN: usize = 8;

const KIND_SAMPLE: u8 = 0x01;
const KIND_RELAY: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SatelliteFrame {
    Sample { channel: u8, value: f32 },
    Relay { circuit: u8, energize: bool },
}

impl SatelliteFrame {
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let (kind, channel, value) = match *self {
            Self::Sample { channel, value } => (KIND_SAMPLE, channel, value),
            Self::Relay { circuit, energize } => {
                (KIND_RELAY, circuit, if energize { 1.0 } else { 0.0 })
            }
        };
        let [v0, v1, v2, v3] = value.to_le_bytes();
        seal(&[SYNC, kind, channel, v0, v1, v2, v3])
    }

    fn from_bytes(frame: [u8; FRAME_LEN]) -> Decoded<Self> {
        let [_sync, kind, channel, v0, v1, v2, v3, _crc] = frame;
        let value = f32::from_le_bytes([v0, v1, v2, v3]);
        match kind {
            KIND_SAMPLE => Decoded::Frame(Self::Sample { channel, value }),
            KIND_RELAY => Decoded::Frame(Self::Relay {
                circuit: channel,
                energize: value >= 0.5,
            }),
            other => Decoded::Rejected {
                error: FrameError::UnknownKind(other),
                channel: Some(channel),
            },
        }
    }
}

/// Codec for satellite datagrams. Call `decode_eof` per datagram so a
/// trailing partial frame is reported instead of carried over.
#[derive(Debug, Default, Clone, Copy)]
pub struct SatelliteCodec;

impl Decoder for SatelliteCodec {
    type Item = Decoded<SatelliteFrame>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // The channel byte is read before the split so checksum failures can
        // be attributed to the sensor that sent them.
        let claimed_channel = src.get(2).copied();
        Ok(split_frame::<FRAME_LEN>(src, SYNC).map(|result| match result {
            Ok(frame) => SatelliteFrame::from_bytes(frame),
            Err(error @ FrameError::Checksum { .. }) => Decoded::Rejected {
                error,
                channel: claimed_channel,
            },
            Err(error) => Decoded::rejected(error),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => {
                let len = buf.len();
                buf.clear();
                Ok(Some(Decoded::rejected(FrameError::Truncated { len })))
            }
        }
    }
}

impl Encoder<SatelliteFrame> for SatelliteCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: SatelliteFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}
