//! Shared fixed-size frame handling for the binary links.
//!
//! Both links use frames of the form `[sync][body...][crc8]` where the CRC
//! covers every byte before it. Splitting never fails the stream: garbage
//! before a sync byte and frames with a bad checksum are reported as
//! [`FrameError`]s and skipped.

use crate::checksum::crc8;
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// A malformed frame that was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Bytes skipped while searching for the next sync byte.
    #[error("Lost sync, skipped {skipped} bytes")]
    Resync { skipped: usize },

    #[error("Checksum mismatch: frame says {received:#04x}, computed {computed:#04x}")]
    Checksum { received: u8, computed: u8 },

    #[error("Unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("Invalid {field} byte {value:#04x}")]
    InvalidField { field: &'static str, value: u8 },

    /// A datagram ended in the middle of a frame.
    #[error("Truncated frame of {len} bytes")]
    Truncated { len: usize },
}

/// Output of the binary decoders.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Frame(T),
    Rejected {
        error: FrameError,
        /// Satellite channel the bad frame claimed, if it got that far.
        channel: Option<u8>,
    },
}

impl<T> Decoded<T> {
    pub(crate) fn rejected(error: FrameError) -> Self {
        Self::Rejected {
            error,
            channel: None,
        }
    }

    pub fn frame(self) -> Option<T> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::Rejected { .. } => None,
        }
    }
}

/// Pulls the next `N`-byte frame out of `src`.
///
/// Returns `None` when more bytes are needed, `Some(Ok(frame))` for a frame
/// with a valid checksum and `Some(Err(..))` for dropped input.
pub(crate) fn split_frame<const N: usize>(
    src: &mut BytesMut,
    sync: u8,
) -> Option<Result<[u8; N], FrameError>> {
    let first = *src.first()?;
    if first != sync {
        let skipped = src
            .iter()
            .position(|&byte| byte == sync)
            .unwrap_or(src.len());
        src.advance(skipped);
        return Some(Err(FrameError::Resync { skipped }));
    }

    if src.len() < N {
        return None;
    }

    let mut frame = [0u8; N];
    frame.copy_from_slice(&src.split_to(N));

    let (body, trailer) = frame.split_at(N - 1);
    let received = trailer.first().copied().unwrap_or_default();
    let computed = crc8(body);
    if received != computed {
        return Some(Err(FrameError::Checksum { received, computed }));
    }

    Some(Ok(frame))
}

/// Appends the CRC byte to a frame body.
pub(crate) fn seal<const N: usize>(body: &[u8]) -> [u8; N] {
    let mut frame = [0u8; N];
    let (head, trailer) = frame.split_at_mut(N - 1);
    head.copy_from_slice(body);
    if let Some(crc) = trailer.first_mut() {
        *crc = crc8(body);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_skips_to_next_sync_byte() {
        let mut buf = BytesMut::from(&[0x00, 0x11, 0xA5, 0x01][..]);
        let result = split_frame::<4>(&mut buf, 0xA5);
        assert_eq!(result, Some(Err(FrameError::Resync { skipped: 2 })));
        assert_eq!(buf.first(), Some(&0xA5));
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut buf = BytesMut::from(&[0xA5, 0x01][..]);
        assert_eq!(split_frame::<4>(&mut buf, 0xA5), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_sealed_frame_splits_cleanly() {
        let frame: [u8; 4] = seal(&[0xA5, 0x01, 0x02]);
        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(split_frame::<4>(&mut buf, 0xA5), Some(Ok(frame)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_checksum_consumes_frame() {
        let mut frame: [u8; 4] = seal(&[0xA5, 0x01, 0x02]);
        frame[3] ^= 0xFF;
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            split_frame::<4>(&mut buf, 0xA5),
            Some(Err(FrameError::Checksum { .. }))
        ));
        assert!(buf.is_empty());
    }
}
