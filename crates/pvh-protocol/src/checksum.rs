//! CRC-8 used by both binary links (polynomial 0x07, init 0x00, no reflection).

const POLY: u8 = 0x07;

/// Computes the CRC-8 of `data`.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| {
        (0..8).fold(crc ^ byte, |acc, _| {
            if acc & 0x80 != 0 {
                (acc << 1) ^ POLY
            } else {
                acc << 1
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Standard check input for CRC-8/SMBUS.
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_detects_single_bit_flip() {
        let a = [0xA5, 0x01, 0x02, 0x00, 0x00, 0x48, 0x42];
        let mut b = a;
        b[3] ^= 0x01;
        assert_ne!(crc8(&a), crc8(&b));
    }
}
