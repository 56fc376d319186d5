//! Deterministic payload pattern and data-integrity verification.
//!
//! The pattern buffer is filled once at startup and doubles as the client's
//! send buffer: byte 0 is rewritten with the live sequence counter and byte 1
//! carries [`CLIENT_MASK`]. Integrity verification compares an echoed payload
//! against the pattern after undoing the server's mask rewrite.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::wire::{CLIENT_MASK, MASK_BYTE};

/// Fill `buf` with pattern bytes in `[0, 128)` from a seeded generator.
///
/// Byte 0 is left for the sequence counter and byte 1 is set to
/// [`CLIENT_MASK`]; both are control bytes, not pattern.
pub fn write_pattern(buf: &mut [u8], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for b in buf.iter_mut() {
        *b = rng.gen_range(0..128u8);
    }
    if buf.len() > MASK_BYTE {
        buf[MASK_BYTE] = CLIENT_MASK;
    }
}

/// Verify an echoed payload against the pattern.
///
/// The server rewrites byte 1 on the way back, so it is restored to
/// [`CLIENT_MASK`] before the compare. Byte 0 already matched the expected
/// sequence or the datagram would not have reached this check.
pub fn verify(pattern: &[u8], received: &mut [u8], msg_size: usize) -> bool {
    if received.len() < msg_size || pattern.len() < msg_size {
        return false;
    }
    received[MASK_BYTE] = CLIENT_MASK;
    received[..msg_size] == pattern[..msg_size]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SERVER_MASK;

    #[test]
    fn test_pattern_byte_range() {
        let mut buf = vec![0u8; 4096];
        write_pattern(&mut buf, 7);
        assert!(buf.iter().all(|&b| b < 128));
        assert_eq!(buf[MASK_BYTE], CLIENT_MASK);
    }

    #[test]
    fn test_pattern_deterministic() {
        let mut a = vec![0u8; 256];
        let mut b = vec![0u8; 256];
        write_pattern(&mut a, 42);
        write_pattern(&mut b, 42);
        assert_eq!(a, b);
        write_pattern(&mut b, 43);
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_accepts_echo() {
        let mut pattern = vec![0u8; 64];
        write_pattern(&mut pattern, 1);
        pattern[0] = 9; // live sequence value

        let mut echoed = pattern.clone();
        echoed[MASK_BYTE] = SERVER_MASK; // what the server sends back
        assert!(verify(&pattern, &mut echoed, 64));
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let mut pattern = vec![0u8; 64];
        write_pattern(&mut pattern, 1);

        let mut echoed = pattern.clone();
        echoed[MASK_BYTE] = SERVER_MASK;
        echoed[40] ^= 0x01;
        assert!(!verify(&pattern, &mut echoed, 64));
    }

    #[test]
    fn test_verify_checks_only_msg_size() {
        let mut pattern = vec![0u8; 128];
        write_pattern(&mut pattern, 1);

        let mut echoed = pattern.clone();
        echoed[MASK_BYTE] = SERVER_MASK;
        echoed[100] ^= 0xFF; // beyond msg_size
        assert!(verify(&pattern, &mut echoed, 64));
    }
}
