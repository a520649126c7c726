//! Common Utilities
//!
//! Bit packing helpers shared by the decode stage and its tests.

use bytes::{BufMut, Bytes, BytesMut};

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte & (1 << (7 - i))) != 0);
        }
    }

    bits
}

/// Hard decision over signed-byte demodulated values. BPSK-style mapping:
/// a non-negative value decodes to bit 0, a negative value to bit 1.
pub fn hard_decide(demod: &[i8]) -> Vec<bool> {
    demod.iter().map(|&v| v < 0).collect()
}
