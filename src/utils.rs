use byteorder::{BigEndian, ByteOrder};
use itertools::Itertools;
use sha3::{Digest, Keccak256};

/// Little-endian bit decomposition of the low `width` bits of `value`.
pub fn to_bits_le(value: u128, width: usize) -> Vec<bool> {
    (0..width)
        .map(|i| i < 128 && (value >> i) & 1 == 1)
        .collect_vec()
}

/// Inverse of [`to_bits_le`]. Bits past position 127 are ignored.
pub fn from_bits_le(bits: &[bool]) -> u128 {
    bits.iter()
        .take(128)
        .enumerate()
        .fold(0u128, |acc, (i, b)| acc | ((*b as u128) << i))
}

/// Number of bits needed for values in `[0, upper_bound]`; a bound of 0 still takes one bit.
pub fn bit_length(upper_bound: u128) -> usize {
    if upper_bound == 0 {
        1
    } else {
        (128 - upper_bound.leading_zeros()) as usize
    }
}

/// Packs bits eight to a byte, least significant first.
pub fn transcode_to_bytes(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, b)| acc | ((*b as u8) << i))
        })
        .collect_vec()
}

/// Unpacks `len` bits from `bytes`. Returns `None` if `bytes` is too short.
pub fn transcode_from_bytes(bytes: &[u8], len: usize) -> Option<Vec<bool>> {
    if bytes.len() * 8 < len {
        return None;
    }
    Some((0..len).map(|i| (bytes[i / 8] >> (i % 8)) & 1 == 1).collect_vec())
}

/// 32-byte big-endian encoding of an integer, the width hashed alongside secrets.
pub fn word(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    BigEndian::write_u64(&mut out[24..], value);
    out
}

pub fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Bit `i` of a digest read as a big-endian integer.
pub fn digest_bit(digest: &[u8; 32], i: usize) -> bool {
    (digest[31 - i / 8] >> (i % 8)) & 1 == 1
}

/// Digest read as a big-endian integer, reduced modulo `modulus`.
pub fn digest_mod(digest: &[u8; 32], modulus: u64) -> u64 {
    let m = modulus as u128;
    digest
        .iter()
        .fold(0u128, |acc, byte| ((acc << 8) | *byte as u128) % m) as u64
}
