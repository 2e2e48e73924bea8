//! Bit-sliced arithmetic over [`BinaryGates`].
//!
//! Unsigned values with a public upper bound ([`BigValueCiphertext`]), 72-bit two's
//! complement integers ([`Int72Ciphertext`]) and 16-bit fixed point mantissas
//! ([`Fix16`]) used to divide two integers without branching on secret data.

mod big_value;
mod fix16;
mod int72;

pub use big_value::BigValueCiphertext;
pub use fix16::{divide, normalize, Fix16, Quotient, FIX16_BITS};
pub use int72::{Int72Ciphertext, INT72_BITS};

use crate::gates::BinaryGates;

/// Little-endian ripple-carry addition truncated to `width` output bits.
///
/// Bits missing from the shorter operand are treated as zero without spending gates.
pub(crate) fn add_bits<G: BinaryGates>(
    g: &G,
    a: &[G::Bit],
    b: &[G::Bit],
    carry_in: Option<G::Bit>,
    width: usize,
) -> Vec<G::Bit> {
    let mut out = Vec::with_capacity(width);
    let mut carry = carry_in;
    for i in 0..width {
        let (sum, next) = match (a.get(i), b.get(i), carry.as_ref()) {
            (Some(x), Some(y), Some(c)) => {
                let x_xor_y = g.xor(x, y);
                let sum = g.xor(&x_xor_y, c);
                let next = g.or(&g.and(x, y), &g.and(c, &x_xor_y));
                (sum, Some(next))
            }
            (Some(x), Some(y), None) => (g.xor(x, y), Some(g.and(x, y))),
            (Some(x), None, Some(c)) | (None, Some(x), Some(c)) => {
                (g.xor(x, c), Some(g.and(x, c)))
            }
            (Some(x), None, None) | (None, Some(x), None) => (x.clone(), None),
            (None, None, Some(c)) => (c.clone(), None),
            (None, None, None) => (g.zero(), None),
        };
        out.push(sum);
        carry = next;
    }
    out
}

/// `a + 1` over exactly `a.len()` bits.
pub(crate) fn increment<G: BinaryGates>(g: &G, a: &[G::Bit]) -> Vec<G::Bit> {
    add_bits(g, a, &[], Some(g.one()), a.len())
}

/// Adds a single encrypted bit into a fixed-width counter.
pub(crate) fn add_bit<G: BinaryGates>(g: &G, a: &[G::Bit], bit: &G::Bit) -> Vec<G::Bit> {
    add_bits(g, a, &[], Some(bit.clone()), a.len())
}
