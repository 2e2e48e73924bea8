use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{add_bits, increment, BigValueCiphertext};
use crate::error::{check_len, Result};
use crate::gates::{BinaryGates, BitDecryptor};
use crate::utils::{bit_length, from_bits_le, to_bits_le};

pub const INT72_BITS: usize = 72;

/// Two's complement integer over 72 little-endian bits; bit 71 is the sign.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Int72Ciphertext<B> {
    bits: Vec<B>,
}

impl<B: Clone> Int72Ciphertext<B> {
    pub fn zero<G: BinaryGates<Bit = B>>(g: &G) -> Self {
        Self {
            bits: vec![g.zero(); INT72_BITS],
        }
    }

    pub fn from_bits(bits: Vec<B>) -> Result<Self> {
        check_len("int72", INT72_BITS, bits.len())?;
        Ok(Self { bits })
    }

    pub fn trivial<G: BinaryGates<Bit = B>>(g: &G, value: i128) -> Self {
        let bits = to_bits_le(value as u128, INT72_BITS)
            .into_iter()
            .map(|b| g.constant(b))
            .collect_vec();
        Self { bits }
    }

    pub fn bits(&self) -> &[B] {
        &self.bits
    }

    pub fn decrypt<D: BitDecryptor<Bit = B>>(&self, decryptor: &D) -> i128 {
        let raw = from_bits_le(&decryptor.decrypt_bits(&self.bits)) as i128;
        if raw >> (INT72_BITS - 1) & 1 == 1 {
            raw - (1i128 << INT72_BITS)
        } else {
            raw
        }
    }

    pub fn add<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        Self {
            bits: add_bits(g, &self.bits, &other.bits, None, INT72_BITS),
        }
    }

    /// `self - other`, computed as `self + !other + 1`.
    pub fn sub<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        let inverted = other.bits.iter().map(|b| g.not(b)).collect_vec();
        Self {
            bits: add_bits(g, &self.bits, &inverted, Some(g.one()), INT72_BITS),
        }
    }

    pub fn neg<G: BinaryGates<Bit = B>>(&self, g: &G) -> Self {
        let inverted = self.bits.iter().map(|b| g.not(b)).collect_vec();
        Self {
            bits: increment(g, &inverted),
        }
    }

    /// `acc + coefficient * value`.
    ///
    /// The product is built from one shifted add per set bit of `|coefficient|`, each
    /// only as wide as the running bound of the partial product requires. Terms are
    /// reduced modulo 2^72.
    pub fn scaled_accumulate<G: BinaryGates<Bit = B>>(
        g: &G,
        coefficient: i128,
        value: &BigValueCiphertext<B>,
        acc: &Self,
    ) -> Self {
        if coefficient == 0 || value.upper_bound() == 0 {
            return acc.clone();
        }
        let magnitude = coefficient.unsigned_abs();

        let mut product: Vec<B> = Vec::new();
        let mut max_value = 0u128;
        for shift in (0..INT72_BITS).filter(|k| (magnitude >> k) & 1 == 1) {
            max_value = max_value.saturating_add(value.upper_bound().saturating_mul(1 << shift));
            let width = bit_length(max_value).min(INT72_BITS);
            if product.len() < shift {
                product.resize(shift, g.zero());
            }
            let high = add_bits(g, &product[shift..], value.bits(), None, width - shift);
            product.truncate(shift);
            product.extend(high);
        }
        product.resize(INT72_BITS, g.zero());
        let product = Self { bits: product };

        if coefficient > 0 {
            acc.add(&product, g)
        } else {
            acc.sub(&product, g)
        }
    }
}
