use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{add_bits, Int72Ciphertext, INT72_BITS};
use crate::error::{Error, Result};
use crate::gates::{BinaryGates, BitDecryptor, BitEncryptor};
use crate::utils::{bit_length, from_bits_le, to_bits_le};

/// Unsigned bit-sliced value, little-endian, whose width follows a public upper bound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BigValueCiphertext<B> {
    pub(super) bits: Vec<B>,
    pub(super) upper_bound: u128,
}

impl<B: Clone> BigValueCiphertext<B> {
    pub fn zero<G: BinaryGates<Bit = B>>(g: &G) -> Self {
        Self {
            bits: vec![g.zero()],
            upper_bound: 0,
        }
    }

    /// A single encrypted bit as a value in `{0, 1}`.
    pub fn from_bit(bit: B) -> Self {
        Self {
            bits: vec![bit],
            upper_bound: 1,
        }
    }

    /// Wraps existing bits. `bits.len()` must match the width of `upper_bound`.
    pub fn from_bits(bits: Vec<B>, upper_bound: u128) -> Result<Self> {
        crate::error::check_len("big value", bit_length(upper_bound), bits.len())?;
        Ok(Self { bits, upper_bound })
    }

    pub fn trivial<G: BinaryGates<Bit = B>>(g: &G, value: u128, upper_bound: u128) -> Result<Self> {
        check_value(value, upper_bound)?;
        let bits = to_bits_le(value, bit_length(upper_bound))
            .into_iter()
            .map(|b| g.constant(b))
            .collect_vec();
        Ok(Self { bits, upper_bound })
    }

    pub fn encrypt<E: BitEncryptor<Bit = B>>(
        encryptor: &E,
        value: u128,
        upper_bound: u128,
    ) -> Result<Self> {
        check_value(value, upper_bound)?;
        let bits = encryptor.encrypt_bits(&to_bits_le(value, bit_length(upper_bound)));
        Ok(Self { bits, upper_bound })
    }

    pub fn decrypt<D: BitDecryptor<Bit = B>>(&self, decryptor: &D) -> u128 {
        from_bits_le(&decryptor.decrypt_bits(&self.bits))
    }

    pub fn bits(&self) -> &[B] {
        &self.bits
    }

    pub fn upper_bound(&self) -> u128 {
        self.upper_bound
    }

    pub fn add<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        let upper_bound = self.upper_bound.saturating_add(other.upper_bound);
        let width = bit_length(upper_bound);
        Self {
            bits: add_bits(g, &self.bits, &other.bits, None, width),
            upper_bound,
        }
    }

    /// Shift-and-add product; the operand with fewer bits drives the rows.
    pub fn mul<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        if self.upper_bound == 0 || other.upper_bound == 0 {
            return Self::zero(g);
        }
        let upper_bound = self.upper_bound.saturating_mul(other.upper_bound);
        let width = bit_length(upper_bound);
        let (short, long) = if self.bits.len() <= other.bits.len() {
            (self, other)
        } else {
            (other, self)
        };

        let mut acc: Vec<B> = Vec::new();
        for (row, selector) in short.bits.iter().enumerate().take(width) {
            let partial = long.bits.iter().map(|b| g.and(selector, b)).collect_vec();
            if row == 0 {
                acc = add_bits(g, &partial, &[], None, width);
            } else {
                let high = add_bits(g, &acc[row..], &partial, None, width - row);
                acc.truncate(row);
                acc.extend(high);
            }
        }
        Self {
            bits: acc,
            upper_bound,
        }
    }

    /// Multiplies by `2^k`.
    pub fn shl<G: BinaryGates<Bit = B>>(&self, k: usize, g: &G) -> Self {
        let mut bits = vec![g.zero(); k];
        bits.extend(self.bits.iter().cloned());
        let upper_bound = self.upper_bound.checked_shl(k as u32).unwrap_or(u128::MAX);
        let width = bit_length(upper_bound);
        bits.truncate(width);
        Self { bits, upper_bound }
    }

    /// Zero-extends into a 72-bit container. Bounds of 2^72 or more are rejected.
    pub fn to_int72<G: BinaryGates<Bit = B>>(&self, g: &G) -> Result<Int72Ciphertext<B>> {
        if self.bits.len() > INT72_BITS {
            return Err(Error::Overflow {
                bound: self.upper_bound,
            });
        }
        let mut bits = self.bits.clone();
        bits.resize(INT72_BITS, g.zero());
        Int72Ciphertext::from_bits(bits)
    }
}

fn check_value(value: u128, upper_bound: u128) -> Result<()> {
    if value > upper_bound {
        return Err(Error::InvalidInput(format!(
            "value {value} exceeds upper bound {upper_bound}"
        )));
    }
    Ok(())
}
