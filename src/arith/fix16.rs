use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{add_bit, add_bits, BigValueCiphertext, Int72Ciphertext, INT72_BITS};
use crate::error::{check_len, Result};
use crate::gates::{BinaryGates, BitDecryptor};
use crate::utils::bit_length;

pub const FIX16_BITS: usize = 16;

// extra low-order bits carried through reciprocal and division
const GUARD_BITS: usize = 6;
const WIDE_BITS: usize = FIX16_BITS + GUARD_BITS;

/// Fixed point value in `[0, 2)`, most significant bit first: `bits[0]` is the units
/// place and `bits[i]` is worth `2^-i`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fix16<B> {
    bits: Vec<B>,
}

impl<B: Clone> Fix16<B> {
    pub fn from_bits(bits: Vec<B>) -> Result<Self> {
        check_len("fix16", FIX16_BITS, bits.len())?;
        Ok(Self { bits })
    }

    /// Nearest representable value at or below `value`, wrapped into `[0, 2)`.
    pub fn trivial<G: BinaryGates<Bit = B>>(g: &G, value: f64) -> Self {
        let raw = (value * (1u64 << (FIX16_BITS - 1)) as f64).floor() as u64;
        Self {
            bits: (0..FIX16_BITS)
                .map(|i| g.constant((raw >> (FIX16_BITS - 1 - i)) & 1 == 1))
                .collect_vec(),
        }
    }

    pub fn bits(&self) -> &[B] {
        &self.bits
    }

    pub fn decrypt<D: BitDecryptor<Bit = B>>(&self, decryptor: &D) -> f64 {
        decryptor
            .decrypt_bits(&self.bits)
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| 2f64.powi(-(i as i32)))
            .sum()
    }

    pub fn add<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        Self {
            bits: fixed_add(g, &self.bits, &other.bits),
        }
    }

    /// `2 - self`, the additive inverse modulo 2.
    pub fn neg<G: BinaryGates<Bit = B>>(&self, g: &G) -> Self {
        Self {
            bits: fixed_neg(g, &self.bits),
        }
    }

    pub fn sub<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        self.add(&other.neg(g), g)
    }

    /// Product truncated to 16 bits after summing every partial product.
    pub fn mul<G: BinaryGates<Bit = B>>(&self, other: &Self, g: &G) -> Self {
        Self {
            bits: fixed_mul(g, &self.bits, &other.bits),
        }
    }

    /// `1 / self` for `self` in `[0.75, 1.5)`, rounded to nearest.
    pub fn reciprocal<G: BinaryGates<Bit = B>>(&self, g: &G) -> Self {
        let (bits, _) = round_to_fix16(g, &reciprocal_wide(g, &widen(g, &self.bits)));
        Self { bits }
    }
}

fn widen<G: BinaryGates>(g: &G, bits: &[G::Bit]) -> Vec<G::Bit> {
    let mut wide = bits.to_vec();
    wide.resize(WIDE_BITS, g.zero());
    wide
}

fn fixed_add<G: BinaryGates>(g: &G, a: &[G::Bit], b: &[G::Bit]) -> Vec<G::Bit> {
    let a = a.iter().rev().cloned().collect_vec();
    let b = b.iter().rev().cloned().collect_vec();
    let mut sum = add_bits(g, &a, &b, None, a.len());
    sum.reverse();
    sum
}

fn fixed_neg<G: BinaryGates>(g: &G, a: &[G::Bit]) -> Vec<G::Bit> {
    let inverted = a.iter().rev().map(|b| g.not(b)).collect_vec();
    let mut out = add_bits(g, &inverted, &[], Some(g.one()), inverted.len());
    out.reverse();
    out
}

fn fixed_mul<G: BinaryGates>(g: &G, a: &[G::Bit], b: &[G::Bit]) -> Vec<G::Bit> {
    debug_assert_eq!(a.len(), b.len());
    let width = a.len();
    let operand = |bits: &[G::Bit]| BigValueCiphertext {
        bits: bits.iter().rev().cloned().collect_vec(),
        upper_bound: width_max(width),
    };
    let product = operand(a).mul(&operand(b), g);
    // each operand carries `width - 1` fractional bits
    let fraction = width - 1;
    let mut out = product.bits[fraction..fraction + width].to_vec();
    out.reverse();
    out
}

fn width_max(width: usize) -> u128 {
    (1u128 << width) - 1
}

/// `1 / b` at wide precision using `y = 2 - b` and `y (1 + e)(1 + e^2)(1 + e^4)(1 + e^8)`
/// with `e = 1 - b y`. `e <= 1/4` on `[0.75, 1.5)`, so the series error stays below `2^-32`.
fn reciprocal_wide<G: BinaryGates>(g: &G, b: &[G::Bit]) -> Vec<G::Bit> {
    let y = fixed_neg(g, b);
    let by = fixed_mul(g, b, &y);
    // 1 - by is 2 - by with the units bit flipped
    let mut e = fixed_neg(g, &by);
    e[0] = g.not(&e[0]);
    let e2 = fixed_mul(g, &e, &e);
    let e4 = fixed_mul(g, &e2, &e2);
    let e8 = fixed_mul(g, &e4, &e4);

    let r = fixed_mul(g, &one_plus(g, &e), &one_plus(g, &e2));
    let r = fixed_mul(g, &r, &one_plus(g, &e4));
    let r = fixed_mul(g, &r, &one_plus(g, &e8));
    fixed_mul(g, &r, &y)
}

/// `1 + a` for `a < 1`.
fn one_plus<G: BinaryGates>(g: &G, a: &[G::Bit]) -> Vec<G::Bit> {
    let mut out = a.to_vec();
    out[0] = g.one();
    out
}

/// Rounds a wide value to the nearest 16-bit one, ties up. Returns the carry out of the
/// units place; when it is set the rounded value is `1.0` and the caller halves its scale.
fn round_to_fix16<G: BinaryGates>(g: &G, wide: &[G::Bit]) -> (Vec<G::Bit>, G::Bit) {
    let half = wide[FIX16_BITS].clone();
    let le = wide[..FIX16_BITS].iter().rev().cloned().collect_vec();
    let mut sum = add_bits(g, &le, &[], Some(half), FIX16_BITS + 1);
    let carry = sum.pop().unwrap_or_else(|| g.zero());
    sum.reverse();
    // a carry leaves every kept bit zero
    sum[0] = g.or(&sum[0], &carry);
    (sum, carry)
}

/// Leading-one normalisation of a non-negative 72-bit integer.
///
/// Returns `(mantissa, shift)` with `v ~= mantissa * 2^(72 - shift)` and the mantissa in
/// `[0.75, 1.5)`, truncated to 16 bits. The scan visits every position regardless of
/// where the leading bits are, so the shift is computed without revealing the bit length
/// of `v`. Zero yields a zero mantissa and a shift of 72.
pub fn normalize<G: BinaryGates>(
    g: &G,
    v: &Int72Ciphertext<G::Bit>,
) -> (Fix16<G::Bit>, BigValueCiphertext<G::Bit>) {
    let (bits, shift) = leading_bits(g, v, FIX16_BITS);
    (Fix16 { bits }, shift)
}

/// [`normalize`] extracting `width` mantissa bits.
fn leading_bits<G: BinaryGates>(
    g: &G,
    v: &Int72Ciphertext<G::Bit>,
    width: usize,
) -> (Vec<G::Bit>, BigValueCiphertext<G::Bit>) {
    // `width` known zeros below the value and one above; `None` marks a known zero
    let mut ext: Vec<Option<&G::Bit>> = vec![None; width];
    ext.extend(v.bits().iter().map(Some));
    ext.push(None);
    let top = width + INT72_BITS - 1;

    let counter_width = bit_length(INT72_BITS as u128);
    let mut shift = vec![g.zero(); counter_width];
    let mut found = g.one();
    let mut mantissa: Vec<Option<G::Bit>> = vec![None; width];

    for i in (width..=top).rev() {
        let (Some(high), low) = (ext[i], ext[i - 1]) else {
            continue;
        };
        let (fit10, fit11) = match low {
            Some(low) => {
                let searching_high = g.and(&found, high);
                (
                    g.and(&searching_high, &g.not(low)),
                    g.and(&searching_high, low),
                )
            }
            None => (g.and(&found, high), g.zero()),
        };

        for (j, slot) in mantissa.iter_mut().enumerate() {
            let take10 = ext[i - j].map(|bit| g.and(&fit10, bit));
            let take11 = ext[i - j + 1].map(|bit| g.and(&fit11, bit));
            for taken in [take10, take11].into_iter().flatten() {
                *slot = Some(match slot.take() {
                    Some(prev) => g.or(&prev, &taken),
                    None => taken,
                });
            }
        }

        let matched = g.or(&fit10, &fit11);
        found = g.and(&found, &g.not(&matched));
        shift = add_bit(g, &shift, &found);
        shift = add_bit(g, &shift, &fit10);
    }

    let mantissa = mantissa
        .into_iter()
        .map(|b| b.unwrap_or_else(|| g.zero()))
        .collect_vec();
    let shift = BigValueCiphertext {
        bits: shift,
        upper_bound: INT72_BITS as u128,
    };
    (mantissa, shift)
}

/// `mantissa * 2^exponent`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quotient<B> {
    pub mantissa: Fix16<B>,
    pub exponent: Int72Ciphertext<B>,
}

impl<B: Clone> Quotient<B> {
    pub fn decrypt<D: BitDecryptor<Bit = B>>(&self, decryptor: &D) -> f64 {
        let mantissa = self.mantissa.decrypt(decryptor);
        let exponent = self.exponent.decrypt(decryptor);
        mantissa * 2f64.powi(exponent.clamp(i32::MIN as i128, i32::MAX as i128) as i32)
    }
}

/// `a / b` for non-negative `a` and positive `b`, relative error below `2^-15`.
///
/// Both operands are normalised to wide mantissas. The mantissa quotient lies in
/// `(0.5, 2)`; when its units bit is clear it is doubled by an oblivious select, then
/// rounded to 16 bits, and the exponent absorbs both adjustments.
pub fn divide<G: BinaryGates>(
    g: &G,
    a: &Int72Ciphertext<G::Bit>,
    b: &Int72Ciphertext<G::Bit>,
) -> Result<Quotient<G::Bit>> {
    let (ma, la) = leading_bits(g, a, WIDE_BITS);
    let (mb, lb) = leading_bits(g, b, WIDE_BITS);

    let recip = reciprocal_wide(g, &mb);
    let product = fixed_mul(g, &ma, &recip);

    let below_one = g.not(&product[0]);
    let not_below = g.not(&below_one);
    let doubled = (0..WIDE_BITS)
        .map(|j| match product.get(j + 1) {
            Some(next) => g.mux(&below_one, next, &product[j]),
            None => g.and(&not_below, &product[j]),
        })
        .collect_vec();
    let (mantissa, carry) = round_to_fix16(g, &doubled);

    let la = la.add(&BigValueCiphertext::from_bit(below_one), g);
    let lb = lb.add(&BigValueCiphertext::from_bit(carry), g);
    let exponent = lb.to_int72(g)?.sub(&la.to_int72(g)?, g);
    Ok(Quotient {
        mantissa: Fix16 { bits: mantissa },
        exponent,
    })
}
