//! Boolean gate evaluation over encrypted (or clear) bits.
//!
//! Every homomorphic routine in the crate is written against [`BinaryGates`], so the
//! same circuit runs over `bool` for at-rest encryption and reference checks and over
//! TFHE ciphertexts when the `tfhe` feature is enabled.

#[cfg(feature = "tfhe")]
pub mod boolean;
#[cfg(test)]
pub(crate) mod masked;

/// Gate evaluator. Implementations hold only read-only key material and are shared
/// by reference across worker threads.
pub trait BinaryGates: Sync {
    type Bit: Clone + Send + Sync;

    /// Noiseless encryption of `false`.
    fn zero(&self) -> Self::Bit;
    /// Noiseless encryption of `true`.
    fn one(&self) -> Self::Bit;

    fn and(&self, a: &Self::Bit, b: &Self::Bit) -> Self::Bit;
    fn or(&self, a: &Self::Bit, b: &Self::Bit) -> Self::Bit;
    fn xor(&self, a: &Self::Bit, b: &Self::Bit) -> Self::Bit;
    fn xnor(&self, a: &Self::Bit, b: &Self::Bit) -> Self::Bit;
    fn not(&self, a: &Self::Bit) -> Self::Bit;

    fn constant(&self, value: bool) -> Self::Bit {
        if value {
            self.one()
        } else {
            self.zero()
        }
    }

    /// Carry of a full adder.
    fn majority(&self, a: &Self::Bit, b: &Self::Bit, c: &Self::Bit) -> Self::Bit {
        let ab = self.and(a, b);
        let a_xor_b = self.xor(a, b);
        let c_ab = self.and(c, &a_xor_b);
        self.or(&ab, &c_ab)
    }

    /// `sel ? a : b`
    fn mux(&self, sel: &Self::Bit, a: &Self::Bit, b: &Self::Bit) -> Self::Bit {
        let take_a = self.and(sel, a);
        let not_sel = self.not(sel);
        let take_b = self.and(&not_sel, b);
        self.or(&take_a, &take_b)
    }

    /// AND of all bits; `one()` for an empty slice.
    fn and_all(&self, bits: &[Self::Bit]) -> Self::Bit {
        match bits.split_first() {
            Some((first, rest)) => rest.iter().fold(first.clone(), |acc, b| self.and(&acc, b)),
            None => self.one(),
        }
    }

    /// OR of all bits; `zero()` for an empty slice.
    fn or_all(&self, bits: &[Self::Bit]) -> Self::Bit {
        match bits.split_first() {
            Some((first, rest)) => rest.iter().fold(first.clone(), |acc, b| self.or(&acc, b)),
            None => self.zero(),
        }
    }

    /// Encrypted equality of two equally long bit strings.
    fn equal(&self, a: &[Self::Bit], b: &[Self::Bit]) -> Self::Bit {
        debug_assert_eq!(a.len(), b.len());
        let same = a.iter().zip(b).map(|(x, y)| self.xnor(x, y)).collect::<Vec<_>>();
        self.and_all(&same)
    }

    /// Equality against a public bit string.
    fn equal_clear(&self, a: &[Self::Bit], clear: &[bool]) -> Self::Bit {
        debug_assert_eq!(a.len(), clear.len());
        let same = a
            .iter()
            .zip(clear)
            .map(|(x, c)| if *c { x.clone() } else { self.not(x) })
            .collect::<Vec<_>>();
        self.and_all(&same)
    }
}

/// Encryption side of the collaborator. Custodians only ever hold one of these.
pub trait BitEncryptor {
    type Bit;

    fn encrypt_bit(&self, value: bool) -> Self::Bit;

    fn encrypt_bits(&self, values: &[bool]) -> Vec<Self::Bit> {
        values.iter().map(|v| self.encrypt_bit(*v)).collect()
    }
}

pub trait BitDecryptor {
    type Bit;

    fn decrypt_bit(&self, bit: &Self::Bit) -> bool;

    fn decrypt_bits(&self, bits: &[Self::Bit]) -> Vec<bool> {
        bits.iter().map(|b| self.decrypt_bit(b)).collect()
    }
}

/// Evaluates gates over clear bits. Used for the at-rest cipher and as the
/// reference evaluator in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainGates;

impl BinaryGates for PlainGates {
    type Bit = bool;

    fn zero(&self) -> bool {
        false
    }

    fn one(&self) -> bool {
        true
    }

    fn and(&self, a: &bool, b: &bool) -> bool {
        *a & *b
    }

    fn or(&self, a: &bool, b: &bool) -> bool {
        *a | *b
    }

    fn xor(&self, a: &bool, b: &bool) -> bool {
        *a ^ *b
    }

    fn xnor(&self, a: &bool, b: &bool) -> bool {
        !(*a ^ *b)
    }

    fn not(&self, a: &bool) -> bool {
        !*a
    }
}

impl BitEncryptor for PlainGates {
    type Bit = bool;

    fn encrypt_bit(&self, value: bool) -> bool {
        value
    }
}

impl BitDecryptor for PlainGates {
    type Bit = bool;

    fn decrypt_bit(&self, bit: &bool) -> bool {
        *bit
    }
}
