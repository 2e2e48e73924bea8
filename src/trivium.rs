//! 288-bit Trivium register driven through [`BinaryGates`].
//!
//! Over [`PlainGates`](crate::gates::PlainGates) this is the at-rest cipher; over an
//! encrypted backend the same transition function produces an encrypted keystream.

use itertools::{izip, Itertools};

use crate::error::{check_len, Result};
use crate::gates::{BinaryGates, PlainGates};
use crate::keys::combine_encrypted_keys;
use crate::{IV_BITS, KEY_BITS, STATE_BITS, WARMUP_ROUNDS};

pub struct Trivium<'g, G: BinaryGates> {
    gates: &'g G,
    state: Vec<G::Bit>,
}

impl<'g, G: BinaryGates> Trivium<'g, G> {
    pub fn new(gates: &'g G, key: &[G::Bit], iv: &[G::Bit]) -> Result<Self> {
        check_len("key", KEY_BITS, key.len())?;
        check_len("iv", IV_BITS, iv.len())?;

        let mut state = vec![gates.zero(); STATE_BITS];
        state[..KEY_BITS].clone_from_slice(key);
        state[93..93 + IV_BITS].clone_from_slice(iv);
        for bit in &mut state[285..] {
            *bit = gates.one();
        }

        let mut cipher = Trivium { gates, state };
        for _ in 0..WARMUP_ROUNDS {
            cipher.next_bit();
        }
        Ok(cipher)
    }

    /// Loads `first XOR second` as the key without combining the halves in the clear.
    pub fn with_custodian_keys(
        gates: &'g G,
        first: &[G::Bit],
        second: &[G::Bit],
        iv: &[bool],
    ) -> Result<Self> {
        let key = combine_encrypted_keys(gates, first, second)?;
        let iv = iv.iter().map(|b| gates.constant(*b)).collect_vec();
        Self::new(gates, &key, &iv)
    }

    pub fn next_bit(&mut self) -> G::Bit {
        let g = self.gates;
        let s = &self.state;

        let mut t1 = g.xor(&s[65], &s[92]);
        let mut t2 = g.xor(&s[161], &s[176]);
        let mut t3 = g.xor(&s[242], &s[287]);
        let z = g.xor(&g.xor(&t1, &t2), &t3);

        t1 = g.xor(&t1, &g.xor(&g.and(&s[90], &s[91]), &s[170]));
        t2 = g.xor(&t2, &g.xor(&g.and(&s[174], &s[175]), &s[263]));
        t3 = g.xor(&t3, &g.xor(&g.and(&s[285], &s[286]), &s[68]));

        self.state.rotate_right(1);
        self.state[0] = t3;
        self.state[93] = t1;
        self.state[177] = t2;
        z
    }

    pub fn keystream(&mut self, len: usize) -> Vec<G::Bit> {
        (0..len).map(|_| self.next_bit()).collect_vec()
    }

    /// XORs `bits` with the keystream.
    pub fn apply(&mut self, bits: &[G::Bit]) -> Vec<G::Bit> {
        let stream = self.keystream(bits.len());
        izip!(bits, &stream)
            .map(|(b, k)| self.gates.xor(b, k))
            .collect_vec()
    }
}

/// Symmetric encryption (and decryption) of clear bits.
pub fn encrypt_bits(key: &[bool], iv: &[bool], bits: &[bool]) -> Result<Vec<bool>> {
    let mut cipher = Trivium::new(&PlainGates, key, iv)?;
    Ok(cipher.apply(bits))
}

/// Turns at-rest ciphertext into homomorphic ciphertext of the same plaintext, using
/// the two custodians' encrypted keys.
pub fn re_encrypt<G: BinaryGates>(
    gates: &G,
    ciphertext: &[bool],
    first: &[G::Bit],
    second: &[G::Bit],
    iv: &[bool],
) -> Result<Vec<G::Bit>> {
    let mut cipher = Trivium::with_custodian_keys(gates, first, second, iv)?;
    let stream = cipher.keystream(ciphertext.len());
    // XOR with a public bit is a NOT when the bit is set
    Ok(izip!(ciphertext, stream)
        .map(|(c, k)| if *c { gates.not(&k) } else { k })
        .collect_vec())
}
