//! Test evaluator whose bits are not `bool`. Each bit travels as a pair whose XOR is
//! the value, and every non-linear gate draws a fresh mask, so a circuit that peeks
//! at a representation or relies on `Bit = bool` gives wrong answers here.

use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use super::{BinaryGates, BitDecryptor, BitEncryptor};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Masked {
    share: bool,
    mask: bool,
}

pub struct MaskedGates {
    rng: Mutex<ChaChaRng>,
}

impl MaskedGates {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaChaRng::seed_from_u64(seed)),
        }
    }

    fn fresh(&self, value: bool) -> Masked {
        let mask: bool = self.rng.lock().unwrap().gen();
        Masked {
            share: value ^ mask,
            mask,
        }
    }

    fn open(bit: &Masked) -> bool {
        bit.share ^ bit.mask
    }
}

impl BinaryGates for MaskedGates {
    type Bit = Masked;

    fn zero(&self) -> Masked {
        Masked {
            share: false,
            mask: false,
        }
    }

    fn one(&self) -> Masked {
        Masked {
            share: true,
            mask: false,
        }
    }

    fn and(&self, a: &Masked, b: &Masked) -> Masked {
        self.fresh(Self::open(a) & Self::open(b))
    }

    fn or(&self, a: &Masked, b: &Masked) -> Masked {
        self.fresh(Self::open(a) | Self::open(b))
    }

    fn xor(&self, a: &Masked, b: &Masked) -> Masked {
        Masked {
            share: a.share ^ b.share,
            mask: a.mask ^ b.mask,
        }
    }

    fn xnor(&self, a: &Masked, b: &Masked) -> Masked {
        self.fresh(Self::open(a) == Self::open(b))
    }

    fn not(&self, a: &Masked) -> Masked {
        Masked {
            share: !a.share,
            mask: a.mask,
        }
    }
}

impl BitEncryptor for MaskedGates {
    type Bit = Masked;

    fn encrypt_bit(&self, value: bool) -> Masked {
        self.fresh(value)
    }
}

impl BitDecryptor for MaskedGates {
    type Bit = Masked;

    fn decrypt_bit(&self, bit: &Masked) -> bool {
        Self::open(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::PlainGates;

    #[test]
    fn test_gates_match_plain() {
        let g = MaskedGates::new(5);
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 1 == 1, bits & 2 == 2, bits & 4 == 4);
            let (ea, eb, ec) = (g.encrypt_bit(a), g.encrypt_bit(b), g.encrypt_bit(c));
            assert_eq!(g.decrypt_bit(&g.and(&ea, &eb)), PlainGates.and(&a, &b));
            assert_eq!(g.decrypt_bit(&g.or(&ea, &eb)), PlainGates.or(&a, &b));
            assert_eq!(g.decrypt_bit(&g.xor(&ea, &eb)), PlainGates.xor(&a, &b));
            assert_eq!(g.decrypt_bit(&g.xnor(&ea, &eb)), PlainGates.xnor(&a, &b));
            assert_eq!(g.decrypt_bit(&g.not(&ea)), !a);
            assert_eq!(
                g.decrypt_bit(&g.majority(&ea, &eb, &ec)),
                PlainGates.majority(&a, &b, &c)
            );
            assert_eq!(
                g.decrypt_bit(&g.mux(&ea, &eb, &ec)),
                PlainGates.mux(&a, &b, &c)
            );
        }
        assert!(g.decrypt_bit(&g.constant(true)));
        assert!(!g.decrypt_bit(&g.constant(false)));
    }

    #[test]
    fn test_masks_vary() {
        let g = MaskedGates::new(6);
        let shares = (0..64).map(|_| g.encrypt_bit(true).share).collect::<Vec<_>>();
        assert!(shares.contains(&true) && shares.contains(&false));
    }
}
