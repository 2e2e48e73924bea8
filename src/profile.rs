//! STR marker profiles (the 13 CODIS core loci) used for person search.

use std::fmt;

use itertools::Itertools;
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{check_len, Error, Result};
use crate::utils::{from_bits_le, to_bits_le};

pub const STR_MARKERS: [&str; 13] = [
    "D3S1358", "vWA", "FGA", "D8S1179", "D21S11", "D18S51", "D5S818", "D13S317", "D7S820",
    "D16S539", "THO1", "TPOX", "CSF1PO",
];

pub const REPEAT_BITS: usize = 8;
pub const PROFILE_BITS: usize = STR_MARKERS.len() * 2 * REPEAT_BITS;

/// Repeat counts of both alleles at each locus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrProfile {
    pub loci: [(u8, u8); 13],
}

impl StrProfile {
    pub fn random<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let mut loci = [(0u8, 0u8); 13];
        for locus in loci.iter_mut() {
            *locus = (rng.gen(), rng.gen());
        }
        Self { loci }
    }

    /// Per locus, eight little-endian bits of the first repeat then eight of the second.
    pub fn to_bits(&self) -> Vec<bool> {
        self.loci
            .iter()
            .flat_map(|(first, second)| {
                let mut bits = to_bits_le(*first as u128, REPEAT_BITS);
                bits.extend(to_bits_le(*second as u128, REPEAT_BITS));
                bits
            })
            .collect_vec()
    }

    pub fn from_bits(bits: &[bool]) -> Result<Self> {
        check_len("str profile", PROFILE_BITS, bits.len())?;
        let mut loci = [(0u8, 0u8); 13];
        for (locus, chunk) in loci.iter_mut().zip(bits.chunks(2 * REPEAT_BITS)) {
            *locus = (
                from_bits_le(&chunk[..REPEAT_BITS]) as u8,
                from_bits_le(&chunk[REPEAT_BITS..]) as u8,
            );
        }
        Ok(Self { loci })
    }

    /// Parses lines of the form `"D3S1358 15 17"`, one per marker in canonical order.
    pub fn parse(lines: &[&str]) -> Result<Self> {
        check_len("str markers", STR_MARKERS.len(), lines.len())?;
        let mut loci = [(0u8, 0u8); 13];
        for ((locus, line), marker) in loci.iter_mut().zip(lines).zip(STR_MARKERS) {
            let malformed = || Error::InvalidInput(format!("malformed str locus {line:?}"));
            let fields = line.split_whitespace().collect_vec();
            match fields.as_slice() {
                [name, first, second] if *name == marker => {
                    *locus = (
                        first.parse().map_err(|_| malformed())?,
                        second.parse().map_err(|_| malformed())?,
                    );
                }
                _ => return Err(malformed()),
            }
        }
        Ok(Self { loci })
    }
}

impl fmt::Display for StrProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .loci
            .iter()
            .zip(STR_MARKERS)
            .map(|((first, second), marker)| format!("{marker} {first} {second}"))
            .join("\n");
        f.write_str(&lines)
    }
}
