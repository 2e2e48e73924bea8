use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{digest_mod, from_bits_le, keccak, to_bits_le};
use crate::{EngineParameters, GENOTYPE_BITS, RSID_BITS, VARIANT_BITS};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub numeric_id: u64,
}

impl Owner {
    pub fn new(name: impl Into<String>, numeric_id: u64) -> Self {
        Self {
            name: name.into(),
            numeric_id,
        }
    }
}

/// One genotype call. `genotype` packs two alleles as `4 * first + second`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub rsid: u32,
    pub genotype: u8,
}

impl Variant {
    pub fn new(rsid: u32, genotype: u8) -> Self {
        Self { rsid, genotype }
    }

    /// The all-zero record used to pad short segments.
    pub fn padding() -> Self {
        Self::default()
    }

    pub fn rsid_bits(&self) -> Vec<bool> {
        to_bits_le(self.rsid as u128, RSID_BITS)
    }

    pub fn genotype_bits(&self) -> Vec<bool> {
        to_bits_le(self.genotype as u128, GENOTYPE_BITS)
    }

    /// rsid bits followed by genotype bits, the order the cipher consumes them.
    pub fn to_bits(&self) -> Vec<bool> {
        let mut bits = self.rsid_bits();
        bits.extend(self.genotype_bits());
        bits
    }

    pub fn from_bits(bits: &[bool]) -> Result<Self> {
        crate::error::check_len("variant", VARIANT_BITS, bits.len())?;
        Ok(Self {
            rsid: from_bits_le(&bits[..RSID_BITS]) as u32,
            genotype: from_bits_le(&bits[RSID_BITS..]) as u8,
        })
    }
}

pub fn segment_id(owner_label: &str, rsid: u32, modulus: u64) -> Result<u64> {
    if modulus <= 1 {
        return Err(Error::InvalidModulus(modulus));
    }
    let digest = keccak(&[owner_label.as_bytes(), rsid.to_string().as_bytes()]);
    Ok(digest_mod(&digest, modulus))
}

/// Buckets an owner's variants by segment id, keeping input order inside a bucket, and
/// pads every bucket to `params.minimal_block_size`.
pub fn divide_into_segments(
    owner: &Owner,
    variants: &[Variant],
    params: &EngineParameters,
) -> Result<BTreeMap<u64, Vec<Variant>>> {
    let mut segments: BTreeMap<u64, Vec<Variant>> = BTreeMap::new();
    for variant in variants {
        let id = segment_id(&owner.name, variant.rsid, params.seg_num)?;
        segments.entry(id).or_default().push(*variant);
    }
    for bucket in segments.values_mut() {
        pad_bucket(bucket, params.minimal_block_size);
    }
    Ok(segments)
}

pub fn pad_bucket(bucket: &mut Vec<Variant>, minimal_block_size: usize) {
    if bucket.len() < minimal_block_size {
        bucket.resize(minimal_block_size, Variant::padding());
    }
}

/// Contents stored for a segment id the owner has no data in.
pub fn padded_bucket(minimal_block_size: usize) -> Vec<Variant> {
    vec![Variant::padding(); minimal_block_size]
}

pub fn genotype_to_string(code: u8) -> String {
    format!("{}|{}", (code >> 2) & 3, code & 3)
}

/// Parses `"a|b"` (phased) or `"a/b"` (unphased).
pub fn genotype_from_str(s: &str) -> Result<u8> {
    let malformed = || Error::InvalidInput(format!("malformed genotype {s:?}"));
    let (a, b) = s.split_once(['|', '/']).ok_or_else(malformed)?;
    let a: u8 = a.trim().parse().map_err(|_| malformed())?;
    let b: u8 = b.trim().parse().map_err(|_| malformed())?;
    if a > 3 || b > 3 {
        return Err(malformed());
    }
    Ok(a * 4 + b)
}

pub fn rsid_to_string(rsid: u32) -> String {
    format!("rs{rsid}")
}

pub fn rsid_from_str(s: &str) -> Result<u32> {
    s.strip_prefix("rs")
        .and_then(|digits| digits.parse::<u32>().ok())
        .filter(|rsid| *rsid != 0)
        .ok_or_else(|| Error::InvalidInput(format!("malformed rsid {s:?}")))
}

/// Number of alternate alleles, read from the low bit of each allele.
pub fn alternate_allele_count(code: u8) -> u8 {
    ((code >> 2) & 1) + (code & 1)
}
