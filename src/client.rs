//! Data owner, custodian and querier side of the protocol.

use std::time::Instant;

use itertools::Itertools;
use rayon::prelude::*;
use tracing::info;

use crate::arith::BigValueCiphertext;
use crate::error::{check_len, Result};
use crate::gates::{BitDecryptor, BitEncryptor};
use crate::gwas::{self, GwasCiphertext, GwasOutcome};
use crate::keys::{
    combined_key, derive_custodian_secret, derive_key, issue_custodian_key, stream_iv,
    Commitment, CustodianKey, KeyProofSystem,
};
use crate::profile::{StrProfile, PROFILE_BITS};
use crate::segment::{divide_into_segments, genotype_to_string, padded_bucket, Owner, Variant};
use crate::store::{EncryptedProfile, EncryptedSegment, MemoryStore};
use crate::trivium::encrypt_bits;
use crate::utils::from_bits_le;
use crate::{EngineParameters, GENOTYPE_BITS};

/// Everything an owner publishes.
pub struct OwnerArtifacts {
    pub owner: Owner,
    pub commitments: [Commitment; 2],
    pub segments: Vec<EncryptedSegment>,
    pub profile: Option<EncryptedProfile>,
}

impl OwnerArtifacts {
    pub fn publish(self, store: &mut MemoryStore) {
        store.insert_commitments(&self.owner, self.commitments);
        for segment in self.segments {
            store.insert_segment(segment);
        }
        if let Some(profile) = self.profile {
            store.insert_profile(profile);
        }
    }
}

/// The symmetric key the owner encrypts `segment` under.
fn owner_stream_key(owner: &Owner, segment: u64, params: &EngineParameters) -> Result<Vec<bool>> {
    let first = derive_custodian_secret(owner, 1);
    let second = derive_custodian_secret(owner, 2);
    combined_key(
        &derive_key(first.raw(), params.mode, segment, params.batch_size)?,
        &derive_key(second.raw(), params.mode, segment, params.batch_size)?,
    )
}

pub fn encrypt_segment(
    owner: &Owner,
    segment: u64,
    records: &[Variant],
    params: &EngineParameters,
) -> Result<EncryptedSegment> {
    let key = owner_stream_key(owner, segment, params)?;
    let plain = records.iter().flat_map(|v| v.to_bits()).collect_vec();
    Ok(EncryptedSegment {
        owner: owner.name.clone(),
        segment,
        mode: params.mode,
        bits: encrypt_bits(&key, &stream_iv(params.mode, segment), &plain)?,
    })
}

pub fn encrypt_profile(
    owner: &Owner,
    profile: &StrProfile,
    params: &EngineParameters,
) -> Result<EncryptedProfile> {
    let segment = params.search_person_segment();
    let key = owner_stream_key(owner, segment, params)?;
    Ok(EncryptedProfile {
        owner: owner.name.clone(),
        mode: params.mode,
        bits: encrypt_bits(&key, &stream_iv(params.mode, segment), &profile.to_bits())?,
    })
}

/// Buckets and encrypts every segment id of an owner. Ids without data get padding
/// records so the published set does not reveal where the data lives.
pub fn encrypt_owner(
    owner: &Owner,
    variants: &[Variant],
    profile: Option<&StrProfile>,
    params: &EngineParameters,
) -> Result<OwnerArtifacts> {
    params.validate()?;
    let now = Instant::now();
    let buckets = divide_into_segments(owner, variants, params)?;
    let padding = padded_bucket(params.minimal_block_size);

    let segments = (0..params.seg_num)
        .into_par_iter()
        .map(|id| {
            let records = buckets.get(&id).unwrap_or(&padding);
            encrypt_segment(owner, id, records, params)
        })
        .collect::<Result<Vec<_>>>()?;
    let profile = profile
        .map(|p| encrypt_profile(owner, p, params))
        .transpose()?;

    info!(
        owner = %owner.name,
        variants = variants.len(),
        segments = segments.len(),
        elapsed = ?now.elapsed(),
        "owner data encrypted"
    );
    Ok(OwnerArtifacts {
        owner: owner.clone(),
        commitments: [
            derive_custodian_secret(owner, 1).commitment,
            derive_custodian_secret(owner, 2).commitment,
        ],
        segments,
        profile,
    })
}

/// One of the two key holders of an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Custodian {
    pub id: u8,
}

impl Custodian {
    pub const FIRST: Custodian = Custodian { id: 1 };
    pub const SECOND: Custodian = Custodian { id: 2 };

    /// Encrypted key for `segment` of `owner` with its batch proofs.
    pub fn issue_key<E: BitEncryptor, P: KeyProofSystem>(
        &self,
        encryptor: &E,
        proofs: &P,
        owner: &Owner,
        segment: u64,
        params: &EngineParameters,
    ) -> Result<CustodianKey<E::Bit, P::Proof>> {
        let secret = derive_custodian_secret(owner, self.id);
        issue_custodian_key(
            encryptor,
            proofs,
            &secret,
            params.mode,
            segment,
            params.batch_size,
        )
    }
}

/// Both custodians' keys for one segment.
pub fn segment_keys<E: BitEncryptor, P: KeyProofSystem>(
    encryptor: &E,
    proofs: &P,
    owner: &Owner,
    segment: u64,
    params: &EngineParameters,
) -> Result<[CustodianKey<E::Bit, P::Proof>; 2]> {
    Ok([
        Custodian::FIRST.issue_key(encryptor, proofs, owner, segment, params)?,
        Custodian::SECOND.issue_key(encryptor, proofs, owner, segment, params)?,
    ])
}

pub fn encrypt_query_profile<E: BitEncryptor>(encryptor: &E, profile: &StrProfile) -> Vec<E::Bit> {
    encryptor.encrypt_bits(&profile.to_bits())
}

pub fn encrypt_phenotypes<E: BitEncryptor>(
    encryptor: &E,
    values: &[u64],
    upper_bound: u64,
) -> Result<Vec<BigValueCiphertext<E::Bit>>>
where
    E::Bit: Clone,
{
    values
        .iter()
        .map(|v| BigValueCiphertext::encrypt(encryptor, *v as u128, upper_bound as u128))
        .collect()
}

/// `"a|b"` of a user query result, `"0|0"` when the rsid is absent.
pub fn decode_genotype<D: BitDecryptor>(decryptor: &D, bits: &[D::Bit]) -> Result<String> {
    check_len("genotype", GENOTYPE_BITS, bits.len())?;
    let code = from_bits_le(&decryptor.decrypt_bits(bits)) as u8;
    Ok(genotype_to_string(code))
}

/// Counts of `[no alternate allele, heterozygous, homozygous alternate]`.
pub fn decode_distribution<D: BitDecryptor>(
    decryptor: &D,
    counts: &[BigValueCiphertext<D::Bit>; 3],
) -> [u128; 3]
where
    D::Bit: Clone,
{
    [
        counts[0].decrypt(decryptor),
        counts[1].decrypt(decryptor),
        counts[2].decrypt(decryptor),
    ]
}

pub fn match_indices<D: BitDecryptor>(decryptor: &D, matches: &[D::Bit]) -> Vec<usize> {
    decryptor
        .decrypt_bits(matches)
        .into_iter()
        .positions(|m| m)
        .collect_vec()
}

pub fn decrypt_gwas<D: BitDecryptor>(
    decryptor: &D,
    ciphertext: &GwasCiphertext<D::Bit>,
) -> Result<GwasOutcome>
where
    D::Bit: Clone,
{
    gwas::decrypt(decryptor, ciphertext)
}

pub fn decode_profile<D: BitDecryptor>(decryptor: &D, bits: &[D::Bit]) -> Result<StrProfile> {
    check_len("str profile", PROFILE_BITS, bits.len())?;
    StrProfile::from_bits(&decryptor.decrypt_bits(bits))
}
