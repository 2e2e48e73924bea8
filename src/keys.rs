//! Two-custodian key derivation.
//!
//! Each custodian holds a secret derived from a labelled hash and publishes its
//! commitment. A stream-cipher key is the XOR of both custodians' derived keys; that
//! XOR is only ever evaluated under homomorphic encryption.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gates::{BinaryGates, BitEncryptor};
use crate::segment::Owner;
use crate::utils::{digest_bit, keccak, word};
use crate::{BATCH_SIZES, IV_BITS, KEY_BITS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    /// A fresh key for every segment, all-zero IV.
    PerSegment,
    /// One key per owner; segments are told apart by [`hosted_iv`].
    Hosted,
}

pub type Commitment = [u8; 32];

#[derive(Clone, Serialize, Deserialize)]
pub struct CustodianSecret {
    pub custodian: u8,
    raw: [u8; 32],
    pub commitment: Commitment,
}

impl std::fmt::Debug for CustodianSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodianSecret")
            .field("custodian", &self.custodian)
            .field("commitment", &hex::encode(self.commitment))
            .finish_non_exhaustive()
    }
}

pub fn derive_custodian_secret(owner: &Owner, custodian: u8) -> CustodianSecret {
    let label = format!("genome key holder {custodian} of {}", owner.name);
    let raw = keccak(&[label.as_bytes()]);
    let commitment = keccak(&[raw.as_slice()]);
    CustodianSecret {
        custodian,
        raw,
        commitment,
    }
}

impl CustodianSecret {
    pub fn raw(&self) -> &[u8; 32] {
        &self.raw
    }

    pub fn matches(&self, commitment: &Commitment) -> bool {
        keccak(&[self.raw.as_slice()]) == *commitment
    }
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if !BATCH_SIZES.contains(&batch_size) {
        return Err(Error::InvalidInput(format!(
            "batch size {batch_size} is not one of {BATCH_SIZES:?}"
        )));
    }
    Ok(())
}

fn label_base(mode: KeyMode, segment: u64) -> u64 {
    match mode {
        KeyMode::PerSegment => segment * KEY_BITS as u64,
        KeyMode::Hosted => 0,
    }
}

/// Key bits `[batch * batch_size, (batch + 1) * batch_size)`. Bit `j` is the low bit of
/// `hash(raw || label_base + j + 1)`, so the assembled key is independent of the batching.
pub fn key_batch(
    raw: &[u8; 32],
    mode: KeyMode,
    segment: u64,
    batch_size: usize,
    batch: usize,
) -> Result<Vec<bool>> {
    check_batch_size(batch_size)?;
    if batch >= KEY_BITS / batch_size {
        return Err(Error::InvalidInput(format!(
            "batch {batch} out of range for batch size {batch_size}"
        )));
    }
    let base = label_base(mode, segment);
    Ok((batch * batch_size..(batch + 1) * batch_size)
        .map(|j| {
            let digest = keccak(&[raw.as_slice(), word(base + j as u64 + 1).as_slice()]);
            digest_bit(&digest, 0)
        })
        .collect_vec())
}

pub fn derive_key(
    raw: &[u8; 32],
    mode: KeyMode,
    segment: u64,
    batch_size: usize,
) -> Result<Vec<bool>> {
    check_batch_size(batch_size)?;
    let mut key = Vec::with_capacity(KEY_BITS);
    for batch in 0..KEY_BITS / batch_size {
        key.extend(key_batch(raw, mode, segment, batch_size, batch)?);
    }
    Ok(key)
}

pub fn segment_key(raw: &[u8; 32], segment: u64, batch_size: usize) -> Result<Vec<bool>> {
    derive_key(raw, KeyMode::PerSegment, segment, batch_size)
}

pub fn hosted_key(raw: &[u8; 32], batch_size: usize) -> Result<Vec<bool>> {
    derive_key(raw, KeyMode::Hosted, 0, batch_size)
}

pub fn hosted_iv(segment: u64) -> Vec<bool> {
    let digest = keccak(&[word(segment).as_slice()]);
    (0..IV_BITS).map(|i| digest_bit(&digest, i)).collect_vec()
}

pub fn stream_iv(mode: KeyMode, segment: u64) -> Vec<bool> {
    match mode {
        KeyMode::PerSegment => vec![false; IV_BITS],
        KeyMode::Hosted => hosted_iv(segment),
    }
}

/// Clear combination of both custodians' keys. Only the data owner, who derives both
/// secrets, ever calls this.
pub fn combined_key(first: &[bool], second: &[bool]) -> Result<Vec<bool>> {
    crate::error::check_len("first custodian key", KEY_BITS, first.len())?;
    crate::error::check_len("second custodian key", KEY_BITS, second.len())?;
    Ok(first.iter().zip(second).map(|(a, b)| a ^ b).collect_vec())
}

/// Homomorphic combination of both custodians' encrypted keys.
pub fn combine_encrypted_keys<G: BinaryGates>(
    gates: &G,
    first: &[G::Bit],
    second: &[G::Bit],
) -> Result<Vec<G::Bit>> {
    crate::error::check_len("first custodian key", KEY_BITS, first.len())?;
    crate::error::check_len("second custodian key", KEY_BITS, second.len())?;
    Ok(first
        .iter()
        .zip(second)
        .map(|(a, b)| gates.xor(a, b))
        .collect_vec())
}

/// Public inputs of one key-batch proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatement {
    pub commitment: Commitment,
    pub mode: KeyMode,
    pub segment: u64,
    pub batch: usize,
    pub batch_size: usize,
}

/// Proof collaborator. Proofs are opaque attestations that the encrypted key batch
/// was derived from the secret behind `statement.commitment`.
pub trait KeyProofSystem: Sync {
    type Proof: Clone + Send + Sync;

    fn prove(
        &self,
        statement: &KeyStatement,
        secret: &CustodianSecret,
        key_batch: &[bool],
    ) -> Self::Proof;

    fn verify(&self, statement: &KeyStatement, proof: &Self::Proof) -> bool;
}

/// Proof system that attests nothing and accepts everything, for deployments that
/// trust their custodians.
#[derive(Clone, Copy, Debug, Default)]
pub struct UncheckedProofs;

impl KeyProofSystem for UncheckedProofs {
    type Proof = ();

    fn prove(&self, _: &KeyStatement, _: &CustodianSecret, _: &[bool]) {}

    fn verify(&self, _: &KeyStatement, _: &()) -> bool {
        true
    }
}

/// What a custodian hands to the engine for one segment: 80 encrypted key bits and
/// one proof per batch.
#[derive(Clone)]
pub struct CustodianKey<B, P> {
    pub custodian: u8,
    pub bits: Vec<B>,
    pub proofs: Vec<P>,
}

pub fn statements(
    commitment: &Commitment,
    mode: KeyMode,
    segment: u64,
    batch_size: usize,
) -> Result<Vec<KeyStatement>> {
    check_batch_size(batch_size)?;
    Ok((0..KEY_BITS / batch_size)
        .map(|batch| KeyStatement {
            commitment: *commitment,
            mode,
            segment,
            batch,
            batch_size,
        })
        .collect_vec())
}

/// Custodian side: derives the key for `segment`, encrypts it under the querier's
/// public key and proves every batch.
pub fn issue_custodian_key<E: BitEncryptor, P: KeyProofSystem>(
    encryptor: &E,
    proofs: &P,
    secret: &CustodianSecret,
    mode: KeyMode,
    segment: u64,
    batch_size: usize,
) -> Result<CustodianKey<E::Bit, P::Proof>> {
    let mut bits = Vec::with_capacity(KEY_BITS);
    let mut attestations = Vec::with_capacity(KEY_BITS / batch_size);
    for statement in statements(&secret.commitment, mode, segment, batch_size)? {
        let batch = key_batch(&secret.raw, mode, segment, batch_size, statement.batch)?;
        attestations.push(proofs.prove(&statement, secret, &batch));
        bits.extend(encryptor.encrypt_bits(&batch));
    }
    Ok(CustodianKey {
        custodian: secret.custodian,
        bits,
        proofs: attestations,
    })
}

/// Engine side: checks every batch proof against the published commitment.
pub fn verify_custodian_key<B, P: KeyProofSystem>(
    proofs: &P,
    commitment: &Commitment,
    key: &CustodianKey<B, P::Proof>,
    mode: KeyMode,
    segment: u64,
    batch_size: usize,
) -> Result<()> {
    crate::error::check_len("custodian key", KEY_BITS, key.bits.len())?;
    let statements = statements(commitment, mode, segment, batch_size)?;
    if key.proofs.len() != statements.len() {
        return Err(Error::ProofRejected {
            custodian: key.custodian,
            batch: key.proofs.len().min(statements.len()),
        });
    }
    for (statement, proof) in statements.iter().zip(&key.proofs) {
        if !proofs.verify(statement, proof) {
            return Err(Error::ProofRejected {
                custodian: key.custodian,
                batch: statement.batch,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::PlainGates;

    fn owner() -> Owner {
        Owner::new("HG00096", 0)
    }

    #[test]
    fn test_custodian_secret() {
        let first = derive_custodian_secret(&owner(), 1);
        let second = derive_custodian_secret(&owner(), 2);
        assert_ne!(first.raw(), second.raw());
        assert!(first.matches(&first.commitment));
        assert!(!first.matches(&second.commitment));
        assert_eq!(
            derive_custodian_secret(&owner(), 1).commitment,
            first.commitment
        );
    }

    #[test]
    fn test_secret_debug_shows_commitment_only() {
        let secret = derive_custodian_secret(&owner(), 1);
        let printed = format!("{secret:?}");
        let commitment = hex::encode(secret.commitment);
        assert_eq!(commitment.len(), 64);
        assert!(printed.contains(&commitment));
        assert!(!printed.contains(&hex::encode(secret.raw())));
    }

    #[test]
    fn test_key_independent_of_batch_size() {
        let secret = derive_custodian_secret(&owner(), 1);
        let reference = segment_key(secret.raw(), 4242, 1).unwrap();
        assert_eq!(reference.len(), KEY_BITS);
        for batch_size in BATCH_SIZES {
            assert_eq!(segment_key(secret.raw(), 4242, batch_size).unwrap(), reference);
        }
        let hosted = hosted_key(secret.raw(), 1).unwrap();
        for batch_size in BATCH_SIZES {
            assert_eq!(hosted_key(secret.raw(), batch_size).unwrap(), hosted);
        }
        assert!(segment_key(secret.raw(), 4242, 3).is_err());
    }

    #[test]
    fn test_keys_differ_by_segment() {
        let secret = derive_custodian_secret(&owner(), 1);
        assert_ne!(
            segment_key(secret.raw(), 1, 8).unwrap(),
            segment_key(secret.raw(), 2, 8).unwrap()
        );
        // hosted mode label sequence starts where segment 0 starts
        assert_eq!(
            hosted_key(secret.raw(), 8).unwrap(),
            segment_key(secret.raw(), 0, 8).unwrap()
        );
        assert_ne!(hosted_iv(1), hosted_iv(2));
        assert_eq!(stream_iv(KeyMode::PerSegment, 7), vec![false; IV_BITS]);
        assert_eq!(stream_iv(KeyMode::Hosted, 7), hosted_iv(7));
    }

    #[test]
    fn test_combine_encrypted_matches_clear() {
        let k1 = segment_key(derive_custodian_secret(&owner(), 1).raw(), 9, 1).unwrap();
        let k2 = segment_key(derive_custodian_secret(&owner(), 2).raw(), 9, 1).unwrap();
        let clear = combined_key(&k1, &k2).unwrap();
        assert_eq!(combine_encrypted_keys(&PlainGates, &k1, &k2).unwrap(), clear);
        assert!(combined_key(&k1, &k2[1..]).is_err());
    }

    struct RejectBatch(usize);

    impl KeyProofSystem for RejectBatch {
        type Proof = usize;

        fn prove(&self, statement: &KeyStatement, _: &CustodianSecret, _: &[bool]) -> usize {
            statement.batch
        }

        fn verify(&self, statement: &KeyStatement, proof: &usize) -> bool {
            *proof == statement.batch && statement.batch != self.0
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let secret = derive_custodian_secret(&owner(), 2);
        let key = issue_custodian_key(
            &PlainGates,
            &UncheckedProofs,
            &secret,
            KeyMode::PerSegment,
            17,
            8,
        )
        .unwrap();
        assert_eq!(key.bits, segment_key(secret.raw(), 17, 1).unwrap());
        assert_eq!(key.proofs.len(), 10);
        verify_custodian_key(
            &UncheckedProofs,
            &secret.commitment,
            &key,
            KeyMode::PerSegment,
            17,
            8,
        )
        .unwrap();
    }

    #[test]
    fn test_rejected_proof_surfaces() {
        let secret = derive_custodian_secret(&owner(), 1);
        let system = RejectBatch(3);
        let key = issue_custodian_key(&PlainGates, &system, &secret, KeyMode::Hosted, 5, 4)
            .unwrap();
        let err = verify_custodian_key(&system, &secret.commitment, &key, KeyMode::Hosted, 5, 4)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProofRejected {
                custodian: 1,
                batch: 3
            }
        ));

        // proofs produced for the wrong batch size do not line up
        let err = verify_custodian_key(
            &RejectBatch(usize::MAX),
            &secret.commitment,
            &key,
            KeyMode::Hosted,
            5,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProofRejected { .. }));
    }
}
