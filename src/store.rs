//! Encrypted artifacts at rest and the lookup interface the engine reads them through.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ArtifactKind, Error, Result};
use crate::keys::{Commitment, KeyMode};
use crate::segment::Owner;
use crate::utils::{transcode_from_bytes, transcode_to_bytes};
use crate::VARIANT_BITS;

/// Symmetric ciphertext of one segment: each record is 32 rsid bits then 4 genotype bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSegment {
    pub owner: String,
    pub segment: u64,
    pub mode: KeyMode,
    pub bits: Vec<bool>,
}

/// Symmetric ciphertext of an owner's STR profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedProfile {
    pub owner: String,
    pub mode: KeyMode,
    pub bits: Vec<bool>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    owner: String,
    segment: u64,
    mode: KeyMode,
    len: u64,
    packed: Vec<u8>,
}

impl Blob {
    fn new(owner: &str, segment: u64, mode: KeyMode, bits: &[bool]) -> Self {
        Self {
            owner: owner.to_string(),
            segment,
            mode,
            len: bits.len() as u64,
            packed: transcode_to_bytes(bits),
        }
    }

    fn bits(&self) -> Result<Vec<bool>> {
        transcode_from_bytes(&self.packed, self.len as usize).ok_or_else(|| {
            Error::InvalidInput(format!(
                "blob for {} holds {} bytes, fewer than {} bits",
                self.owner,
                self.packed.len(),
                self.len
            ))
        })
    }
}

impl EncryptedSegment {
    pub fn records(&self) -> usize {
        self.bits.len() / VARIANT_BITS
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&Blob::new(
            &self.owner,
            self.segment,
            self.mode,
            &self.bits,
        ))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let blob: Blob = bincode::deserialize(bytes)?;
        let bits = blob.bits()?;
        if bits.len() % VARIANT_BITS != 0 {
            return Err(Error::InvalidInput(format!(
                "segment of {} bits is not a whole number of records",
                bits.len()
            )));
        }
        Ok(Self {
            owner: blob.owner,
            segment: blob.segment,
            mode: blob.mode,
            bits,
        })
    }
}

impl EncryptedProfile {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&Blob::new(
            &self.owner,
            0,
            self.mode,
            &self.bits,
        ))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let blob: Blob = bincode::deserialize(bytes)?;
        let bits = blob.bits()?;
        Ok(Self {
            owner: blob.owner,
            mode: blob.mode,
            bits,
        })
    }
}

/// Read access to everything owners have published.
pub trait ArtifactStore: Sync {
    fn segment(&self, owner: &Owner, segment: u64, mode: KeyMode) -> Result<EncryptedSegment>;

    /// Commitments of custodians 1 and 2.
    fn commitments(&self, owner: &Owner) -> Result<[Commitment; 2]>;

    fn profile(&self, owner: &Owner, mode: KeyMode) -> Result<EncryptedProfile>;
}

#[derive(Default)]
pub struct MemoryStore {
    segments: HashMap<(String, u64, KeyMode), EncryptedSegment>,
    commitments: HashMap<String, [Commitment; 2]>,
    profiles: HashMap<(String, KeyMode), EncryptedProfile>,
}

fn missing(kind: ArtifactKind, owner: &Owner, segment: Option<u64>) -> Error {
    Error::MissingArtifact {
        kind,
        owner: owner.name.clone(),
        segment,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_segment(&mut self, segment: EncryptedSegment) {
        self.segments.insert(
            (segment.owner.clone(), segment.segment, segment.mode),
            segment,
        );
    }

    pub fn insert_commitments(&mut self, owner: &Owner, commitments: [Commitment; 2]) {
        self.commitments.insert(owner.name.clone(), commitments);
    }

    pub fn insert_profile(&mut self, profile: EncryptedProfile) {
        self.profiles
            .insert((profile.owner.clone(), profile.mode), profile);
    }

    pub fn remove_segment(&mut self, owner: &Owner, segment: u64, mode: KeyMode) {
        self.segments.remove(&(owner.name.clone(), segment, mode));
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl ArtifactStore for MemoryStore {
    fn segment(&self, owner: &Owner, segment: u64, mode: KeyMode) -> Result<EncryptedSegment> {
        self.segments
            .get(&(owner.name.clone(), segment, mode))
            .cloned()
            .ok_or_else(|| missing(ArtifactKind::Segment, owner, Some(segment)))
    }

    fn commitments(&self, owner: &Owner) -> Result<[Commitment; 2]> {
        self.commitments
            .get(&owner.name)
            .copied()
            .ok_or_else(|| missing(ArtifactKind::Commitments, owner, None))
    }

    fn profile(&self, owner: &Owner, mode: KeyMode) -> Result<EncryptedProfile> {
        self.profiles
            .get(&(owner.name.clone(), mode))
            .cloned()
            .ok_or_else(|| missing(ArtifactKind::Profile, owner, None))
    }
}
