use std::fmt;

use thiserror::Error;

/// Stored artifact an individual must have for a query to proceed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Segment,
    Commitments,
    Profile,
    CustodianKey,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Segment => "segment ciphertext",
            ArtifactKind::Commitments => "key commitments",
            ArtifactKind::Profile => "str profile",
            ArtifactKind::CustodianKey => "custodian key",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("segment modulus must be greater than 1, got {0}")]
    InvalidModulus(u64),
    #[error("{what}: expected {expected} bits, got {actual}")]
    BitLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upper bound {bound} does not fit a 72-bit container")]
    Overflow { bound: u128 },
    #[error("key proof rejected for custodian {custodian}, batch {batch}")]
    ProofRejected { custodian: u8, batch: usize },
    #[error("missing {kind} for owner {owner} (segment {segment:?})")]
    MissingArtifact {
        kind: ArtifactKind,
        owner: String,
        segment: Option<u64>,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::BitLength {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
