pub mod arith;
pub mod client;
pub mod error;
pub mod gates;
pub mod gwas;
pub mod keys;
pub mod profile;
pub mod segment;
pub mod server;
pub mod store;
pub mod trivium;
pub mod utils;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
use keys::KeyMode;

pub const KEY_BITS: usize = 80;
pub const IV_BITS: usize = 80;
pub const STATE_BITS: usize = 288;
pub const WARMUP_ROUNDS: usize = 1152;

pub const RSID_BITS: usize = 32;
pub const GENOTYPE_BITS: usize = 4;
// keystream bits consumed per stored variant
pub const VARIANT_BITS: usize = RSID_BITS + GENOTYPE_BITS;

/// Allowed number of key bits proved together. All divide 80.
pub const BATCH_SIZES: [usize; 10] = [1, 2, 4, 5, 8, 10, 16, 20, 40, 80];

pub const SEG_NUM: u64 = 120000;
pub const MINIMAL_BLOCK_SIZE: usize = 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineParameters {
    pub seg_num: u64,
    pub minimal_block_size: usize,
    pub batch_size: usize,
    /// Share of the machine's cores given to the worker pool.
    pub worker_fraction: f64,
    pub mode: KeyMode,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            seg_num: SEG_NUM,
            minimal_block_size: MINIMAL_BLOCK_SIZE,
            batch_size: 1,
            worker_fraction: 0.5,
            mode: KeyMode::PerSegment,
        }
    }
}

impl EngineParameters {
    pub fn validate(&self) -> Result<()> {
        if self.seg_num <= 1 {
            return Err(Error::InvalidModulus(self.seg_num));
        }
        if self.minimal_block_size == 0 {
            return Err(Error::InvalidInput(
                "minimal block size must be positive".into(),
            ));
        }
        if !BATCH_SIZES.contains(&self.batch_size) {
            return Err(Error::InvalidInput(format!(
                "batch size {} is not one of {BATCH_SIZES:?}",
                self.batch_size
            )));
        }
        if !(self.worker_fraction > 0.0 && self.worker_fraction <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "worker fraction {} outside (0, 1]",
                self.worker_fraction
            )));
        }
        Ok(())
    }

    /// Segment id reserved for STR profiles used by person search.
    pub fn search_person_segment(&self) -> u64 {
        self.seg_num + 1
    }

    /// Segment id reserved for phenotype material of a GWAS.
    pub fn gwas_segment(&self) -> u64 {
        self.seg_num + 2
    }
}
