use std::time::Instant;

use itertools::Itertools;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::arith::BigValueCiphertext;
use crate::error::{check_len, Error, Result};
use crate::gates::BinaryGates;
use crate::gwas::{self, GwasCiphertext};
use crate::keys::{stream_iv, verify_custodian_key, CustodianKey, KeyProofSystem};
use crate::profile::PROFILE_BITS;
use crate::segment::{segment_id, Owner};
use crate::store::ArtifactStore;
use crate::trivium::re_encrypt;
use crate::utils::to_bits_le;
use crate::{EngineParameters, RSID_BITS, VARIANT_BITS};

/// Bounded pool for per-individual homomorphic work. Its thread count caps how many
/// evaluations, and their ciphertext working sets, are in flight at once.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Uses `fraction` of the available cores, at least one thread.
    pub fn new(fraction: f64) -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(((cores as f64 * fraction).floor() as usize).max(1))
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("genoquery-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Applies `f` to every item in parallel. Results keep input order; the first
    /// error aborts the whole batch.
    pub fn map<T, U, F>(&self, items: &[T], f: F) -> Result<Vec<U>>
    where
        T: Sync,
        U: Send,
        F: Fn(usize, &T) -> Result<U> + Sync + Send,
    {
        self.pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .map(|(i, item)| f(i, item))
                .collect()
        })
    }

    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

/// One re-encrypted record.
#[derive(Clone, Debug)]
pub struct EncryptedVariant<B> {
    pub rsid: Vec<B>,
    pub genotype: Vec<B>,
}

pub type SegmentKeys<B, P> = [CustodianKey<B, P>; 2];

/// Evaluates queries over stored artifacts with custodian-supplied encrypted keys.
pub struct QueryEngine<'a, G: BinaryGates, P: KeyProofSystem, S: ArtifactStore> {
    gates: &'a G,
    proofs: &'a P,
    store: &'a S,
    params: EngineParameters,
    pool: WorkerPool,
}

impl<'a, G: BinaryGates, P: KeyProofSystem, S: ArtifactStore> QueryEngine<'a, G, P, S> {
    pub fn new(gates: &'a G, proofs: &'a P, store: &'a S, params: EngineParameters) -> Result<Self> {
        params.validate()?;
        let pool = WorkerPool::new(params.worker_fraction)?;
        debug!(threads = pool.threads(), "worker pool ready");
        Ok(Self {
            gates,
            proofs,
            store,
            params,
            pool,
        })
    }

    pub fn params(&self) -> &EngineParameters {
        &self.params
    }

    /// Segment holding `rsid` for `owner`; the querier asks custodians for keys to it.
    pub fn segment_of(&self, owner: &Owner, rsid: u32) -> Result<u64> {
        segment_id(&owner.name, rsid, self.params.seg_num)
    }

    fn verify_keys(
        &self,
        owner: &Owner,
        segment: u64,
        keys: &SegmentKeys<G::Bit, P::Proof>,
    ) -> Result<()> {
        let commitments = self.store.commitments(owner)?;
        for (key, commitment) in keys.iter().zip(&commitments) {
            verify_custodian_key(
                self.proofs,
                commitment,
                key,
                self.params.mode,
                segment,
                self.params.batch_size,
            )?;
        }
        Ok(())
    }

    /// Fetches a segment, checks both custodians' proofs and converts the symmetric
    /// ciphertext into homomorphic ciphertext of the records.
    pub fn re_encrypt_segment(
        &self,
        owner: &Owner,
        segment: u64,
        keys: &SegmentKeys<G::Bit, P::Proof>,
    ) -> Result<Vec<EncryptedVariant<G::Bit>>> {
        let stored = self.store.segment(owner, segment, self.params.mode)?;
        if stored.bits.len() % VARIANT_BITS != 0 {
            return Err(Error::InvalidInput(format!(
                "segment {segment} of {} holds {} bits, not whole {VARIANT_BITS}-bit records",
                owner.name,
                stored.bits.len()
            )));
        }
        self.verify_keys(owner, segment, keys)?;
        let bits = re_encrypt(
            self.gates,
            &stored.bits,
            &keys[0].bits,
            &keys[1].bits,
            &stream_iv(self.params.mode, segment),
        )?;
        Ok(bits
            .chunks(VARIANT_BITS)
            .map(|record| EncryptedVariant {
                rsid: record[..RSID_BITS].to_vec(),
                genotype: record[RSID_BITS..].to_vec(),
            })
            .collect_vec())
    }

    /// Genotype bits of the record with `rsid`, all zero when there is none.
    fn lookup(&self, records: &[EncryptedVariant<G::Bit>], rsid: u32) -> Vec<G::Bit> {
        let g = self.gates;
        let query = to_bits_le(rsid as u128, RSID_BITS);
        let masked = records
            .iter()
            .map(|record| {
                let hit = g.equal_clear(&record.rsid, &query);
                record
                    .genotype
                    .iter()
                    .map(|bit| g.and(bit, &hit))
                    .collect_vec()
            })
            .collect_vec();
        (0..crate::GENOTYPE_BITS)
            .map(|i| {
                let column = masked.iter().map(|m| m[i].clone()).collect_vec();
                g.or_all(&column)
            })
            .collect_vec()
    }

    fn genotype_of(
        &self,
        owner: &Owner,
        rsid: u32,
        keys: &SegmentKeys<G::Bit, P::Proof>,
    ) -> Result<Vec<G::Bit>> {
        let segment = self.segment_of(owner, rsid)?;
        let records = self.re_encrypt_segment(owner, segment, keys)?;
        Ok(self.lookup(&records, rsid))
    }

    /// Four encrypted genotype bits of `owner` at `rsid`.
    pub fn user_query(
        &self,
        owner: &Owner,
        rsid: u32,
        keys: &SegmentKeys<G::Bit, P::Proof>,
    ) -> Result<Vec<G::Bit>> {
        let now = Instant::now();
        let genotype = self.genotype_of(owner, rsid, keys)?;
        info!(owner = %owner.name, rsid, elapsed = ?now.elapsed(), "user query evaluated");
        Ok(genotype)
    }

    fn per_individual<U: Send>(
        &self,
        owners: &[Owner],
        keys: &[SegmentKeys<G::Bit, P::Proof>],
        f: impl Fn(&Owner, &SegmentKeys<G::Bit, P::Proof>) -> Result<U> + Sync + Send,
    ) -> Result<Vec<U>> {
        check_len("custodian key pairs", owners.len(), keys.len())?;
        self.pool.map(owners, |i, owner| f(owner, &keys[i]))
    }

    /// Sum of the low bit of each allele, in `[0, 2]`.
    fn merged_genotype(&self, genotype: &[G::Bit]) -> BigValueCiphertext<G::Bit> {
        BigValueCiphertext::from_bit(genotype[0].clone())
            .add(&BigValueCiphertext::from_bit(genotype[2].clone()), self.gates)
    }

    /// Encrypted counts of `[no alternate allele, heterozygous, homozygous alternate]`
    /// at `rsid` over the population. Individuals without the record count as the first.
    pub fn genotype_distribution(
        &self,
        owners: &[Owner],
        rsid: u32,
        keys: &[SegmentKeys<G::Bit, P::Proof>],
    ) -> Result<[BigValueCiphertext<G::Bit>; 3]> {
        let g = self.gates;
        let now = Instant::now();
        info!(population = owners.len(), rsid, "genotype distribution started");
        let indicators = self.per_individual(owners, keys, |owner, pair| {
            let genotype = self.genotype_of(owner, rsid, pair)?;
            let (low, high) = (&genotype[0], &genotype[2]);
            Ok([
                g.not(&g.or(low, high)),
                g.xor(low, high),
                g.and(low, high),
            ])
        })?;

        let mut counts = [
            BigValueCiphertext::zero(g),
            BigValueCiphertext::zero(g),
            BigValueCiphertext::zero(g),
        ];
        for individual in indicators {
            for (count, bit) in counts.iter_mut().zip(individual) {
                *count = count.add(&BigValueCiphertext::from_bit(bit), g);
            }
        }
        info!(population = owners.len(), elapsed = ?now.elapsed(), "genotype distribution finished");
        Ok(counts)
    }

    /// Association test of `rsid` against the querier's encrypted phenotypes.
    pub fn gwas_query(
        &self,
        owners: &[Owner],
        rsid: u32,
        keys: &[SegmentKeys<G::Bit, P::Proof>],
        phenotypes: &[BigValueCiphertext<G::Bit>],
    ) -> Result<GwasCiphertext<G::Bit>> {
        check_len("phenotypes", owners.len(), phenotypes.len())?;
        let now = Instant::now();
        info!(population = owners.len(), rsid, "gwas started");
        let genotypes = self.merged_genotypes(owners, rsid, keys)?;

        let result = self
            .pool
            .install(|| gwas::evaluate(self.gates, &genotypes, phenotypes))?;
        info!(population = owners.len(), elapsed = ?now.elapsed(), "gwas finished");
        Ok(result)
    }

    /// Like [`Self::gwas_query`] but only reveals whether the p-value is below
    /// `p_threshold`.
    pub fn gwas_threshold_query(
        &self,
        owners: &[Owner],
        rsid: u32,
        keys: &[SegmentKeys<G::Bit, P::Proof>],
        phenotypes: &[BigValueCiphertext<G::Bit>],
        p_threshold: f64,
    ) -> Result<G::Bit> {
        check_len("phenotypes", owners.len(), phenotypes.len())?;
        let now = Instant::now();
        info!(population = owners.len(), rsid, p_threshold, "gwas threshold started");
        let genotypes = self.merged_genotypes(owners, rsid, keys)?;

        let result = self.pool.install(|| {
            gwas::evaluate_threshold(self.gates, &genotypes, phenotypes, p_threshold)
        })?;
        info!(population = owners.len(), elapsed = ?now.elapsed(), "gwas threshold finished");
        Ok(result)
    }

    fn merged_genotypes(
        &self,
        owners: &[Owner],
        rsid: u32,
        keys: &[SegmentKeys<G::Bit, P::Proof>],
    ) -> Result<Vec<BigValueCiphertext<G::Bit>>> {
        let now = Instant::now();
        let genotypes = self.per_individual(owners, keys, |owner, pair| {
            let genotype = self.genotype_of(owner, rsid, pair)?;
            Ok(self.merged_genotype(&genotype))
        })?;
        info!(elapsed = ?now.elapsed(), "genotypes re-encrypted");
        Ok(genotypes)
    }

    /// Compares the query profile with every owner's stored profile. One encrypted match
    /// bit per owner, in input order.
    pub fn search_person(
        &self,
        owners: &[Owner],
        query: &[G::Bit],
        keys: &[SegmentKeys<G::Bit, P::Proof>],
    ) -> Result<Vec<G::Bit>> {
        check_len("query profile", PROFILE_BITS, query.len())?;
        let segment = self.params.search_person_segment();
        let now = Instant::now();
        info!(population = owners.len(), "person search started");
        let matches = self.per_individual(owners, keys, |owner, pair| {
            let stored = self.store.profile(owner, self.params.mode)?;
            check_len("stored profile", PROFILE_BITS, stored.bits.len())?;
            self.verify_keys(owner, segment, pair)?;
            let profile = re_encrypt(
                self.gates,
                &stored.bits,
                &pair[0].bits,
                &pair[1].bits,
                &stream_iv(self.params.mode, segment),
            )?;
            Ok(self.gates.equal(&profile, query))
        })?;
        info!(population = owners.len(), elapsed = ?now.elapsed(), "person search finished");
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        decode_distribution, decode_genotype, decrypt_gwas, encrypt_owner, encrypt_phenotypes,
        encrypt_query_profile, match_indices, segment_keys,
    };
    use crate::error::{ArtifactKind, Error};
    use crate::gates::PlainGates;
    use crate::keys::{CustodianSecret, KeyMode, KeyStatement, UncheckedProofs};
    use crate::profile::StrProfile;
    use crate::segment::{alternate_allele_count, genotype_to_string, Variant};
    use crate::store::MemoryStore;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaChaRng;

    const RSID: u32 = 6053810;

    fn params(mode: KeyMode) -> EngineParameters {
        EngineParameters {
            seg_num: 4,
            minimal_block_size: 3,
            batch_size: 10,
            worker_fraction: 1.0,
            mode,
        }
    }

    struct Population {
        owners: Vec<Owner>,
        genotypes: Vec<Option<u8>>,
        profiles: Vec<StrProfile>,
        store: MemoryStore,
    }

    fn population(n: usize, mode: KeyMode, seed: u64) -> Population {
        let mut rng = ChaChaRng::seed_from_u64(seed);
        let params = params(mode);
        let mut store = MemoryStore::new();
        let mut owners = vec![];
        let mut genotypes = vec![];
        let mut profiles = vec![];
        for i in 0..n {
            let owner = Owner::new(format!("HG{:05}", 100 + i), i as u64);
            let genotype = match i % 5 {
                0 => None,
                _ => Some([0u8, 1, 4, 5][rng.gen_range(0..4)]),
            };
            let mut variants = (0..6)
                .map(|_| Variant::new(rng.gen_range(1..RSID), rng.gen_range(0..16)))
                .collect_vec();
            if let Some(code) = genotype {
                variants.push(Variant::new(RSID, code));
            }
            let profile = StrProfile::random(&mut rng);
            encrypt_owner(&owner, &variants, Some(&profile), &params)
                .unwrap()
                .publish(&mut store);
            owners.push(owner);
            genotypes.push(genotype);
            profiles.push(profile);
        }
        Population {
            owners,
            genotypes,
            profiles,
            store,
        }
    }

    fn keys_for(
        engine: &QueryEngine<PlainGates, UncheckedProofs, MemoryStore>,
        owners: &[Owner],
        segment: impl Fn(&Owner) -> u64,
    ) -> Vec<SegmentKeys<bool, ()>> {
        owners
            .iter()
            .map(|owner| {
                segment_keys(&PlainGates, &UncheckedProofs, owner, segment(owner), engine.params())
                    .unwrap()
            })
            .collect_vec()
    }

    #[test]
    fn test_user_query() {
        for mode in [KeyMode::PerSegment, KeyMode::Hosted] {
            let pop = population(5, mode, 71);
            let engine =
                QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params(mode)).unwrap();
            for (owner, expected) in pop.owners.iter().zip(&pop.genotypes) {
                let segment = engine.segment_of(owner, RSID).unwrap();
                let keys = keys_for(&engine, std::slice::from_ref(owner), |_| segment);
                let bits = engine.user_query(owner, RSID, &keys[0]).unwrap();
                assert_eq!(
                    decode_genotype(&PlainGates, &bits).unwrap(),
                    genotype_to_string(expected.unwrap_or(0))
                );
            }
        }
    }

    #[test]
    fn test_genotype_distribution() {
        let pop = population(12, KeyMode::PerSegment, 72);
        let params = params(KeyMode::PerSegment);
        let engine = QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params).unwrap();
        let keys = keys_for(&engine, &pop.owners, |o| engine.segment_of(o, RSID).unwrap());
        let counts = engine
            .genotype_distribution(&pop.owners, RSID, &keys)
            .unwrap();

        let mut expected = [0u128; 3];
        for genotype in &pop.genotypes {
            expected[alternate_allele_count(genotype.unwrap_or(0)) as usize] += 1;
        }
        assert_eq!(decode_distribution(&PlainGates, &counts), expected);
    }

    #[test]
    fn test_gwas_query_matches_reference() {
        let pop = population(15, KeyMode::Hosted, 73);
        let params = params(KeyMode::Hosted);
        let engine = QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params).unwrap();
        let keys = keys_for(&engine, &pop.owners, |o| engine.segment_of(o, RSID).unwrap());

        let clear_genotypes = pop
            .genotypes
            .iter()
            .map(|g| alternate_allele_count(g.unwrap_or(0)))
            .collect_vec();
        let phenotypes = (0..pop.owners.len())
            .map(|i| ((i * 7 + clear_genotypes[i] as usize) % 3 == 0) as u64)
            .collect_vec();
        let encrypted = encrypt_phenotypes(&PlainGates, &phenotypes, 1).unwrap();

        let result = engine
            .gwas_query(&pop.owners, RSID, &keys, &encrypted)
            .unwrap();
        let outcome = decrypt_gwas(&PlainGates, &result).unwrap();
        if let Some(expected) = gwas::reference_statistic(&clear_genotypes, &phenotypes).unwrap() {
            if expected == 0.0 {
                assert_eq!(outcome.statistic, 0.0);
            } else {
                assert!(((outcome.statistic - expected) / expected).abs() < 2f64.powi(-15));
            }
            assert!((0.0..=1.0).contains(&outcome.p_value));
        }

        for threshold in [0.5, 0.05] {
            let significant = engine
                .gwas_threshold_query(&pop.owners, RSID, &keys, &encrypted, threshold)
                .unwrap();
            assert_eq!(
                significant,
                gwas::reference_threshold(&clear_genotypes, &phenotypes, threshold).unwrap()
            );
        }
    }

    #[test]
    fn test_search_person() {
        let pop = population(6, KeyMode::PerSegment, 74);
        let params = params(KeyMode::PerSegment);
        let segment = params.search_person_segment();
        let engine = QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params).unwrap();
        let keys = keys_for(&engine, &pop.owners, |_| segment);

        let query = encrypt_query_profile(&PlainGates, &pop.profiles[4]);
        let matches = engine.search_person(&pop.owners, &query, &keys).unwrap();
        assert_eq!(match_indices(&PlainGates, &matches), vec![4]);

        assert!(engine
            .search_person(&pop.owners, &query[1..], &keys)
            .is_err());
    }

    #[test]
    fn test_missing_segment_aborts_population() {
        let mut pop = population(4, KeyMode::PerSegment, 75);
        let params = params(KeyMode::PerSegment);
        let segment = segment_id(&pop.owners[2].name, RSID, params.seg_num).unwrap();
        pop.store
            .remove_segment(&pop.owners[2], segment, KeyMode::PerSegment);

        let engine = QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params).unwrap();
        let keys = keys_for(&engine, &pop.owners, |o| engine.segment_of(o, RSID).unwrap());
        let err = engine
            .genotype_distribution(&pop.owners, RSID, &keys)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingArtifact {
                kind: ArtifactKind::Segment,
                ..
            }
        ));
        assert!(engine
            .genotype_distribution(&pop.owners, RSID, &keys[1..])
            .is_err());
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let mut pop = population(2, KeyMode::PerSegment, 77);
        let params = params(KeyMode::PerSegment);
        let owner = pop.owners[0].clone();
        let segment = segment_id(&owner.name, RSID, params.seg_num).unwrap();
        let mut stored = pop
            .store
            .segment(&owner, segment, KeyMode::PerSegment)
            .unwrap();
        stored.bits.truncate(VARIANT_BITS + 10);
        pop.store.insert_segment(stored);

        let engine = QueryEngine::new(&PlainGates, &UncheckedProofs, &pop.store, params).unwrap();
        let keys = keys_for(&engine, std::slice::from_ref(&owner), |_| segment);
        assert!(matches!(
            engine.user_query(&owner, RSID, &keys[0]),
            Err(Error::InvalidInput(_))
        ));
        // whole records still decrypt
        let other = &pop.owners[1];
        let keys = keys_for(&engine, std::slice::from_ref(other), |o| {
            engine.segment_of(o, RSID).unwrap()
        });
        assert!(engine.user_query(other, RSID, &keys[0]).is_ok());
    }

    /// Rejects any proof made for a statement other than the one being checked.
    struct StatementProofs;

    impl KeyProofSystem for StatementProofs {
        type Proof = KeyStatement;

        fn prove(&self, statement: &KeyStatement, _: &CustodianSecret, _: &[bool]) -> KeyStatement {
            statement.clone()
        }

        fn verify(&self, statement: &KeyStatement, proof: &KeyStatement) -> bool {
            statement == proof
        }
    }

    #[test]
    fn test_keys_for_wrong_segment_rejected() {
        let pop = population(2, KeyMode::PerSegment, 76);
        let params = params(KeyMode::PerSegment);
        let engine = QueryEngine::new(&PlainGates, &StatementProofs, &pop.store, params).unwrap();
        let owner = &pop.owners[1];
        let segment = engine.segment_of(owner, RSID).unwrap();

        let good = segment_keys(&PlainGates, &StatementProofs, owner, segment, engine.params())
            .unwrap();
        assert!(engine.user_query(owner, RSID, &good).is_ok());

        let wrong = (segment + 1) % engine.params().seg_num;
        let bad = segment_keys(&PlainGates, &StatementProofs, owner, wrong, engine.params())
            .unwrap();
        assert!(matches!(
            engine.user_query(owner, RSID, &bad),
            Err(Error::ProofRejected { custodian: 1, .. })
        ));
    }

    #[test]
    fn test_worker_pool_preserves_order() {
        let pool = WorkerPool::with_threads(3).unwrap();
        assert_eq!(pool.threads(), 3);
        let items = (0..100u64).collect_vec();
        let squares = pool.map(&items, |i, v| Ok(v * v + i as u64)).unwrap();
        assert_eq!(squares, items.iter().map(|v| v * v + v).collect_vec());

        let failed = pool.map(&items, |_, v| {
            if *v == 57 {
                Err(Error::InvalidInput("boom".into()))
            } else {
                Ok(*v)
            }
        });
        assert!(failed.is_err());
        assert!(WorkerPool::new(0.5).unwrap().threads() >= 1);
    }
}
