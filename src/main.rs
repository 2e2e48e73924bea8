use clap::{Args, Parser, Subcommand};
use genoquery::{
    client::*,
    gates::{BinaryGates, BitDecryptor, BitEncryptor, PlainGates},
    gwas::{reference_statistic, reference_threshold},
    keys::{derive_custodian_secret, derive_key, KeyMode, UncheckedProofs},
    profile::StrProfile,
    segment::{alternate_allele_count, genotype_to_string, rsid_from_str, segment_id, Owner, Variant},
    server::{QueryEngine, SegmentKeys},
    store::MemoryStore,
    utils::transcode_to_bytes,
    EngineParameters, Result,
};
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Queries over genomes encrypted under two-custodian keys")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct EngineArgs {
    /// Number of segments per owner
    #[arg(long, default_value_t = 64)]
    seg_num: u64,

    #[arg(long, default_value_t = genoquery::MINIMAL_BLOCK_SIZE)]
    minimal_block_size: usize,

    /// Key bits proved together
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Share of cores used by the worker pool
    #[arg(long, default_value_t = 0.5)]
    worker_fraction: f64,

    /// One key per owner with per-segment IVs
    #[arg(long)]
    hosted: bool,

    /// Seed of the synthetic roster
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Evaluate with TFHE boolean gates instead of clear bits
    #[cfg(feature = "tfhe")]
    #[arg(long)]
    tfhe: bool,
}

impl EngineArgs {
    fn params(&self) -> EngineParameters {
        EngineParameters {
            seg_num: self.seg_num,
            minimal_block_size: self.minimal_block_size,
            batch_size: self.batch_size,
            worker_fraction: self.worker_fraction,
            mode: if self.hosted {
                KeyMode::Hosted
            } else {
                KeyMode::PerSegment
            },
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print a custodian's commitment and the key for the segment holding an rsid
    DeriveKey {
        #[arg(long)]
        owner: String,

        #[arg(long, default_value_t = 1)]
        custodian: u8,

        #[arg(long)]
        rsid: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Look up one individual's genotype
    UserQuery {
        #[arg(long, default_value_t = 8)]
        population: usize,

        #[arg(long, default_value_t = 0)]
        individual: usize,

        #[arg(long, default_value = "rs6053810")]
        rsid: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Count genotypes at an rsid across the population
    Distribution {
        #[arg(long, default_value_t = 8)]
        population: usize,

        #[arg(long, default_value = "rs6053810")]
        rsid: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Association test of an rsid against a random binary phenotype
    Gwas {
        #[arg(long, default_value_t = 16)]
        population: usize,

        #[arg(long, default_value = "rs6053810")]
        rsid: String,

        /// Only reveal whether the p-value falls below this threshold
        #[arg(long)]
        p_threshold: Option<f64>,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Find who in the population carries a given STR profile
    SearchPerson {
        #[arg(long, default_value_t = 8)]
        population: usize,

        #[arg(long, default_value_t = 0)]
        target: usize,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

struct Individual {
    owner: Owner,
    genotype: u8,
    profile: StrProfile,
}

/// Random individuals, each with a few variants and, for most of them, a call at `rsid`.
fn synthetic_roster(
    population: usize,
    rsid: u32,
    params: &EngineParameters,
    rng: &mut ChaChaRng,
) -> Result<(Vec<Individual>, MemoryStore)> {
    let mut store = MemoryStore::new();
    let mut roster = Vec::with_capacity(population);
    for i in 0..population {
        let owner = Owner::new(format!("HG{:05}", 96 + i), i as u64);
        let genotype = [0u8, 1, 4, 5][rng.gen_range(0..4)];
        let mut variants = (0..20)
            .map(|_| Variant::new(rng.gen_range(1..=u32::MAX), rng.gen_range(0..16)))
            .filter(|v| v.rsid != rsid)
            .collect_vec();
        if genotype != 0 {
            variants.push(Variant::new(rsid, genotype));
        }
        let profile = StrProfile::random(rng);
        encrypt_owner(&owner, &variants, Some(&profile), params)?.publish(&mut store);
        roster.push(Individual {
            owner,
            genotype,
            profile,
        });
    }
    Ok((roster, store))
}

fn all_keys<E: BitEncryptor>(
    encryptor: &E,
    owners: &[Owner],
    params: &EngineParameters,
    segment: impl Fn(&Owner) -> Result<u64>,
) -> Result<Vec<SegmentKeys<E::Bit, ()>>> {
    owners
        .iter()
        .map(|owner| segment_keys(encryptor, &UncheckedProofs, owner, segment(owner)?, params))
        .collect()
}

fn derive_key_command(owner: &str, custodian: u8, rsid: &str, engine: &EngineArgs) -> Result<()> {
    let params = engine.params();
    params.validate()?;
    let owner = Owner::new(owner, 0);
    let rsid = rsid_from_str(rsid)?;
    let segment = segment_id(&owner.name, rsid, params.seg_num)?;
    let secret = derive_custodian_secret(&owner, custodian);
    let key = derive_key(secret.raw(), params.mode, segment, params.batch_size)?;
    println!("commitment {}", hex::encode(secret.commitment));
    println!("segment    {segment}");
    println!("key        {}", hex::encode(transcode_to_bytes(&key)));
    Ok(())
}

/// Runs one query over a freshly generated roster. `custodian` encrypts key material,
/// `querier` encrypts queries and decrypts results.
fn run<G, E, D>(
    gates: &G,
    custodian: &E,
    querier: &D,
    command: &Command,
) -> Result<()>
where
    G: BinaryGates,
    E: BitEncryptor<Bit = G::Bit>,
    D: BitEncryptor<Bit = G::Bit> + BitDecryptor<Bit = G::Bit>,
{
    match command {
        Command::DeriveKey { .. } => Ok(()),
        Command::UserQuery {
            population,
            individual,
            rsid,
            engine,
        } => {
            let params = engine.params();
            let rsid = rsid_from_str(rsid)?;
            let mut rng = ChaChaRng::seed_from_u64(engine.seed);
            let (roster, store) = synthetic_roster(*population, rsid, &params, &mut rng)?;
            let person = roster.get(*individual).ok_or_else(|| {
                genoquery::Error::InvalidInput(format!("no individual {individual}"))
            })?;

            let engine = QueryEngine::new(gates, &UncheckedProofs, &store, params.clone())?;
            let segment = engine.segment_of(&person.owner, rsid)?;
            let keys = segment_keys(custodian, &UncheckedProofs, &person.owner, segment, &params)?;
            let bits = engine.user_query(&person.owner, rsid, &keys)?;
            println!(
                "{} rs{rsid}: {} (stored {})",
                person.owner.name,
                decode_genotype(querier, &bits)?,
                genotype_to_string(person.genotype)
            );
            Ok(())
        }
        Command::Distribution {
            population,
            rsid,
            engine,
        } => {
            let params = engine.params();
            let rsid = rsid_from_str(rsid)?;
            let mut rng = ChaChaRng::seed_from_u64(engine.seed);
            let (roster, store) = synthetic_roster(*population, rsid, &params, &mut rng)?;
            let owners = roster.iter().map(|p| p.owner.clone()).collect_vec();

            let engine = QueryEngine::new(gates, &UncheckedProofs, &store, params.clone())?;
            let keys = all_keys(custodian, &owners, &params, |o| engine.segment_of(o, rsid))?;
            let counts = engine.genotype_distribution(&owners, rsid, &keys)?;
            let [none, het, hom] = decode_distribution(querier, &counts);
            println!("rs{rsid}: 0|0 {none}, heterozygous {het}, 1|1 {hom}");
            Ok(())
        }
        Command::Gwas {
            population,
            rsid,
            p_threshold,
            engine,
        } => {
            let params = engine.params();
            let rsid = rsid_from_str(rsid)?;
            let mut rng = ChaChaRng::seed_from_u64(engine.seed);
            let (roster, store) = synthetic_roster(*population, rsid, &params, &mut rng)?;
            let owners = roster.iter().map(|p| p.owner.clone()).collect_vec();
            let phenotypes = (0..owners.len())
                .map(|_| rng.gen_range(0..=1u64))
                .collect_vec();

            let engine = QueryEngine::new(gates, &UncheckedProofs, &store, params.clone())?;
            let keys = all_keys(custodian, &owners, &params, |o| engine.segment_of(o, rsid))?;
            let encrypted = encrypt_phenotypes(querier, &phenotypes, 1)?;
            let genotypes = roster
                .iter()
                .map(|p| alternate_allele_count(p.genotype))
                .collect_vec();

            if let Some(threshold) = *p_threshold {
                let bit = engine.gwas_threshold_query(&owners, rsid, &keys, &encrypted, threshold)?;
                println!(
                    "rs{rsid}: p-value below {threshold}: {} (clear {})",
                    querier.decrypt_bit(&bit),
                    reference_threshold(&genotypes, &phenotypes, threshold)?
                );
                return Ok(());
            }

            let result = engine.gwas_query(&owners, rsid, &keys, &encrypted)?;
            let outcome = decrypt_gwas(querier, &result)?;
            println!(
                "rs{rsid}: statistic {:.6}, p-value {:.6}",
                outcome.statistic, outcome.p_value
            );
            match reference_statistic(&genotypes, &phenotypes)? {
                Some(expected) => println!("clear statistic {expected:.6}"),
                None => println!("clear statistic undefined (no variation)"),
            }
            Ok(())
        }
        Command::SearchPerson {
            population,
            target,
            engine,
        } => {
            let params = engine.params();
            let mut rng = ChaChaRng::seed_from_u64(engine.seed);
            let (roster, store) = synthetic_roster(*population, 6053810, &params, &mut rng)?;
            let person = roster.get(*target).ok_or_else(|| {
                genoquery::Error::InvalidInput(format!("no individual {target}"))
            })?;
            let owners = roster.iter().map(|p| p.owner.clone()).collect_vec();

            let engine = QueryEngine::new(gates, &UncheckedProofs, &store, params.clone())?;
            let segment = params.search_person_segment();
            let keys = all_keys(custodian, &owners, &params, |_| Ok(segment))?;
            let query = encrypt_query_profile(querier, &person.profile);
            let matches = engine.search_person(&owners, &query, &keys)?;
            let found = match_indices(querier, &matches)
                .into_iter()
                .map(|i| owners[i].name.clone())
                .collect_vec();
            println!("profile of {} matches {found:?}", person.owner.name);
            Ok(())
        }
    }
}

fn engine_args(command: &Command) -> &EngineArgs {
    match command {
        Command::DeriveKey { engine, .. }
        | Command::UserQuery { engine, .. }
        | Command::Distribution { engine, .. }
        | Command::Gwas { engine, .. }
        | Command::SearchPerson { engine, .. } => engine,
    }
}

fn dispatch(command: &Command) -> Result<()> {
    if let Command::DeriveKey {
        owner,
        custodian,
        rsid,
        engine,
    } = command
    {
        return derive_key_command(owner, *custodian, rsid, engine);
    }

    #[cfg(feature = "tfhe")]
    if engine_args(command).tfhe {
        let now = std::time::Instant::now();
        let (client, gates) = genoquery::gates::boolean::generate_keys();
        let public = client.public_key();
        info!(elapsed = ?now.elapsed(), "tfhe keys generated");
        return run(&gates, &public, &client, command);
    }

    info!(seg_num = engine_args(command).seg_num, "evaluating over clear bits");
    run(&PlainGates, &PlainGates, &PlainGates, command)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(&cli.command) {
        error!("{e}");
        std::process::exit(1);
    }
}
