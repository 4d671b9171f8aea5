use clap::{Parser, ValueEnum};
use log::{info, warn};
use permucn::cache::{load_bundle, make_cache_spec, save_bundle, CacheBundle, Stage};
use permucn::events::mask_from_keys;
use permucn::io::{load_canonical_tree, write_permutations_tsv};
use permucn::permutation::{effective_jobs, GeneratorConfig, PermutationGenerator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Sample null permutations of observed gain/loss branch sets on a species
/// tree and write them as TSV (one permutation per row).
#[derive(Parser, Debug)]
#[command(name = "permucn", version, about = "Clade-binned permutations of foreground branch sets")]
struct Args {
    /// Path to NEXUS (first TREE entry is used) or plain Newick file
    #[arg(short = 'i', long = "tree")]
    tree: PathBuf,

    /// Observed gain (0->1) branch keys, comma separated
    #[arg(long = "gain", value_delimiter = ',')]
    gain: Vec<String>,

    /// Observed loss (1->0) branch keys, comma separated
    #[arg(long = "loss", value_delimiter = ',')]
    loss: Vec<String>,

    /// Number of permutations
    #[arg(short = 'n', long = "n-perm", default_value_t = 1000)]
    n_perm: usize,

    /// Worker threads (0 = all available cores)
    #[arg(short = 'j', long = "jobs", default_value_t = 1, allow_negative_numbers = true)]
    jobs: i64,

    /// Base seed; drawn at random (and logged) when omitted
    #[arg(short = 's', long = "seed")]
    seed: Option<u64>,

    /// Permute losses under the descendant constraint (default)
    #[arg(long = "include-trait-loss", overrides_with = "no_include_trait_loss")]
    include_trait_loss: bool,

    /// Ignore observed losses; every permuted loss set is empty
    #[arg(long = "no-include-trait-loss", overrides_with = "include_trait_loss")]
    no_include_trait_loss: bool,

    /// Restarts allowed per permutation
    #[arg(long = "max-perm-attempts", default_value_t = GeneratorConfig::default().max_perm_attempts)]
    max_perm_attempts: usize,

    /// Attempts allowed per set sample
    #[arg(long = "max-set-attempts", default_value_t = GeneratorConfig::default().max_set_attempts)]
    max_set_attempts: usize,

    /// Permutation cache (JSON, gzip when ending in .gz); reused when compatible
    #[arg(long = "perm-cache")]
    perm_cache: Option<PathBuf>,

    /// Cache slot the permutations belong to
    #[arg(long = "stage", value_enum, default_value_t = StageArg::Initial)]
    stage: StageArg,

    /// Output path for the permutation TSV (gzip when ending in .gz)
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StageArg { Initial, Refine }

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Initial => Stage::Initial,
            StageArg::Refine => Stage::Refine,
        }
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if args.n_perm == 0 {
        exit_with(2, "n-perm must be > 0".to_string());
    }
    if let Err(e) = effective_jobs(args.jobs) {
        exit_with(2, format!("{e}"));
    }

    // Read tree and build the branch model
    let t0 = Instant::now();
    let tree = match load_canonical_tree(&args.tree) {
        Ok(t) => Arc::new(t),
        Err(e) => exit_with(2, format!("Failed to load tree {:?}: {e}", args.tree)),
    };
    let read_s = t0.elapsed().as_secs_f64();
    info!("Reading tree {read_s:.3}s");
    info!("Tree has {} branches", tree.num_branches());

    let observed = (mask_from_keys(&tree, &args.gain), mask_from_keys(&tree, &args.loss));
    let (obs_01, obs_10) = match observed {
        (Ok(g), Ok(l)) => (g, l),
        (Err(e), _) | (_, Err(e)) => exit_with(2, format!("{e}")),
    };

    let stage = Stage::from(args.stage);
    let config = GeneratorConfig {
        seed: stage.seed(args.seed),
        include_trait_loss: !args.no_include_trait_loss,
        max_perm_attempts: args.max_perm_attempts,
        max_set_attempts: args.max_set_attempts,
    };
    let generator = match PermutationGenerator::new(Arc::clone(&tree), &obs_01, &obs_10, &config) {
        Ok(g) => g,
        Err(e) => exit_with(2, format!("{e}")),
    };
    info!(
        "Observed {} gain and {} loss branches (trait loss {})",
        generator.sampler().obs_mask_01().count_ones(),
        generator.sampler().obs_mask_10().count_ones(),
        if config.include_trait_loss { "included" } else { "ignored" },
    );

    // Keyed on the observed masks, including losses that are not permuted
    let spec = make_cache_spec(&tree, config.include_trait_loss, &obs_01, &obs_10);
    let mut bundle = match &args.perm_cache {
        Some(path) if path.exists() => match load_bundle(path) {
            Ok(b) if b.is_compatible(&spec) => b,
            Ok(_) => {
                warn!("Permutation cache {path:?} does not match this tree/foreground; starting fresh");
                CacheBundle::empty(&spec)
            }
            Err(e) => {
                warn!("Could not read permutation cache {path:?} ({e}); starting fresh");
                CacheBundle::empty(&spec)
            }
        },
        _ => CacheBundle::empty(&spec),
    };

    // Reuse a cached prefix or sample new permutations
    let t1 = Instant::now();
    let cache = match bundle.get_stage(stage, args.n_perm, tree.words) {
        Some(cached) => {
            info!("Reusing {} cached '{}' permutations", args.n_perm, stage.as_str());
            cached
        }
        None => {
            info!("Generating {} '{}' permutations", args.n_perm, stage.as_str());
            let cache = match generator.generate(args.n_perm, args.jobs) {
                Ok(c) => c,
                Err(e) => exit_with(3, format!("{e}")),
            };
            let gen_s = t1.elapsed().as_secs_f64();
            info!("Generating permutations {gen_s:.3}s");

            if let Some(path) = &args.perm_cache {
                bundle.put_stage(stage, &cache);
                if let Err(e) = save_bundle(path, &bundle) {
                    exit_with(4, format!("Failed to write permutation cache {path:?}: {e}"));
                }
                info!("Saved permutation cache to {path:?}");
            }
            cache
        }
    };

    let t2 = Instant::now();
    if let Err(e) = write_permutations_tsv(&args.output, &tree, &cache) {
        exit_with(4, format!("Failed to write output {:?}: {e}", args.output));
    }
    let write_s = t2.elapsed().as_secs_f64();
    info!("Writing to output {write_s:.3}s");
}

fn exit_with(code: i32, msg: String) -> ! {
    eprintln!("{msg}");
    std::process::exit(code);
}
