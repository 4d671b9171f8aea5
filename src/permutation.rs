//! Constrained permutation of foreground branch sets.
//!
//! # Overview
//! A permutation replaces the observed gain (0→1) and loss (1→0) branch sets
//! with random sets that
//!
//! 1. have the same number of branches in every clade-size bin,
//! 2. never contain two branches in an ancestor/descendant relation,
//! 3. optionally place every loss branch strictly below a gain branch of the
//!    same permutation.
//!
//! # Reproducibility
//! Permutation `idx` draws from its own RNG seeded with
//! [`seed_for_index`]`(base_seed, idx)`. Results are written back by index,
//! so the output does not depend on chunking, worker count or completion
//! order.

use crate::bitset::Bitset;
use crate::error::{PermError, Result};
use crate::events::bin_counts;
use crate::tree::{CanonicalTree, NUM_CLADE_BINS};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::ops::Range;
use std::sync::Arc;

/// Odd 64-bit mixing constant (2^64 / φ).
pub const GOLDEN_RATIO_CONSTANT: u64 = 0x9E37_79B9_7F4A_7C15;

pub const DEFAULT_MAX_PERM_ATTEMPTS: usize = 200;
pub const DEFAULT_MAX_SET_ATTEMPTS: usize = 200;

/// Seed of permutation `idx`: `base_seed + (idx + 1) * GOLDEN_RATIO_CONSTANT (mod 2^64)`.
///
/// The constant is odd, so distinct indices below 2^64 never share a seed.
#[inline]
pub fn seed_for_index(base_seed: u64, idx: u64) -> u64 {
    base_seed.wrapping_add(idx.wrapping_add(1).wrapping_mul(GOLDEN_RATIO_CONSTANT))
}

/// Sampled permutations, ordered by permutation index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermutationCache {
    pub masks_01: Vec<Bitset>,
    pub masks_10: Vec<Bitset>,
    pub total_attempts: u64,
    pub total_restarts: u64,
    /// Trials whose loss set fell back to unconstrained sampling because the
    /// descendants of the sampled gain set lacked bin capacity. Diagnostic
    /// only: the affected masks are not flagged.
    pub total_loss_fallbacks: u64,
}

impl PermutationCache {
    pub fn len(&self) -> usize {
        self.masks_01.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks_01.is_empty()
    }

    /// First `n` permutations. Valid because every entry was sampled
    /// independently from its own index seed. Counters are kept as is.
    pub fn truncated(&self, n: usize) -> Result<Self> {
        if n > self.len() {
            return Err(PermError::InvalidArgument(format!(
                "requested {n} permutations but only {} are cached",
                self.len()
            )));
        }
        Ok(PermutationCache {
            masks_01: self.masks_01[..n].to_vec(),
            masks_10: self.masks_10[..n].to_vec(),
            total_attempts: self.total_attempts,
            total_restarts: self.total_restarts,
            total_loss_fallbacks: self.total_loss_fallbacks,
        })
    }
}

/// Knobs of a generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Base seed; a random one is drawn (and logged) when absent
    pub seed: Option<u64>,
    pub include_trait_loss: bool,
    pub max_perm_attempts: usize,
    pub max_set_attempts: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            seed: None,
            include_trait_loss: true,
            max_perm_attempts: DEFAULT_MAX_PERM_ATTEMPTS,
            max_set_attempts: DEFAULT_MAX_SET_ATTEMPTS,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_perm_attempts == 0 {
            return Err(PermError::InvalidArgument("max_perm_attempts must be > 0".to_string()));
        }
        if self.max_set_attempts == 0 {
            return Err(PermError::InvalidArgument("max_set_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}

/// One successful trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    pub mask_01: Bitset,
    pub mask_10: Bitset,
    pub attempts: u64,
    pub restarts: u64,
    pub loss_fallback: bool,
}

/// A set could not be filled under the requested constraints. Never leaves
/// this module: the trial restarts instead.
#[derive(Debug, Clone, Copy)]
struct SampleFailure;

/// Immutable sampling context: tree tables, observed bin profiles and limits.
///
/// Shared by reference between workers; nothing in it changes while sampling.
#[derive(Debug, Clone)]
pub struct PermutationSampler {
    tree: Arc<CanonicalTree>,
    include_trait_loss: bool,
    max_perm_attempts: usize,
    max_set_attempts: usize,
    obs_mask_01: Bitset,
    obs_mask_10: Bitset,
    bin_counts_01: [usize; NUM_CLADE_BINS],
    bin_counts_10: [usize; NUM_CLADE_BINS],
    candidates_by_bin: Vec<Vec<usize>>,
}

impl PermutationSampler {
    /// # Errors
    /// `InvalidArgument` when a limit is zero or an observed mask names a
    /// branch index the tree does not have.
    pub fn new(
        tree: Arc<CanonicalTree>,
        obs_mask_01: &Bitset,
        obs_mask_10: &Bitset,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let obs_mask_01 = fit_mask(&tree, obs_mask_01, "observed gain")?;
        let obs_mask_10 = if config.include_trait_loss {
            fit_mask(&tree, obs_mask_10, "observed loss")?
        } else {
            Bitset::zeros(tree.words)
        };

        let bin_counts_01 = bin_counts(&obs_mask_01, &tree.clade_bins);
        let bin_counts_10 = bin_counts(&obs_mask_10, &tree.clade_bins);

        let mut candidates_by_bin = vec![Vec::new(); NUM_CLADE_BINS];
        for (idx, &b) in tree.clade_bins.iter().enumerate() {
            candidates_by_bin[b].push(idx);
        }

        debug!(
            "Sampler over {} branches: gain bins {:?}, loss bins {:?}",
            tree.num_branches(),
            bin_counts_01,
            bin_counts_10
        );

        Ok(PermutationSampler {
            tree,
            include_trait_loss: config.include_trait_loss,
            max_perm_attempts: config.max_perm_attempts,
            max_set_attempts: config.max_set_attempts,
            obs_mask_01,
            obs_mask_10,
            bin_counts_01,
            bin_counts_10,
            candidates_by_bin,
        })
    }

    pub fn tree(&self) -> &CanonicalTree {
        &self.tree
    }

    pub fn obs_mask_01(&self) -> &Bitset {
        &self.obs_mask_01
    }

    /// Observed loss mask, empty when trait loss is not in scope.
    pub fn obs_mask_10(&self) -> &Bitset {
        &self.obs_mask_10
    }

    pub fn include_trait_loss(&self) -> bool {
        self.include_trait_loss
    }

    /// Draw one permutation from the RNG seeded with `seed`.
    ///
    /// Each attempt samples a gain set over all branches, then a loss set over
    /// the strict descendants of that gain set. The loss set falls back to all
    /// branches when the gain set is empty or its descendants lack capacity.
    /// A failed set restarts the whole attempt.
    ///
    /// # Errors
    /// `Infeasible` once `max_perm_attempts` attempts failed.
    pub fn generate_one(&self, seed: u64) -> Result<Trial> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut attempts = 0u64;
        let mut restarts = 0u64;

        for _ in 0..self.max_perm_attempts {
            attempts += 1;
            match self.try_once(&mut rng) {
                Ok((mask_01, mask_10, loss_fallback)) => {
                    return Ok(Trial {
                        mask_01,
                        mask_10,
                        attempts,
                        restarts,
                        loss_fallback,
                    });
                }
                Err(SampleFailure) => restarts += 1,
            }
        }

        Err(PermError::Infeasible(format!(
            "no valid permutation after {} attempts (seed {seed})",
            self.max_perm_attempts
        )))
    }

    fn try_once<R: Rng>(
        &self,
        rng: &mut R,
    ) -> std::result::Result<(Bitset, Bitset, bool), SampleFailure> {
        let tree = &self.tree;
        let mask_01 = self.sample_set(&self.bin_counts_01, &tree.all_mask, rng)?;

        if !self.include_trait_loss || self.obs_mask_10.is_empty() {
            return Ok((mask_01, Bitset::zeros(tree.words), false));
        }

        let mut loss_fallback = false;
        let allowed_10 = if mask_01.is_empty() {
            // Nothing was gained: loss branches are placed independently
            tree.all_mask.clone()
        } else {
            let below_gain = tree.strict_descendants_of(&mask_01);
            if self.has_bin_capacity(&below_gain, &self.bin_counts_10) {
                below_gain
            } else {
                loss_fallback = true;
                tree.all_mask.clone()
            }
        };

        let mask_10 = self.sample_set(&self.bin_counts_10, &allowed_10, rng)?;
        Ok((mask_01, mask_10, loss_fallback))
    }

    /// Pick a conflict-free set with exactly `bin_counts[b]` allowed branches
    /// from every bin `b`.
    ///
    /// Bins are filled hardest first (fewest allowed candidates, then largest
    /// demand). Each bin walks a fresh shuffle of its candidates and greedily
    /// keeps those with no ancestor or descendant already selected.
    fn sample_set<R: Rng>(
        &self,
        bin_counts: &[usize; NUM_CLADE_BINS],
        allowed: &Bitset,
        rng: &mut R,
    ) -> std::result::Result<Bitset, SampleFailure> {
        let words = self.tree.words;
        let target: usize = bin_counts.iter().sum();
        if target == 0 {
            return Ok(Bitset::zeros(words));
        }
        if !self.has_bin_capacity(allowed, bin_counts) {
            return Err(SampleFailure);
        }

        let mut pools: Vec<Vec<usize>> = self
            .candidates_by_bin
            .iter()
            .map(|pool| pool.iter().copied().filter(|&idx| allowed.contains(idx)).collect())
            .collect();

        let mut order: Vec<usize> = (0..NUM_CLADE_BINS).filter(|&b| bin_counts[b] > 0).collect();
        order.sort_by_key(|&b| (pools[b].len(), Reverse(bin_counts[b])));

        let anc = &self.tree.anc_masks;
        let desc = &self.tree.desc_masks;

        'attempt: for _ in 0..self.max_set_attempts {
            let mut selected = Bitset::zeros(words);

            for &b in &order {
                let need = bin_counts[b];
                let pool = &mut pools[b];
                pool.shuffle(rng);

                let mut picked = 0;
                for &idx in pool.iter() {
                    if picked >= need {
                        break;
                    }
                    if anc[idx].intersects(&selected) || desc[idx].intersects(&selected) {
                        continue;
                    }
                    selected.set(idx);
                    picked += 1;
                }

                if picked < need {
                    continue 'attempt;
                }
            }

            if selected.count_ones() == target {
                return Ok(selected);
            }
        }

        Err(SampleFailure)
    }

    /// Every demanded bin has at least as many allowed candidates as it needs.
    fn has_bin_capacity(&self, allowed: &Bitset, bin_counts: &[usize; NUM_CLADE_BINS]) -> bool {
        bin_counts.iter().enumerate().all(|(b, &need)| {
            need == 0 || allowed_count(&self.candidates_by_bin[b], allowed) >= need
        })
    }
}

fn allowed_count(pool: &[usize], allowed: &Bitset) -> usize {
    pool.iter().filter(|&&idx| allowed.contains(idx)).count()
}

/// Copy `mask` onto the tree's word width, rejecting bits past the last branch.
fn fit_mask(tree: &CanonicalTree, mask: &Bitset, what: &str) -> Result<Bitset> {
    let mut out = Bitset::zeros(tree.words);
    for idx in mask.iter_ones() {
        if idx >= tree.num_branches() {
            return Err(PermError::InvalidArgument(format!(
                "{what} mask sets branch index {idx} but the tree has {} branches",
                tree.num_branches()
            )));
        }
        out.set(idx);
    }
    Ok(out)
}

/// Drives many independent trials of a [`PermutationSampler`].
#[derive(Debug, Clone)]
pub struct PermutationGenerator {
    sampler: PermutationSampler,
    seed: Option<u64>,
}

impl PermutationGenerator {
    pub fn new(
        tree: Arc<CanonicalTree>,
        obs_mask_01: &Bitset,
        obs_mask_10: &Bitset,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        let sampler = PermutationSampler::new(tree, obs_mask_01, obs_mask_10, config)?;
        Ok(PermutationGenerator {
            sampler,
            seed: config.seed,
        })
    }

    pub fn sampler(&self) -> &PermutationSampler {
        &self.sampler
    }

    /// Sample `n_perm` permutations on up to `jobs` workers (`0` = all cores).
    ///
    /// Output is identical for any `jobs` given the same seed.
    ///
    /// # Errors
    /// `InvalidArgument` for `n_perm == 0` or `jobs < 0`; `Infeasible` if any
    /// single trial exhausts its attempts (no partial result is returned).
    pub fn generate(&self, n_perm: usize, jobs: i64) -> Result<PermutationCache> {
        if n_perm == 0 {
            return Err(PermError::InvalidArgument("n_perm must be > 0".to_string()));
        }
        let jobs_eff = effective_jobs(jobs)?.min(n_perm);

        let base_seed = match self.seed {
            Some(seed) => seed,
            None => {
                let seed = rand::thread_rng().r#gen::<u64>() >> 1;
                info!("No seed configured, drew base seed {seed}");
                seed
            }
        };

        let chunks = split_indices(n_perm, jobs_eff);
        debug!(
            "Generating {n_perm} permutations in {} chunks on {jobs_eff} workers",
            chunks.len()
        );

        let executor = Executor::probe(jobs_eff);
        let outputs = executor.run(&self.sampler, &chunks, base_seed)?;
        let cache = assemble(outputs, n_perm, self.sampler.tree.words);

        info!(
            "Generated {n_perm} permutations (attempts={}, restarts={}, loss fallbacks={})",
            cache.total_attempts, cache.total_restarts, cache.total_loss_fallbacks
        );
        Ok(cache)
    }
}

/// Resolve the requested worker count.
pub fn effective_jobs(jobs: i64) -> Result<usize> {
    if jobs < 0 {
        return Err(PermError::InvalidArgument("jobs must be >= 0".to_string()));
    }
    if jobs == 0 {
        return Ok(std::thread::available_parallelism().map_or(1, |n| n.get()));
    }
    Ok(jobs as usize)
}

/// Contiguous chunks of `0..n` of size `max(1, n / jobs)`.
pub fn split_indices(n: usize, jobs: usize) -> Vec<Range<usize>> {
    let chunk_size = (n / jobs.max(1)).max(1);
    (0..n)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(n))
        .collect()
}

struct ChunkOutput {
    rows: Vec<(usize, Bitset, Bitset)>,
    attempts: u64,
    restarts: u64,
    loss_fallbacks: u64,
}

fn run_chunk(sampler: &PermutationSampler, chunk: Range<usize>, base_seed: u64) -> Result<ChunkOutput> {
    let mut out = ChunkOutput {
        rows: Vec::with_capacity(chunk.len()),
        attempts: 0,
        restarts: 0,
        loss_fallbacks: 0,
    };
    for idx in chunk {
        let trial = sampler.generate_one(seed_for_index(base_seed, idx as u64))?;
        out.attempts += trial.attempts;
        out.restarts += trial.restarts;
        out.loss_fallbacks += u64::from(trial.loss_fallback);
        out.rows.push((idx, trial.mask_01, trial.mask_10));
    }
    Ok(out)
}

/// Write rows into index positions and sum the counters.
fn assemble(outputs: Vec<ChunkOutput>, n_perm: usize, words: usize) -> PermutationCache {
    let mut cache = PermutationCache {
        masks_01: vec![Bitset::zeros(words); n_perm],
        masks_10: vec![Bitset::zeros(words); n_perm],
        ..Default::default()
    };
    for out in outputs {
        cache.total_attempts += out.attempts;
        cache.total_restarts += out.restarts;
        cache.total_loss_fallbacks += out.loss_fallbacks;
        for (idx, m01, m10) in out.rows {
            cache.masks_01[idx] = m01;
            cache.masks_10[idx] = m10;
        }
    }
    cache
}

/// How chunks are executed. Chosen once per run by [`Executor::probe`];
/// both strategies use the same per-index seeds and give identical output.
enum Executor {
    Sequential,
    Pool(rayon::ThreadPool),
}

impl Executor {
    /// Use a dedicated thread pool for `jobs > 1`, or run inline when the
    /// pool cannot be created.
    fn probe(jobs: usize) -> Self {
        if jobs <= 1 {
            return Executor::Sequential;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("permucn-worker-{i}"))
            .build()
        {
            Ok(pool) => Executor::Pool(pool),
            Err(e) => {
                warn!("Could not start {jobs} worker threads ({e}); generating sequentially");
                Executor::Sequential
            }
        }
    }

    fn run(
        &self,
        sampler: &PermutationSampler,
        chunks: &[Range<usize>],
        base_seed: u64,
    ) -> Result<Vec<ChunkOutput>> {
        match self {
            Executor::Sequential => chunks
                .iter()
                .map(|chunk| run_chunk(sampler, chunk.clone(), base_seed))
                .collect(),
            Executor::Pool(pool) => pool.install(|| {
                chunks
                    .par_iter()
                    .map(|chunk| run_chunk(sampler, chunk.clone(), base_seed))
                    .collect()
            }),
        }
    }
}
