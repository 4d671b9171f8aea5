//! Persisted permutation caches.
//!
//! A bundle stores up to two stages of permutations (`initial`, `refine`)
//! together with what they were sampled for: the tree's branch ordering, the
//! observed foreground masks and whether trait loss was in scope. A bundle is
//! only reused when all of those match. Masks are stored as lowercase hex.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bitset::Bitset;
use crate::error::Result;
use crate::permutation::PermutationCache;
use crate::tree::CanonicalTree;

pub const CACHE_VERSION: u32 = 1;

/// Added to the base seed for the `refine` stage, so its permutations are
/// drawn independently of `initial`.
pub const REFINE_SEED_OFFSET: u64 = 7919;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initial,
    Refine,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Refine => "refine",
        }
    }

    /// Base seed used to sample this stage. `None` stays `None`.
    pub fn seed(self, base_seed: Option<u64>) -> Option<u64> {
        match self {
            Stage::Initial => base_seed,
            Stage::Refine => base_seed.map(|s| s.wrapping_add(REFINE_SEED_OFFSET)),
        }
    }
}

/// What a cached permutation set must have been sampled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMatchSpec {
    pub tree_fingerprint: String,
    pub include_trait_loss: bool,
    pub fg_01_mask: Bitset,
    pub fg_10_mask: Bitset,
}

/// SHA-256 (hex) of the branch keys in index order, one per line.
pub fn tree_fingerprint(tree: &CanonicalTree) -> String {
    let payload = tree.branch_keys.join("\n");
    Sha256::digest(payload.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn make_cache_spec(
    tree: &CanonicalTree,
    include_trait_loss: bool,
    fg_01_mask: &Bitset,
    fg_10_mask: &Bitset,
) -> CacheMatchSpec {
    CacheMatchSpec {
        tree_fingerprint: tree_fingerprint(tree),
        include_trait_loss,
        fg_01_mask: fg_01_mask.clone(),
        fg_10_mask: fg_10_mask.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub n_perm: usize,
    pub masks_01_hex: Vec<String>,
    pub masks_10_hex: Vec<String>,
    #[serde(default)]
    pub total_attempts: u64,
    #[serde(default)]
    pub total_restarts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBundle {
    pub fg_01_mask_hex: String,
    pub fg_10_mask_hex: String,
    #[serde(default)]
    pub include_trait_loss: bool,
    #[serde(default)]
    pub initial: Option<StageEntry>,
    #[serde(default)]
    pub refine: Option<StageEntry>,
    pub tree_fingerprint: String,
    pub version: u32,
}

impl CacheBundle {
    /// A bundle for `spec` with no stages filled.
    pub fn empty(spec: &CacheMatchSpec) -> Self {
        CacheBundle {
            fg_01_mask_hex: spec.fg_01_mask.to_hex(),
            fg_10_mask_hex: spec.fg_10_mask.to_hex(),
            include_trait_loss: spec.include_trait_loss,
            initial: None,
            refine: None,
            tree_fingerprint: spec.tree_fingerprint.clone(),
            version: CACHE_VERSION,
        }
    }

    pub fn is_compatible(&self, spec: &CacheMatchSpec) -> bool {
        self.version == CACHE_VERSION
            && self.tree_fingerprint == spec.tree_fingerprint
            && self.include_trait_loss == spec.include_trait_loss
            && self.fg_01_mask_hex == spec.fg_01_mask.to_hex()
            && self.fg_10_mask_hex == spec.fg_10_mask.to_hex()
    }

    fn slot(&self, stage: Stage) -> Option<&StageEntry> {
        match stage {
            Stage::Initial => self.initial.as_ref(),
            Stage::Refine => self.refine.as_ref(),
        }
    }

    /// The first `n_required` cached permutations of `stage`, decoded into
    /// masks of `words` words.
    ///
    /// `None` when the stage is missing, holds fewer entries, or an entry does
    /// not decode.
    pub fn get_stage(&self, stage: Stage, n_required: usize, words: usize) -> Option<PermutationCache> {
        let entry = self.slot(stage)?;
        if entry.n_perm < n_required
            || entry.masks_01_hex.len() < n_required
            || entry.masks_10_hex.len() < n_required
        {
            return None;
        }

        let decode = |hex: &[String]| -> Option<Vec<Bitset>> {
            hex[..n_required]
                .iter()
                .map(|h| Bitset::from_hex(h, words))
                .collect()
        };

        Some(PermutationCache {
            masks_01: decode(&entry.masks_01_hex)?,
            masks_10: decode(&entry.masks_10_hex)?,
            total_attempts: entry.total_attempts,
            total_restarts: entry.total_restarts,
            total_loss_fallbacks: 0,
        })
    }

    pub fn put_stage(&mut self, stage: Stage, cache: &PermutationCache) {
        let entry = StageEntry {
            n_perm: cache.len(),
            masks_01_hex: cache.masks_01.iter().map(Bitset::to_hex).collect(),
            masks_10_hex: cache.masks_10.iter().map(Bitset::to_hex).collect(),
            total_attempts: cache.total_attempts,
            total_restarts: cache.total_restarts,
        };
        match stage {
            Stage::Initial => self.initial = Some(entry),
            Stage::Refine => self.refine = Some(entry),
        }
    }
}

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

/// Read a bundle from JSON, or gzip-compressed JSON for `.gz` paths.
pub fn load_bundle<P: AsRef<Path>>(path: P) -> Result<CacheBundle> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let bundle = if is_gz(path) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    Ok(bundle)
}

/// Write a bundle, creating parent directories as needed.
pub fn save_bundle<P: AsRef<Path>>(path: P, bundle: &CacheBundle) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    if is_gz(path) {
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut enc, bundle)?;
        writeln!(enc)?;
        enc.finish()?.flush()?;
    } else {
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, bundle)?;
        writeln!(out)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::mask_from_keys;
    use crate::permutation::{GeneratorConfig, PermutationGenerator};
    use crate::tree::tests::toy_tree;
    use std::sync::Arc;

    fn mask(bits: u64) -> Bitset {
        Bitset(vec![bits])
    }

    fn sample_cache() -> PermutationCache {
        PermutationCache {
            masks_01: vec![mask(0b1), mask(0b10), mask(0b100)],
            masks_10: vec![mask(0b0), mask(0b1), mask(0b0)],
            total_attempts: 12,
            total_restarts: 3,
            total_loss_fallbacks: 1,
        }
    }

    #[test]
    fn test_cache_roundtrip_and_slice() {
        let tree = toy_tree();
        let spec = make_cache_spec(&tree, true, &mask(0b1010), &mask(0b0100));
        let mut bundle = CacheBundle::empty(&spec);
        bundle.put_stage(Stage::Initial, &sample_cache());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("perm_cache.json.gz");
        save_bundle(&path, &bundle).unwrap();

        let loaded = load_bundle(&path).unwrap();
        assert_eq!(loaded, bundle);
        assert!(loaded.is_compatible(&spec));

        let got2 = loaded.get_stage(Stage::Initial, 2, tree.words).unwrap();
        assert_eq!(got2.masks_01, vec![mask(0b1), mask(0b10)]);
        assert_eq!(got2.masks_10, vec![mask(0b0), mask(0b1)]);
        assert_eq!(got2.total_attempts, 12);
        assert_eq!(got2.total_restarts, 3);

        assert!(loaded.get_stage(Stage::Initial, 4, tree.words).is_none());
        assert!(loaded.get_stage(Stage::Refine, 1, tree.words).is_none());
    }

    #[test]
    fn test_plain_json_layout() {
        let tree = toy_tree();
        let spec = make_cache_spec(&tree, false, &mask(0b100), &mask(0));
        let mut bundle = CacheBundle::empty(&spec);
        bundle.put_stage(Stage::Refine, &sample_cache());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm_cache.json");
        save_bundle(&path, &bundle).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["fg_01_mask_hex"], "4");
        assert_eq!(value["fg_10_mask_hex"], "0");
        assert_eq!(value["initial"], serde_json::Value::Null);
        assert_eq!(value["refine"]["n_perm"], 3);
        assert_eq!(value["refine"]["masks_01_hex"][2], "4");
    }

    #[test]
    fn test_incompatible_bundles() {
        let tree = toy_tree();
        let spec = make_cache_spec(&tree, true, &mask(0b1), &mask(0));
        let bundle = CacheBundle::empty(&spec);

        let other_loss = make_cache_spec(&tree, false, &mask(0b1), &mask(0));
        assert!(!bundle.is_compatible(&other_loss));

        let other_fg = make_cache_spec(&tree, true, &mask(0b10), &mask(0));
        assert!(!bundle.is_compatible(&other_fg));

        let mut old = bundle.clone();
        old.version = 0;
        assert!(!old.is_compatible(&spec));

        let mut other_tree = bundle.clone();
        other_tree.tree_fingerprint = "deadbeef".to_string();
        assert!(!other_tree.is_compatible(&spec));
    }

    #[test]
    fn test_undecodable_stage_is_ignored() {
        let tree = toy_tree();
        let spec = make_cache_spec(&tree, true, &mask(0), &mask(0));
        let mut bundle = CacheBundle::empty(&spec);
        bundle.put_stage(Stage::Initial, &sample_cache());
        if let Some(entry) = bundle.initial.as_mut() {
            entry.masks_10_hex[1] = "not-hex".to_string();
        }
        assert!(bundle.get_stage(Stage::Initial, 1, tree.words).is_some());
        assert!(bundle.get_stage(Stage::Initial, 2, tree.words).is_none());
    }

    #[test]
    fn test_fingerprint_tracks_branch_order() {
        let tree = toy_tree();
        let fp = tree_fingerprint(&tree);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, tree_fingerprint(&toy_tree()));

        let mut renamed = toy_tree();
        renamed.branch_keys.swap(0, 1);
        assert_ne!(fp, tree_fingerprint(&renamed));
    }

    #[test]
    fn test_stage_seeds() {
        assert_eq!(Stage::Initial.seed(Some(5)), Some(5));
        assert_eq!(Stage::Refine.seed(Some(5)), Some(5 + REFINE_SEED_OFFSET));
        assert_eq!(Stage::Refine.seed(Some(u64::MAX)), Some(REFINE_SEED_OFFSET - 1));
        assert_eq!(Stage::Initial.seed(None), None);
        assert_eq!(Stage::Refine.seed(None), None);
    }

    #[test]
    fn test_refine_stage_draws_other_permutations() {
        let tree = Arc::new(toy_tree());
        let gain = mask_from_keys(&tree, &["A"]).unwrap();
        let loss = Bitset::zeros(tree.words);
        let generate = |stage: Stage| {
            let config = GeneratorConfig {
                seed: stage.seed(Some(5)),
                include_trait_loss: false,
                ..Default::default()
            };
            PermutationGenerator::new(Arc::clone(&tree), &gain, &loss, &config)
                .unwrap()
                .generate(40, 1)
                .unwrap()
        };
        let initial = generate(Stage::Initial);
        let refine = generate(Stage::Refine);
        assert_eq!(initial, generate(Stage::Initial));
        assert_ne!(initial.masks_01, refine.masks_01);
    }

    #[test]
    fn test_spec_keeps_observed_loss_when_loss_ignored() {
        // The bundle records what was observed, not what the sampler used
        let tree = toy_tree();
        let loss = mask_from_keys(&tree, &["A"]).unwrap();
        let spec = make_cache_spec(&tree, false, &mask(0b100), &loss);
        let bundle = CacheBundle::empty(&spec);
        assert_eq!(bundle.fg_10_mask_hex, "1");
        assert!(!bundle.include_trait_loss);

        let zeroed = make_cache_spec(&tree, false, &mask(0b100), &mask(0));
        assert!(!bundle.is_compatible(&zeroed));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_bundle(dir.path().join("absent.json")).is_err());
    }
}
