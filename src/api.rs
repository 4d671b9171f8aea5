//! Python binding layer for permutation generation.
//!
//! Provides Python functions for sampling null permutations of foreground
//! branch sets on a tree loaded from a NEXUS/Newick file.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use std::sync::Arc;

use crate::error::PermError;
use crate::events::mask_from_keys;
use crate::io::load_canonical_tree;
use crate::permutation::{GeneratorConfig, PermutationGenerator};

fn to_py_err(e: PermError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Sample constrained permutations of observed gain/loss branch sets.
///
/// Args:
///     tree_path: NEXUS file (first TREE entry is used) or plain Newick file
///     gain_keys: Branch keys of observed gain (0->1) events
///     loss_keys: Branch keys of observed loss (1->0) events
///     n_perm: Number of permutations
///     jobs: Worker threads, 0 for all cores (default: 1)
///     seed: Base seed; random when None (default: None)
///     include_trait_loss: Permute losses below gains (default: True)
///     max_perm_attempts: Restarts allowed per permutation (default: 200)
///     max_set_attempts: Attempts allowed per set sample (default: 200)
///
/// Returns:
///     A tuple of (masks_01, masks_10, total_attempts, total_restarts) where
///     masks are lowercase hex strings over the tree's branch indices.
///
/// Raises:
///     ValueError: On invalid input, unknown branch keys, or an infeasible profile
#[pyfunction]
#[pyo3(signature = (
    tree_path,
    gain_keys,
    loss_keys,
    n_perm,
    jobs=1,
    seed=None,
    include_trait_loss=true,
    max_perm_attempts=200,
    max_set_attempts=200,
))]
#[allow(clippy::too_many_arguments)]
fn generate_permutations(
    tree_path: String,
    gain_keys: Vec<String>,
    loss_keys: Vec<String>,
    n_perm: usize,
    jobs: i64,
    seed: Option<u64>,
    include_trait_loss: bool,
    max_perm_attempts: usize,
    max_set_attempts: usize,
) -> PyResult<(Vec<String>, Vec<String>, u64, u64)> {
    let tree = Arc::new(load_canonical_tree(&tree_path).map_err(to_py_err)?);
    let obs_01 = mask_from_keys(&tree, &gain_keys).map_err(to_py_err)?;
    let obs_10 = mask_from_keys(&tree, &loss_keys).map_err(to_py_err)?;

    let config = GeneratorConfig {
        seed,
        include_trait_loss,
        max_perm_attempts,
        max_set_attempts,
    };
    let generator = PermutationGenerator::new(tree, &obs_01, &obs_10, &config).map_err(to_py_err)?;

    let cache = generator.generate(n_perm, jobs).map_err(to_py_err)?;

    Ok((
        cache.masks_01.iter().map(|m| m.to_hex()).collect(),
        cache.masks_10.iter().map(|m| m.to_hex()).collect(),
        cache.total_attempts,
        cache.total_restarts,
    ))
}

/// Branch keys of a tree in branch-index order.
#[pyfunction]
fn branch_keys(tree_path: String) -> PyResult<Vec<String>> {
    let tree = load_canonical_tree(&tree_path).map_err(to_py_err)?;
    Ok(tree.branch_keys)
}

/// Python module definition
#[pymodule]
fn permucn(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(generate_permutations, m)?)?;
    m.add_function(wrap_pyfunction!(branch_keys, m)?)?;
    Ok(())
}
