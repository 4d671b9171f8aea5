//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: fixed-width bitset used for every branch mask.
//! - `tree`: canonical branch model (indices, masks, clade bins).
//! - `io`: reading the first tree of a NEXUS/Newick file.
//! - `events`: foreground masks from branch keys or p-values.
//! - `permutation`: null permutation sampler and parallel generator.
//! - `cache`: persisted permutation caches.
//! - `error`: crate error type.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod error;
pub mod tree;
pub mod io;
pub mod events;
pub mod permutation;
pub mod cache;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use error::{PermError, Result};
pub use io::load_canonical_tree;
pub use permutation::{GeneratorConfig, PermutationCache, PermutationGenerator};
pub use tree::{CanonicalTree, RawTree};
