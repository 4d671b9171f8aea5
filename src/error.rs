//! Error taxonomy for tree loading, permutation generation and cache persistence.

use phylotree::tree::TreeError;

/// Errors surfaced by this crate.
///
/// Validation errors are reported before any work starts. `Infeasible` is
/// reported after the sampler exhausted its attempt ceilings and is fatal for
/// the whole generation request.
#[derive(Debug, thiserror::Error)]
pub enum PermError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encountered empty branch key on non-root node id {node}")]
    EmptyBranchKey { node: usize },

    #[error("Duplicate branch key in tree: {0}")]
    DuplicateBranchKey(String),

    #[error("Unknown branch key: {0}")]
    UnknownBranchKey(String),

    #[error("Invalid branch length for {key}: {length}")]
    InvalidBranchLength { key: String, length: f64 },

    #[error("Malformed tree: {0}")]
    MalformedTree(String),

    #[error("Failed to parse Newick: {0}")]
    NewickParse(String),

    #[error("Tree error: {0}")]
    Tree(String),

    #[error(
        "Failed to generate a valid permutation under constraints: {0}. \
         Try reducing n-perm or relaxing constraints."
    )]
    Infeasible(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TreeError> for PermError {
    fn from(e: TreeError) -> Self {
        PermError::Tree(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PermError>;
