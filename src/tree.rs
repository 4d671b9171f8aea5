//! Canonical branch model of a rooted phylogeny.
//!
//! # Overview
//! Every non-root node owns the branch leading to it from its parent. Those
//! branches get a stable zero-based index (ascending node id, root skipped)
//! and per-branch tables are precomputed once:
//!
//! - descendant mask: branches in the subtree below the branch, itself included
//! - ancestor mask: branches on the path from the branch's parent node up to the root
//! - clade size: number of tips below the branch
//! - clade bin: log2-scaled category of the clade size
//!
//! ```text
//!            <6> (root, no branch)
//!           /    \
//!         <2>    <5>
//!         / \    / \
//!        A   B  C   D
//!
//! node ids  : A=0 B=1 <2>=2 C=3 D=4 <5>=5 <6>=6
//! branches  : A=0 B=1 <2>=2 C=3 D=4 <5>=5
//! desc(<2>) : {A, B, <2>}      anc(A) : {<2>}
//! ```
//!
//! All traversals are iterative, so very deep (caterpillar) trees are fine.

use crate::bitset::Bitset;
use crate::error::{PermError, Result};
use std::collections::HashMap;

/// Number of clade-size bins (see [`clade_bin`]).
pub const NUM_CLADE_BINS: usize = 8;

/// A parsed tree as handed over by a parser: one entry per node.
///
/// Node ids are positions in the vectors. Children must be listed by their
/// parent; the parent relation is derived from them.
#[derive(Debug, Clone, Default)]
pub struct RawTree {
    pub root: usize,
    pub labels: Vec<String>,
    pub lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
}

impl RawTree {
    /// Appends a node and returns its id. Children must already exist.
    ///
    /// Building bottom-up gives the postorder node numbering a Newick parser
    /// produces, which is what fixes the branch indices.
    pub fn push_node(&mut self, label: &str, length: f64, children: Vec<usize>) -> usize {
        let id = self.labels.len();
        self.labels.push(label.to_string());
        self.lengths.push(length);
        self.children.push(children);
        id
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Immutable branch-indexed view of a tree.
///
/// # Invariants
/// For branches `i != j`: `j` is an ancestor of `i` iff `anc_masks[i]`
/// contains `j` iff `desc_masks[j]` contains `i`.
#[derive(Debug, Clone)]
pub struct CanonicalTree {
    pub root: usize,
    pub labels: Vec<String>,
    pub branch_key_by_node: Vec<String>,
    pub parent_by_node: Vec<Option<usize>>,
    pub children_by_node: Vec<Vec<usize>>,
    pub branch_length_by_node: Vec<f64>,
    /// Species name for tips, `None` for internal nodes
    pub tip_species_by_node: Vec<Option<String>>,

    pub node_by_branch: Vec<usize>,
    pub branch_keys: Vec<String>,
    pub branch_index_by_key: HashMap<String, usize>,

    /// Subtree branches, including the branch itself
    pub desc_masks: Vec<Bitset>,
    /// Strict ancestor branches
    pub anc_masks: Vec<Bitset>,
    pub clade_sizes: Vec<usize>,
    pub clade_bins: Vec<usize>,

    /// Exactly one bit per branch
    pub all_mask: Bitset,
    /// Number of u64 words in every mask of this tree
    pub words: usize,
}

impl CanonicalTree {
    /// Build the branch model from a parsed tree.
    ///
    /// # Algorithm
    /// 1. Derive parents from children lists, rejecting shared children
    /// 2. Assign branch indices to non-root nodes in ascending node id,
    ///    rejecting empty or duplicate branch keys
    /// 3. Postorder pass: tip counts and descendant masks, bottom-up
    /// 4. Preorder pass: ancestor masks, top-down (`anc(child) = anc(parent) ∪ {parent}`)
    ///
    /// # Errors
    /// `MalformedTree` for out-of-range ids, multiple parents or unreachable
    /// nodes; `EmptyBranchKey` / `DuplicateBranchKey` for bad labels.
    pub fn from_raw(raw: &RawTree) -> Result<Self> {
        let n = raw.len();
        if raw.lengths.len() != n || raw.children.len() != n {
            return Err(PermError::MalformedTree(
                "labels, lengths and children must have one entry per node".to_string(),
            ));
        }
        if raw.root >= n {
            return Err(PermError::MalformedTree(format!(
                "root id {} out of range for {} nodes",
                raw.root, n
            )));
        }

        // Step 1: parents
        let mut parent_by_node: Vec<Option<usize>> = vec![None; n];
        for (node_id, children) in raw.children.iter().enumerate() {
            for &child in children {
                if child >= n {
                    return Err(PermError::MalformedTree(format!(
                        "child id {child} of node {node_id} out of range"
                    )));
                }
                if child == raw.root || parent_by_node[child].is_some() {
                    return Err(PermError::MalformedTree(format!(
                        "node {child} has more than one parent"
                    )));
                }
                parent_by_node[child] = Some(node_id);
            }
        }

        let labels = raw.labels.clone();
        let branch_key_by_node: Vec<String> =
            labels.iter().map(|l| branch_key_from_label(l)).collect();
        let tip_species_by_node: Vec<Option<String>> = (0..n)
            .map(|id| {
                if raw.children[id].is_empty() {
                    tip_species_from_branch_key(&branch_key_by_node[id])
                } else {
                    None
                }
            })
            .collect();

        // Step 2: branch indices
        let mut node_by_branch = Vec::with_capacity(n.saturating_sub(1));
        let mut branch_keys = Vec::with_capacity(n.saturating_sub(1));
        let mut branch_index_by_key = HashMap::with_capacity(n);
        let mut branch_by_node: Vec<Option<usize>> = vec![None; n];
        for node_id in (0..n).filter(|&id| id != raw.root) {
            let key = &branch_key_by_node[node_id];
            if key.is_empty() {
                return Err(PermError::EmptyBranchKey { node: node_id });
            }
            if branch_index_by_key.contains_key(key) {
                return Err(PermError::DuplicateBranchKey(key.clone()));
            }
            let idx = node_by_branch.len();
            node_by_branch.push(node_id);
            branch_keys.push(key.clone());
            branch_index_by_key.insert(key.clone(), idx);
            branch_by_node[node_id] = Some(idx);
        }

        let m = node_by_branch.len();
        let words = m.div_ceil(64);

        // Step 3: tips and descendant masks
        let order = postorder(raw.root, &raw.children);
        if order.len() != n {
            return Err(PermError::MalformedTree(format!(
                "{} of {} nodes are not reachable from the root",
                n - order.len(),
                n
            )));
        }

        let mut tips_by_node = vec![0usize; n];
        let mut desc_by_node: Vec<Bitset> = vec![Bitset::zeros(words); n];
        for &node_id in &order {
            let children = &raw.children[node_id];
            let mut mask = Bitset::zeros(words);
            if let Some(idx) = branch_by_node[node_id] {
                mask.set(idx);
            }
            if children.is_empty() {
                tips_by_node[node_id] = 1;
            } else {
                tips_by_node[node_id] = children.iter().map(|&c| tips_by_node[c]).sum();
                for &child in children {
                    mask.or_assign(&desc_by_node[child]);
                }
            }
            desc_by_node[node_id] = mask;
        }

        // Step 4: ancestor masks, parents before children
        let mut anc_by_node: Vec<Bitset> = vec![Bitset::zeros(words); n];
        for &node_id in order.iter().rev() {
            let Some(parent) = parent_by_node[node_id] else {
                continue;
            };
            let mut anc = anc_by_node[parent].clone();
            if let Some(pidx) = branch_by_node[parent] {
                anc.set(pidx);
            }
            anc_by_node[node_id] = anc;
        }

        let desc_masks: Vec<Bitset> = node_by_branch
            .iter()
            .map(|&node| desc_by_node[node].clone())
            .collect();
        let anc_masks: Vec<Bitset> = node_by_branch
            .iter()
            .map(|&node| anc_by_node[node].clone())
            .collect();
        let clade_sizes: Vec<usize> = node_by_branch.iter().map(|&node| tips_by_node[node]).collect();
        let clade_bins: Vec<usize> = clade_sizes.iter().map(|&s| clade_bin(s)).collect();

        Ok(CanonicalTree {
            root: raw.root,
            labels,
            branch_key_by_node,
            parent_by_node,
            children_by_node: raw.children.clone(),
            branch_length_by_node: raw.lengths.clone(),
            tip_species_by_node,
            node_by_branch,
            branch_keys,
            branch_index_by_key,
            desc_masks,
            anc_masks,
            clade_sizes,
            clade_bins,
            all_mask: Bitset::full(m),
            words,
        })
    }

    pub fn num_branches(&self) -> usize {
        self.node_by_branch.len()
    }

    pub fn branch_index(&self, key: &str) -> Option<usize> {
        self.branch_index_by_key.get(key).copied()
    }

    /// Length of the branch with index `idx`.
    pub fn branch_length(&self, idx: usize) -> f64 {
        self.branch_length_by_node[self.node_by_branch[idx]]
    }

    /// Union of the descendant masks of every branch in `mask`, minus `mask` itself.
    pub fn strict_descendants_of(&self, mask: &Bitset) -> Bitset {
        let mut out = Bitset::zeros(self.words);
        for idx in mask.iter_ones() {
            out.or_assign(&self.desc_masks[idx]);
        }
        out.and_not_assign(mask);
        out
    }

    /// Check branch lengths for length-sensitive consumers.
    ///
    /// Lengths must be finite and non-negative; with `strictly_positive` they
    /// must also be > 0.
    pub fn validate_lengths(&self, strictly_positive: bool) -> Result<()> {
        for (idx, key) in self.branch_keys.iter().enumerate() {
            let length = self.branch_length(idx);
            let bad = !length.is_finite() || length < 0.0 || (strictly_positive && length <= 0.0);
            if bad {
                return Err(PermError::InvalidBranchLength {
                    key: key.clone(),
                    length,
                });
            }
        }
        Ok(())
    }
}

/// Iterative postorder over the subtree of `root`, children in listed order.
fn postorder(root: usize, children: &[Vec<usize>]) -> Vec<usize> {
    let mut out = Vec::with_capacity(children.len());
    let mut visited = vec![false; children.len()];
    // (node, next child position)
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    visited[root] = true;
    while let Some(top) = stack.last_mut() {
        let (node, pos) = *top;
        if let Some(&child) = children[node].get(pos) {
            top.1 += 1;
            if !visited[child] {
                visited[child] = true;
                stack.push((child, 0));
            }
        } else {
            out.push(node);
            stack.pop();
        }
    }
    out
}

/// Log2 clade-size bin: 1→0, 2→1, 3–4→2, 5–8→3, 9–16→4, 17–32→5, 33–64→6, ≥65→7.
///
/// A size of 0 never occurs for a reachable branch and maps to bin 0.
pub fn clade_bin(size: usize) -> usize {
    if size <= 1 {
        return 0;
    }
    let ceil_log2 = (size - 1).ilog2() as usize + 1;
    ceil_log2.min(NUM_CLADE_BINS - 1)
}

/// Strip a trailing `_<digits>` state suffix from a node label.
///
/// `"Acanthochromis_polyacanthus<66>_1"` → `"Acanthochromis_polyacanthus<66>"`
pub fn branch_key_from_label(label: &str) -> String {
    let label = label.trim();
    if let Some((head, tail)) = label.rsplit_once('_') {
        if !head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return head.to_string();
        }
    }
    label.to_string()
}

/// Species name of a tip-like branch key.
///
/// `"Acanthochromis_polyacanthus<66>"` → `Some("Acanthochromis_polyacanthus")`,
/// `"<12>"` → `None`, `"Danio"` → `Some("Danio")`.
pub fn tip_species_from_branch_key(branch_key: &str) -> Option<String> {
    if let Some(head) = branch_key.strip_suffix('>') {
        if let Some(open) = head.rfind('<') {
            let tag = &head[open + 1..];
            if !tag.is_empty() && tag.bytes().all(|b| b.is_ascii_digit()) {
                let species = &head[..open];
                return (!species.is_empty()).then(|| species.to_string());
            }
        }
    }
    (!branch_key.is_empty()).then(|| branch_key.to_string())
}
