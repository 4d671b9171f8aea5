//! Foreground masks at the boundary with ancestral-state reconstruction.
//!
//! Reconstruction lives outside this crate; it hands over branch keys or
//! per-branch probabilities, which are turned into masks over the branch
//! index space of a [`CanonicalTree`] here.

use crate::bitset::Bitset;
use crate::error::{PermError, Result};
use crate::tree::{CanonicalTree, NUM_CLADE_BINS};

/// Mask with one bit per listed branch key.
///
/// # Errors
/// `UnknownBranchKey` for a key that is not a branch of `tree` (the root
/// label included).
pub fn mask_from_keys<S: AsRef<str>>(tree: &CanonicalTree, keys: &[S]) -> Result<Bitset> {
    let mut mask = Bitset::zeros(tree.words);
    for key in keys {
        let key = key.as_ref().trim();
        let idx = tree
            .branch_index(key)
            .ok_or_else(|| PermError::UnknownBranchKey(key.to_string()))?;
        mask.set(idx);
    }
    Ok(mask)
}

/// Branch keys of the bits set in `mask`, in branch-index order.
pub fn keys_from_mask<'a>(tree: &'a CanonicalTree, mask: &Bitset) -> Vec<&'a str> {
    mask.iter_ones()
        .filter_map(|idx| tree.branch_keys.get(idx).map(String::as_str))
        .collect()
}

/// Mask of branches whose p-value is below `alpha`. NaN entries are skipped;
/// a missing vector gives the empty mask.
///
/// # Errors
/// `InvalidArgument` when there are more p-values than branches.
pub fn build_significance_mask(
    tree: &CanonicalTree,
    p_values: Option<&[f64]>,
    alpha: f64,
) -> Result<Bitset> {
    let mut mask = Bitset::zeros(tree.words);
    let Some(p_values) = p_values else {
        return Ok(mask);
    };
    if p_values.len() > tree.num_branches() {
        return Err(PermError::InvalidArgument(format!(
            "{} p-values given for {} branches",
            p_values.len(),
            tree.num_branches()
        )));
    }
    for (idx, &p) in p_values.iter().enumerate() {
        if !p.is_nan() && p < alpha {
            mask.set(idx);
        }
    }
    Ok(mask)
}

/// Number of set branches in each clade bin.
pub fn bin_counts(mask: &Bitset, clade_bins: &[usize]) -> [usize; NUM_CLADE_BINS] {
    let mut out = [0usize; NUM_CLADE_BINS];
    for idx in mask.iter_ones() {
        out[clade_bins[idx]] += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::toy_tree;

    #[test]
    fn test_mask_from_keys() {
        let tree = toy_tree();
        let mask = mask_from_keys(&tree, &["<2>", " A"]).unwrap();
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(keys_from_mask(&tree, &mask), vec!["A", "<2>"]);

        let empty: [&str; 0] = [];
        assert!(mask_from_keys(&tree, &empty).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let tree = toy_tree();
        assert!(matches!(
            mask_from_keys(&tree, &["<6>"]),
            Err(PermError::UnknownBranchKey(k)) if k == "<6>"
        ));
    }

    #[test]
    fn test_significance_mask() {
        let tree = toy_tree();
        let p = [0.01, f64::NAN, 0.2, 0.049, 0.05];
        let mask = build_significance_mask(&tree, Some(&p), 0.05).unwrap();
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![0, 3]);
        assert!(build_significance_mask(&tree, None, 0.05).unwrap().is_empty());
    }

    #[test]
    fn test_significance_mask_longer_than_tree() {
        let tree = toy_tree();
        let full = [0.01; 6];
        assert_eq!(
            build_significance_mask(&tree, Some(&full), 0.05).unwrap(),
            tree.all_mask
        );

        // A seventh value would name a branch the tree does not have
        let extra = [0.01; 7];
        assert!(matches!(
            build_significance_mask(&tree, Some(&extra), 0.05),
            Err(PermError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bin_counts() {
        let tree = toy_tree();
        let mask = mask_from_keys(&tree, &["<2>", "C", "D"]).unwrap();
        let counts = bin_counts(&mask, &tree.clade_bins);
        assert_eq!(counts, [2, 1, 0, 0, 0, 0, 0, 0]);
    }
}
