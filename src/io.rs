use std::fs;
use std::path::Path;
use std::collections::HashMap;
use std::io::{self, Write};

use phylotree::tree::Tree as PhyloTree;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{PermError, Result};
use crate::events::keys_from_mask;
use crate::permutation::PermutationCache;
use crate::tree::{CanonicalTree, RawTree};

/// Strip BEAST-style annotations from Newick strings.
///
/// Annotations like :[&rate=0.123]2.45 are removed while the branch length
/// is preserved.
fn strip_beast_annotations(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut in_annotation = false;
    let mut chars = newick.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '[' && chars.peek() == Some(&'&') {
            in_annotation = true;
        } else if ch == ']' && in_annotation {
            in_annotation = false;
        } else if !in_annotation {
            result.push(ch);
        }
    }

    result
}

/// Drop whitespace around Newick punctuation so labels come out trimmed.
/// Whitespace inside a label is kept.
fn trim_newick_tokens(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut token = String::new();
    for ch in newick.chars() {
        if matches!(ch, '(' | ')' | ',' | ':' | ';') {
            result.push_str(token.trim());
            token.clear();
            result.push(ch);
        } else {
            token.push(ch);
        }
    }
    result.push_str(token.trim());
    result
}

/// Extract the first `TREE name = ...;` entry of a NEXUS file.
///
/// The entry may span several lines. A file without NEXUS blocks whose
/// content starts with `(` is taken as plain Newick.
pub fn read_first_tree_newick<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;

    let mut lines = content
        .lines()
        .skip_while(|line| !(line.to_ascii_uppercase().contains("TREE") && line.contains('=')));

    let mut chunks: Vec<&str> = Vec::new();
    if let Some(first) = lines.next() {
        // STRUCTURE:
        //   TREE t1 = ((A<0>_0:1.0,B<1>_1:1.0)<2>_0:1.0, ...
        let after = first.split_once('=').map(|(_, body)| body.trim()).unwrap_or_default();
        chunks.push(after);
        if !after.contains(';') {
            for line in lines {
                let part = line.trim();
                chunks.push(part);
                if part.contains(';') {
                    break;
                }
            }
        }
    } else if content.trim_start().starts_with('(') {
        chunks.push(content.trim());
    } else {
        return Err(PermError::MalformedTree(format!(
            "No TREE entry found in: {}",
            path.display()
        )));
    }

    let text = chunks.join(" ");
    let Some(semi) = text.find(';') else {
        return Err(PermError::MalformedTree(format!(
            "Malformed TREE entry (missing ';') in: {}",
            path.display()
        )));
    };
    Ok(text[..=semi].to_string())
}

/// Parse a Newick string with `phylotree` into a [`RawTree`].
///
/// Node ids are assigned in postorder (children left to right, then the
/// parent), matching a recursive-descent Newick parser. Missing branch
/// lengths become NaN and missing names the empty string.
pub fn parse_newick(newick: &str) -> Result<RawTree> {
    let cleaned = trim_newick_tokens(&strip_beast_annotations(newick));
    let tree = PhyloTree::from_newick(&cleaned).map_err(|e| PermError::NewickParse(e.to_string()))?;
    raw_tree_from_phylotree(&tree)
}

/// Convert a `phylotree` tree without recursion.
pub fn raw_tree_from_phylotree(tree: &PhyloTree) -> Result<RawTree> {
    let root = tree.get_root()?;
    let mut raw = RawTree::default();
    let mut dense_id: HashMap<usize, usize> = HashMap::new();

    // (phylotree node id, children already emitted)
    let mut stack = vec![(root, false)];
    while let Some((node_id, expanded)) = stack.pop() {
        let node = tree.get(&node_id)?;
        if expanded || node.children.is_empty() {
            let children = node
                .children
                .iter()
                .map(|child| {
                    dense_id.get(child).copied().ok_or_else(|| {
                        PermError::MalformedTree(format!("child {child} visited after its parent"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let id = raw.push_node(
                node.name.as_deref().unwrap_or_default(),
                node.parent_edge.unwrap_or(f64::NAN),
                children,
            );
            dense_id.insert(node_id, id);
        } else {
            stack.push((node_id, true));
            for &child in node.children.iter().rev() {
                stack.push((child, false));
            }
        }
    }

    raw.root = dense_id
        .get(&root)
        .copied()
        .ok_or_else(|| PermError::MalformedTree("root was never visited".to_string()))?;
    Ok(raw)
}

/// Read the first tree of a NEXUS/Newick file and build its branch model.
pub fn load_canonical_tree<P: AsRef<Path>>(path: P) -> Result<CanonicalTree> {
    let newick = read_first_tree_newick(path)?;
    let raw = parse_newick(&newick)?;
    CanonicalTree::from_raw(&raw)
}

/// Write permutations as TSV: index, hex gain mask, hex loss mask, and the
/// branch keys of both sets (comma separated).
/// If `path` ends with `.gz`, the output is gzip-compressed.
/// `-` (stdout) is not supported.
pub fn write_permutations_tsv<P: AsRef<Path>>(
    path: P,
    tree: &CanonicalTree,
    cache: &PermutationCache,
) -> io::Result<()> {
    use std::fs::File;
    use std::io::BufWriter;

    let p = path.as_ref();
    if p.as_os_str() == "-" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "writing to stdout is not supported by write_permutations_tsv",
        ));
    }

    let is_gz = p.to_string_lossy().ends_with(".gz");
    let f = File::create(p)?;

    if is_gz {
        let mut enc = GzEncoder::new(BufWriter::new(f), Compression::default());
        write_permutation_rows(&mut enc, tree, cache)?;
        // finish() writes the gzip trailer; dropping would hide its errors
        enc.finish()?.flush()
    } else {
        let mut out = BufWriter::new(f);
        write_permutation_rows(&mut out, tree, cache)?;
        out.flush()
    }
}

fn write_permutation_rows<W: Write>(
    out: &mut W,
    tree: &CanonicalTree,
    cache: &PermutationCache,
) -> io::Result<()> {
    writeln!(out, "perm\tmask_01\tmask_10\tkeys_01\tkeys_10")?;
    for (i, (m01, m10)) in cache.masks_01.iter().zip(&cache.masks_10).enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            i,
            m01.to_hex(),
            m10.to_hex(),
            keys_from_mask(tree, m01).join(","),
            keys_from_mask(tree, m10).join(","),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    const NEXUS: &str = "#nexus
BEGIN TREES;
  TREE t1 = ((A<0>_0:1.0,B<1>_1:1.0)<2>_0:1.0,(C<3>_1:1.0,D<4>_0:1.0)<5>_1:1.0)<6>_0;
END;
";

    fn write_tmp(dir: &tempfile::TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, text).unwrap();
        p
    }

    #[test]
    fn test_strip_annotations_and_trim() {
        assert_eq!(
            strip_beast_annotations("(A:[&rate=0.1]1.0,B:2.0);"),
            "(A:1.0,B:2.0);"
        );
        assert_eq!(trim_newick_tokens("( A : 1.0 , B b :2 ) r ;"), "(A:1.0,B b:2)r;");
    }

    #[test]
    fn test_read_first_tree_multiline() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_tmp(
            &dir,
            "multi.tre",
            "#NEXUS\nBEGIN TREES;\n  TREE a = ((A:1,B:1)\n   x:1,C:1)r;\n  TREE b = (Z:1,Y:1);\nEND;\n",
        );
        assert_eq!(read_first_tree_newick(&p).unwrap(), "((A:1,B:1) x:1,C:1)r;");
    }

    #[test]
    fn test_read_first_tree_errors() {
        let dir = tempfile::tempdir().unwrap();
        let none = write_tmp(&dir, "none.tre", "#NEXUS\nBEGIN TREES;\nEND;\n");
        assert!(matches!(read_first_tree_newick(&none), Err(PermError::MalformedTree(_))));

        let open = write_tmp(&dir, "open.tre", "TREE t = (A:1,B:1)\n");
        assert!(matches!(read_first_tree_newick(&open), Err(PermError::MalformedTree(_))));

        assert!(matches!(
            read_first_tree_newick(dir.path().join("missing.tre")),
            Err(PermError::Io(_))
        ));
    }

    #[test]
    fn test_plain_newick_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_tmp(&dir, "plain.nwk", "((A:1,B:1)n1:1,C:1)root;\n");
        let tree = load_canonical_tree(&p).unwrap();
        assert_eq!(tree.branch_keys, vec!["A", "B", "n1", "C"]);
    }

    #[test]
    fn test_parse_newick_postorder_ids() {
        let raw = parse_newick("((A:1.5,B:1.0)n2:0.5,(C:1.0,D:1.0)n5:1.0)n6;").unwrap();
        assert_eq!(raw.labels, vec!["A", "B", "n2", "C", "D", "n5", "n6"]);
        assert_eq!(raw.root, 6);
        assert_eq!(raw.children[2], vec![0, 1]);
        assert_eq!(raw.children[6], vec![2, 5]);
        assert_eq!(raw.lengths[0], 1.5);
        assert!(raw.lengths[6].is_nan());
    }

    #[test]
    fn test_load_cafe_style_tree() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_tmp(&dir, "toy.tre", NEXUS);
        let tree = load_canonical_tree(&p).unwrap();

        assert_eq!(
            tree.branch_keys,
            vec!["A<0>", "B<1>", "<2>", "C<3>", "D<4>", "<5>"]
        );
        assert_eq!(tree.tip_species_by_node[0].as_deref(), Some("A"));
        assert_eq!(tree.clade_bins, vec![0, 0, 1, 0, 0, 1]);
        assert!(tree.validate_lengths(true).is_ok());
    }

    #[test]
    fn test_write_permutations_tsv_gz() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_tmp(&dir, "toy.tre", NEXUS);
        let tree = load_canonical_tree(&p).unwrap();

        let mut m01 = crate::bitset::Bitset::zeros(1);
        m01.set(2);
        let mut m10 = crate::bitset::Bitset::zeros(1);
        m10.set(0);
        let cache = PermutationCache {
            masks_01: vec![m01],
            masks_10: vec![m10],
            ..Default::default()
        };

        let out = dir.path().join("perms.tsv.gz");
        write_permutations_tsv(&out, &tree, &cache).unwrap();

        let mut text = String::new();
        GzDecoder::new(fs::File::open(&out).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "perm\tmask_01\tmask_10\tkeys_01\tkeys_10");
        assert_eq!(lines[1], "0\t4\t1\t<2>\tA<0>");

        // Trailer is present: ISIZE (last 4 bytes) is the uncompressed length
        let raw = fs::read(&out).unwrap();
        let trailer_len = u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap());
        assert_eq!(trailer_len as usize, text.len());

        let plain = dir.path().join("perms.tsv");
        write_permutations_tsv(&plain, &tree, &cache).unwrap();
        assert_eq!(fs::read_to_string(&plain).unwrap(), text);

        assert!(write_permutations_tsv("-", &tree, &cache).is_err());
    }
}
