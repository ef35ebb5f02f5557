//! Dependency manifest ("meta") generation
//!
//! Every resolved dependency contributes lines of the form
//! `"<hash>  <path>"`, where the path is either a bare package name or a
//! `/`-joined chain recording how a nested dependency was discovered.
//! Generation deduplicates the lines, prunes self-references through the
//! job's own subpackages, and breaks dependency cycles with one of two
//! algorithms. Output order comes from an explicit sort and is therefore
//! deterministic for any input order.

use crate::artifact::is_empty_file;
use crate::error::{KilnError, KilnResult};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

pub use crate::job::MetaAlgorithm;

/// Placeholder hash for dependencies whose content identity is unknown.
pub const UNKNOWN_HASH: &str = "deaddeaddeaddeaddeaddeaddeaddead";

/// One manifest entry: a content hash and a discovery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLine {
    pub hash: String,
    pub path: String,
}

impl MetaLine {
    pub fn new(hash: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            path: path.into(),
        }
    }

    /// Nesting depth: the number of `/` separators in the path.
    pub fn depth(&self) -> usize {
        self.path.matches('/').count()
    }

    /// The path's last component.
    pub fn last_segment(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, last)) => last,
            None => &self.path,
        }
    }

    /// The path's first component.
    pub fn root(&self) -> &str {
        match self.path.split_once('/') {
            Some((root, _)) => root,
            None => &self.path,
        }
    }

    /// Dedup key: the same content hash satisfying the same final package
    /// is one dependency regardless of how it was reached.
    pub fn last_segment_key(&self) -> (String, String) {
        (self.hash.clone(), self.last_segment().to_string())
    }

    /// Rendered manifest line, two-space separated.
    pub fn render(&self) -> String {
        format!("{}  {}", self.hash, self.path)
    }

    /// Parse a rendered line back into its parts.
    pub fn parse(line: &str) -> Option<Self> {
        let (hash, path) = line.split_once("  ")?;
        Some(Self::new(hash, path))
    }
}

/// Manifest lines straight from the job's dependency list.
///
/// Used when per-dependency metadata is unavailable or suppressed: each
/// manifest-relevant dependency contributes one line from its expected
/// hash, with the placeholder standing in where the scheduler knows none.
pub fn generate_job_meta(bdeps: &[&crate::job::BDep]) -> Vec<String> {
    let mut lines: Vec<MetaLine> = bdeps
        .iter()
        .map(|d| {
            let hash = if d.hdrmd5.is_empty() {
                UNKNOWN_HASH
            } else {
                d.hdrmd5.as_str()
            };
            MetaLine::new(hash, d.name.as_str())
        })
        .collect();

    lines.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.hash.cmp(&b.hash)));
    lines.iter().map(MetaLine::render).collect()
}

/// Whether any segment of `path` names a subpackage.
fn touches_subpack(path: &str, subpacks: &HashSet<&str>) -> bool {
    path.split('/').any(|seg| subpacks.contains(seg))
}

/// Generate the sorted, deduplicated, cycle-broken manifest lines.
pub fn generate(lines: &[MetaLine], subpacks: &[String], algorithm: MetaAlgorithm) -> Vec<String> {
    let subpack_set: HashSet<&str> = subpacks.iter().map(|s| s.as_str()).collect();

    // Full paths that are themselves subpackage references, and top-level
    // roots that reach into a subpackage without being one of the job's own
    // subpackages. The latter are the cycles needing treatment.
    let mut subpack_paths: HashSet<&str> = HashSet::new();
    let mut cycle_roots: BTreeSet<&str> = BTreeSet::new();

    for line in lines {
        if touches_subpack(&line.path, &subpack_set) {
            subpack_paths.insert(line.path.as_str());

            let root = line.root();
            if !subpack_set.contains(root) {
                cycle_roots.insert(root);
            }
        }
    }

    // The sort is the single source of ordering: depth first, then path,
    // then hash.
    let mut sorted: Vec<&MetaLine> = lines.iter().collect();
    sorted.sort_by(|a, b| {
        a.depth()
            .cmp(&b.depth())
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.hash.cmp(&b.hash))
    });

    let prune = |input: &[&MetaLine]| -> Vec<MetaLine> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for line in input {
            if subpack_paths.contains(line.path.as_str()) {
                continue;
            }
            if seen.insert(line.last_segment_key()) {
                out.push((*line).clone());
            }
        }
        out
    };

    let result = match algorithm {
        MetaAlgorithm::Basic => {
            // Blunt cycle-breaker: drop every chain rooted at a cycle.
            let kept: Vec<&MetaLine> = sorted
                .iter()
                .copied()
                .filter(|l| !cycle_roots.contains(l.root()))
                .collect();
            prune(&kept)
        }
        MetaAlgorithm::Refined => {
            // Remember the shallowest cyclic appearance of each dependency,
            // then keep only non-cyclic lines that beat it.
            let mut cycle_seen: HashMap<(String, String), usize> = HashMap::new();
            for line in &sorted {
                if cycle_roots.contains(line.root()) {
                    cycle_seen
                        .entry(line.last_segment_key())
                        .or_insert_with(|| line.depth());
                }
            }

            let pruned = prune(&sorted);
            if cycle_seen.is_empty() {
                pruned
            } else {
                pruned
                    .into_iter()
                    .filter(|line| match cycle_seen.get(&line.last_segment_key()) {
                        Some(&cyclic_depth) => line.depth() < cyclic_depth,
                        None => true,
                    })
                    .collect()
            }
        }
    };

    result.iter().map(MetaLine::render).collect()
}

/// Expand one dependency's metadata file into manifest lines.
///
/// The file's first line names the dependency itself; the rest record its
/// own dependency chains, which are re-rooted under `dep/`. A first line
/// that already points back at the current package marks a trivial
/// self-cycle and yields nothing. Repeated lines of non-subpackage deps
/// are skipped early to keep the working set small.
pub fn expand_meta_file(
    dep: &str,
    file: &Path,
    current_pkg: &str,
    subpacks: &[String],
) -> KilnResult<Vec<MetaLine>> {
    if is_empty_file(file) {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(file)
        .map_err(|e| KilnError::io(format!("reading meta file {}", file.display()), e))?;

    let subpack_set: HashSet<&str> = subpacks.iter().map(|s| s.as_str()).collect();
    let dep_is_subpack = subpack_set.contains(dep);

    let mut lines = Vec::new();
    let mut seen = HashSet::new();
    let mut first = true;

    for raw in content.lines() {
        let Some(parsed) = MetaLine::parse(raw) else {
            continue;
        };

        if first {
            first = false;
            if parsed.path == current_pkg {
                // The dependency's own manifest points straight back at us.
                return Ok(Vec::new());
            }
            lines.push(MetaLine::new(parsed.hash, dep));
            continue;
        }

        if !dep_is_subpack {
            if seen.contains(raw) {
                continue;
            }
            if !touches_subpack(&parsed.path, &subpack_set) {
                seen.insert(raw.to_string());
            }
        }

        lines.push(MetaLine::new(
            parsed.hash,
            format!("{}/{}", dep, parsed.path),
        ));
    }

    Ok(lines)
}

/// Write the manifest: newline-joined lines with a trailing blank line.
pub fn write_manifest(path: &Path, lines: &[String]) -> KilnResult<()> {
    let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum::<usize>() + 1);
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');

    let mut file = fs::File::create(path)
        .map_err(|e| KilnError::io(format!("creating manifest {}", path.display()), e))?;
    file.write_all(out.as_bytes())
        .map_err(|e| KilnError::io(format!("writing manifest {}", path.display()), e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(hash: &str, path: &str) -> MetaLine {
        MetaLine::new(hash, path)
    }

    #[test]
    fn meta_line_accessors() {
        let l = line("aa", "pkgA/sub/leaf");
        assert_eq!(l.depth(), 2);
        assert_eq!(l.root(), "pkgA");
        assert_eq!(l.last_segment(), "leaf");
        assert_eq!(l.render(), "aa  pkgA/sub/leaf");
        assert_eq!(MetaLine::parse("aa  pkgA/sub/leaf"), Some(l));
        assert_eq!(MetaLine::parse("no-separator"), None);
    }

    #[test]
    fn generate_is_deterministic_under_permutation() {
        let lines = vec![
            line("cc", "zlib"),
            line("aa", "gcc"),
            line("bb", "gcc/binutils"),
            line("dd", "make"),
        ];

        let expected = generate(&lines, &[], MetaAlgorithm::Basic);

        let mut permuted = lines.clone();
        permuted.reverse();
        assert_eq!(generate(&permuted, &[], MetaAlgorithm::Basic), expected);

        let rotated: Vec<_> = lines[2..].iter().chain(&lines[..2]).cloned().collect();
        assert_eq!(generate(&rotated, &[], MetaAlgorithm::Basic), expected);
    }

    #[test]
    fn generate_sorts_by_depth_then_path_then_hash() {
        let lines = vec![
            line("bb", "b/nested"),
            line("aa", "zz"),
            line("cc", "aa"),
        ];

        let out = generate(&lines, &[], MetaAlgorithm::Basic);
        assert_eq!(out, vec!["cc  aa", "aa  zz", "bb  b/nested"]);
    }

    #[test]
    fn generate_dedups_by_last_segment_key() {
        // The same hash satisfying the same final package through two
        // routes is one dependency; the shallower (post-sort first) wins.
        let lines = vec![
            line("aa", "gcc/zlib"),
            line("aa", "make/deeper/zlib"),
            line("bb", "make"),
        ];

        let out = generate(&lines, &[], MetaAlgorithm::Basic);
        assert_eq!(out, vec!["bb  make", "aa  gcc/zlib"]);
    }

    #[test]
    fn basic_drops_cycle_rooted_chains() {
        // `sub` is a subpackage of the current job; pkgA reaches into it,
        // so every pkgA-rooted line disappears.
        let lines = vec![line("aa", "pkgA"), line("bb", "pkgA/sub")];
        let subpacks = vec!["sub".to_string()];

        let out = generate(&lines, &subpacks, MetaAlgorithm::Basic);
        assert!(out.is_empty());
    }

    #[test]
    fn both_algorithms_keep_independent_lines() {
        let lines = vec![
            line("aa", "pkgA"),
            line("bb", "pkgA/sub"),
            line("cc", "other"),
        ];
        let subpacks = vec!["sub".to_string()];

        let basic = generate(&lines, &subpacks, MetaAlgorithm::Basic);
        assert_eq!(basic, vec!["cc  other"]);

        let refined = generate(&lines, &subpacks, MetaAlgorithm::Refined);
        assert_eq!(refined, vec!["cc  other"]);
    }

    #[test]
    fn refined_prefers_shallower_non_cyclic_appearance() {
        // zlib appears at depth 1 under the cyclic root pkgA and at depth 2
        // under the clean root other; only a shallower clean appearance
        // would survive, so the depth-2 one is filtered.
        let lines = vec![
            line("aa", "pkgA"),
            line("bb", "pkgA/sub"),
            line("zz", "pkgA/zlib"),
            line("zz", "other/mid/zlib"),
            line("cc", "other"),
        ];
        let subpacks = vec!["sub".to_string()];

        let out = generate(&lines, &subpacks, MetaAlgorithm::Refined);
        assert_eq!(out, vec!["cc  other"]);

        // A clean appearance shallower than every cyclic one survives.
        let lines2 = vec![
            line("aa", "pkgA"),
            line("bb", "pkgA/sub"),
            line("zz", "pkgA/deep/zlib"),
            line("zz", "other/zlib"),
            line("cc", "other"),
        ];
        let out2 = generate(&lines2, &subpacks, MetaAlgorithm::Refined);
        assert_eq!(out2, vec!["cc  other", "zz  other/zlib"]);
    }

    #[test]
    fn subpack_paths_never_appear_in_output() {
        // A package must not list itself as its own dependency: lines whose
        // full path is a subpackage reference are pruned even when their
        // root is a subpackage (no cycle).
        let lines = vec![line("aa", "sub"), line("bb", "gcc")];
        let subpacks = vec!["sub".to_string()];

        let out = generate(&lines, &subpacks, MetaAlgorithm::Basic);
        assert_eq!(out, vec!["bb  gcc"]);
    }

    #[test]
    fn job_meta_sorts_and_fills_placeholder() {
        use crate::job::BDep;

        let zlib = BDep {
            name: "zlib".to_string(),
            hdrmd5: "bb".to_string(),
            ..Default::default()
        };
        let gcc = BDep {
            name: "gcc".to_string(),
            ..Default::default()
        };

        let out = generate_job_meta(&[&zlib, &gcc]);
        assert_eq!(
            out,
            vec![
                format!("{}  gcc", UNKNOWN_HASH),
                "bb  zlib".to_string(),
            ]
        );
    }

    #[test]
    fn expand_meta_file_reroots_chains() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("gcc.meta");
        fs::write(&file, "aa  gcc\nbb  zlib\ncc  zlib/nested\n").unwrap();

        let lines = expand_meta_file("gcc", &file, "widget", &[]).unwrap();
        assert_eq!(
            lines,
            vec![
                line("aa", "gcc"),
                line("bb", "gcc/zlib"),
                line("cc", "gcc/zlib/nested"),
            ]
        );
    }

    #[test]
    fn expand_meta_file_detects_self_cycle() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("dep.meta");
        fs::write(&file, "aa  widget\nbb  zlib\n").unwrap();

        let lines = expand_meta_file("dep", &file, "widget", &[]).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn expand_meta_file_skips_repeated_clean_lines() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("dep.meta");
        fs::write(&file, "aa  dep\nbb  zlib\nbb  zlib\ncc  sub\ncc  sub\n").unwrap();

        let subpacks = vec!["sub".to_string()];
        let lines = expand_meta_file("dep", &file, "widget", &subpacks).unwrap();

        // The clean zlib repeat is dropped; subpackage lines repeat freely.
        assert_eq!(
            lines,
            vec![
                line("aa", "dep"),
                line("bb", "dep/zlib"),
                line("cc", "dep/sub"),
                line("cc", "dep/sub"),
            ]
        );
    }

    #[test]
    fn expand_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let lines =
            expand_meta_file("dep", &dir.path().join("absent.meta"), "widget", &[]).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn manifest_has_two_space_separator_and_trailing_blank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deps");

        write_manifest(&path, &["aa  gcc".to_string(), "bb  make".to_string()]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "aa  gcc\nbb  make\n\n");
    }
}
