//! Content-addressed artifact cache store
//!
//! Artifacts live at `dir/<id[0:2]>/<id>` with an optional `.meta` sibling.
//! A single ledger file (`dir/content`) records every valid `(id, size)`
//! pair; a lock file (`dir/lock`) guards cache-wide mutation. The cache id
//! is a pure function of the repository scope and the artifact's content
//! hash, so identical content reached via different builds collapses to one
//! slot.

use crate::artifact::{file_size, is_empty_file, link_or_copy};
use crate::cache::lock::ScopedLock;
use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LEDGER_FILE: &str = "content";
const LOCK_FILE: &str = "lock";

/// Derive the cache slot id for an artifact.
///
/// Stable and collision-resistant: hex(SHA-256("scope/contentHash")).
pub fn derive_id(scope_key: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope_key.as_bytes());
    hasher.update(b"/");
    hasher.update(content_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// One entry of the cache ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: String,
    pub size: u64,
}

/// A freshly produced artifact to be installed into the cache.
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub entry: CacheEntry,
    /// Artifact file in the working directory; its metadata sibling (if
    /// non-empty) is committed alongside
    pub bin_file: PathBuf,
}

impl CacheCandidate {
    fn meta_source(&self) -> PathBuf {
        let name = self
            .bin_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.bin_file
            .with_file_name(crate::artifact::meta_file_name(&name))
    }
}

/// Summary of the ledger for status output.
#[derive(Debug, Clone, Default)]
pub struct CacheUsage {
    pub entries: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

/// Content-addressed on-disk cache with a size budget.
///
/// `dir == None` means no cache is configured: every operation is a no-op
/// and every lookup is a miss.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: Option<PathBuf>,
    budget: u64,
}

impl CacheStore {
    pub fn new(dir: Option<PathBuf>, budget: u64) -> Self {
        Self { dir, budget }
    }

    /// A store with no backing directory; all operations are no-ops.
    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    fn slot_path(&self, id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        if id.len() < 2 {
            return None;
        }
        Some(dir.join(&id[0..2]).join(id))
    }

    /// Link (or copy) the cached artifact for `id` to `dest`.
    ///
    /// Returns false on a miss; a link/copy failure is a miss for that
    /// artifact, never an error.
    pub fn materialize(&self, id: &str, dest: &Path) -> bool {
        let Some(slot) = self.slot_path(id) else {
            return false;
        };
        link_or_copy(&slot, dest).is_ok()
    }

    /// Link (or copy) the cached metadata sibling for `id` to `dest`.
    pub fn materialize_meta(&self, id: &str, dest: &Path) -> bool {
        let Some(slot) = self.slot_path(id) else {
            return false;
        };
        let mut meta = slot.into_os_string();
        meta.push(".meta");
        link_or_copy(Path::new(&meta), dest).is_ok()
    }

    /// Install or refresh the metadata sibling for `id` from `src`.
    ///
    /// Best effort: the sibling only ever serves a lookup whose artifact
    /// slot also exists, so a failure here is not an error.
    pub fn store_meta(&self, id: &str, src: &Path) -> bool {
        let Some(slot) = self.slot_path(id) else {
            return false;
        };
        let Some(parent) = slot.parent() else {
            return false;
        };
        if fs::create_dir_all(parent).is_err() {
            return false;
        }
        let mut meta = slot.into_os_string();
        meta.push(".meta");
        link_or_copy(src, Path::new(&meta)).is_ok()
    }

    /// Read the metadata sibling for `id`, if present.
    pub fn read_meta(&self, id: &str) -> Option<Vec<u8>> {
        let slot = self.slot_path(id)?;
        let mut meta = slot.into_os_string();
        meta.push(".meta");
        fs::read(Path::new(&meta)).ok()
    }

    /// Evict down to the configured budget, installing `new` first.
    pub fn prune(&self, keep: &[CacheEntry], new: Vec<CacheCandidate>) -> KilnResult<()> {
        self.prune_to(self.budget, keep, new)
    }

    /// Proactively make room before a bulk download far over budget.
    ///
    /// Only reacts when the projected bytes exceed one percent of the
    /// budget; smaller downloads are absorbed by the final prune.
    pub fn shrink_for(&self, projected_bytes: u64) -> KilnResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if projected_bytes.saturating_mul(100) > self.budget {
            let target = self.budget.saturating_sub(projected_bytes);
            return self.prune_to(target, &[], Vec::new());
        }
        Ok(())
    }

    /// The single mutating cache-wide operation.
    ///
    /// Holds the exclusive cross-process lock for its entire duration.
    /// Working order is `new` ++ `keep` ++ ledger: content this job just
    /// touched is retained in preference to older unreferenced content.
    pub fn prune_to(
        &self,
        budget: u64,
        keep: &[CacheEntry],
        new: Vec<CacheCandidate>,
    ) -> KilnResult<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };

        fs::create_dir_all(&dir)
            .map_err(|e| KilnError::io(format!("creating cache dir {}", dir.display()), e))?;

        let _lock = ScopedLock::acquire(&dir.join(LOCK_FILE))?;

        let committed = self.commit(&new);
        let recorded = self.read_ledger(&dir);

        let mut working: Vec<CacheEntry> =
            Vec::with_capacity(committed.len() + keep.len() + recorded.len());
        working.extend(committed.iter().cloned());
        working.extend(keep.iter().cloned());
        working.extend(recorded);

        let mut seen = HashSet::new();
        working.retain(|e| e.size > 0 && seen.insert(e.id.clone()));

        let mut total: u64 = 0;
        let mut retained = working.len();
        for (i, entry) in working.iter().enumerate() {
            total += entry.size;
            if total > budget {
                retained = i;
                break;
            }
        }

        for entry in &working[retained..] {
            self.remove_slot(&entry.id);
        }
        working.truncate(retained);

        if let Err(e) = self.write_ledger(&dir, &working) {
            // Never leave the ledger pointing at artifacts it does not
            // acknowledge: roll back this call's additions. Entries durable
            // before this call stay on disk.
            for entry in &committed {
                self.remove_slot(&entry.id);
            }
            return Err(KilnError::CacheLedger {
                path: dir.join(LEDGER_FILE),
                source: e,
            });
        }

        debug!(
            "Cache pruned to {} entries ({} bytes, budget {})",
            working.len(),
            total.min(budget),
            budget
        );

        Ok(())
    }

    /// Ledger summary for status output.
    pub fn usage(&self) -> CacheUsage {
        let Some(dir) = self.dir.as_ref() else {
            return CacheUsage::default();
        };
        let entries = self.read_ledger(dir);
        CacheUsage {
            entries: entries.len(),
            used_bytes: entries.iter().map(|e| e.size).sum(),
            budget_bytes: self.budget,
        }
    }

    /// Install candidates into their slots, most recently produced first.
    ///
    /// Caller must hold the cache lock. A candidate whose artifact cannot
    /// be linked is skipped; a rename failure abandons the slot.
    fn commit(&self, new: &[CacheCandidate]) -> Vec<CacheEntry> {
        let mut committed = Vec::with_capacity(new.len());

        for candidate in new.iter().rev() {
            let Some(slot) = self.slot_path(&candidate.entry.id) else {
                continue;
            };

            if let Some(parent) = slot.parent() {
                if fs::create_dir_all(parent).is_err() {
                    continue;
                }
            }

            let tmp = slot.with_extension("tmp");
            if let Err(e) = link_or_copy(&candidate.bin_file, &tmp) {
                warn!(
                    "Skipping cache commit of {}: {}",
                    candidate.bin_file.display(),
                    e
                );
                continue;
            }
            if let Err(e) = fs::rename(&tmp, &slot) {
                let _ = fs::remove_file(&tmp);
                warn!("Failed to install cache slot {}: {}", slot.display(), e);
                continue;
            }

            // Refresh the metadata sibling; stale meta must not survive a
            // new artifact.
            let mut meta_slot = slot.clone().into_os_string();
            meta_slot.push(".meta");
            let meta_slot = PathBuf::from(meta_slot);
            let _ = fs::remove_file(&meta_slot);

            let meta_src = candidate.meta_source();
            if !is_empty_file(&meta_src) {
                let meta_tmp = slot.with_extension("meta.tmp");
                if link_or_copy(&meta_src, &meta_tmp).is_ok() {
                    if fs::rename(&meta_tmp, &meta_slot).is_err() {
                        let _ = fs::remove_file(&meta_tmp);
                    }
                }
            }

            committed.push(candidate.entry.clone());
        }

        committed
    }

    fn remove_slot(&self, id: &str) {
        if let Some(slot) = self.slot_path(id) {
            let _ = fs::remove_file(&slot);
            let mut meta = slot.into_os_string();
            meta.push(".meta");
            let _ = fs::remove_file(Path::new(&meta));
        }
    }

    fn read_ledger(&self, dir: &Path) -> Vec<CacheEntry> {
        let Ok(content) = fs::read_to_string(dir.join(LEDGER_FILE)) else {
            return Vec::new();
        };

        content
            .lines()
            .filter_map(|line| {
                let (id, size) = line.split_once(' ')?;
                let size: u64 = size.trim().parse().ok()?;
                if id.is_empty() || size == 0 {
                    return None;
                }
                Some(CacheEntry {
                    id: id.to_string(),
                    size,
                })
            })
            .collect()
    }

    fn write_ledger(&self, dir: &Path, entries: &[CacheEntry]) -> std::io::Result<()> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.id);
            content.push(' ');
            content.push_str(&entry.size.to_string());
            content.push('\n');
        }

        let path = dir.join(LEDGER_FILE);
        let tmp = dir.join(format!("{}.new", LEDGER_FILE));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)
    }
}

/// Commit a freshly downloaded or verified artifact as a cache candidate.
pub fn candidate_for(scope_key: &str, content_hash: &str, bin_file: &Path) -> CacheCandidate {
    CacheCandidate {
        entry: CacheEntry {
            id: derive_id(scope_key, content_hash),
            size: file_size(bin_file),
        },
        bin_file: bin_file.to_path_buf(),
    }
}
