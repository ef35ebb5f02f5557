//! Binary dependency resolution
//!
//! Walks the job's ordered repository search path and satisfies each
//! required binary from the first repository that lists it, preferring the
//! local cache over a download. Every binary resolved from the cache is
//! hash-verified against its listing entry before use; every downloaded
//! binary is hashed and becomes a cache candidate under the identity of
//! its delivered content. Names that no repository can provide
//! are reported together in a single error.

use crate::artifact::{content_hash, file_size, meta_file_name};
use crate::cache::{candidate_for, derive_id, CacheCandidate, CacheEntry, CacheStore};
use crate::error::{KilnError, KilnResult};
use crate::job::JobSpec;
use crate::repo::{index_listing, BinaryDescriptor, ListQuery, ListingCache, RepoClient};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Observer of per-binary resolution outcomes.
///
/// All methods default to no-ops so implementors track only what they
/// care about.
pub trait ResolveHooks {
    fn cache_hit(&mut self, _name: &str, _bytes: u64) {}
    fn downloaded(&mut self, _name: &str, _bytes: u64) {}
    fn image_used(&mut self, _file: &str, _bytes: u64, _covered: usize) {}
}

/// Hooks that record nothing.
pub struct NoopHooks;

impl ResolveHooks for NoopHooks {}

/// One binary placed into the package directory.
#[derive(Debug, Clone)]
pub struct ResolvedBinary {
    pub name: String,
    /// Artifact file in the package directory
    pub file: PathBuf,
    /// Metadata sibling, when one was taken
    pub meta_file: Option<PathBuf>,
    /// Content hash of the artifact as materialized or delivered
    pub hdrmd5: String,
    /// Origin scope, `project/repository/arch`
    pub prpa: String,
    pub from_cache: bool,
}

/// The complete outcome of a resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    pub binaries: Vec<ResolvedBinary>,
}

impl Resolution {
    pub fn get(&self, name: &str) -> Option<&ResolvedBinary> {
        self.binaries.iter().find(|b| b.name == name)
    }

    pub fn from_cache(&self) -> usize {
        self.binaries.iter().filter(|b| b.from_cache).count()
    }
}

/// Resolves a job's binary dependencies against its repository path.
pub struct BinaryResolver<'a> {
    job: &'a JobSpec,
    client: &'a dyn RepoClient,
    cache: &'a CacheStore,
}

impl<'a> BinaryResolver<'a> {
    pub fn new(job: &'a JobSpec, client: &'a dyn RepoClient, cache: &'a CacheStore) -> Self {
        Self { job, client, cache }
    }

    /// Resolve `names` into `pkgdir`.
    ///
    /// Repositories are consulted in path order and a name sticks with the
    /// first repository that lists it as available; listings already in
    /// `listings` are reused when they cover every outstanding name. The
    /// cache is updated once at the end: downloads become new entries,
    /// cache hits refresh their retention rank.
    pub fn resolve(
        &self,
        names: &[String],
        pkgdir: &Path,
        listings: &mut ListingCache,
        hooks: &mut dyn ResolveHooks,
    ) -> KilnResult<Resolution> {
        if names.is_empty() {
            return Err(KilnError::NoBinariesNeeded);
        }

        let mut remaining: Vec<String> = names.to_vec();
        let mut resolution = Resolution::default();
        let mut keep_alive: Vec<CacheEntry> = Vec::new();
        let mut new_entries: Vec<CacheCandidate> = Vec::new();

        for repo in &self.job.paths {
            if remaining.is_empty() {
                break;
            }

            let scope = self.job.scope_of(repo);
            let server = self.job.server_of(repo);
            let prpa = scope.to_string();
            let suppress_meta = self.job.no_meta || self.job.suppress_meta_for(repo);

            let listing: Vec<BinaryDescriptor> = match listings.covering(&prpa, &remaining) {
                Some(known) => known.to_vec(),
                None => {
                    let query = ListQuery {
                        names: remaining.clone(),
                        modules: self.job.modules.clone(),
                        no_meta: suppress_meta,
                    };
                    let fetched = self.client.list_binaries(server, &scope, &query)?;
                    listings.insert(prpa.clone(), fetched.clone());
                    fetched
                }
            };
            let by_name = index_listing(&listing);

            let mut to_download: Vec<String> = Vec::new();
            let mut projected_bytes: u64 = 0;
            let mut taken: Vec<String> = Vec::new();

            for name in &remaining {
                let Some(desc) = by_name.get(name.as_str()) else {
                    continue;
                };
                if desc.is_unavailable() || desc.hdrmd5.is_empty() {
                    continue;
                }

                if let Some(hit) =
                    self.try_cache(name, desc, &prpa, pkgdir, suppress_meta, hooks)
                {
                    keep_alive.push(hit.0);
                    resolution.binaries.push(hit.1);
                    taken.push(name.clone());
                    continue;
                }

                to_download.push(name.clone());
                projected_bytes += desc.size_kb * 1024;
            }

            if !to_download.is_empty() {
                self.cache.shrink_for(projected_bytes)?;

                let query = ListQuery {
                    names: to_download.clone(),
                    modules: self.job.modules.clone(),
                    no_meta: suppress_meta,
                };
                let files = self
                    .client
                    .download_binaries(server, &scope, &query, pkgdir)?;

                // Suppression binds locally; a server may deliver metadata
                // side files regardless. Drop them before manifest writing
                // can see them.
                if suppress_meta {
                    for file in &files {
                        if file.as_meta().is_some() {
                            let _ = fs::remove_file(&file.path);
                        }
                    }
                }

                let mut arrived: HashMap<&str, &Path> = HashMap::new();
                for file in &files {
                    if let Some(stem) = file.as_binary() {
                        arrived.insert(stem, &file.path);
                    }
                }

                for name in &to_download {
                    let Some(path) = arrived.get(name.as_str()) else {
                        continue;
                    };
                    let desc = by_name[name.as_str()];
                    let bytes = file_size(path);
                    // The listing's hash is advisory; the delivered bytes
                    // define the artifact's identity.
                    let hdrmd5 = content_hash(path)?;
                    hooks.downloaded(name, bytes);

                    if self.cache.is_enabled() {
                        new_entries.push(candidate_for(&prpa, &hdrmd5, path));
                    }

                    let meta_file = if suppress_meta {
                        None
                    } else {
                        let meta = pkgdir.join(meta_file_name(&desc.name));
                        meta.exists().then_some(meta)
                    };

                    resolution.binaries.push(ResolvedBinary {
                        name: name.clone(),
                        file: path.to_path_buf(),
                        meta_file,
                        hdrmd5,
                        prpa: prpa.clone(),
                        from_cache: false,
                    });
                    taken.push(name.clone());
                }
            }

            if !taken.is_empty() {
                debug!("Resolved {} binaries from {}", taken.len(), prpa);
                remaining.retain(|n| !taken.contains(n));
            }
        }

        if !remaining.is_empty() {
            remaining.sort();
            return Err(KilnError::MissingBinaries(remaining));
        }

        if self.cache.is_enabled() && (!new_entries.is_empty() || !keep_alive.is_empty()) {
            self.cache.prune(&keep_alive, new_entries)?;
        }

        info!(
            "Resolved {} binaries ({} from cache)",
            resolution.binaries.len(),
            resolution.from_cache()
        );

        Ok(resolution)
    }

    /// Attempt to satisfy one binary from the cache.
    ///
    /// A hit requires the materialized artifact to hash to the listing's
    /// `hdrmd5`, and, when metadata is wanted, the metadata sibling to
    /// hash to `metamd5`. Artifact and metadata are taken together or not
    /// at all; any partial materialization is removed.
    fn try_cache(
        &self,
        name: &str,
        desc: &BinaryDescriptor,
        prpa: &str,
        pkgdir: &Path,
        suppress_meta: bool,
        hooks: &mut dyn ResolveHooks,
    ) -> Option<(CacheEntry, ResolvedBinary)> {
        if !self.cache.is_enabled() {
            return None;
        }

        let id = derive_id(prpa, &desc.hdrmd5);
        let dest = pkgdir.join(&desc.name);

        if !self.cache.materialize(&id, &dest) {
            return None;
        }

        let want_meta = !suppress_meta && !desc.meta_hash.is_empty();
        let meta_dest = pkgdir.join(meta_file_name(&desc.name));

        let verified = content_hash(&dest).ok().as_deref() == Some(desc.hdrmd5.as_str())
            && (!want_meta
                || (self.cache.materialize_meta(&id, &meta_dest)
                    && content_hash(&meta_dest).ok().as_deref()
                        == Some(desc.meta_hash.as_str())));

        if !verified {
            let _ = fs::remove_file(&dest);
            let _ = fs::remove_file(&meta_dest);
            return None;
        }

        let bytes = file_size(&dest);
        hooks.cache_hit(name, bytes);

        Some((
            CacheEntry {
                id,
                size: bytes,
            },
            ResolvedBinary {
                name: name.to_string(),
                file: dest,
                meta_file: want_meta.then_some(meta_dest),
                hdrmd5: desc.hdrmd5.clone(),
                prpa: prpa.to_string(),
                from_cache: true,
            },
        ))
    }
}
