//! Preinstall-image selection
//!
//! A preinstall image is a prebuilt build-root snapshot covering some of
//! the job's installable dependencies. Using one replaces the per-binary
//! install of everything it covers, so an image is only usable when all
//! of its content is actually wanted: every hash in the image must belong
//! to an installable dependency of the job, as listed by the job's own
//! repository path. Among usable images the one covering the most
//! dependencies wins. A selected image still owes the manifest the
//! per-binary metadata of everything it covers; an image whose transfer,
//! verification, or metadata acquisition fails is excluded for the rest
//! of the job.

use crate::artifact::{content_hash, file_size, meta_file_name};
use crate::cache::{candidate_for, derive_id, CacheEntry, CacheStore};
use crate::error::{KilnError, KilnResult};
use crate::job::{JobSpec, Scope};
use crate::repo::{
    index_listing, BinaryDescriptor, ImageDescriptor, ListQuery, ListingCache, RepoClient,
};
use crate::resolve::ResolveHooks;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Marker distinguishing cached images from cached binaries.
pub const IMAGE_META_MARKER: &str = ":preinstallimage";

/// The image chosen for a job, fetched into the package directory.
#[derive(Debug)]
pub struct SelectedImage {
    pub descriptor: ImageDescriptor,
    /// Image file in the package directory
    pub file: PathBuf,
    /// Names of the dependencies the image covers
    pub covered: Vec<String>,
    pub from_cache: bool,
}

/// One needed binary as its providing repository lists it.
struct NeededBin {
    name: String,
    /// Artifact file name from the listing
    file_name: String,
    hdrmd5: String,
    meta_hash: String,
    scope: Scope,
    prpa: String,
    server: String,
    want_meta: bool,
}

struct Candidate {
    image: ImageDescriptor,
    server: String,
    /// Number of needed hashes covered; zeroed on permanent exclusion
    coverage: usize,
}

/// Selects and fetches the best preinstall image for a job.
pub struct ImageSelector<'a> {
    job: &'a JobSpec,
    client: &'a dyn RepoClient,
    cache: &'a CacheStore,
}

impl<'a> ImageSelector<'a> {
    pub fn new(job: &'a JobSpec, client: &'a dyn RepoClient, cache: &'a CacheStore) -> Self {
        Self { job, client, cache }
    }

    /// Pick, fetch, and verify the best usable image, if any.
    ///
    /// Listings fetched while surveying the needed binaries land in
    /// `listings` for later reuse. Returns `Ok(None)` when no image
    /// qualifies; discovery, transfer, and metadata failures demote
    /// candidates rather than failing the job.
    pub fn select(
        &self,
        pkgdir: &Path,
        listings: &mut ListingCache,
        hooks: &mut dyn ResolveHooks,
    ) -> KilnResult<Option<SelectedImage>> {
        let names: Vec<String> = self
            .job
            .installable_bdeps()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        if names.len() < 2 {
            return Ok(None);
        }

        let needed = self.survey(&names, listings);
        if needed.len() < 2 {
            return Ok(None);
        }

        let mut candidates = self.discover(&needed);
        if candidates.is_empty() {
            return Ok(None);
        }

        loop {
            let best = match candidates
                .iter_mut()
                .filter(|c| c.coverage > 0)
                .max_by_key(|c| c.coverage)
            {
                Some(c) => c,
                None => return Ok(None),
            };

            let mut seen = HashSet::new();
            let covered: Vec<&NeededBin> = best
                .image
                .hdrmd5s
                .iter()
                .filter(|h| seen.insert(h.as_str()))
                .filter_map(|h| needed.get(h.as_str()))
                .collect();

            let fetched = self.fetch(&best.image, &best.server, pkgdir).and_then(|got| {
                self.acquire_metas(&best.image.file, &covered, pkgdir)?;
                Ok(got)
            });

            match fetched {
                Ok((file, from_cache)) => {
                    let covered: Vec<String> = covered.iter().map(|b| b.name.clone()).collect();

                    info!(
                        "Using preinstall image {} covering {} of {} binaries",
                        best.image.file,
                        covered.len(),
                        needed.len()
                    );
                    hooks.image_used(&best.image.file, file_size(&file), covered.len());

                    return Ok(Some(SelectedImage {
                        descriptor: best.image.clone(),
                        file,
                        covered,
                        from_cache,
                    }));
                }
                Err(e) => {
                    warn!(
                        "Preinstall image {} from {} unusable: {}",
                        best.image.file, best.image.prpa, e
                    );
                    let _ = fs::remove_file(pkgdir.join(&best.image.file));
                    for bin in &covered {
                        if bin.want_meta {
                            let _ = fs::remove_file(pkgdir.join(meta_file_name(&bin.file_name)));
                        }
                    }
                    best.coverage = 0;
                }
            }
        }
    }

    /// Walk the repository path and record, per needed name, the content
    /// hash and metadata digest its first providing repository lists.
    fn survey(&self, names: &[String], listings: &mut ListingCache) -> HashMap<String, NeededBin> {
        let mut needed: HashMap<String, NeededBin> = HashMap::new();
        let mut remaining: Vec<String> = names.to_vec();

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
                    match self.client.list_binaries(server, &scope, &query) {
                        Ok(fetched) => {
                            listings.insert(prpa.clone(), fetched.clone());
                            fetched
                        }
                        Err(e) => {
                            warn!("Listing {} for image selection failed: {}", prpa, e);
                            continue;
                        }
                    }
                }
            };

            let by_name = index_listing(&listing);
            let mut taken: Vec<String> = Vec::new();
            for name in &remaining {
                let Some(desc) = by_name.get(name.as_str()) else {
                    continue;
                };
                if desc.is_unavailable() || desc.hdrmd5.is_empty() {
                    continue;
                }

                needed.insert(
                    desc.hdrmd5.clone(),
                    NeededBin {
                        name: name.clone(),
                        file_name: desc.name.clone(),
                        hdrmd5: desc.hdrmd5.clone(),
                        meta_hash: desc.meta_hash.clone(),
                        scope: scope.clone(),
                        prpa: prpa.clone(),
                        server: server.to_string(),
                        want_meta: !suppress_meta && !desc.meta_hash.is_empty(),
                    },
                );
                taken.push(name.clone());
            }
            remaining.retain(|n| !taken.contains(n));
        }

        needed
    }

    /// Query every repository server for images and score them.
    fn discover(&self, needed: &HashMap<String, NeededBin>) -> Vec<Candidate> {
        let own_prpa = self.job.scope().to_string();

        // Scopes grouped per server, path order preserved. The source
        // server never serves images.
        let mut order: Vec<&str> = Vec::new();
        let mut per_server: HashMap<&str, Vec<String>> = HashMap::new();
        for repo in &self.job.paths {
            let server = self.job.server_of(repo);
            if server == self.job.src_server {
                continue;
            }
            let prpa = self.job.scope_of(repo).to_string();
            let scopes = per_server.entry(server).or_insert_with(|| {
                order.push(server);
                Vec::new()
            });
            if !scopes.contains(&prpa) {
                scopes.push(prpa);
            }
        }

        let mut candidates = Vec::new();
        for server in order {
            let images = match self.client.list_images(server, &per_server[server]) {
                Ok(images) => images,
                Err(e) => {
                    warn!("Image discovery at {} failed: {}", server, e);
                    continue;
                }
            };

            for image in images {
                let coverage = image_coverage(self.job, &own_prpa, &image, needed);
                if coverage > 0 {
                    debug!(
                        "Image candidate {} ({}) covers {}",
                        image.file, image.prpa, coverage
                    );
                    candidates.push(Candidate {
                        image,
                        server: server.to_string(),
                        coverage,
                    });
                }
            }
        }
        candidates
    }

    /// Materialize the image from cache, or download, verify, and cache it.
    fn fetch(
        &self,
        image: &ImageDescriptor,
        server: &str,
        pkgdir: &Path,
    ) -> KilnResult<(PathBuf, bool)> {
        let dest = pkgdir.join(&image.file);
        let marker = format!("{}  {}\n", image.hdrmd5, IMAGE_META_MARKER);

        if self.cache.is_enabled() {
            let id = derive_id(&image.prpa, &image.hdrmd5);
            if self.cache.materialize(&id, &dest) {
                let verified = content_hash(&dest).ok().as_deref() == Some(image.hdrmd5.as_str())
                    && self.cache.read_meta(&id).as_deref() == Some(marker.as_bytes());
                if verified {
                    let entry = CacheEntry {
                        id,
                        size: file_size(&dest),
                    };
                    self.cache.prune(&[entry], Vec::new())?;
                    return Ok((dest, true));
                }
                let _ = fs::remove_file(&dest);
            }
        }

        self.client
            .download_image(server, &image.prpa, &image.path, &dest)?;

        if content_hash(&dest).ok().as_deref() != Some(image.hdrmd5.as_str()) {
            let _ = fs::remove_file(&dest);
            return Err(KilnError::ImageUnusable {
                file: image.file.clone(),
                reason: "delivered content failed verification".to_string(),
            });
        }

        if self.cache.is_enabled() {
            // The marker sibling distinguishes the slot from a binary; it
            // travels into the cache alongside the image and leaves no
            // trace in the package directory.
            let candidate = candidate_for(&image.prpa, &image.hdrmd5, &dest);
            let marker_file = dest.with_file_name(format!("{}.meta", image.file));
            fs::write(&marker_file, &marker).ok();
            self.cache.prune(&[], vec![candidate])?;
            let _ = fs::remove_file(&marker_file);
        }

        Ok((dest, false))
    }

    /// Obtain and verify the metadata of every covered binary that wants
    /// one, cache first, then one bulk transfer per origin scope for the
    /// rest. Verified metadata goes back into the cache; anything
    /// unverifiable fails the whole image.
    fn acquire_metas(
        &self,
        image_file: &str,
        covered: &[&NeededBin],
        pkgdir: &Path,
    ) -> KilnResult<()> {
        let mut misses: Vec<&NeededBin> = Vec::new();

        for &bin in covered {
            if !bin.want_meta {
                continue;
            }
            let dest = pkgdir.join(meta_file_name(&bin.file_name));
            let id = derive_id(&bin.prpa, &bin.hdrmd5);
            if self.cache.materialize_meta(&id, &dest)
                && content_hash(&dest).ok().as_deref() == Some(bin.meta_hash.as_str())
            {
                continue;
            }
            let _ = fs::remove_file(&dest);
            misses.push(bin);
        }

        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&NeededBin>> = HashMap::new();
        for bin in misses {
            let bins = groups.entry(bin.prpa.as_str()).or_insert_with(|| {
                order.push(bin.prpa.as_str());
                Vec::new()
            });
            bins.push(bin);
        }

        for prpa in order {
            let bins = &groups[prpa];
            let query = ListQuery {
                names: bins.iter().map(|b| b.name.clone()).collect(),
                modules: self.job.modules.clone(),
                no_meta: false,
            };
            let files = self
                .client
                .download_binaries(&bins[0].server, &bins[0].scope, &query, pkgdir)?;

            // Only the metadata is wanted; the image already provides
            // the artifacts themselves.
            for file in &files {
                if file.as_binary().is_some() {
                    let _ = fs::remove_file(&file.path);
                }
            }

            for bin in bins {
                let dest = pkgdir.join(meta_file_name(&bin.file_name));
                if content_hash(&dest).ok().as_deref() != Some(bin.meta_hash.as_str()) {
                    let _ = fs::remove_file(&dest);
                    return Err(KilnError::ImageUnusable {
                        file: image_file.to_string(),
                        reason: format!("metadata for {} unverifiable", bin.name),
                    });
                }
                self.cache
                    .store_meta(&derive_id(&bin.prpa, &bin.hdrmd5), &dest);
            }
        }

        Ok(())
    }
}

/// Score one image against the needed hashes; zero means unusable.
fn image_coverage(
    job: &JobSpec,
    own_prpa: &str,
    image: &ImageDescriptor,
    needed: &HashMap<String, NeededBin>,
) -> usize {
    if image.hdrmd5.is_empty() || image.size_kb == 0 || image.hdrmd5s.is_empty() {
        return 0;
    }

    // A job never preinstalls from an image it built itself.
    if image.prpa == own_prpa && image.package == job.package {
        return 0;
    }

    // Everything inside the image must be wanted by the job.
    let unique: HashSet<&str> = image.hdrmd5s.iter().map(|h| h.as_str()).collect();
    if !unique.iter().all(|h| needed.contains_key(*h)) {
        return 0;
    }

    if unique.len() < 2 {
        return 0;
    }

    // An image-building job must not bootstrap from an image equivalent
    // to its complete dependency set.
    if job.is_preinstall_image() && unique.len() == needed.len() {
        return 0;
    }

    unique.len()
}
