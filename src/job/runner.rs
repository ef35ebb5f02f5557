//! Job orchestration
//!
//! Drives one job end to end: pick a preinstall image, resolve every
//! binary dependency the image does not cover, generate the dependency
//! manifest, and record fetch statistics. The runner owns the ordering;
//! all mechanism lives in the component modules.

use crate::artifact::is_empty_file;
use crate::cache::CacheStore;
use crate::error::KilnResult;
use crate::image::{ImageSelector, SelectedImage};
use crate::job::JobSpec;
use crate::meta::{self, MetaLine, UNKNOWN_HASH};
use crate::repo::{ListingCache, RepoClient};
use crate::resolve::{BinaryResolver, Resolution};
use crate::stats::BuildStats;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dependency manifest file name inside the package directory.
pub const MANIFEST_FILE: &str = "_meta";

/// Everything one job run produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub resolution: Resolution,
    pub image: Option<SelectedImage>,
    /// Manifest path, absent for no-meta jobs
    pub manifest: Option<PathBuf>,
}

/// Runs jobs against a repository client and cache.
pub struct JobRunner<'a> {
    job: &'a JobSpec,
    client: &'a dyn RepoClient,
    cache: &'a CacheStore,
}

impl<'a> JobRunner<'a> {
    pub fn new(job: &'a JobSpec, client: &'a dyn RepoClient, cache: &'a CacheStore) -> Self {
        Self { job, client, cache }
    }

    /// Fetch the job's dependencies into `pkgdir`.
    pub fn run(&self, pkgdir: &Path) -> KilnResult<JobOutcome> {
        fs::create_dir_all(pkgdir).map_err(|e| {
            crate::error::KilnError::io(format!("creating package dir {}", pkgdir.display()), e)
        })?;

        let mut stats = BuildStats::start();
        let mut listings = ListingCache::new();

        let image = ImageSelector::new(self.job, self.client, self.cache).select(
            pkgdir,
            &mut listings,
            &mut stats,
        )?;

        let covered: HashSet<&str> = image
            .iter()
            .flat_map(|i| i.covered.iter().map(|n| n.as_str()))
            .collect();

        let to_fetch: Vec<String> = self
            .job
            .not_src_bdeps()
            .iter()
            .filter(|d| !covered.contains(d.name.as_str()))
            .map(|d| d.name.clone())
            .collect();

        let resolution = if to_fetch.is_empty() {
            debug!("No binaries left to fetch");
            Resolution::default()
        } else {
            let resolver = BinaryResolver::new(self.job, self.client, self.cache);
            resolver.resolve(&to_fetch, pkgdir, &mut listings, &mut stats)?
        };

        let manifest = if self.job.no_meta {
            None
        } else {
            Some(self.write_manifest(pkgdir)?)
        };

        stats.write(pkgdir)?;

        info!(
            "Job {}/{} done: {} downloaded, {} from cache{}",
            self.job.project,
            self.job.package,
            stats.downloaded_count(),
            stats.cache_hit_count(),
            if image.is_some() {
                ", preinstall image used"
            } else {
                ""
            }
        );

        Ok(JobOutcome {
            resolution,
            image,
            manifest,
        })
    }

    /// Generate and write the dependency manifest.
    ///
    /// Dependencies with a usable metadata sibling contribute their full
    /// dependency chains, whether resolved individually or covered by the
    /// preinstall image; the rest contribute a single line from the hash
    /// the scheduler supplied.
    fn write_manifest(&self, pkgdir: &Path) -> KilnResult<PathBuf> {
        let bdeps = self.job.meta_bdeps();

        let lines = if self.job.is_preinstall_image() {
            meta::generate_job_meta(&bdeps)
        } else {
            let mut collected: Vec<MetaLine> = Vec::new();
            for dep in &bdeps {
                let meta_file = pkgdir.join(format!("{}.meta", dep.name));
                if !is_empty_file(&meta_file) {
                    collected.extend(meta::expand_meta_file(
                        &dep.name,
                        &meta_file,
                        &self.job.package,
                        &self.job.subpacks,
                    )?);
                } else {
                    let hash = if dep.hdrmd5.is_empty() {
                        UNKNOWN_HASH
                    } else {
                        dep.hdrmd5.as_str()
                    };
                    collected.push(MetaLine::new(hash, dep.name.as_str()));
                }
            }
            meta::generate(&collected, &self.job.subpacks, self.job.meta_algorithm)
        };

        let path = pkgdir.join(MANIFEST_FILE);
        meta::write_manifest(&path, &lines)?;
        debug!("Wrote manifest with {} lines to {}", lines.len(), path.display());
        Ok(path)
    }
}
