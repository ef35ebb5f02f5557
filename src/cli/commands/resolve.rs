//! Resolve command - fetch a job's dependencies

use crate::cache::CacheStore;
use crate::cli::args::ResolveArgs;
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::job::runner::JobRunner;
use crate::job::JobSpec;
use crate::repo::http::HttpRepoClient;
use console::style;
use std::env;
use std::time::Duration;
use tracing::debug;

/// Execute the resolve command
pub fn execute(args: ResolveArgs, config: &Config) -> KilnResult<()> {
    let mut job = JobSpec::load(&args.job)?;

    if let Some(server) = args.server {
        job.repo_server = server;
    } else if job.repo_server.is_empty() {
        job.repo_server = config.repo.server.clone();
    }
    if job.src_server.is_empty() {
        job.src_server = config.repo.src_server.clone();
    }
    if job.repo_server.is_empty() {
        return Err(KilnError::JobInvalid {
            path: args.job.clone(),
            reason: "no repository server given by job, --server, or config".to_string(),
        });
    }

    let cache = if args.no_cache {
        debug!("Cache bypassed (--no-cache)");
        CacheStore::disabled()
    } else {
        let dir = args.cache_dir.or_else(|| config.cache.dir.clone());
        CacheStore::new(dir, config.cache.budget_bytes())
    };

    let pkgdir = match args.pkgdir {
        Some(dir) => dir,
        None => env::current_dir()
            .map_err(|e| KilnError::io("getting current directory", e))?
            .join(&job.package),
    };

    let client = HttpRepoClient::new(
        Duration::from_secs(config.worker.timeout_secs),
        config.worker.id.clone(),
    );

    let runner = JobRunner::new(&job, &client, &cache);
    let outcome = runner.run(&pkgdir)?;

    println!(
        "{} {} binaries in {}",
        style("Resolved").green().bold(),
        outcome.resolution.binaries.len(),
        pkgdir.display()
    );
    if let Some(image) = &outcome.image {
        println!(
            "  preinstall image {} covers {} binaries",
            image.descriptor.file,
            image.covered.len()
        );
    }
    if let Some(manifest) = &outcome.manifest {
        println!("  manifest: {}", manifest.display());
    }

    Ok(())
}
