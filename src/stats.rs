//! Dependency-fetch statistics
//!
//! Collects per-job counters through [`ResolveHooks`] and writes them as
//! a `_statistics` JSON file next to the resolved binaries. The file is
//! written through a temp-and-rename so a crash never leaves a partial
//! document.

use crate::error::{KilnError, KilnResult};
use crate::resolve::ResolveHooks;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;

pub const STATISTICS_FILE: &str = "_statistics";

#[derive(Debug, Default, Serialize)]
struct BinaryCounters {
    downloaded: usize,
    download_bytes: u64,
    from_cache: usize,
    cache_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ImageCounters {
    file: String,
    bytes: u64,
    covered: usize,
}

#[derive(Debug, Serialize)]
struct StatisticsDocument<'a> {
    generated_at: DateTime<Utc>,
    duration_ms: u64,
    binaries: &'a BinaryCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    preinstall_image: Option<&'a ImageCounters>,
}

/// Accumulates fetch outcomes over one job.
#[derive(Debug)]
pub struct BuildStats {
    started: Instant,
    binaries: BinaryCounters,
    image: Option<ImageCounters>,
}

impl BuildStats {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            binaries: BinaryCounters::default(),
            image: None,
        }
    }

    pub fn downloaded_count(&self) -> usize {
        self.binaries.downloaded
    }

    pub fn cache_hit_count(&self) -> usize {
        self.binaries.from_cache
    }

    /// Write the statistics document into `dir`.
    pub fn write(&self, dir: &Path) -> KilnResult<()> {
        let doc = StatisticsDocument {
            generated_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            binaries: &self.binaries,
            preinstall_image: self.image.as_ref(),
        };

        let path = dir.join(STATISTICS_FILE);
        let tmp = dir.join(format!("{}.new", STATISTICS_FILE));
        let body = serde_json::to_vec_pretty(&doc)?;

        fs::write(&tmp, body)
            .map_err(|e| KilnError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| KilnError::io(format!("renaming {}", tmp.display()), e))?;

        Ok(())
    }
}

impl ResolveHooks for BuildStats {
    fn cache_hit(&mut self, _name: &str, bytes: u64) {
        self.binaries.from_cache += 1;
        self.binaries.cache_bytes += bytes;
    }

    fn downloaded(&mut self, _name: &str, bytes: u64) {
        self.binaries.downloaded += 1;
        self.binaries.download_bytes += bytes;
    }

    fn image_used(&mut self, file: &str, bytes: u64, covered: usize) {
        self.image = Some(ImageCounters {
            file: file.to_string(),
            bytes,
            covered,
        });
    }
}
