//! Repository server interfaces
//!
//! The resolver and the preinstall-image selector talk to repository
//! servers only through the [`RepoClient`] trait: binary-version listings,
//! bulk binary downloads, image discovery, and image transfer. The HTTP
//! implementation lives in [`http`]; tests substitute in-memory clients.

pub mod http;

use crate::artifact::{bin_stem, meta_stem};
use crate::error::KilnResult;
use crate::job::Scope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One binary's version entry from a repository listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryDescriptor {
    /// Artifact filename, e.g. `gcc-13.2-1.x86_64.rpm`
    pub name: String,
    #[serde(rename = "sizek")]
    pub size_kb: u64,
    /// Content hash of the artifact's package header
    pub hdrmd5: String,
    /// Expected hash of the metadata sibling
    #[serde(rename = "metamd5")]
    pub meta_hash: String,
    /// Non-empty when the repository knows the binary is unavailable
    pub error: String,
}

impl BinaryDescriptor {
    /// Whether the repository marked this binary as known-unavailable.
    pub fn is_unavailable(&self) -> bool {
        !self.error.is_empty()
    }
}

/// A candidate preinstall image advertised by a repository server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDescriptor {
    pub file: String,
    pub path: String,
    /// Origin scope, `project/repository/arch`
    pub prpa: String,
    pub package: String,
    #[serde(rename = "sizek")]
    pub size_kb: u64,
    /// The image's own content hash
    pub hdrmd5: String,
    /// Content hashes of every binary the image covers
    pub hdrmd5s: Vec<String>,
}

/// A file produced in the working directory by a bulk download.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub name: String,
    pub path: PathBuf,
}

impl DownloadedFile {
    /// The binary stem when this is an artifact file.
    pub fn as_binary(&self) -> Option<&str> {
        bin_stem(&self.name)
    }

    /// The binary stem when this is a metadata file.
    pub fn as_meta(&self) -> Option<&str> {
        meta_stem(&self.name)
    }
}

/// Query options shared by listing and download requests.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub names: Vec<String>,
    pub modules: Vec<String>,
    pub no_meta: bool,
}

/// Operations the core needs from a repository server.
pub trait RepoClient {
    /// Binary-version listing restricted to the requested names.
    fn list_binaries(
        &self,
        server: &str,
        scope: &Scope,
        query: &ListQuery,
    ) -> KilnResult<Vec<BinaryDescriptor>>;

    /// Bulk artifact transfer; one request covers every queried name.
    /// Streamed items land in `dest` and are distinguished as artifacts vs
    /// `<name>.meta` files by suffix. With `no_meta` set the server sends
    /// artifacts only.
    fn download_binaries(
        &self,
        server: &str,
        scope: &Scope,
        query: &ListQuery,
        dest: &Path,
    ) -> KilnResult<Vec<DownloadedFile>>;

    /// Preinstall-image discovery for a set of origin scopes.
    fn list_images(&self, server: &str, prpas: &[String]) -> KilnResult<Vec<ImageDescriptor>>;

    /// Single-image transfer into `dest`.
    fn download_image(&self, server: &str, prpa: &str, path: &str, dest: &Path) -> KilnResult<()>;
}

/// Job-scoped reuse of binary listings across components.
///
/// The image selector queries the same repositories the resolver walks;
/// listings are keyed by origin scope so the resolver can skip a second
/// request when a known listing already covers every outstanding name.
#[derive(Debug, Default)]
pub struct ListingCache {
    known: HashMap<String, Vec<BinaryDescriptor>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prpa: String, listing: Vec<BinaryDescriptor>) {
        self.known.insert(prpa, listing);
    }

    /// The stored listing for a scope, only if it covers every requested
    /// name (either as an available artifact or an explicit error entry).
    pub fn covering(&self, prpa: &str, names: &[String]) -> Option<&[BinaryDescriptor]> {
        let listing = self.known.get(prpa)?;

        let covers = |name: &String| {
            listing.iter().any(|d| {
                if d.is_unavailable() {
                    d.name == *name
                } else {
                    bin_stem(&d.name) == Some(name.as_str())
                }
            })
        };

        if names.iter().all(covers) {
            Some(listing)
        } else {
            None
        }
    }
}

/// Index a listing by binary stem; error entries keep their full name.
pub fn index_listing(listing: &[BinaryDescriptor]) -> HashMap<&str, &BinaryDescriptor> {
    let mut by_name = HashMap::new();
    for desc in listing {
        if desc.is_unavailable() {
            by_name.insert(desc.name.as_str(), desc);
        } else if let Some(stem) = bin_stem(&desc.name) {
            by_name.insert(stem, desc);
        }
    }
    by_name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, hash: &str) -> BinaryDescriptor {
        BinaryDescriptor {
            name: name.into(),
            hdrmd5: hash.into(),
            size_kb: 1,
            ..Default::default()
        }
    }

    #[test]
    fn downloaded_file_classification() {
        let f = DownloadedFile {
            name: "gcc-13.2-1.x86_64.rpm".into(),
            path: PathBuf::from("/tmp/gcc-13.2-1.x86_64.rpm"),
        };
        assert_eq!(f.as_binary(), Some("gcc-13.2-1.x86_64"));
        assert_eq!(f.as_meta(), None);

        let m = DownloadedFile {
            name: "gcc.meta".into(),
            path: PathBuf::from("/tmp/gcc.meta"),
        };
        assert_eq!(m.as_binary(), None);
        assert_eq!(m.as_meta(), Some("gcc"));
    }

    #[test]
    fn index_listing_keys_by_stem() {
        let listing = vec![
            desc("gcc-13.2-1.x86_64.rpm", "h1"),
            BinaryDescriptor {
                name: "missing-pkg".into(),
                error: "not available".into(),
                ..Default::default()
            },
        ];

        let idx = index_listing(&listing);
        assert!(idx.contains_key("gcc-13.2-1.x86_64"));
        assert!(idx.contains_key("missing-pkg"));
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn listing_cache_requires_full_coverage() {
        let mut cache = ListingCache::new();
        cache.insert(
            "p/r/a".into(),
            vec![desc("gcc-13.2-1.x86_64.rpm", "h1")],
        );

        let covered = vec!["gcc-13.2-1.x86_64".to_string()];
        assert!(cache.covering("p/r/a", &covered).is_some());

        let partial = vec![
            "gcc-13.2-1.x86_64".to_string(),
            "make-4.4-1.x86_64".to_string(),
        ];
        assert!(cache.covering("p/r/a", &partial).is_none());
        assert!(cache.covering("other/r/a", &covered).is_none());
    }
}
