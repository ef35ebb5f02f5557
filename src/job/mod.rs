//! Build job model
//!
//! A job describes one package build: its repository scope, the binary
//! dependencies it needs, the ordered repository paths to resolve them
//! against, and the subpackages the build itself will produce. Jobs are
//! loaded from TOML files handed to the worker by the scheduler.

pub mod runner;

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// The `(project, repository, architecture)` triple identifying a
/// repository namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub project: String,
    pub repository: String,
    pub arch: String,
}

impl Scope {
    pub fn new(
        project: impl Into<String>,
        repository: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            repository: repository.into(),
            arch: arch.into(),
        }
    }

    /// Parse a `project/repository/arch` string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut it = s.splitn(3, '/');
        match (it.next(), it.next(), it.next()) {
            (Some(p), Some(r), Some(a)) if !p.is_empty() && !r.is_empty() && !a.is_empty() => {
                Some(Self::new(p, r, a))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    /// Renders as `project/repository/arch` (the "prpa" form).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.repository, self.arch)
    }
}

/// One binary dependency of the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BDep {
    pub name: String,
    /// "src" dependencies are sources, not binaries to fetch
    pub repo_arch: String,
    /// Excluded from the dependency manifest
    pub not_meta: bool,
    /// Never installed into the build root (and never covered by an image)
    pub no_install: bool,
    /// Expected content hash; empty when the scheduler does not know one
    pub hdrmd5: String,
    pub version: String,
    pub release: String,
}

/// One entry of the job's ordered repository search path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoPath {
    pub project: String,
    pub repository: String,
    /// Repository server override; empty means the job's default server
    pub server: String,
}

/// Cycle-handling algorithm for the dependency manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaAlgorithm {
    /// Drop every dependency chain rooted at a cycle
    #[default]
    Basic,
    /// Keep the shallowest non-conflicting appearance of cyclic entries
    Refined,
}

/// A build job as handed to the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub project: String,
    pub repository: String,
    pub package: String,
    pub arch: String,

    /// The source file driving the build; `_preinstallimage` marks an
    /// image-building job
    pub file: String,

    /// Default repository server for paths without their own
    pub repo_server: String,
    /// Source server; listings from it are never image candidates
    pub src_server: String,

    pub subpacks: Vec<String>,
    pub modules: Vec<String>,
    pub bdeps: Vec<BDep>,
    pub paths: Vec<RepoPath>,

    pub meta_algorithm: MetaAlgorithm,

    /// Metadata is suppressed for the whole job
    pub no_meta: bool,
}

impl JobSpec {
    /// Load a job description from a TOML file.
    pub fn load(path: &Path) -> KilnResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| KilnError::io(format!("reading job file {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KilnError::JobInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// The job's own repository scope.
    pub fn scope(&self) -> Scope {
        Scope::new(&self.project, &self.repository, &self.arch)
    }

    /// The scope a repository path resolves against (same arch as the job).
    pub fn scope_of(&self, repo: &RepoPath) -> Scope {
        Scope::new(&repo.project, &repo.repository, &self.arch)
    }

    /// The server a repository path is queried at.
    pub fn server_of<'a>(&'a self, repo: &'a RepoPath) -> &'a str {
        if repo.server.is_empty() {
            &self.repo_server
        } else {
            &repo.server
        }
    }

    /// Whether this job builds a preinstall image itself.
    pub fn is_preinstall_image(&self) -> bool {
        self.file == "_preinstallimage"
    }

    /// Metadata from foreign repositories is never trusted, and
    /// image-building jobs take none at all.
    pub fn suppress_meta_for(&self, repo: &RepoPath) -> bool {
        repo.project != self.project
            || repo.repository != self.repository
            || self.is_preinstall_image()
    }

    /// Binary dependencies that must be fetched (excludes sources).
    pub fn not_src_bdeps(&self) -> Vec<&BDep> {
        self.bdeps.iter().filter(|d| d.repo_arch != "src").collect()
    }

    /// Dependencies that appear in the dependency manifest.
    pub fn meta_bdeps(&self) -> Vec<&BDep> {
        self.bdeps.iter().filter(|d| !d.not_meta).collect()
    }

    /// Dependencies flagged no-install, across all repo arches.
    pub fn no_install_bdeps(&self) -> Vec<&BDep> {
        self.bdeps.iter().filter(|d| d.no_install).collect()
    }

    /// Dependencies that end up installed in the build root, and are
    /// therefore candidates for preinstall-image coverage.
    pub fn installable_bdeps(&self) -> Vec<&BDep> {
        self.bdeps
            .iter()
            .filter(|d| d.repo_arch != "src" && !d.no_install)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job_with_bdeps() -> JobSpec {
        JobSpec {
            project: "devel:tools".into(),
            repository: "standard".into(),
            package: "widget".into(),
            arch: "x86_64".into(),
            bdeps: vec![
                BDep {
                    name: "gcc".into(),
                    ..Default::default()
                },
                BDep {
                    name: "widget-src".into(),
                    repo_arch: "src".into(),
                    ..Default::default()
                },
                BDep {
                    name: "doc-tool".into(),
                    not_meta: true,
                    no_install: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn scope_display_and_parse() {
        let scope = Scope::new("devel:tools", "standard", "x86_64");
        let s = scope.to_string();
        assert_eq!(s, "devel:tools/standard/x86_64");
        assert_eq!(Scope::parse(&s), Some(scope));
        assert_eq!(Scope::parse("not-a-scope"), None);
    }

    #[test]
    fn bdep_filters() {
        let job = job_with_bdeps();

        let not_src: Vec<_> = job.not_src_bdeps().iter().map(|d| d.name.clone()).collect();
        assert_eq!(not_src, vec!["gcc", "doc-tool"]);

        let meta: Vec<_> = job.meta_bdeps().iter().map(|d| d.name.clone()).collect();
        assert_eq!(meta, vec!["gcc", "widget-src"]);

        let no_install: Vec<_> = job
            .no_install_bdeps()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(no_install, vec!["doc-tool"]);
    }

    #[test]
    fn preinstall_image_mode() {
        let mut job = job_with_bdeps();
        assert!(!job.is_preinstall_image());

        job.file = "_preinstallimage".into();
        assert!(job.is_preinstall_image());
    }

    #[test]
    fn meta_suppression_for_foreign_repo() {
        let job = job_with_bdeps();

        let own = RepoPath {
            project: "devel:tools".into(),
            repository: "standard".into(),
            server: String::new(),
        };
        assert!(!job.suppress_meta_for(&own));

        let foreign = RepoPath {
            project: "openSUSE:Factory".into(),
            repository: "standard".into(),
            server: String::new(),
        };
        assert!(job.suppress_meta_for(&foreign));
    }

    #[test]
    fn server_fallback() {
        let mut job = job_with_bdeps();
        job.repo_server = "http://repo.example".into();

        let default = RepoPath::default();
        assert_eq!(job.server_of(&default), "http://repo.example");

        let explicit = RepoPath {
            server: "http://mirror.example".into(),
            ..Default::default()
        };
        assert_eq!(job.server_of(&explicit), "http://mirror.example");
    }

    #[test]
    fn load_job_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            r#"
project = "devel:tools"
repository = "standard"
package = "widget"
arch = "x86_64"
subpacks = ["widget", "widget-devel"]
meta_algorithm = "refined"

[[bdeps]]
name = "gcc"

[[paths]]
project = "devel:tools"
repository = "standard"
"#,
        )
        .unwrap();

        let job = JobSpec::load(&path).unwrap();
        assert_eq!(job.package, "widget");
        assert_eq!(job.meta_algorithm, MetaAlgorithm::Refined);
        assert_eq!(job.subpacks.len(), 2);
        assert_eq!(job.paths.len(), 1);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, "project = [broken").unwrap();

        assert!(matches!(
            JobSpec::load(&path),
            Err(KilnError::JobInvalid { .. })
        ));
    }
}
