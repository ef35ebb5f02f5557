//! HTTP repository client
//!
//! Synchronous `ureq`-based implementation of [`RepoClient`]. Transient
//! transport failures are retried with exponential backoff (3 attempts,
//! starting at 10 ms); non-2xx responses surface the status and body.
//! Bulk binary downloads arrive as a tar stream that is unpacked into the
//! package directory.

use crate::error::{KilnError, KilnResult};
use crate::job::Scope;
use crate::repo::{BinaryDescriptor, DownloadedFile, ImageDescriptor, ListQuery, RepoClient};
use serde::Deserialize;
use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use ureq::Agent;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct BinaryListResponse {
    #[serde(default)]
    binaries: Vec<BinaryDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ImageListResponse {
    #[serde(default)]
    images: Vec<ImageDescriptor>,
}

/// Repository client over HTTP.
pub struct HttpRepoClient {
    agent: Agent,
    worker_id: String,
}

impl HttpRepoClient {
    pub fn new(timeout: Duration, worker_id: impl Into<String>) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();

        Self {
            agent: Agent::new_with_config(config),
            worker_id: worker_id.into(),
        }
    }

    /// GET with bounded retry, handing the successful response to `handle`.
    fn get<T>(
        &self,
        url: &str,
        handle: impl Fn(ureq::Body) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let mut backoff = RETRY_BACKOFF;
        let mut last_err = None;

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(backoff);
                backoff *= 2;
            }

            match self.agent.get(url).call() {
                Ok(resp) => {
                    let status = resp.status();
                    let mut body = resp.into_body();
                    if !status.is_success() {
                        let text = body.read_to_string().unwrap_or_default();
                        return Err(KilnError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    return handle(body);
                }
                Err(e) => {
                    warn!("Request to {} failed (attempt {}): {}", url, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(KilnError::transport(
            url,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn scope_query(&self, scope: &Scope) -> String {
        let mut q = format!(
            "project={}&repository={}&arch={}",
            scope.project, scope.repository, scope.arch
        );
        if !self.worker_id.is_empty() {
            q.push_str("&workerid=");
            q.push_str(&self.worker_id);
        }
        q
    }
}

impl RepoClient for HttpRepoClient {
    fn list_binaries(
        &self,
        server: &str,
        scope: &Scope,
        query: &ListQuery,
    ) -> KilnResult<Vec<BinaryDescriptor>> {
        let mut url = format!(
            "{}/getbinaryversions?{}&binaries={}",
            server,
            self.scope_query(scope),
            query.names.join(",")
        );
        for module in &query.modules {
            url.push_str("&module=");
            url.push_str(module);
        }
        if query.no_meta {
            url.push_str("&nometa=1");
        }

        debug!("Listing {} binaries at {}", query.names.len(), server);

        self.get(&url, |mut body| {
            let text = body
                .read_to_string()
                .map_err(|e| KilnError::transport(&url, e))?;
            let parsed: BinaryListResponse = serde_json::from_str(&text)?;
            Ok(parsed.binaries)
        })
    }

    fn download_binaries(
        &self,
        server: &str,
        scope: &Scope,
        query: &ListQuery,
        dest: &Path,
    ) -> KilnResult<Vec<DownloadedFile>> {
        let mut url = format!(
            "{}/getbinaries?{}&binaries={}",
            server,
            self.scope_query(scope),
            query.names.join(",")
        );
        for module in &query.modules {
            url.push_str("&module=");
            url.push_str(module);
        }
        if query.no_meta {
            url.push_str("&nometa=1");
        }

        debug!("Downloading {} binaries from {}", query.names.len(), server);

        self.get(&url, |body| {
            let mut archive = tar::Archive::new(body.into_reader());
            let mut files = Vec::new();

            let entries = archive
                .entries()
                .map_err(|e| KilnError::io("reading download stream".to_string(), e))?;

            for entry in entries {
                let mut entry =
                    entry.map_err(|e| KilnError::io("reading download stream".to_string(), e))?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }

                // Streamed names are flattened; never honor directory
                // components from the wire.
                let name = match entry.path().ok().and_then(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                }) {
                    Some(n) => n,
                    None => continue,
                };

                let path = dest.join(&name);
                let mut out = File::create(&path)
                    .map_err(|e| KilnError::io(format!("creating {}", path.display()), e))?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))?;

                files.push(DownloadedFile { name, path });
            }

            Ok(files)
        })
    }

    fn list_images(&self, server: &str, prpas: &[String]) -> KilnResult<Vec<ImageDescriptor>> {
        let mut url = format!("{}/getpreinstallimageinfos?match=body", server);
        for prpa in prpas {
            url.push_str("&prpa=");
            url.push_str(prpa);
        }

        let mut backoff = RETRY_BACKOFF;
        let mut last_err = None;

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(backoff);
                backoff *= 2;
            }

            match self
                .agent
                .post(&url)
                .header("content-type", "application/octet-stream")
                .send(&[][..])
            {
                Ok(resp) => {
                    let status = resp.status();
                    let mut body = resp.into_body();
                    if !status.is_success() {
                        let text = body.read_to_string().unwrap_or_default();
                        return Err(KilnError::HttpStatus {
                            url,
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    let text = body
                        .read_to_string()
                        .map_err(|e| KilnError::transport(&url, e))?;
                    let parsed: ImageListResponse = serde_json::from_str(&text)?;
                    return Ok(parsed.images);
                }
                Err(e) => {
                    warn!("Request to {} failed (attempt {}): {}", url, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(KilnError::transport(
            &url,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn download_image(&self, server: &str, prpa: &str, path: &str, dest: &Path) -> KilnResult<()> {
        let url = format!("{}/build/{}/{}", server, prpa, path);

        self.get(&url, |body| {
            let mut out = File::create(dest)
                .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;
            io::copy(&mut body.into_reader(), &mut out)
                .map_err(|e| KilnError::io(format!("writing {}", dest.display()), e))?;
            Ok(())
        })
    }
}
