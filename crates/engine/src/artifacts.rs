//! Per-run artifact documents
//!
//! Layout: `<root>/<run_id>/{discovery,test_cases,report}.json`. Writes go
//! through a temp file and a rename so readers never observe partial
//! documents.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use qaflow_common::{DiscoveredPage, Error, Report, Result, TestCase};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::report::group_scenarios;

pub const DISCOVERY_DOC: &str = "discovery.json";
pub const TEST_CASES_DOC: &str = "test_cases.json";
pub const REPORT_DOC: &str = "report.json";

const DOCUMENTS: [&str; 3] = [DISCOVERY_DOC, TEST_CASES_DOC, REPORT_DOC];

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!("Artifact store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_component(run_id)?;
        Ok(self.root.join(run_id))
    }

    /// `pages: [{url, page_signature, page_kind, controls}]`
    pub async fn write_discovery(&self, run_id: &str, pages: &[DiscoveredPage]) -> Result<ArtifactInfo> {
        let pages: Vec<Value> = pages
            .iter()
            .map(|p| {
                json!({
                    "url": p.url,
                    "page_signature": p.page_signature,
                    "page_kind": p.page_kind,
                    "controls": p.controls,
                })
            })
            .collect();
        self.write(run_id, DISCOVERY_DOC, &json!({ "pages": pages })).await
    }

    /// `all_test_cases`, `total_test_cases`, `scenarios`
    pub async fn write_test_cases(&self, run_id: &str, cases: &[TestCase]) -> Result<ArtifactInfo> {
        let doc = json!({
            "all_test_cases": cases,
            "total_test_cases": cases.len(),
            "scenarios": group_scenarios(cases),
        });
        self.write(run_id, TEST_CASES_DOC, &doc).await
    }

    pub async fn write_report(&self, run_id: &str, report: &Report) -> Result<ArtifactInfo> {
        self.write(run_id, REPORT_DOC, &serde_json::to_value(report)?).await
    }

    async fn write(&self, run_id: &str, name: &str, doc: &Value) -> Result<ArtifactInfo> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir).await?;
        let data = serde_json::to_vec_pretty(doc)?;

        let path = dir.join(name);
        let tmp_path = dir.join(format!(".{}.tmp", name));
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored {} for run {} ({} bytes)", name, run_id, data.len());
        Ok(ArtifactInfo {
            name: name.to_string(),
            path,
            size: data.len() as u64,
            sha256: hash(&data),
        })
    }

    /// Documents stored for a run
    pub async fn list(&self, run_id: &str) -> Result<Vec<ArtifactInfo>> {
        let dir = self.run_dir(run_id)?;
        let mut found = Vec::new();
        for name in DOCUMENTS {
            let path = dir.join(name);
            match fs::read(&path).await {
                Ok(data) => found.push(ArtifactInfo {
                    name: name.to_string(),
                    path,
                    size: data.len() as u64,
                    sha256: hash(&data),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(found)
    }

    /// Read one document
    pub async fn fetch(&self, run_id: &str, name: &str) -> Result<Value> {
        if !DOCUMENTS.contains(&name) {
            return Err(Error::NotFound {
                kind: "artifact".to_string(),
                id: name.to_string(),
            });
        }
        let path = self.run_dir(run_id)?.join(name);
        match fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                kind: "artifact".to_string(),
                id: format!("{}/{}", run_id, name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove run directories last modified before the retention window
    pub async fn purge_expired(&self, retention: Duration) -> Result<Vec<String>> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = Vec::new();

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::now());
            if modified >= cutoff {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed.push(run_id),
                Err(e) => warn!("Failed to purge artifacts of {}: {}", run_id, e),
            }
        }

        if !removed.is_empty() {
            info!("Purged artifacts of {} run(s)", removed.len());
        }
        Ok(removed)
    }
}

fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Run ids become directory names
fn validate_component(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::NotFound {
            kind: "run".to_string(),
            id: run_id.to_string(),
        })
    }
}
