use serde::Deserialize;
use thiserror::Error;

use crate::models::{Cluster, ClusterResult};

/// Engine output that does not satisfy the result contract
#[derive(Debug, Error)]
#[error("Malformed engine output: {reason}")]
pub struct DecodeError {
    pub reason: String,
    /// Captured stdout, kept for diagnostics
    pub raw: Vec<u8>,
}

impl DecodeError {
    fn new(reason: impl Into<String>, raw: &[u8]) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }

    /// Lossy, length-limited rendering of the raw output for logs
    pub fn raw_excerpt(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.raw);
        if text.chars().count() <= max_chars {
            text.into_owned()
        } else {
            let cut: String = text.chars().take(max_chars).collect();
            format!("{}… ({} bytes total)", cut, self.raw.len())
        }
    }
}

#[derive(Deserialize)]
struct EngineDocument {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    num_clusters: Option<u64>,
    clusters: Vec<EngineCluster>,
}

/// `name` holds the member list in the engine's contract
#[derive(Deserialize)]
struct EngineCluster {
    #[serde(rename = "name", alias = "members")]
    members: Vec<String>,
}

/// Parses captured engine stdout. Never returns a partial result.
pub fn decode(raw: &[u8]) -> Result<ClusterResult, DecodeError> {
    let document: EngineDocument =
        serde_json::from_slice(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

    if let Some(status) = document.status.as_deref() {
        if status != "success" {
            return Err(DecodeError::new(
                format!("engine reported status '{}'", status),
                raw,
            ));
        }
    }

    if document.clusters.is_empty() {
        return Err(DecodeError::new("result contains no clusters", raw));
    }

    if let Some(declared) = document.num_clusters {
        if declared as usize != document.clusters.len() {
            return Err(DecodeError::new(
                format!(
                    "num_clusters is {} but {} clusters were returned",
                    declared,
                    document.clusters.len()
                ),
                raw,
            ));
        }
    }

    if let Some(index) = document.clusters.iter().position(|c| c.members.is_empty()) {
        return Err(DecodeError::new(
            format!("cluster {} has no members", index),
            raw,
        ));
    }

    Ok(ClusterResult {
        clusters: document
            .clusters
            .into_iter()
            .map(|c| Cluster { members: c.members })
            .collect(),
    })
}
