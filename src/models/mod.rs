use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use utoipa::ToSchema;

/// A group of people sharing inferred affinities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Cluster {
    pub members: Vec<String>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Decoded engine output, clusters in engine order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterResult {
    pub clusters: Vec<Cluster>,
}

impl ClusterResult {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.clusters.iter().map(Cluster::len).collect()
    }

    pub fn member_count(&self) -> usize {
        self.clusters.iter().map(Cluster::len).sum()
    }
}

/// Legacy cluster entry; `name` holds the member list
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LegacyCluster {
    pub name: Vec<String>,
}

/// Response body of `POST /upload`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClusterResponse {
    pub clusters: Vec<LegacyCluster>,
}

impl From<ClusterResult> for ClusterResponse {
    fn from(result: ClusterResult) -> Self {
        Self {
            clusters: result
                .clusters
                .into_iter()
                .map(|c| LegacyCluster { name: c.members })
                .collect(),
        }
    }
}

pub const CLUSTER_CONTRACT_VERSION: u32 = 2;

/// Response body of `POST /v2/analyze`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClusterResponseV2 {
    pub version: u32,
    pub clusters: Vec<Cluster>,
}

impl From<ClusterResult> for ClusterResponseV2 {
    fn from(result: ClusterResult) -> Self {
        Self {
            version: CLUSTER_CONTRACT_VERSION,
            clusters: result.clusters,
        }
    }
}

/// A file part received with an analysis request
pub struct IncomingFile<'a> {
    pub original_filename: Option<String>,
    pub content_type: Option<String>,
    /// Size announced by the client, when known before the body is read
    pub declared_size: Option<u64>,
    pub body: Box<dyn AsyncRead + Unpin + Send + 'a>,
}

impl std::fmt::Debug for IncomingFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFile")
            .field("original_filename", &self.original_filename)
            .field("content_type", &self.content_type)
            .field("declared_size", &self.declared_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct UploadRequest<'a> {
    pub file: Option<IncomingFile<'a>>,
}

impl<'a> UploadRequest<'a> {
    pub fn empty() -> Self {
        Self { file: None }
    }

    pub fn with_file(file: IncomingFile<'a>) -> Self {
        Self { file: Some(file) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterResult {
        ClusterResult {
            clusters: vec![
                Cluster {
                    members: vec!["Alice".to_string(), "Charlie".to_string()],
                },
                Cluster {
                    members: vec!["Bob".to_string()],
                },
            ],
        }
    }

    #[test]
    fn test_legacy_shape_keeps_name_field() {
        let body = serde_json::to_value(ClusterResponse::from(sample())).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"clusters": [{"name": ["Alice", "Charlie"]}, {"name": ["Bob"]}]})
        );
    }

    #[test]
    fn test_v2_shape_uses_members() {
        let body = serde_json::to_value(ClusterResponseV2::from(sample())).unwrap();
        assert_eq!(body["version"], 2);
        assert_eq!(body["clusters"][0]["members"][1], "Charlie");
        assert!(body["clusters"][0].get("name").is_none());
    }

    #[test]
    fn test_sizes() {
        let result = sample();
        assert_eq!(result.cluster_sizes(), vec![2, 1]);
        assert_eq!(result.member_count(), 3);
    }
}
