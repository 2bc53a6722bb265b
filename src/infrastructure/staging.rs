use crate::config::AnalysisConfig;
use crate::services::staging::LocalStagingStore;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

pub async fn setup_staging(config: &AnalysisConfig) -> anyhow::Result<Arc<LocalStagingStore>> {
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("creating upload dir {}", config.upload_dir.display()))?;

    // The engine may run from another working directory, so hand it absolute paths
    let root = tokio::fs::canonicalize(&config.upload_dir)
        .await
        .with_context(|| format!("resolving upload dir {}", config.upload_dir.display()))?;

    info!(
        "📁 Staging: {} (max {} MB per dataset)",
        root.display(),
        config.max_file_size / 1024 / 1024
    );

    Ok(Arc::new(LocalStagingStore::new(
        root,
        config.max_file_size as u64,
    )))
}
