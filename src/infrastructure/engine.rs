use crate::config::AnalysisConfig;
use crate::services::engine::{AnalysisEngine, ProcessEngine};
use std::sync::Arc;
use tracing::info;

pub async fn setup_engine(config: &AnalysisConfig) -> Arc<dyn AnalysisEngine> {
    let engine = ProcessEngine::from_config(config);

    info!(
        "🧠 Engine: {} {} <dataset> (timeout {}s, stderr policy '{}')",
        config.engine_program,
        config.engine_args.join(" "),
        config.engine_timeout_secs,
        config.stderr_policy
    );

    // Warm-up probe only; requests still fail individually if it stays missing
    if engine.health_check().await {
        info!("✅ Analysis engine '{}' is available", engine.program());
    } else {
        tracing::warn!(
            "⚠️  Analysis engine '{}' could not be started! Uploads will fail until it is installed.",
            engine.program()
        );
    }

    Arc::new(engine)
}
