use clap::Parser;
use cluster_backend::config::AnalysisConfig;
use cluster_backend::infrastructure::{engine, staging};
use cluster_backend::services::orchestrator::AnalysisService;
use cluster_backend::services::worker::StagingSweeper;
use cluster_backend::{AppState, create_app};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the API server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port for the API server
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting cluster backend...");

    let config = AnalysisConfig::from_env();
    info!(
        "🛡️  Upload policy: Max Size={}MB, Strict Extensions={} ({}), Expose Diagnostics={}",
        config.max_file_size / 1024 / 1024,
        config.strict_extensions,
        config.allowed_extensions.join(","),
        config.expose_engine_diagnostics
    );

    let staging_store = staging::setup_staging(&config).await?;
    let analysis_engine = engine::setup_engine(&config).await;
    let analysis = Arc::new(AnalysisService::new(
        staging_store.clone(),
        analysis_engine,
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweeper_handle = config.staging_cleanup_age().map(|max_age| {
        let sweeper = StagingSweeper::new(
            staging_store.clone(),
            max_age,
            Duration::from_secs(config.staging_sweep_interval_secs.max(1)),
            shutdown_rx,
        );
        tokio::spawn(sweeper.run())
    });

    let state = AppState {
        analysis,
        config: config.clone(),
    };
    let app = create_app(state);

    let addr = SocketAddr::new(args.host, args.port);
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
