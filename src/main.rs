use std::sync::Arc;

use field_dispatch::backend::HttpBackend;
use field_dispatch::channel::transport::HttpPushTransport;
use field_dispatch::config::{BackendConfig, DispatchConfig};
use field_dispatch::location::NoopLocationSink;
use field_dispatch::{Engine, EngineNotice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let backend_config = BackendConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export DISPATCH_BASE_URL=https://...");
        eprintln!("  export DISPATCH_AUTH_TOKEN=...");
        eprintln!("  export DISPATCH_WORKER_ID=<uuid>");
        std::process::exit(1);
    });

    eprintln!("🚚 Field Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {}", backend_config.base_url);
    eprintln!("   Worker:  {}\n", backend_config.worker_id);

    let config = DispatchConfig {
        worker_id: backend_config.worker_id,
        ..DispatchConfig::default()
    };

    let backend = Arc::new(HttpBackend::new(&backend_config));
    let transport = Arc::new(HttpPushTransport::new(&backend_config));
    let (engine, handle) = Engine::new(config, backend, transport, Arc::new(NoopLocationSink));

    let engine_task = tokio::spawn(engine.run());

    // Log notifications that a real host application would surface in UI.
    let mut notices = handle.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                EngineNotice::OfferUnavailable { offer_id } => {
                    tracing::info!(offer_id = %offer_id, "Offer no longer available");
                }
                EngineNotice::AssignmentCompleted { assignment_id, .. } => {
                    tracing::info!(assignment_id = %assignment_id, "Assignment completed");
                }
                EngineNotice::AssignmentCancelled { assignment_id } => {
                    tracing::info!(assignment_id = %assignment_id, "Assignment cancelled");
                }
                EngineNotice::AuthExpired => {
                    tracing::warn!("Session expired, sign in again");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    handle.shutdown().await.ok();
    engine_task.await?;

    Ok(())
}
