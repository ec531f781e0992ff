use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiergate_server::{
    routes, AppState, Config, DisabledTranscripts, Error, OllamaEngine, SqliteTranscriptStore,
    TranscriptStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().map_err(|e| Error::Config(e.to_string()))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        tiers = config.admission.tiers,
        tick_ms = config.admission.tick_ms,
        reservation = ?config.admission.reservation,
        "Starting tiergate"
    );

    let engine = Arc::new(OllamaEngine::new(
        &config.engine.ollama.base_url,
        &config.engine.ollama.model,
    ));
    tracing::info!(
        "Using ollama engine at {} with model {}",
        config.engine.ollama.base_url,
        config.engine.ollama.model
    );

    let transcripts: Arc<dyn TranscriptStore> = if config.transcript.enabled {
        Arc::new(SqliteTranscriptStore::new(&config.transcript.database_url)?)
    } else {
        tracing::info!("Transcript persistence disabled");
        Arc::new(DisabledTranscripts)
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, engine, transcripts));
    let fail_fast = state.fail_fast().clone();

    let app = routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    let shutdown = {
        let fail_fast = fail_fast.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C, shutting down"),
                _ = fail_fast.tripped() => {}
            }
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    if fail_fast.is_tripped() {
        return Err(Error::EngineFailure(format!(
            "{} consecutive engine failures",
            fail_fast.consecutive_failures()
        ))
        .into());
    }

    Ok(())
}
