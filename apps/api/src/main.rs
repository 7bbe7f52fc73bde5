mod channel;
mod config;
mod conversation;
mod db;
mod dispatch;
mod embedding;
mod errors;
mod generation;
mod ingestion;
mod llm_client;
mod routes;
mod state;
mod vector;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::channel::HttpChannelGateway;
use crate::config::Config;
use crate::conversation::{Mediator, PgConversationStore};
use crate::db::{create_pool, ensure_schema};
use crate::dispatch::HttpMailSubmitter;
use crate::embedding::HttpEmbedder;
use crate::generation::RagEmailGenerator;
use crate::ingestion::PdfIngestor;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::state::AppState;
use crate::vector::MemoryVectorStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Courier API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let pool = create_pool(&config.database_url).await?;
    ensure_schema(&pool).await?;

    // Collaborators behind the mediator
    let embedder = Arc::new(HttpEmbedder::new(
        config.embedding_api_url.clone(),
        config.embedding_api_key.clone(),
        config.embedding_model.clone(),
    ));
    let vectors = Arc::new(MemoryVectorStore::new());
    info!("Vector store initialized (in-memory)");

    let llm = Arc::new(LlmClient::new(config.anthropic_api_key.clone()));
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let ingestor = Arc::new(PdfIngestor::new(embedder.clone(), vectors.clone()));
    let generator = Arc::new(RagEmailGenerator::new(
        llm,
        embedder,
        vectors,
        config.sender_name.clone(),
    ));
    let mailer = Arc::new(HttpMailSubmitter::new(
        config.mail_api_url.clone(),
        config.mail_api_key.clone(),
        config.sender_name.clone(),
        config.sender_email.clone(),
    ));
    let store = Arc::new(PgConversationStore::new(pool));

    let mediator = Arc::new(Mediator::new(
        store,
        ingestor,
        generator,
        mailer,
        Duration::from_secs(config.external_timeout_secs),
    ));

    let channel = Arc::new(HttpChannelGateway::new(
        config.channel_api_url.clone(),
        config.channel_account_id.clone(),
        config.channel_auth_token.clone(),
        config.channel_sender.clone(),
    ));

    // Build app state
    let state = AppState {
        mediator,
        channel,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
