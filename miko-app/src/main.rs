//! Miko entry point — wires the streaming gateway to the agent, TTS, VLM,
//! and memory services.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use miko_gateway::auth::TokenValidator;
use miko_gateway::normalizer::TextNormalizer;
use miko_gateway::server::ConnectionManager;

use miko_app::agent::OpenAiChatAgent;
use miko_app::api::{self, AppServices};
use miko_app::assets::FileAssetCatalog;
use miko_app::config::MikoConfig;
use miko_app::services::{LtmClient, ManagedService, StmClient, TtsClient, VlmClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse config path from CLI args (first arg) or default to "miko.toml"
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "miko.toml".to_string());

    let config = match MikoConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}; starting with defaults", e);
            MikoConfig::default()
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Miko starting with config from '{}'", config_path);

    // External service adapters, initialized before anything listens.
    let tts = Arc::new(
        TtsClient::new(&config.tts.base_url, config.tts.voice.clone())
            .context("Failed to build TTS adapter")?,
    );
    let vlm =
        Arc::new(VlmClient::new(&config.vlm.base_url).context("Failed to build VLM adapter")?);
    let stm = Arc::new(
        StmClient::new(&config.memory.stm_base_url).context("Failed to build STM adapter")?,
    );
    let ltm = Arc::new(
        LtmClient::new(&config.memory.ltm_base_url).context("Failed to build LTM adapter")?,
    );

    let managed: Vec<Arc<dyn ManagedService>> =
        vec![tts.clone(), vlm.clone(), stm.clone(), ltm.clone()];
    for service in &managed {
        service
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize {} service", service.name()))?;
    }

    let agent = Arc::new(
        OpenAiChatAgent::new(&config.agent).context("Failed to build agent adapter")?,
    );
    let assets = Arc::new(FileAssetCatalog::new(&config.assets));
    let validator = Arc::new(TokenValidator::new(&config.auth.tokens));
    let normalizer = Arc::new(TextNormalizer::new(&config.normalizer_rules()));

    let gateway = ConnectionManager::new(
        validator,
        agent,
        assets,
        normalizer,
        config.connection_settings(),
        config.stream_settings(),
    );

    let rest = api::router(AppServices { tts, vlm, stm, ltm });
    let app = gateway.router().merge(rest);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Miko listening on {}", addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
