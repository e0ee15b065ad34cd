use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_service::config::AppConfig;
use agent_service::{build_router, AppState};
use agentcore::mcp::{IntegrationRegistry, McpTimeouts};
use agentcore::store::{InMemoryChatStore, SharedChatStore};
use agentcore::{auth::TokenCache, llm::LlmClient, Orchestrator};
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the TOML configuration file
    #[arg(long, default_value = "agent-service.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config).await?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .logging
                .filter
                .clone()
                .unwrap_or_else(|| "agentcore=info,agent_service=info,tower_http=info".to_string()),
        )
    });
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!(
        addr = %args.addr,
        servers = config.mcp_servers.len(),
        "starting agent service"
    );

    let auth_cache = Arc::new(TokenCache::new());
    let mcp_timeouts = McpTimeouts {
        connect: Duration::from_secs(config.mcp.connect_timeout_seconds.unwrap_or(30)),
        read_write: Duration::from_secs(config.mcp.read_timeout_seconds.unwrap_or(360)),
    };
    let registry = Arc::new(IntegrationRegistry::with_timeouts(
        config.mcp_servers.clone(),
        auth_cache,
        mcp_timeouts,
    )?);
    registry.refresh().await;

    if let Some(interval_secs) = config.mcp.registry_refresh_seconds.filter(|s| *s > 0) {
        let refresh_registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await; // first tick fires immediately; skip it, startup already refreshed.
            loop {
                ticker.tick().await;
                refresh_registry.refresh().await;
            }
        });
    }

    let llm = Arc::new(LlmClient::with_timeout(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        config
            .llm
            .timeout_seconds
            .unwrap_or(agentcore::llm::client::DEFAULT_TIMEOUT_SECONDS),
    )?);

    let store: SharedChatStore = Arc::new(InMemoryChatStore::new());
    let system_role = config.resolve_system_role().await?;
    let max_rounds = config
        .tools
        .max_rounds
        .unwrap_or(agentcore::orchestrator::MAX_ROUNDS);
    let content_max_length = config
        .content
        .max_length
        .unwrap_or(agentcore::filter::DEFAULT_MAX_LENGTH);

    if let Some(system_text) = &system_role {
        info!(chars = system_text.len(), "loaded system role text");
    }

    let orchestrator = Arc::new(
        Orchestrator::with_limits(store.clone(), registry, llm, max_rounds, content_max_length)
            .with_system_role(system_role),
    );

    let state = AppState {
        store,
        orchestrator,
        default_model: config.llm.model.clone(),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
