//! Facade configuration: LLM endpoint/model, MCP server list, tool-round
//! and content-length overrides, MCP timeout/refresh tuning, and logging.

use std::path::Path;

use agentcore::mcp::{McpServerConfig, RawAuthConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    /// Initial system message text, or a path to a file containing it.
    #[serde(default)]
    pub system_role: Option<String>,
    /// Overrides the 360s default LLM request timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsConfig {
    pub max_rounds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ContentConfig {
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpTuning {
    /// Overrides the 30s default MCP connect timeout.
    pub connect_timeout_seconds: Option<u64>,
    /// Overrides the 360s default MCP read/write timeout.
    pub read_timeout_seconds: Option<u64>,
    /// Interval in seconds for the background tool-discovery refresh
    /// task; 0 (or absent) disables it.
    pub registry_refresh_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub mcp: McpTuning,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Secrets come from the environment, never the TOML file on disk —
    /// `LLM_API_KEY` for the LLM endpoint, `MCP_<NAME>_TOKEN` for a
    /// server's bearer/API-key credential, `MCP_<NAME>_CLIENT_SECRET`
    /// for an OAuth2 client secret. `<NAME>` is the server's configured
    /// name, uppercased with non-alphanumerics turned into `_`.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        for server in &mut self.mcp_servers {
            let slug = env_slug(&server.name);
            let token_var = format!("MCP_{slug}_TOKEN");
            let secret_var = format!("MCP_{slug}_CLIENT_SECRET");
            match &mut server.auth {
                RawAuthConfig::Bearer { token } => {
                    if let Ok(v) = std::env::var(&token_var) {
                        *token = v;
                    }
                }
                RawAuthConfig::ApiKey { value, .. } => {
                    if let Ok(v) = std::env::var(&token_var) {
                        *value = v;
                    }
                }
                RawAuthConfig::OAuth2ClientCredentials { client_secret, .. } => {
                    if let Ok(v) = std::env::var(&secret_var) {
                        *client_secret = v;
                    }
                }
                RawAuthConfig::Basic { .. } | RawAuthConfig::None => {}
            }
        }
    }

    /// Resolves `system_role`, reading it from disk if it names an
    /// existing file rather than holding the text directly.
    pub async fn resolve_system_role(&self) -> anyhow::Result<Option<String>> {
        match &self.llm.system_role {
            None => Ok(None),
            Some(value) => {
                let candidate = Path::new(value);
                if candidate.is_file() {
                    Ok(Some(tokio::fs::read_to_string(candidate).await?))
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }
}

fn env_slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
