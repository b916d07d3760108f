//! Configuration parsing and validation for the chat service
//!
//! This module handles command-line argument parsing and validation using clap. Every option
//! can also be set through a `FORGE_*` environment variable.
use anyhow::anyhow;
use clap::Parser;
use dialogue_forge::ServiceSettings;
use dialogue_forge::client::PoolConfig;
use dialogue_forge::gateway::{Channel, GatewayConfig};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the chat server will listen.
    #[arg(short = 'p', long, env = "FORGE_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "FORGE_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "FORGE_METRICS", default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "FORGE_METRICS_PREFIX", default_value = "dialogue_forge")]
    pub metrics_prefix: String,

    /// Base URL of the LLM workflow gateway API, e.g. https://gateway.example.com/v1
    #[arg(long, env = "FORGE_GATEWAY_URL")]
    pub gateway_url: Url,

    /// API key sent to the gateway as a bearer token.
    #[arg(long, env = "FORGE_GATEWAY_KEY", hide_env_values = true)]
    pub gateway_key: String,

    /// Which gateway API blocking requests use.
    #[arg(long, env = "FORGE_GATEWAY_CHANNEL", value_enum, default_value_t = Channel::Workflow)]
    pub gateway_channel: Channel,

    /// User identifier reported to the gateway.
    #[arg(long, env = "FORGE_GATEWAY_USER", default_value = "dialogue-forge")]
    pub gateway_user: String,

    /// Wall-clock limit (in seconds) on one gateway exchange, streamed body included.
    #[arg(long, env = "FORGE_UPSTREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Limit (in seconds) on each stop request sent to the gateway.
    #[arg(long, env = "FORGE_STOP_TIMEOUT_SECS", default_value_t = 30)]
    pub stop_timeout_secs: u64,

    /// Maximum number of idle HTTP connections to keep alive to the gateway.
    #[arg(long, env = "FORGE_POOL_MAX_IDLE_PER_HOST", default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, env = "FORGE_POOL_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// Directory generated documents are written to and served from.
    #[arg(long, env = "FORGE_GENERATED_DIR", default_value = "generated")]
    pub generated_dir: PathBuf,

    /// Directory uploads are stored in.
    #[arg(long, env = "FORGE_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Largest accepted upload, in bytes.
    #[arg(long, env = "FORGE_MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Static bearer keys accepted by the API (comma separated).
    #[arg(long, env = "FORGE_API_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub api_keys: Vec<String>,

    /// Reject requests that carry no bearer token.
    #[arg(long, env = "FORGE_REQUIRE_AUTH", default_value_t = false)]
    pub require_auth: bool,

    /// Lifetime of issued session tokens, in hours.
    #[arg(long, env = "FORGE_TOKEN_TTL_HOURS", default_value_t = 24)]
    pub token_ttl_hours: i64,

    /// Model catalogue served to clients (comma separated).
    #[arg(
        long,
        env = "FORGE_MODELS",
        value_delimiter = ',',
        default_value = "deepseek-chat,deepseek-coder"
    )]
    pub models: Vec<String>,
}

// Keys stay out of the startup log.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("metrics_port", &self.metrics_port)
            .field("metrics", &self.metrics)
            .field("metrics_prefix", &self.metrics_prefix)
            .field("gateway_url", &self.gateway_url.as_str())
            .field("gateway_channel", &self.gateway_channel)
            .field("gateway_user", &self.gateway_user)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("stop_timeout_secs", &self.stop_timeout_secs)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("pool_idle_timeout_secs", &self.pool_idle_timeout_secs)
            .field("generated_dir", &self.generated_dir)
            .field("upload_dir", &self.upload_dir)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("api_keys", &self.api_keys.len())
            .field("require_auth", &self.require_auth)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("models", &self.models)
            .finish()
    }
}

impl Config {
    pub fn validate(mut self) -> Result<Self, anyhow::Error> {
        if self.gateway_key.trim().is_empty() {
            return Err(anyhow!("The gateway key must not be empty"));
        }
        if self.upstream_timeout_secs == 0 || self.stop_timeout_secs == 0 {
            return Err(anyhow!("Gateway timeouts must be at least one second"));
        }
        if self.token_ttl_hours <= 0 {
            return Err(anyhow!("The token lifetime must be positive"));
        }
        if self.require_auth && self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(anyhow!(
                "Authentication is required but no API keys are configured"
            ));
        }
        self.api_keys.retain(|k| !k.trim().is_empty());
        self.models.retain(|m| !m.trim().is_empty());

        for dir in [&self.generated_dir, &self.upload_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow!("Cannot create directory '{}': {}", dir.display(), e))?;
        }
        Ok(self)
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig::builder()
            .base_url(self.gateway_url.clone())
            .api_key(self.gateway_key.clone())
            .channel(self.gateway_channel)
            .user(self.gateway_user.clone())
            .timeout(Duration::from_secs(self.upstream_timeout_secs))
            .stop_timeout(Duration::from_secs(self.stop_timeout_secs))
            .build()
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig::builder()
            .max_idle_per_host(self.pool_max_idle_per_host)
            .idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .build()
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings::builder()
            .models(self.models.clone())
            .generated_dir(self.generated_dir.clone())
            .upload_dir(self.upload_dir.clone())
            .max_upload_bytes(self.max_upload_bytes)
            .require_auth(self.require_auth)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "dialogue-forge",
            "--gateway-url",
            "https://gw.example.com/v1",
            "--gateway-key",
            "app-key",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.gateway_channel, Channel::Workflow);
        assert_eq!(config.upstream_timeout_secs, 60);
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.models, vec!["deepseek-chat", "deepseek-coder"]);
        assert!(config.api_keys.is_empty());
        assert!(!config.require_auth);

        let gateway = config.gateway();
        assert_eq!(gateway.timeout, Duration::from_secs(60));
        assert_eq!(gateway.user, "dialogue-forge");
    }

    #[test]
    fn test_lists_and_channel() {
        let config = parse(&["--api-keys", "a,b", "--gateway-channel", "chat"]);
        assert_eq!(config.api_keys, vec!["a", "b"]);
        assert_eq!(config.gateway_channel, Channel::Chat);
    }

    #[test]
    fn test_validation() {
        let dir = tempfile::tempdir().unwrap();
        let generated = dir.path().join("gen");
        let uploads = dir.path().join("up");
        let config = parse(&[
            "--generated-dir",
            generated.to_str().unwrap(),
            "--upload-dir",
            uploads.to_str().unwrap(),
        ])
        .validate()
        .unwrap();
        assert!(config.generated_dir.is_dir());
        assert!(uploads.is_dir());

        assert!(parse(&["--upstream-timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--require-auth"]).validate().is_err());
        assert!(parse(&["--token-ttl-hours", "0"]).validate().is_err());
    }

    #[test]
    fn test_missing_gateway_is_an_error() {
        assert!(Config::try_parse_from(["dialogue-forge"]).is_err());
    }
}
