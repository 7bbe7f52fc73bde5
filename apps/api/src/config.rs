use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails fast at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub anthropic_api_key: String,
    pub embedding_api_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub channel_api_url: String,
    pub channel_account_id: String,
    pub channel_auth_token: String,
    pub channel_sender: String,
    /// Upper bound in seconds on any single external call made during a turn.
    pub external_timeout_secs: u64,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            embedding_api_url: require_env("EMBEDDING_API_URL")?,
            embedding_api_key: require_env("EMBEDDING_API_KEY")?,
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            mail_api_url: require_env("MAIL_API_URL")?,
            mail_api_key: require_env("MAIL_API_KEY")?,
            sender_name: require_env("SENDER_NAME")?,
            sender_email: require_env("SENDER_EMAIL")?,
            channel_api_url: require_env("CHANNEL_API_URL")?,
            channel_account_id: require_env("CHANNEL_ACCOUNT_ID")?,
            channel_auth_token: require_env("CHANNEL_AUTH_TOKEN")?,
            channel_sender: require_env("CHANNEL_SENDER")?,
            external_timeout_secs: std::env::var("EXTERNAL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .context("EXTERNAL_TIMEOUT_SECS must be a number of seconds")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
