//! Configuration management for the Verification Service
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::gate::ClientConfig;
use crate::orchestrator::VerificationPolicy;
use anyhow::{Context, Result};
use rate_limiter::RateLimitConfig;
use std::env;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Redis URL for counters, transactions and usage records
    pub redis_url: String,

    /// Face matching service base URL
    pub face_matcher_url: String,

    /// Speech-to-text service base URL
    pub speech_api_url: String,

    /// Reference image vault base URL
    pub reference_vault_url: String,

    /// Timeout applied to every verification-provider call
    pub provider_timeout_secs: u64,

    /// Minimum face similarity accepted as a match
    pub similarity_threshold: f64,

    /// Per-method verification attempt budget
    pub max_verification_attempts: u32,

    /// Minutes until a new transaction expires
    pub transaction_ttl_minutes: i64,

    /// Amounts above this lose risk points
    pub large_amount_threshold: f64,

    /// Rate limits applied to clients without explicit overrides
    pub default_limits: RateLimitConfig,

    /// Optional JSON file with registered clients
    pub clients_file: Option<PathBuf>,

    /// API key of the built-in development client, used when no clients
    /// file is configured
    pub default_api_key: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "8084".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            face_matcher_url: env::var("FACE_MATCHER_URL")
                .unwrap_or_else(|_| "http://localhost:9100".to_string()),

            speech_api_url: env::var("SPEECH_API_URL")
                .unwrap_or_else(|_| "http://localhost:9101".to_string()),

            reference_vault_url: env::var("REFERENCE_VAULT_URL")
                .unwrap_or_else(|_| "http://localhost:9102".to_string()),

            provider_timeout_secs: env::var("PROVIDER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid PROVIDER_TIMEOUT_SECS")?,

            similarity_threshold: env::var("SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.8".to_string())
                .parse()
                .context("Invalid SIMILARITY_THRESHOLD")?,

            max_verification_attempts: env::var("MAX_VERIFICATION_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Invalid MAX_VERIFICATION_ATTEMPTS")?,

            transaction_ttl_minutes: env::var("TRANSACTION_TTL_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("Invalid TRANSACTION_TTL_MINUTES")?,

            large_amount_threshold: env::var("LARGE_AMOUNT_THRESHOLD")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .context("Invalid LARGE_AMOUNT_THRESHOLD")?,

            default_limits: RateLimitConfig {
                requests_per_minute: env::var("DEFAULT_REQUESTS_PER_MINUTE")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("Invalid DEFAULT_REQUESTS_PER_MINUTE")?,
                requests_per_hour: env::var("DEFAULT_REQUESTS_PER_HOUR")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .context("Invalid DEFAULT_REQUESTS_PER_HOUR")?,
                requests_per_day: env::var("DEFAULT_REQUESTS_PER_DAY")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()
                    .context("Invalid DEFAULT_REQUESTS_PER_DAY")?,
            },

            clients_file: env::var("CLIENTS_FILE").ok().map(PathBuf::from),

            default_api_key: env::var("API_KEY").unwrap_or_else(|_| "dev-client-key".to_string()),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            anyhow::bail!("SIMILARITY_THRESHOLD must be in (0, 1]");
        }

        if self.max_verification_attempts == 0 {
            anyhow::bail!("MAX_VERIFICATION_ATTEMPTS must be greater than 0");
        }

        if self.transaction_ttl_minutes <= 0 {
            anyhow::bail!("TRANSACTION_TTL_MINUTES must be greater than 0");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Timeout applied to verification-provider calls
    pub fn provider_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.provider_timeout_secs)
    }

    /// Verification policy derived from this configuration
    pub fn verification_policy(&self) -> VerificationPolicy {
        VerificationPolicy {
            similarity_threshold: self.similarity_threshold,
            max_attempts: self.max_verification_attempts,
            transaction_ttl: chrono::Duration::minutes(self.transaction_ttl_minutes),
            large_amount_threshold: self.large_amount_threshold,
            ..VerificationPolicy::default()
        }
    }

    /// Load registered clients from the clients file, or fall back to the
    /// built-in development client.
    pub fn load_clients(&self) -> Result<Vec<ClientConfig>> {
        match &self.clients_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read clients file: {}", path.display()))?;

                let clients: Vec<ClientConfig> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse clients file: {}", path.display()))?;

                if clients.is_empty() {
                    anyhow::bail!("Clients file {} contains no clients", path.display());
                }

                Ok(clients)
            }
            None => Ok(vec![ClientConfig {
                client_id: "dev-client".to_string(),
                api_key: self.default_api_key.clone(),
                limits: self.default_limits.clone(),
            }]),
        }
    }
}
