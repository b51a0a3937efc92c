//! # Configuration Management
//!
//! Loads process-wide configuration once at startup. After `main` validates it,
//! the configuration is shared read-only with every session.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables: `HOST`, `PORT`, `ASSEMBLYAI_API_KEY`
//! 2. Environment variables with the `APP_` prefix (`APP_PROVIDER__SAMPLE_RATE=8000`)
//! 3. Configuration file (`config.toml`, optional)
//! 4. Default values (defined in the Default impl)
//!
//! ## Rust Concepts Used:
//! - **Serde**: the `config` crate round-trips our structs through its own value tree
//! - **Builder pattern**: sources are stacked with `add_source` and overrides
//! - **Duration helpers**: raw millisecond/second fields stay serde-friendly,
//!   typed `Duration` accessors keep call sites honest

use crate::relay::protocol::ProtocolVariant;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Environment variable carrying the provider credential.
pub const API_KEY_ENV: &str = "ASSEMBLYAI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub transcoder: TranscoderConfig,
    pub session: SessionConfig,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream transcription provider settings.
///
/// ## Fields:
/// - `api_key`: credential sent in the `Authorization` header (required)
/// - `variant`: which wire protocol the provider speaks
/// - `url`: optional endpoint override; each variant knows its default
/// - `sample_rate` / `channels`: PCM format the provider expects
/// - `connect_timeout_ms`: upper bound on opening the upstream link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub variant: ProtocolVariant,
    #[serde(default)]
    pub url: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub connect_timeout_ms: u64,
}

/// External decoder settings.
///
/// `args` replaces the built-in decoder argument list entirely when set. This is
/// how deployments point the relay at something other than ffmpeg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub program: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    pub default_input_format: String,
}

/// Per-session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub drain_grace_ms: u64,
    pub outbound_buffer: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            provider: ProviderConfig {
                api_key: String::new(), // must come from the environment
                variant: ProtocolVariant::Realtime,
                url: None,
                sample_rate: 16_000,
                channels: 1,
                connect_timeout_ms: 10_000,
            },
            transcoder: TranscoderConfig {
                program: "ffmpeg".to_string(),
                args: None,
                default_input_format: "pcm".to_string(),
            },
            session: SessionConfig {
                max_concurrent_sessions: 32,
                drain_grace_ms: 2_000,
                outbound_buffer: 64,
                heartbeat_interval_secs: 15,
                client_timeout_secs: 45,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_PROVIDER__VARIANT=streaming`: switch to the v3 streaming protocol
    /// - `APP_SESSION__DRAIN_GRACE_MS=500`: shorten teardown grace
    /// - `PORT=8080`: special case for deployment platforms
    /// - `ASSEMBLYAI_API_KEY=...`: provider credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names may keep theirs.
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var(API_KEY_ENV) {
            settings = settings.set_override("provider.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot serve a single session.
    ///
    /// A missing credential stops the process before the listener binds.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.provider.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("Missing {}", API_KEY_ENV));
        }

        if self.provider.sample_rate == 0 || self.provider.channels == 0 {
            return Err(anyhow::anyhow!("Provider sample rate and channels must be greater than 0"));
        }

        if self.provider.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Provider connect timeout must be greater than 0"));
        }

        if self.transcoder.program.trim().is_empty() {
            return Err(anyhow::anyhow!("Transcoder program cannot be empty"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.drain_grace_ms == 0 {
            return Err(anyhow::anyhow!("Drain grace period must be greater than 0"));
        }

        if self.session.outbound_buffer == 0 {
            return Err(anyhow::anyhow!("Outbound buffer must hold at least one message"));
        }

        if self.session.client_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.session.client_timeout_secs,
                self.session.heartbeat_interval_secs
            ));
        }

        Ok(())
    }
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SessionConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
