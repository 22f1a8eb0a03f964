use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{CoreResult, RelayError};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    /// Offline echo provider, no credentials needed.
    Null,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitCfg {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests allowed per caller per window. Zero disables limiting.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitCfg {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_max_requests() -> u32 {
    60
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The single cross-origin caller allowed to use the API.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default)]
    pub rate_limit: RateLimitCfg,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            rate_limit: RateLimitCfg::default(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5050
}
fn default_cors_origin() -> String {
    "http://localhost:4200".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UpstreamCfg {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    /// Cap on the total duration of one relayed stream.
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            organization: None,
            default_model: default_model(),
            default_temperature: default_temperature(),
            max_stream_secs: default_max_stream_secs(),
        }
    }
}

impl UpstreamCfg {
    pub fn max_stream_duration(&self) -> Duration {
        Duration::from_secs(self.max_stream_secs)
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::OpenAI
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_max_stream_secs() -> u64 {
    300
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for non-streaming requests in milliseconds (default 60000ms).
    /// Streaming requests are bounded by `UpstreamCfg::max_stream_secs` instead.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub upstream: UpstreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Defaults overridden by process environment variables.
    pub fn from_env() -> CoreResult<Self> {
        let mut cfg = Self::default();
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Apply `PORT`, `HOST`, `CORS_ORIGIN`, `OPENAI_MODEL`, `OPENAI_BASE`, `OPENAI_ORG`
    /// and `CHATRELAY_PROVIDER` from `lookup` on top of the current values.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| RelayError::Config(format!("invalid PORT '{port}': {e}")))?;
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(origin) = lookup("CORS_ORIGIN") {
            self.server.cors_origin = origin;
        }
        if let Some(model) = lookup("OPENAI_MODEL")
            && !model.trim().is_empty()
        {
            self.upstream.default_model = model;
        }
        if let Some(base) = lookup("OPENAI_BASE") {
            self.upstream.base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(org) = lookup("OPENAI_ORG") {
            self.upstream.organization = Some(org);
        }
        if let Some(kind) = lookup("CHATRELAY_PROVIDER") {
            self.upstream.provider = match kind.as_str() {
                "openai" => ProviderKind::OpenAI,
                "null" => ProviderKind::Null,
                other => {
                    return Err(RelayError::Config(format!(
                        "unknown provider '{other}' (expected openai or null)"
                    )));
                }
            };
        }
        Ok(())
    }
}
