//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.telephony-mcp/config.json`) and environment.
//! Vonage credentials usually come from the environment (or a `.env` file loaded by the CLI);
//! the `VONAGE_*` variables override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// MCP (tool invocation) listener.
    #[serde(default)]
    pub mcp: McpConfig,

    /// Webhook listener for provider callbacks.
    #[serde(default)]
    pub callback: CallbackConfig,

    /// Vonage credentials and endpoints.
    #[serde(default)]
    pub vonage: VonageConfig,

    /// Correlation store retention and wait deadlines.
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

/// MCP streamable-HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port (default 8000).
    #[serde(default = "default_mcp_port")]
    pub port: u16,

    /// Path the MCP service is mounted at (default "/mcp").
    #[serde(default = "default_mcp_path")]
    pub path: String,
}

/// Callback (webhook) listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackConfig {
    /// Bind address (default "0.0.0.0"; the provider must be able to reach it).
    #[serde(default = "default_callback_bind")]
    pub bind: String,

    /// Port (default 8080).
    #[serde(default = "default_callback_port")]
    pub port: u16,

    /// Public base URL the provider posts to. Overridden by CALLBACK_SERVER_URL env.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Path for voice call status and speech input events.
    #[serde(default = "default_voice_event_path")]
    pub voice_event_path: String,

    /// Path for SMS delivery receipts.
    #[serde(default = "default_sms_status_path")]
    pub sms_status_path: String,

    /// Path for inbound SMS (replies to `sms_with_input`).
    #[serde(default = "default_sms_inbound_path")]
    pub sms_inbound_path: String,

    /// Maximum number of raw webhook records kept for `/events`.
    #[serde(default = "default_event_log_limit")]
    pub event_log_limit: usize,

    /// When set, voice webhooks must carry a Bearer JWT signed (HS256) with this secret.
    #[serde(default)]
    pub signature_secret: Option<String>,
}

/// Vonage credentials and API endpoints. Every field has an env override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VonageConfig {
    /// SMS API key. Overridden by VONAGE_API_KEY env.
    pub api_key: Option<String>,
    /// SMS API secret. Overridden by VONAGE_API_SECRET env.
    pub api_secret: Option<String>,
    /// Voice application id (JWT `application_id`). Overridden by VONAGE_APPLICATION_ID env.
    pub application_id: Option<String>,
    /// PEM private key of the voice application. Overridden by VONAGE_PRIVATE_KEY_PATH env.
    pub private_key_path: Option<PathBuf>,
    /// Default originating number (LVN). Overridden by VONAGE_LVN env.
    pub virtual_number: Option<String>,
    /// Voice call creation endpoint. Overridden by VONAGE_API_URL env.
    #[serde(default = "default_voice_api_url")]
    pub voice_api_url: String,
    /// SMS send endpoint. Overridden by VONAGE_SMS_URL env.
    #[serde(default = "default_sms_api_url")]
    pub sms_api_url: String,
    /// Per-request timeout in seconds (default 10).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Language of the text-to-speech `talk` action (default "en-GB").
    #[serde(default = "default_voice_language")]
    pub voice_language: String,
    /// Language for speech recognition in `voice_call_with_input` (default "en-US").
    #[serde(default = "default_speech_language")]
    pub speech_language: String,
}

/// Correlation store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationConfig {
    /// Entries untouched for this long are evicted (default 300).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long a tool waits for its callback when `wait_for_result` is set. Clamped to 30..=120.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Events kept per correlation id for audit (default 32).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Interval of the background eviction sweep (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

pub const MIN_WAIT_TIMEOUT_SECS: u64 = 30;
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 120;

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_mcp_port() -> u16 {
    8000
}

fn default_mcp_path() -> String {
    "/mcp".to_string()
}

fn default_callback_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_callback_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_voice_event_path() -> String {
    "/event".to_string()
}

fn default_sms_status_path() -> String {
    "/sms/status".to_string()
}

fn default_sms_inbound_path() -> String {
    "/sms/inbound".to_string()
}

fn default_event_log_limit() -> usize {
    1000
}

fn default_voice_api_url() -> String {
    "https://api.nexmo.com/v1/calls".to_string()
}

fn default_sms_api_url() -> String {
    "https://rest.nexmo.com/sms/json".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_voice_language() -> String {
    "en-GB".to_string()
}

fn default_speech_language() -> String {
    "en-US".to_string()
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_wait_timeout_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    32
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_mcp_port(),
            path: default_mcp_path(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            bind: default_callback_bind(),
            port: default_callback_port(),
            public_url: default_public_url(),
            voice_event_path: default_voice_event_path(),
            sms_status_path: default_sms_status_path(),
            sms_inbound_path: default_sms_inbound_path(),
            event_log_limit: default_event_log_limit(),
            signature_secret: None,
        }
    }
}

impl Default for VonageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            application_id: None,
            private_key_path: None,
            virtual_number: None,
            voice_api_url: default_voice_api_url(),
            sms_api_url: default_sms_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
            voice_language: default_voice_language(),
            speech_language: default_speech_language(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            history_limit: default_history_limit(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CorrelationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Tool wait deadline, clamped to the supported 30..=120s window.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(
            self.wait_timeout_secs
                .clamp(MIN_WAIT_TIMEOUT_SECS, MAX_WAIT_TIMEOUT_SECS),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl CallbackConfig {
    /// Absolute URL for a callback path, e.g. `http://host:8080` + `/event`.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.public_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Non-empty trimmed env var, if set.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn nonempty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Apply `VONAGE_*` and `CALLBACK_SERVER_URL` env overrides on top of the file config.
pub fn apply_env_overrides(config: &mut Config) {
    let v = &mut config.vonage;
    v.api_key = env_nonempty("VONAGE_API_KEY").or_else(|| nonempty(v.api_key.as_ref()));
    v.api_secret = env_nonempty("VONAGE_API_SECRET").or_else(|| nonempty(v.api_secret.as_ref()));
    v.application_id =
        env_nonempty("VONAGE_APPLICATION_ID").or_else(|| nonempty(v.application_id.as_ref()));
    v.virtual_number = env_nonempty("VONAGE_LVN").or_else(|| nonempty(v.virtual_number.as_ref()));
    if let Some(p) = env_nonempty("VONAGE_PRIVATE_KEY_PATH") {
        v.private_key_path = Some(PathBuf::from(p));
    }
    if let Some(url) = env_nonempty("VONAGE_API_URL") {
        v.voice_api_url = url;
    }
    if let Some(url) = env_nonempty("VONAGE_SMS_URL") {
        v.sms_api_url = url;
    }
    if let Some(url) = env_nonempty("CALLBACK_SERVER_URL") {
        config.callback.public_url = url;
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TELEPHONY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".telephony-mcp").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Env overrides are applied afterwards. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}
