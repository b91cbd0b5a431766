use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret for the admin surface. When unset, admin routes
    /// reject every request.
    pub admin_key: Option<String>,
    /// Directory holding the sqlite store. Defaults to `./trestle-data`.
    pub data_dir: Option<String>,

    /// Max retries across accounts on capacity errors.
    pub capacity_retries: u32,
    /// Base backoff between capacity retries, scaled by attempt number.
    pub capacity_retry_delay_ms: u64,
    /// Upstream connect timeout.
    pub fetch_connect_timeout_ms: u64,
    /// Optional forward proxy for all upstream calls.
    pub outbound_proxy_url: Option<String>,
    /// Treat an access token as expired this long before its stated expiry.
    pub token_refresh_skew_ms: i64,

    /// In-flight request cap applied to models absent from `model_concurrency`.
    pub default_model_concurrency: usize,
    /// Per-model in-flight request caps.
    pub model_concurrency: HashMap<String, usize>,
    /// Caller-facing model -> upstream model. Merged with the
    /// `model_mappings` table at startup (table wins).
    pub model_aliases: HashMap<String, String>,
    /// Model -> ordered tier preference for account selection.
    pub preferred_tiers: HashMap<String, Vec<String>>,
    /// Consecutive errors before an account is moved to `error` status.
    pub error_threshold: i64,
    /// Max wait for an available account before the pool gives up.
    pub account_wait_ms: u64,

    /// Model id that switches the envelope to `requestType: "image_gen"`.
    pub image_model: String,
    /// Ring-buffer size of the per-call diagnostics log.
    pub call_log_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8064,
            admin_key: None,
            data_dir: None,
            capacity_retries: 2,
            capacity_retry_delay_ms: 1_000,
            fetch_connect_timeout_ms: 30_000,
            outbound_proxy_url: None,
            token_refresh_skew_ms: 60_000,
            default_model_concurrency: 4,
            model_concurrency: HashMap::new(),
            model_aliases: HashMap::new(),
            preferred_tiers: HashMap::new(),
            error_threshold: 3,
            account_wait_ms: 30_000,
            image_model: "gemini-3-pro-image".to_string(),
            call_log_capacity: 256,
        }
    }
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        match self.data_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => PathBuf::from("trestle-data"),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.capacity_retries + 1
    }

    pub fn concurrency_for(&self, model: &str) -> usize {
        self.model_concurrency
            .get(model)
            .copied()
            .unwrap_or(self.default_model_concurrency)
    }
}

const CONFIG_FILE: &str = "config.json";

/// Load the config file from `dir`, creating a default one on first run.
pub fn load_app_config(dir: &Path) -> Result<AppConfig, String> {
    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let config = AppConfig::default();
        let _ = save_app_config(dir, &config);
        return Ok(config);
    }

    let content = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(dir: &Path, config: &AppConfig) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed_to_create_config_dir: {}", e))?;
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;
    std::fs::write(dir.join(CONFIG_FILE), content)
        .map_err(|e| format!("failed_to_save_config: {}", e))
}

/// Reject configurations that would deadlock or misroute at runtime.
pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.port == 0 {
        errors.push("port must be non-zero".to_string());
    }
    if config.default_model_concurrency == 0 {
        errors.push("default_model_concurrency must be at least 1".to_string());
    }
    for (model, cap) in &config.model_concurrency {
        if *cap == 0 {
            errors.push(format!("model_concurrency for '{}' must be at least 1", model));
        }
    }
    if config.error_threshold < 1 {
        errors.push("error_threshold must be at least 1".to_string());
    }
    if config.token_refresh_skew_ms < 0 {
        errors.push("token_refresh_skew_ms must not be negative".to_string());
    }
    for (alias, target) in &config.model_aliases {
        if target.trim().is_empty() {
            errors.push(format!("model_aliases['{}'] maps to an empty model", alias));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
