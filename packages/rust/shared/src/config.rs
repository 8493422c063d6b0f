//! Application configuration for tgkb.
//!
//! User config lives at `~/.tgkb/tgkb.toml` unless `--config` points elsewhere.
//! CLI flags override environment variables, which override config file
//! values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TgkbError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tgkb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tgkb";

// ---------------------------------------------------------------------------
// Config structs (matching tgkb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub enrichment: EnrichmentSettings,

    #[serde(default)]
    pub render: RenderConfig,
}

/// `[paths]` section. Relative paths resolve against the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory scanned for `*.csv` channel exports.
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Directory holding the intermediate JSON Lines files.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory receiving the Markdown document and run report.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("data/csv")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("data/jsonl")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data/markdown")
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Candidate models, primary first, fallbacks after.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Sent as `HTTP-Referer` for OpenRouter attribution.
    #[serde(default = "default_referer")]
    pub referer: String,

    /// Sent as `X-Title` for OpenRouter attribution.
    #[serde(default = "default_app_title")]
    pub app_title: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            models: default_models(),
            referer: default_referer(),
            app_title: default_app_title(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_models() -> Vec<String> {
    vec![
        "meta-llama/llama-3.1-70b-instruct".into(),
        "meta-llama/llama-3.1-8b-instruct".into(),
        "google/gemini-flash-1.5".into(),
        "openai/gpt-4o-mini".into(),
    ]
}
fn default_referer() -> String {
    "https://github.com/tgkb/tgkb".into()
}
fn default_app_title() -> String {
    "tgkb: Telegram channels to Markdown".into()
}
fn default_max_tokens() -> u32 {
    100
}
fn default_temperature() -> f32 {
    0.7
}

/// `[enrichment]` section: retry, fallback and pacing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentSettings {
    /// Attempts made against each model before falling back to the next.
    #[serde(default = "default_attempts_per_model")]
    pub attempts_per_model: u32,

    /// Wall-clock limit for a single completion request.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// First backoff after an ordinary failure; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Minimum backoff after a rate-limit response.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    /// Upper bound for any single backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Pause between records when enriching sequentially.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,

    /// Records enriched in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Texts shorter than this (in chars) are titled locally.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,

    /// Post text sent to the model is cut to this many chars.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            attempts_per_model: default_attempts_per_model(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_interval_ms: default_request_interval_ms(),
            concurrency: default_concurrency(),
            min_text_chars: default_min_text_chars(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

impl EnrichmentSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

fn default_attempts_per_model() -> u32 {
    3
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_rate_limit_backoff_ms() -> u64 {
    10_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_request_interval_ms() -> u64 {
    500
}
fn default_concurrency() -> usize {
    1
}
fn default_min_text_chars() -> usize {
    10
}
fn default_max_prompt_chars() -> usize {
    2_000
}

/// How index entries point at post sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStyle {
    /// `[Title](#post-3)` with an HTML anchor before each section.
    #[default]
    Anchor,
    /// Obsidian `[[#Title]]` heading links.
    Wikilink,
}

/// `[render]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub link_style: LinkStyle,

    /// H1 of the generated document.
    #[serde(default = "default_document_title")]
    pub document_title: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            link_style: LinkStyle::default(),
            document_title: default_document_title(),
        }
    }
}

fn default_document_title() -> String {
    "All posts from Telegram channels".into()
}

impl AppConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.openrouter.models.iter().all(|m| m.trim().is_empty()) {
            return Err(TgkbError::config("openrouter.models must name at least one model"));
        }
        if self.enrichment.attempts_per_model == 0 {
            return Err(TgkbError::config("enrichment.attempts_per_model must be at least 1"));
        }
        if self.enrichment.concurrency == 0 {
            return Err(TgkbError::config("enrichment.concurrency must be at least 1"));
        }
        if self.enrichment.attempt_timeout_secs == 0 {
            return Err(TgkbError::config("enrichment.attempt_timeout_secs must be at least 1"));
        }
        Url::parse(&self.openrouter.base_url).map_err(|e| {
            TgkbError::config(format!(
                "invalid openrouter.base_url '{}': {e}",
                self.openrouter.base_url
            ))
        })?;
        Ok(())
    }

    /// Replace the model list, e.g. from `--models` / `TGKB_MODELS`.
    pub fn override_models(&mut self, models: &[String]) {
        let models: Vec<String> = models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if !models.is_empty() {
            self.openrouter.models = models;
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tgkb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| TgkbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tgkb/tgkb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TgkbError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TgkbError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TgkbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| TgkbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TgkbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OpenRouter API key from the configured env var.
pub fn api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(TgkbError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable \
             (a .env file in the working directory also works).\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("input_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("attempts_per_model"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.enrichment.attempts_per_model, 3);
        assert_eq!(parsed.openrouter.api_key_env, "OPENROUTER_API_KEY");
        assert_eq!(parsed.render.link_style, LinkStyle::Anchor);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let toml_str = r#"
[openrouter]
models = ["primary/model", "fallback/model"]

[render]
link_style = "wikilink"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.openrouter.models, vec!["primary/model", "fallback/model"]);
        assert_eq!(config.openrouter.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.render.link_style, LinkStyle::Wikilink);
        assert_eq!(config.paths.input_dir, PathBuf::from("data/csv"));
        config.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_empty_models_and_zero_budget() {
        let mut config = AppConfig::default();
        config.openrouter.models = vec![" ".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.enrichment.attempts_per_model = 0;
        assert!(config.validate().unwrap_err().to_string().contains("attempts_per_model"));

        let mut config = AppConfig::default();
        config.openrouter.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn override_models_ignores_blank_entries() {
        let mut config = AppConfig::default();
        config.override_models(&[" a/one ".into(), "".into(), "b/two".into()]);
        assert_eq!(config.openrouter.models, vec!["a/one", "b/two"]);

        config.override_models(&[]);
        assert_eq!(config.openrouter.models, vec!["a/one", "b/two"]);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tgkb.toml");
        std::fs::write(&path, "[paths]\ninput_dir = \"exports\"\n").expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.paths.input_dir, PathBuf::from("exports"));

        std::fs::write(&path, "[paths\n").expect("write");
        assert!(load_config_from(&path).unwrap_err().to_string().contains("failed to parse"));
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "TGKB_TEST_NONEXISTENT_KEY_12345".into();
        let result = api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
