//! Configuration management for manuald.
//!
//! Loads settings from /etc/manualqa/config.toml (or `MANUALQA_CONFIG`)
//! and falls back to defaults for anything missing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/manualqa/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "MANUALQA_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    // Localhost only; the identity gateway sits in front
    "127.0.0.1:7870".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding sessions, messages, violations and ratings
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root directory with one subdirectory per product manual
    #[serde(default = "default_manuals_dir")]
    pub manuals_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/manualqa/manualqa.db")
}

fn default_manuals_dir() -> PathBuf {
    PathBuf::from("/var/lib/manualqa/manuals")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            manuals_dir: default_manuals_dir(),
        }
    }
}

/// Generation/classification backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,

    /// Model used for answers, self-checks and titles
    #[serde(default = "default_answer_model")]
    pub answer_model: String,

    /// Small fast model for question classification
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,

    /// HTTP timeout for a single backend call
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_answer_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}

fn default_classifier_model() -> String {
    "qwen2.5:0.5b-instruct".to_string()
}

fn default_http_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            answer_model: default_answer_model(),
            classifier_model: default_classifier_model(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

/// Retrieval pipeline budgets and knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stage1_timeout")]
    pub snapshot_timeout_ms: u64,

    #[serde(default = "default_stage2_timeout")]
    pub text_cache_timeout_ms: u64,

    #[serde(default = "default_stage3_timeout")]
    pub pdf_timeout_ms: u64,

    #[serde(default = "default_general_timeout")]
    pub general_knowledge_timeout_ms: u64,

    /// Deadline covering every stage of one request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Self-check score below which one regeneration is attempted
    #[serde(default = "default_verify_threshold")]
    pub verify_threshold: f32,

    #[serde(default = "default_true")]
    pub general_knowledge_enabled: bool,

    /// Prior turns sent along with document analysis
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Concurrent section sub-queries during document analysis
    #[serde(default = "default_pdf_concurrency")]
    pub pdf_concurrency: usize,

    #[serde(default = "default_pdf_max_sections")]
    pub pdf_max_sections: usize,

    /// Minimum token similarity for a fuzzy snapshot match
    #[serde(default = "default_fuzzy_threshold")]
    pub snapshot_fuzzy_threshold: f32,

    #[serde(default = "default_snapshot_cache")]
    pub snapshot_cache_capacity: usize,

    /// Cached-text passages handed to the generator
    #[serde(default = "default_text_passages")]
    pub text_cache_passages: usize,
}

fn default_stage1_timeout() -> u64 {
    2_000
}

fn default_stage2_timeout() -> u64 {
    8_000
}

fn default_stage3_timeout() -> u64 {
    25_000
}

fn default_general_timeout() -> u64 {
    15_000
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_verify_threshold() -> f32 {
    0.6
}

fn default_true() -> bool {
    true
}

fn default_history_turns() -> usize {
    5
}

fn default_pdf_concurrency() -> usize {
    3
}

fn default_pdf_max_sections() -> usize {
    6
}

fn default_fuzzy_threshold() -> f32 {
    0.75
}

fn default_snapshot_cache() -> usize {
    64
}

fn default_text_passages() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout_ms: default_stage1_timeout(),
            text_cache_timeout_ms: default_stage2_timeout(),
            pdf_timeout_ms: default_stage3_timeout(),
            general_knowledge_timeout_ms: default_general_timeout(),
            request_timeout_ms: default_request_timeout(),
            verify_threshold: default_verify_threshold(),
            general_knowledge_enabled: true,
            history_turns: default_history_turns(),
            pdf_concurrency: default_pdf_concurrency(),
            pdf_max_sections: default_pdf_max_sections(),
            snapshot_fuzzy_threshold: default_fuzzy_threshold(),
            snapshot_cache_capacity: default_snapshot_cache(),
            text_cache_passages: default_text_passages(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Run model classification when the rule stage is inconclusive
    #[serde(default = "default_true")]
    pub model_check_enabled: bool,

    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,

    #[serde(default = "default_classify_timeout")]
    pub classify_timeout_ms: u64,
}

fn default_max_question_chars() -> usize {
    2_000
}

fn default_classify_timeout() -> u64 {
    5_000
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            model_check_enabled: true,
            max_question_chars: default_max_question_chars(),
            classify_timeout_ms: default_classify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_hours")]
    pub idle_window_hours: i64,
}

fn default_idle_hours() -> i64 {
    manual_shared::session::DEFAULT_IDLE_WINDOW_HOURS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_window_hours: default_idle_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Negative ratings that retire a snapshot entry
    #[serde(default = "default_retire_threshold")]
    pub retire_threshold: u32,
}

fn default_retire_threshold() -> u32 {
    3
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            retire_threshold: default_retire_threshold(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&path)).unwrap_or_else(|e| {
            warn!("Config not loaded from {}, using defaults: {}", path, e);
            Config::default()
        })
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.idle_window_hours, 6);
        assert_eq!(config.pipeline.pdf_concurrency, 3);
        assert!(config.pipeline.general_knowledge_enabled);
        assert_eq!(config.feedback.retire_threshold, 3);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
[pipeline]
verify_threshold = 0.8
general_knowledge_enabled = false

[llm]
answer_model = "custom:7b"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pipeline.verify_threshold, 0.8);
        assert!(!config.pipeline.general_knowledge_enabled);
        assert_eq!(config.llm.answer_model, "custom:7b");
        // Defaults for missing fields
        assert_eq!(config.pipeline.pdf_timeout_ms, 25_000);
        assert_eq!(config.llm.classifier_model, "qwen2.5:0.5b-instruct");
        assert_eq!(config.server.bind, "127.0.0.1:7870");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session]\nidle_window_hours = 2\n").unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.session.idle_window_hours, 2);
        assert!(Config::load_from_path(&dir.path().join("missing.toml")).is_err());
    }
}
