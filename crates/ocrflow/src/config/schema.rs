use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::OutputFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    /// SQLite file; `~` expands to the home directory. Defaults to
    /// `~/.ocrflow/data/ocrflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub ocr: OcrDefaults,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            ocr: OcrDefaults::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Resolved database location.
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database_path {
            Some(ref path) => Some(PathBuf::from(expand_home(path))),
            None => crate::db::default_database_path(),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Jobs that may wait for a free worker; `count * 2` when unset.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_worker_count() -> usize {
    4
}

fn default_job_timeout_secs() -> u64 {
    120
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            job_timeout_secs: default_job_timeout_secs(),
            queue_capacity: None,
        }
    }
}

impl WorkerConfig {
    pub fn capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.count * 2).max(1)
    }
}

/// Defaults applied to OCR requests that leave options out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrDefaults {
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_confidence")]
    pub default_confidence: u8,
    #[serde(default = "default_true")]
    pub default_preprocess: bool,
    #[serde(default)]
    pub default_format: OutputFormat,
    /// Estimate reported to callers when a task is created.
    #[serde(default = "default_estimated_seconds")]
    pub estimated_seconds: u32,
    /// Tesseract models used for image pages.
    #[serde(default = "default_tesseract_languages")]
    pub tesseract_languages: Vec<String>,
}

fn default_language() -> String {
    "zh".to_string()
}

fn default_confidence() -> u8 {
    75
}

fn default_true() -> bool {
    true
}

fn default_estimated_seconds() -> u32 {
    15
}

fn default_tesseract_languages() -> Vec<String> {
    vec!["chi_sim".to_string(), "eng".to_string()]
}

impl Default for OcrDefaults {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            default_confidence: default_confidence(),
            default_preprocess: true,
            default_format: OutputFormat::Text,
            estimated_seconds: default_estimated_seconds(),
            tesseract_languages: default_tesseract_languages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_tokens: Vec<ApiTokenConfig>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_tokens: Vec::new(),
            log_format: LogFormat::Text,
        }
    }
}

/// A bearer token accepted by the HTTP surface.
///
/// The token is resolved from the first source set: a direct value, a
/// file, then an environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTokenConfig {
    pub user_id: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
}

impl ApiTokenConfig {
    pub fn has_source(&self) -> bool {
        self.token.as_deref().is_some_and(|s| !s.is_empty())
            || self.token_file.as_deref().is_some_and(|s| !s.is_empty())
            || self.token_env.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home.to_string_lossy().into_owned();
            }
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
