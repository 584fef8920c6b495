use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.scheduler.interval_secs == 0 {
        return Err(invalid("scheduler.interval_secs must be greater than 0"));
    }
    if config.scheduler.batch_size == 0 {
        return Err(invalid("scheduler.batch_size must be greater than 0"));
    }

    if config.worker.count == 0 {
        return Err(invalid("worker.count must be greater than 0"));
    }
    if config.worker.job_timeout_secs == 0 {
        return Err(invalid("worker.job_timeout_secs must be greater than 0"));
    }
    let cpus = num_cpus::get();
    if config.worker.count > cpus * 2 {
        log::warn!(
            "worker.count ({}) exceeds twice the available CPUs ({})",
            config.worker.count,
            cpus
        );
    }

    if config.ocr.default_confidence > 100 {
        return Err(invalid(&format!(
            "ocr.default_confidence must be between 0 and 100, got {}",
            config.ocr.default_confidence
        )));
    }
    if config.ocr.default_language.trim().is_empty() {
        return Err(invalid("ocr.default_language must not be empty"));
    }

    let mut users = HashSet::new();
    for token in &config.server.api_tokens {
        if token.user_id.trim().is_empty() {
            return Err(invalid("server.api_tokens: user_id must not be empty"));
        }
        if !token.has_source() {
            return Err(invalid(&format!(
                "server.api_tokens: user '{}' needs one of token, token_file or token_env",
                token.user_id
            )));
        }
        if !users.insert(token.user_id.as_str()) {
            return Err(invalid(&format!(
                "server.api_tokens: duplicate user_id '{}'",
                token.user_id
            )));
        }
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
