//! Loading configuration files from disk.

use assert_fs::prelude::*;
use assert_fs::TempDir;

use ocrflow::config::{load_config, LogFormat};
use ocrflow::error::ConfigError;
use ocrflow::identity::{IdentityProvider, StaticTokenIdentity};

#[test]
fn loads_full_config_file() {
    let temp = TempDir::new().unwrap();
    let token_file = temp.child("token.txt");
    token_file.write_str("s3cret\n").unwrap();

    let config_file = temp.child("ocrflow.json");
    config_file
        .write_str(&format!(
            r#"{{
                "version": "1.0",
                "database_path": "{db}",
                "scheduler": {{ "interval_secs": 10, "batch_size": 4 }},
                "worker": {{ "count": 3, "job_timeout_secs": 30 }},
                "ocr": {{ "default_language": "en", "tesseract_languages": ["eng"] }},
                "server": {{
                    "bind": "0.0.0.0:8088",
                    "log_format": "json",
                    "api_tokens": [{{ "user_id": "reader", "token_file": "{token}" }}]
                }}
            }}"#,
            db = temp.child("data/ocrflow.db").path().display(),
            token = token_file.path().display(),
        ))
        .unwrap();

    let config = load_config(config_file.path()).unwrap();
    assert_eq!(config.scheduler.interval_secs, 10);
    assert_eq!(config.scheduler.batch_size, 4);
    assert_eq!(config.worker.capacity(), 6);
    assert_eq!(config.ocr.default_language, "en");
    assert_eq!(config.ocr.default_confidence, 75);
    assert_eq!(config.server.log_format, LogFormat::Json);
    assert_eq!(
        config.database_path().unwrap(),
        temp.child("data/ocrflow.db").path()
    );

    let identity = StaticTokenIdentity::from_config(&config.server.api_tokens).unwrap();
    assert_eq!(identity.authenticate("s3cret").unwrap().as_str(), "reader");
}

#[test]
fn rejects_invalid_values() {
    let temp = TempDir::new().unwrap();
    let config_file = temp.child("bad.json");
    config_file
        .write_str(r#"{ "worker": { "job_timeout_secs": 0 } }"#)
        .unwrap();

    let err = load_config(config_file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));
    assert!(err.to_string().contains("job_timeout_secs"));
}

#[test]
fn reports_missing_file_path() {
    let temp = TempDir::new().unwrap();
    let missing = temp.child("absent.json");

    match load_config(missing.path()) {
        Err(ConfigError::ReadFile { path, .. }) => assert_eq!(path, missing.path()),
        other => panic!("expected ReadFile error, got {:?}", other.map(|_| ())),
    }
}
