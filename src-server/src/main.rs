mod auth;
mod error;
mod routes;
mod state;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use ocrflow::config::{load_config, Config};
use ocrflow::db::Database;
use ocrflow::document::SqliteDocumentStore;
use ocrflow::engine::default_engine;
use ocrflow::identity::StaticTokenIdentity;
use ocrflow::runtime::Pipeline;

use state::AppState;

/// Environment variable naming the JSON config file.
const CONFIG_ENV_VAR: &str = "OCRFLOW_CONFIG";

fn read_config() -> Result<Config, String> {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => load_config(path.trim()).map_err(|e| e.to_string()),
        _ => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match read_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ocrflow-server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init_tracing(config.server.log_format) {
        eprintln!("ocrflow-server: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting ocrflow-server v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), String> {
    let db_path = config
        .database_path()
        .ok_or("Could not determine a database path; set database_path in the config")?;
    let db = Database::open(&db_path).map_err(|e| e.to_string())?;

    let identity = StaticTokenIdentity::from_config(&config.server.api_tokens)
        .map_err(|e| format!("Failed to load API tokens: {}", e))?;
    if identity.is_empty() {
        warn!("No API tokens configured; every OCR request will be rejected");
    }

    let documents = Arc::new(SqliteDocumentStore::new(db.clone()));
    let engine = default_engine(&config.ocr);
    info!(
        "Using OCR engine '{}' ({})",
        engine.name(),
        engine.supported_languages().join(", ")
    );

    let pipeline = Arc::new(
        Pipeline::start(&config, db, engine, documents).map_err(|e| e.to_string())?,
    );
    let app = routes::router(AppState::new(pipeline.clone(), Arc::new(identity)));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", config.server.bind, e))?;
    info!("Listening on {}", config.server.bind);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {}", e));

    info!("Stopping OCR pipeline...");
    if let Err(e) = tokio::task::spawn_blocking(move || pipeline.shutdown()).await {
        error!("Pipeline shutdown failed: {}", e);
    }

    served
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
