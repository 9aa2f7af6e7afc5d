pub mod db;
pub mod errors;
pub mod models;
pub mod position;
pub mod service;
pub mod store;

pub use crate::db::SqliteOrderStore;
pub use crate::errors::{OrderError, OrderResult};
pub use crate::models::{IntegrityReport, OrderDimension, OrderRecord, OrderScope, OrderSettings};
pub use crate::service::OrderService;
pub use crate::store::{CustomFieldDirectory, OrderStore};

use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global subscriber. With `log_dir` set, events go to a daily
/// rolling JSON file; otherwise to stderr.
pub fn init_tracing(settings: &OrderSettings) -> OrderResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .map_err(|error| OrderError::Config(format!("invalid log filter: {}", error)))?;

    let Some(log_dir) = settings.log_dir.as_ref() else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| OrderError::Config(error.to_string()));
    };

    fs::create_dir_all(log_dir)
        .map_err(|error| OrderError::Config(format!("failed to create {}: {}", log_dir.display(), error)))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "board-order.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| OrderError::Config(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::init_tracing;
    use crate::errors::OrderError;
    use crate::models::OrderSettings;

    #[test]
    fn second_init_reports_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = OrderSettings {
            log_dir: Some(dir.path().join("logs")),
            ..OrderSettings::default()
        };

        let _ = init_tracing(&settings);
        assert!(matches!(init_tracing(&settings), Err(OrderError::Config(_))));
        assert!(dir.path().join("logs").is_dir());
    }
}
