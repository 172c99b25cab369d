//! # Structured Logging Module
//!
//! Environment-aware structured logging for the processing, reconciliation
//! and log streaming loops. `RUST_LOG` wins over the environment default;
//! `EVENTFLOW_LOG_FORMAT=json` switches the console layer to JSON lines.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ConfigManager;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&environment)));
        let json = std::env::var("EVENTFLOW_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Embedding applications may already own the global subscriber.
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

pub fn log_event_operation(operation: &str, event_id: &str, project_id: Option<&str>, status: &str) {
    tracing::info!(
        operation = %operation,
        event_id = %event_id,
        project_id = project_id,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 EVENT_OPERATION"
    );
}

pub fn log_worker_operation(operation: &str, event_id: &str, worker_name: &str, phase: &str) {
    tracing::info!(
        operation = %operation,
        event_id = %event_id,
        worker_name = %worker_name,
        phase = %phase,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 WORKER_OPERATION"
    );
}

pub fn log_unit_operation(operation: &str, namespace: &str, unit_name: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        namespace = %namespace,
        unit_name = %unit_name,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 UNIT_OPERATION"
    );
}

pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
