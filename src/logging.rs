//! # Structured Logging Module
//!
//! Environment-aware structured logging for the broker. Console output by default, JSON
//! lines when `LOG_FORMAT=json`. `RUST_LOG` overrides the per-environment level.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
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

        // another subscriber (e.g. a test harness) may already be installed
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Current environment from `BROKER_ENV`, then `APP_ENV`
fn get_environment() -> String {
    std::env::var("BROKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for broker verbs and actions
pub fn log_broker_operation(
    operation: &str,
    instance_id: &str,
    plan_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        instance_id = %instance_id,
        plan_id = plan_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 BROKER_OPERATION"
    );
}

/// Log a backend resource that no record or task tracks anymore
///
/// Operators search for this marker; it must stay loud and stable.
pub fn log_orphan(instance_id: &str, resource_name: &str, error: &str) {
    tracing::error!(
        instance_id = %instance_id,
        resource_name = %resource_name,
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "🚨 ORPHANED RESOURCE: backend resource exists with no record and no delete task"
    );
}
