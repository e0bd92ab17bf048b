//! telemetry - 可观测性库
//!
//! 日志格式、级别和 metrics 开关全部来自显式传入的 [`TelemetryConfig`]

use courier_config::TelemetryConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("Failed to install Prometheus recorder: {0}")]
    Metrics(String),
}

/// 按配置初始化 tracing 与 metrics
///
/// 未启用 metrics 时返回 `None`
pub fn init(config: &TelemetryConfig) -> Result<Option<PrometheusHandle>, TelemetryError> {
    if config.json {
        init_tracing_json(&config.log_level)?;
    } else {
        init_tracing(&config.log_level)?;
    }

    if config.metrics_enabled {
        return init_metrics().map(Some);
    }
    Ok(None)
}

fn build_filter(log_level: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(log_level).map_err(|e| TelemetryError::Filter {
        filter: log_level.to_string(),
        reason: e.to_string(),
    })
}

/// 初始化 tracing
pub fn init_tracing(log_level: &str) -> Result<(), TelemetryError> {
    let filter = build_filter(log_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) -> Result<(), TelemetryError> {
    let filter = build_filter(log_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Metrics(e.to_string()))
}
