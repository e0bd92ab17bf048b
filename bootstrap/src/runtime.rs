//! 运行时初始化

use courier_config::AppConfig;
use courier_telemetry::TelemetryError;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

/// 初始化遥测
///
/// 生产环境强制 JSON 日志；启用 metrics 时返回 Prometheus handle，由调用方决定如何暴露
pub fn init_telemetry(config: &AppConfig) -> Result<Option<PrometheusHandle>, TelemetryError> {
    let mut telemetry = config.telemetry.clone();
    if config.is_production() {
        telemetry.json = true;
    }
    let handle = courier_telemetry::init(&telemetry)?;

    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        backend = ?config.messaging.backend,
        consumer_mode = ?config.messaging.consumer_mode,
        metrics = handle.is_some(),
        "Runtime initialized"
    );
    Ok(handle)
}
