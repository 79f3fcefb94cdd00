//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_sent_total",
        "Notifications resolved as sent, including duplicates"
    );
    metrics::describe_counter!(
        "notification_send_failed_total",
        "Notifications that ended in a failure outcome"
    );
    metrics::describe_histogram!(
        "notification_send_duration_seconds",
        "Time spent in one send attempt in seconds"
    );
    metrics::describe_counter!(
        "notification_error_reports_total",
        "Structured error reports filed"
    );
    metrics::describe_counter!("send_jobs_total", "Send jobs consumed from Kafka");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次投递结果
///
/// 收件人和幂等键基数过高，只进入日志，不作为指标标签。
#[inline]
pub fn record_delivery(
    event: &str,
    template: &str,
    outcome: &str,
    duplicate: bool,
    duration_secs: f64,
) {
    let counter_name = if event == "sent" {
        "notification_sent_total"
    } else {
        "notification_send_failed_total"
    };

    metrics::counter!(
        counter_name,
        "template" => template.to_string(),
        "outcome" => outcome.to_string(),
        "duplicate" => duplicate.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_send_duration_seconds",
        "template" => template.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 记录一次错误报告
#[inline]
pub fn record_error_report(template: &str, outcome: &str) {
    metrics::counter!(
        "notification_error_reports_total",
        "template" => template.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录一条消费到的投递任务
#[inline]
pub fn record_send_job(message_type: &str, status: &str) {
    metrics::counter!(
        "send_jobs_total",
        "message_type" => message_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
