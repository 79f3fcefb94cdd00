//! 投递结果的副作用
//!
//! 每个终态结果恰好产生一个遥测事件；发送失败、账本故障和意外错误
//! 额外提交一份结构化错误报告。遥测和报告都是即发即弃，
//! 不会阻塞或改变返回给调用方的结果。

use chrono::{DateTime, Utc};
use courier_shared::kafka::KafkaProducer;
use courier_shared::observability::metrics as metrics_helpers;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::classifier::Outcome;
use crate::models::MessageType;

pub const EVENT_SENT: &str = "sent";
pub const EVENT_SEND_FAILED: &str = "send_failed";

/// 遥测事件标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryTags {
    pub message_type: MessageType,
    pub template: String,
    /// 归一化后的收件人；归一化失败时为原始输入
    pub recipient: String,
    pub idempotency_key: String,
    pub duplicate: bool,
    pub outcome: &'static str,
}

/// 遥测事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// `sent` 或 `send_failed`
    pub name: &'static str,
    pub duration: Duration,
    pub tags: TelemetryTags,
}

/// 结构化错误报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub outcome: &'static str,
    pub message_type: MessageType,
    pub template: String,
    pub recipient: String,
    pub idempotency_key: String,
    pub user_id: Option<String>,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

/// 遥测发射器
#[cfg_attr(test, mockall::automock)]
pub trait TelemetryEmitter: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// 错误报告器
#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, report: ErrorReport);
}

/// 一次尝试的上下文，用于填充事件标签
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub message_type: MessageType,
    pub template: &'a str,
    pub recipient: &'a str,
    pub idempotency_key: &'a str,
    pub user_id: Option<&'a str>,
}

/// 副作用分发器
#[derive(Clone)]
pub struct EffectDispatcher {
    telemetry: Arc<dyn TelemetryEmitter>,
    reporter: Arc<dyn ErrorReporter>,
}

impl EffectDispatcher {
    pub fn new(telemetry: Arc<dyn TelemetryEmitter>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            telemetry,
            reporter,
        }
    }

    pub fn dispatch(&self, ctx: &DispatchContext<'_>, outcome: &Outcome, duration: Duration) {
        let event = TelemetryEvent {
            name: if outcome.is_success() {
                EVENT_SENT
            } else {
                EVENT_SEND_FAILED
            },
            duration,
            tags: TelemetryTags {
                message_type: ctx.message_type,
                template: ctx.template.to_string(),
                recipient: ctx.recipient.to_string(),
                idempotency_key: ctx.idempotency_key.to_string(),
                duplicate: outcome.is_duplicate(),
                outcome: outcome.name(),
            },
        };
        self.telemetry.emit(&event);

        if outcome.is_reportable() {
            let detail = outcome.detail().unwrap_or_default().to_string();
            self.reporter.capture(ErrorReport {
                message: format!("{} 通知投递失败: {}", ctx.message_type, outcome.name()),
                outcome: outcome.name(),
                message_type: ctx.message_type,
                template: ctx.template.to_string(),
                recipient: ctx.recipient.to_string(),
                idempotency_key: ctx.idempotency_key.to_string(),
                user_id: ctx.user_id.map(str::to_string),
                detail,
                occurred_at: Utc::now(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// 遥测实现
// ---------------------------------------------------------------------------

/// 写入 Prometheus 指标并输出一行结构化日志
///
/// 收件人和幂等键只进日志，不作为指标标签。
#[derive(Debug, Default)]
pub struct MetricsTelemetry;

impl MetricsTelemetry {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryEmitter for MetricsTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        let tags = &event.tags;
        metrics_helpers::record_delivery(
            event.name,
            &tags.template,
            tags.outcome,
            tags.duplicate,
            event.duration.as_secs_f64(),
        );

        let duration_ms = event.duration.as_millis() as u64;
        if event.name == EVENT_SENT {
            info!(
                event = event.name,
                message_type = %tags.message_type,
                template = %tags.template,
                recipient = %tags.recipient,
                idempotency_key = %tags.idempotency_key,
                duplicate = tags.duplicate,
                outcome = tags.outcome,
                duration_ms,
                "通知投递完成"
            );
        } else {
            warn!(
                event = event.name,
                message_type = %tags.message_type,
                template = %tags.template,
                recipient = %tags.recipient,
                idempotency_key = %tags.idempotency_key,
                outcome = tags.outcome,
                duration_ms,
                "通知投递失败"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// 错误报告实现
// ---------------------------------------------------------------------------

/// 以 error 级别日志输出报告
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture(&self, report: ErrorReport) {
        metrics_helpers::record_error_report(&report.template, report.outcome);
        error!(
            outcome = report.outcome,
            message_type = %report.message_type,
            template = %report.template,
            recipient = %report.recipient,
            idempotency_key = %report.idempotency_key,
            user_id = report.user_id.as_deref().unwrap_or("-"),
            detail = %report.detail,
            "{}",
            report.message
        );
    }
}

/// 将报告投递到 Kafka
///
/// 在后台任务中发送，调用方不等待结果；投递失败只记录日志。
#[derive(Clone)]
pub struct KafkaErrorReporter {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaErrorReporter {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

impl ErrorReporter for KafkaErrorReporter {
    fn capture(&self, report: ErrorReport) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(outcome = report.outcome, "没有可用的运行时，错误报告未投递到 Kafka");
            return;
        };

        let producer = self.producer.clone();
        let topic = self.topic.clone();
        runtime.spawn(async move {
            if let Err(e) = producer
                .send_json(&topic, &report.idempotency_key, &report)
                .await
            {
                warn!(
                    topic = %topic,
                    idempotency_key = %report.idempotency_key,
                    error = %e,
                    "错误报告投递到 Kafka 失败"
                );
            }
        });
    }
}

/// 将报告分发给多个报告器
#[derive(Default)]
pub struct CompositeErrorReporter {
    reporters: Vec<Arc<dyn ErrorReporter>>,
}

impl CompositeErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl ErrorReporter for CompositeErrorReporter {
    fn capture(&self, report: ErrorReport) {
        for reporter in &self.reporters {
            reporter.capture(report.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DispatchContext<'static> {
        DispatchContext {
            message_type: MessageType::Sms,
            template: "booking_checkin_reminder",
            recipient: "14155551234",
            idempotency_key: "key-1",
            user_id: Some("user-1"),
        }
    }

    fn dispatcher(telemetry: MockTelemetryEmitter, reporter: MockErrorReporter) -> EffectDispatcher {
        EffectDispatcher::new(Arc::new(telemetry), Arc::new(reporter))
    }

    #[test]
    fn test_success_emits_sent_without_report() {
        let mut telemetry = MockTelemetryEmitter::new();
        telemetry
            .expect_emit()
            .withf(|event| {
                event.name == EVENT_SENT
                    && !event.tags.duplicate
                    && event.tags.recipient == "14155551234"
                    && event.tags.idempotency_key == "key-1"
                    && event.tags.template == "booking_checkin_reminder"
            })
            .times(1)
            .return_const(());
        let mut reporter = MockErrorReporter::new();
        reporter.expect_capture().never();

        dispatcher(telemetry, reporter).dispatch(
            &ctx(),
            &Outcome::NewSendSuccess {
                provider_message_id: None,
            },
            Duration::from_millis(5),
        );
    }

    #[test]
    fn test_duplicates_are_tagged() {
        for outcome in [Outcome::DuplicateNormal, Outcome::DuplicateRace] {
            let mut telemetry = MockTelemetryEmitter::new();
            telemetry
                .expect_emit()
                .withf(|event| event.name == EVENT_SENT && event.tags.duplicate)
                .times(1)
                .return_const(());
            let mut reporter = MockErrorReporter::new();
            reporter.expect_capture().never();

            dispatcher(telemetry, reporter).dispatch(&ctx(), &outcome, Duration::ZERO);
        }
    }

    #[test]
    fn test_failures_file_one_report() {
        let outcomes = [
            Outcome::SendFailure {
                reason: "provider 503".to_string(),
            },
            Outcome::PersistenceFailure {
                detail: "pool timed out".to_string(),
            },
            Outcome::Unexpected {
                detail: "commit failed".to_string(),
            },
        ];

        for outcome in outcomes {
            let expected_detail = outcome.detail().unwrap().to_string();
            let expected_outcome = outcome.name();

            let mut telemetry = MockTelemetryEmitter::new();
            telemetry
                .expect_emit()
                .withf(|event| event.name == EVENT_SEND_FAILED && !event.tags.duplicate)
                .times(1)
                .return_const(());
            let mut reporter = MockErrorReporter::new();
            reporter
                .expect_capture()
                .withf(move |report| {
                    report.detail == expected_detail
                        && report.outcome == expected_outcome
                        && report.user_id.as_deref() == Some("user-1")
                        && report.recipient == "14155551234"
                })
                .times(1)
                .return_const(());

            dispatcher(telemetry, reporter).dispatch(&ctx(), &outcome, Duration::ZERO);
        }
    }

    #[test]
    fn test_input_errors_do_not_report() {
        let outcomes = [
            Outcome::InvalidRecipient {
                reason: "abc".to_string(),
            },
            Outcome::UnknownTemplate {
                template: "does_not_exist".to_string(),
            },
        ];

        for outcome in outcomes {
            let mut telemetry = MockTelemetryEmitter::new();
            telemetry
                .expect_emit()
                .withf(|event| event.name == EVENT_SEND_FAILED)
                .times(1)
                .return_const(());
            let mut reporter = MockErrorReporter::new();
            reporter.expect_capture().never();

            dispatcher(telemetry, reporter).dispatch(&ctx(), &outcome, Duration::ZERO);
        }
    }

    #[test]
    fn test_composite_reporter_fans_out() {
        let mut first = MockErrorReporter::new();
        first.expect_capture().times(1).return_const(());
        let mut second = MockErrorReporter::new();
        second.expect_capture().times(1).return_const(());

        let composite = CompositeErrorReporter::new()
            .with(Arc::new(first))
            .with(Arc::new(second));
        assert_eq!(composite.len(), 2);

        composite.capture(ErrorReport {
            message: "sms 通知投递失败: send_failure".to_string(),
            outcome: "send_failure",
            message_type: MessageType::Sms,
            template: "booking_checkin_reminder".to_string(),
            recipient: "14155551234".to_string(),
            idempotency_key: "key-1".to_string(),
            user_id: None,
            detail: "provider 503".to_string(),
            occurred_at: Utc::now(),
        });
    }

    #[test]
    fn test_builtin_emitters_do_not_panic() {
        let event = TelemetryEvent {
            name: EVENT_SEND_FAILED,
            duration: Duration::from_millis(12),
            tags: TelemetryTags {
                message_type: MessageType::Email,
                template: "booking_confirmation".to_string(),
                recipient: "guest@example.com".to_string(),
                idempotency_key: "key-9".to_string(),
                duplicate: false,
                outcome: "send_failure",
            },
        };
        MetricsTelemetry::new().emit(&event);

        TracingErrorReporter.capture(ErrorReport {
            message: "email 通知投递失败: send_failure".to_string(),
            outcome: "send_failure",
            message_type: MessageType::Email,
            template: "booking_confirmation".to_string(),
            recipient: "guest@example.com".to_string(),
            idempotency_key: "key-9".to_string(),
            user_id: None,
            detail: "provider 503".to_string(),
            occurred_at: Utc::now(),
        });
    }
}
