//! 投递任务消费者
//!
//! 从 Kafka 消费 `SendJob`，按消息类型路由到对应的协调器。
//! 可重试的失败把任务原样转投到重试 topic（幂等键保持不变），由外部调度器重放；
//! 转投本身失败时不确认该消息，由消费循环重新投递。
//! 不可重试的失败和无法解析的消息只记录日志后跳过。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_shared::config::KafkaConfig;
use courier_shared::error::SharedError;
use courier_shared::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer};
use courier_shared::observability::metrics as metrics_helpers;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::coordinator::SendCoordinator;
use crate::error::WorkerError;
use crate::models::{MessageType, SendRequest};

/// Kafka 上的投递任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendJob {
    pub message_type: MessageType,
    #[serde(flatten)]
    pub request: SendRequest,
}

/// 任务处理结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Delivered { already_sent: bool },
    /// 需要以同一幂等键重试
    Retry { reason: String },
    /// 不再处理
    Dropped { reason: String },
}

impl JobDisposition {
    fn status(&self) -> &'static str {
        match self {
            Self::Delivered { already_sent: true } => "duplicate",
            Self::Delivered { already_sent: false } => "delivered",
            Self::Retry { .. } => "retry",
            Self::Dropped { .. } => "dropped",
        }
    }
}

/// 按消息类型路由任务
#[derive(Default)]
pub struct SendJobHandler {
    coordinators: HashMap<MessageType, Arc<SendCoordinator>>,
}

impl SendJobHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coordinator(mut self, coordinator: Arc<SendCoordinator>) -> Self {
        self.coordinators
            .insert(coordinator.message_type(), coordinator);
        self
    }

    pub fn coordinator(&self, message_type: MessageType) -> Result<&Arc<SendCoordinator>, WorkerError> {
        self.coordinators
            .get(&message_type)
            .ok_or(WorkerError::CoordinatorMissing { message_type })
    }

    pub async fn handle(&self, job: &SendJob) -> JobDisposition {
        let disposition = match self.coordinator(job.message_type) {
            Err(e) => JobDisposition::Dropped {
                reason: e.to_string(),
            },
            Ok(coordinator) => match coordinator.send(job.request.clone()).await {
                Ok(delivery) => JobDisposition::Delivered {
                    already_sent: delivery.already_sent,
                },
                Err(e) if e.is_retryable() => JobDisposition::Retry {
                    reason: e.to_string(),
                },
                Err(e) => JobDisposition::Dropped {
                    reason: e.to_string(),
                },
            },
        };

        metrics_helpers::record_send_job(job.message_type.as_str(), disposition.status());
        disposition
    }
}

/// 重试任务的发布端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, topic: &str, job: &SendJob) -> Result<(), SharedError>;
}

#[async_trait]
impl JobPublisher for KafkaProducer {
    async fn publish(&self, topic: &str, job: &SendJob) -> Result<(), SharedError> {
        self.send_json(topic, &job.request.idempotency_key, job)
            .await
            .map(|_| ())
    }
}

/// 投递任务消费者
pub struct SendJobConsumer {
    consumer: KafkaConsumer,
    producer: KafkaProducer,
    handler: Arc<SendJobHandler>,
    jobs_topic: String,
    retry_topic: String,
}

impl SendJobConsumer {
    pub fn new(
        config: &KafkaConfig,
        handler: Arc<SendJobHandler>,
        producer: KafkaProducer,
    ) -> Result<Self, WorkerError> {
        let consumer = KafkaConsumer::new(config, Some("send-jobs"))?;
        Ok(Self {
            consumer,
            producer,
            handler,
            jobs_topic: config.jobs_topic.clone(),
            retry_topic: config.dead_letter_topic.clone(),
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.consumer.subscribe(&[self.jobs_topic.as_str()])?;
        info!(topic = %self.jobs_topic, "投递任务消费者已启动");

        let handler = self.handler;
        let producer = self.producer;
        let retry_topic = self.retry_topic;

        self.consumer
            .start(shutdown, |msg| {
                let handler = &handler;
                let producer = &producer;
                let retry_topic = retry_topic.as_str();
                async move {
                    handle_message(handler, producer, retry_topic, &msg)
                        .await
                        .map_err(|e| match e {
                            WorkerError::Shared(inner) => inner,
                            other => SharedError::Internal(other.to_string()),
                        })
                }
            })
            .await;

        info!("投递任务消费者已停止");
        Ok(())
    }
}

/// 处理单条 Kafka 消息
///
/// 返回 `Ok` 时消息可以确认；返回 `Err` 时消息尚未安全落地，需要重新投递。
async fn handle_message(
    handler: &SendJobHandler,
    publisher: &dyn JobPublisher,
    retry_topic: &str,
    msg: &ConsumerMessage,
) -> Result<(), WorkerError> {
    let job = match decode_job(msg) {
        Ok(job) => job,
        Err(e) => {
            // 重新投递也无法解析，直接跳过
            error!(
                error = %e,
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "无法解析投递任务，已跳过"
            );
            return Ok(());
        }
    };

    match handler.handle(&job).await {
        JobDisposition::Delivered { already_sent } => {
            info!(
                idempotency_key = %job.request.idempotency_key,
                already_sent,
                "投递任务完成"
            );
        }
        JobDisposition::Retry { reason } => {
            warn!(
                idempotency_key = %job.request.idempotency_key,
                reason = %reason,
                "投递失败，转投重试队列"
            );
            publisher.publish(retry_topic, &job).await?;
        }
        JobDisposition::Dropped { reason } => {
            warn!(
                idempotency_key = %job.request.idempotency_key,
                reason = %reason,
                "投递任务被丢弃"
            );
        }
    }

    Ok(())
}

fn decode_job(msg: &ConsumerMessage) -> Result<SendJob, WorkerError> {
    msg.deserialize_payload::<SendJob>()
        .map_err(|e| WorkerError::DeserializationFailed(e.to_string()))
}
