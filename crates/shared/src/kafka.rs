//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为 Producer/Consumer 抽象，统一消息序列化、
//! 错误映射和优雅关闭语义。
//!
//! 消费端采用"处理成功后再存储 offset"的至少一次语义：进程在处理中途崩溃，
//! 或 handler 返回错误时，该消息会被重新投递。下游处理必须因此具备幂等性。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::Offset;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SharedError;

/// handler 失败后，重新投递同一条消息前的等待时间
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, SharedError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| SharedError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，Clone 代价很低，可在后台任务间共享。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 5 秒内无法投递即返回错误，由调用方决定记录或丢弃。
    pub fn new(config: &KafkaConfig) -> Result<Self, SharedError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), SharedError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| SharedError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), SharedError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| SharedError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// Kafka 消费者
///
/// 自动提交已存储的 offset，但 offset 只在 handler 返回 `Ok` 后才存储。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, SharedError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), SharedError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| SharedError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 将分区位置回退到指定 offset，使该消息在退避后被再次消费
    async fn redeliver(&self, topic: &str, partition: i32, offset: i64) {
        tokio::time::sleep(REDELIVERY_BACKOFF).await;

        if let Err(e) = self
            .consumer
            .seek(topic, partition, Offset::Offset(offset), Duration::from_secs(5))
        {
            // offset 未存储，再均衡或重启后仍会从该消息继续
            error!(error = %e, topic, partition, offset, "回退 Kafka offset 失败");
        }
    }

    /// 启动消费循环，直到关闭信号变为 `true`
    ///
    /// handler 返回 `Ok` 表示消息已处理完毕（包括 handler 自行决定跳过的坏消息），
    /// 此时存储 offset。返回 `Err` 表示消息尚未安全落地：不存储 offset，
    /// 并把分区 seek 回该消息，等待片刻后重新投递。分区内后续消息的 offset
    /// 会隐式确认之前的所有消息，因此失败的消息不能被跳过。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), SharedError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            let (topic, partition, offset) =
                                (msg.topic.clone(), msg.partition, msg.offset);

                            match handler(msg).await {
                                Ok(()) => {
                                    if let Err(e) =
                                        self.consumer.store_offset_from_message(&borrowed_msg)
                                    {
                                        error!(error = %e, "存储 Kafka offset 失败");
                                    }
                                }
                                Err(e) => {
                                    error!(
                                        error = %e,
                                        topic = %topic,
                                        partition,
                                        offset,
                                        "处理 Kafka 消息失败，将重新投递"
                                    );
                                    self.redeliver(&topic, partition, offset).await;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_payload(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "courier.send.jobs".to_string(),
            partition: 0,
            offset: 7,
            key: Some("key-1".to_string()),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::from([("trace-id".to_string(), "abc-123".to_string())]),
        }
    }

    #[test]
    fn test_consumer_message_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Job {
            idempotency_key: String,
            template: String,
        }

        let msg = message_with_payload(
            br#"{"idempotency_key":"key-1","template":"booking_checkin_reminder"}"#,
        );

        let job: Job = msg.deserialize_payload().unwrap();
        assert_eq!(
            job,
            Job {
                idempotency_key: "key-1".to_string(),
                template: "booking_checkin_reminder".to_string(),
            }
        );
        assert_eq!(msg.headers.get("trace-id").unwrap(), "abc-123");
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = message_with_payload(b"not json");

        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        let err = result.unwrap_err();
        assert_eq!(err.code(), "KAFKA_ERROR");
    }
}
