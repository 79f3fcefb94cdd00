//! 外部发送适配器
//!
//! 通过 `SenderAdapter` trait 抽象对短信/邮件服务商的调用。当前内置实现为模拟发送
//! （仅记录日志并返回消息 ID），替换为真实 SDK 时只需实现同一 trait。
//!
//! 适配器只负责"发出去"，不感知幂等：重复调用就会重复发送，
//! 去重由协调器和幂等账本保证。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::MessageType;
use crate::recipient::Recipient;
use crate::templates::RenderedMessage;

/// 服务商回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    /// 服务商返回的消息标识，用于追踪投递状态
    pub provider_message_id: Option<String>,
}

/// 服务商拒绝或不可达
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("服务商 {provider} 拒绝发送: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("服务商 {provider} 不可用: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("服务商 {provider} 调用超时 ({timeout_ms}ms)")]
    Timeout { provider: String, timeout_ms: u64 },
}

/// 外部发送适配器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SenderAdapter: Send + Sync {
    /// 该适配器负责的消息类型
    fn message_type(&self) -> MessageType;

    /// 服务商名称，用于日志和错误信息
    fn provider(&self) -> &'static str;

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<ProviderReceipt, SendRejection>;
}

// ---------------------------------------------------------------------------
// 短信发送器
// ---------------------------------------------------------------------------

/// 单条短信的字符上限，超出后服务商会拆分为多条计费
const SMS_SEGMENT_CHARS: usize = 160;

/// 模拟短信发送器
///
/// 生产环境中替换为短信服务商的 API 调用
#[derive(Debug, Default)]
pub struct SmsSender;

impl SmsSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SenderAdapter for SmsSender {
    fn message_type(&self) -> MessageType {
        MessageType::Sms
    }

    fn provider(&self) -> &'static str {
        "simulated-sms"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<ProviderReceipt, SendRejection> {
        let message_id = Uuid::now_v7().to_string();
        let segments = message.body.chars().count().div_ceil(SMS_SEGMENT_CHARS);

        info!(
            channel = "SMS",
            recipient = %recipient,
            message_id = %message_id,
            segments,
            body = %message.body,
            "模拟发送短信通知"
        );

        Ok(ProviderReceipt {
            provider_message_id: Some(message_id),
        })
    }
}

// ---------------------------------------------------------------------------
// 邮件发送器
// ---------------------------------------------------------------------------

/// 模拟邮件发送器
///
/// 生产环境中替换为 SMTP 或邮件服务商的 API 调用
#[derive(Debug)]
pub struct EmailSender {
    from_address: String,
}

impl EmailSender {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
        }
    }
}

impl Default for EmailSender {
    fn default() -> Self {
        Self::new("no-reply@courier.local")
    }
}

#[async_trait]
impl SenderAdapter for EmailSender {
    fn message_type(&self) -> MessageType {
        MessageType::Email
    }

    fn provider(&self) -> &'static str {
        "simulated-email"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<ProviderReceipt, SendRejection> {
        // 邮件必须带主题，缺失说明模板注册错了类型
        let Some(subject) = message.subject.as_deref() else {
            return Err(SendRejection::Rejected {
                provider: self.provider().to_string(),
                reason: "邮件缺少主题".to_string(),
            });
        };

        let message_id = Uuid::now_v7().to_string();

        info!(
            channel = "EMAIL",
            from = %self.from_address,
            recipient = %recipient,
            message_id = %message_id,
            subject = %subject,
            "模拟发送邮件通知"
        );

        Ok(ProviderReceipt {
            provider_message_id: Some(message_id),
        })
    }
}

// ---------------------------------------------------------------------------
// 超时包装
// ---------------------------------------------------------------------------

/// 为任意适配器加上调用超时
///
/// 超时按发送失败处理，账本记录随之回滚。超时后服务商可能仍然完成了发送，
/// 因此下游必须能够容忍偶发的重复通知。
pub struct TimeoutSender {
    inner: Arc<dyn SenderAdapter>,
    timeout: Duration,
}

impl TimeoutSender {
    pub fn new(inner: Arc<dyn SenderAdapter>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl SenderAdapter for TimeoutSender {
    fn message_type(&self) -> MessageType {
        self.inner.message_type()
    }

    fn provider(&self) -> &'static str {
        self.inner.provider()
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<ProviderReceipt, SendRejection> {
        match tokio::time::timeout(self.timeout, self.inner.send(recipient, message)).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    provider = self.inner.provider(),
                    recipient = %recipient,
                    timeout_ms,
                    "外部发送调用超时"
                );
                Err(SendRejection::Timeout {
                    provider: self.inner.provider().to_string(),
                    timeout_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::{normalize_email, normalize_phone};

    fn sms_message() -> RenderedMessage {
        RenderedMessage {
            subject: None,
            body: "Hi Ana, check-in opens at 3:00 PM.".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sms_sender_returns_message_id() {
        let recipient = normalize_phone("+14155551234").unwrap();
        let receipt = SmsSender::new().send(&recipient, &sms_message()).await.unwrap();

        assert!(receipt.provider_message_id.is_some());
        assert_eq!(SmsSender::new().message_type(), MessageType::Sms);
    }

    #[tokio::test]
    async fn test_email_sender_requires_subject() {
        let recipient = normalize_email("guest@example.com").unwrap();
        let sender = EmailSender::default();

        let err = sender.send(&recipient, &sms_message()).await.unwrap_err();
        assert!(matches!(err, SendRejection::Rejected { .. }));

        let message = RenderedMessage {
            subject: Some("Welcome".to_string()),
            body: "Hello".to_string(),
        };
        assert!(sender.send(&recipient, &message).await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_sender_passes_through() {
        let mut mock = MockSenderAdapter::new();
        mock.expect_send().times(1).returning(|_, _| {
            Ok(ProviderReceipt {
                provider_message_id: Some("prov-1".to_string()),
            })
        });
        mock.expect_message_type().return_const(MessageType::Sms);

        let sender = TimeoutSender::new(Arc::new(mock), Duration::from_secs(1));
        let recipient = normalize_phone("+14155551234").unwrap();

        let receipt = sender.send(&recipient, &sms_message()).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("prov-1"));
        assert_eq!(sender.message_type(), MessageType::Sms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sender_times_out() {
        struct SlowSender;

        #[async_trait]
        impl SenderAdapter for SlowSender {
            fn message_type(&self) -> MessageType {
                MessageType::Sms
            }

            fn provider(&self) -> &'static str {
                "slow"
            }

            async fn send(
                &self,
                _recipient: &Recipient,
                _message: &RenderedMessage,
            ) -> Result<ProviderReceipt, SendRejection> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ProviderReceipt {
                    provider_message_id: None,
                })
            }
        }

        let sender = TimeoutSender::new(Arc::new(SlowSender), Duration::from_millis(50));
        let recipient = normalize_phone("+14155551234").unwrap();

        let err = sender.send(&recipient, &sms_message()).await.unwrap_err();
        assert_eq!(
            err,
            SendRejection::Timeout {
                provider: "slow".to_string(),
                timeout_ms: 50,
            }
        );
    }
}
