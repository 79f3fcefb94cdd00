//! 投递领域模型
//!
//! 幂等账本记录、投递请求与投递结果的数据结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// 消息类型
///
/// 幂等键的作用域之一：同一个幂等键在短信和邮件之间互不影响。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Sms,
    Email,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 幂等账本记录
///
/// `(message_type, idempotency_key, message_template)` 三元组全局唯一，
/// 记录只插入不修改，是"这条通知已经发出"的唯一事实来源。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub message_type: MessageType,
    pub idempotency_key: String,
    pub message_template: String,
    /// 归一化后的收件人
    pub recipient: String,
    pub user_id: Option<String>,
    pub params: serde_json::Value,
    pub rendered_message: String,
    pub rendered_subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 待写入账本的记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub message_type: MessageType,
    pub idempotency_key: String,
    pub message_template: String,
    pub recipient: String,
    pub user_id: Option<String>,
    pub params: serde_json::Value,
    pub rendered_message: String,
    pub rendered_subject: Option<String>,
}

impl NewLedgerEntry {
    /// 唯一性三元组
    pub fn scope(&self) -> LedgerScope {
        LedgerScope {
            message_type: self.message_type,
            idempotency_key: self.idempotency_key.clone(),
            message_template: self.message_template.clone(),
        }
    }
}

/// 账本唯一性作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerScope {
    pub message_type: MessageType,
    pub idempotency_key: String,
    pub message_template: String,
}

impl fmt::Display for LedgerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.message_type, self.idempotency_key, self.message_template
        )
    }
}

/// 一次投递请求
///
/// 消息类型由处理该请求的协调器决定，不在请求中携带。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// 原始收件人（手机号或邮箱），尚未归一化
    pub recipient: String,
    pub idempotency_key: String,
    pub template: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl SendRequest {
    pub fn new(
        recipient: impl Into<String>,
        idempotency_key: impl Into<String>,
        template: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            idempotency_key: idempotency_key.into(),
            template: template.into(),
            params,
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// 成功投递的结果
///
/// `already_sent` 为 true 表示此前已经发送过，本次调用没有触发外部发送。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub already_sent: bool,
    pub provider_message_id: Option<String>,
}

impl Delivery {
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            already_sent: false,
            provider_message_id,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            already_sent: true,
            provider_message_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_serde() {
        assert_eq!(serde_json::to_string(&MessageType::Sms).unwrap(), "\"sms\"");
        let parsed: MessageType = serde_json::from_str("\"email\"").unwrap();
        assert_eq!(parsed, MessageType::Email);
        assert_eq!(MessageType::Email.to_string(), "email");
    }

    #[test]
    fn test_send_request_defaults() {
        let request: SendRequest = serde_json::from_str(
            r#"{"recipient":"+14155551234","idempotency_key":"key-1","template":"booking_checkin_reminder"}"#,
        )
        .unwrap();

        assert_eq!(request.params, serde_json::json!({}));
        assert!(request.user_id.is_none());
    }

    #[test]
    fn test_entry_scope_display() {
        let entry = NewLedgerEntry {
            message_type: MessageType::Sms,
            idempotency_key: "key-1".to_string(),
            message_template: "booking_checkin_reminder".to_string(),
            recipient: "14155551234".to_string(),
            user_id: None,
            params: serde_json::json!({}),
            rendered_message: "hi".to_string(),
            rendered_subject: None,
        };

        assert_eq!(entry.scope().to_string(), "sms/key-1/booking_checkin_reminder");
    }
}
