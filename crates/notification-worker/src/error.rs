//! 通知服务错误类型
//!
//! `DeliveryError` 是一次投递调用返回给调用方的失败分类，
//! 上层根据 `is_retryable` 决定转投重试队列还是直接丢弃。

use courier_shared::error::SharedError;
use thiserror::Error;

use crate::models::MessageType;

/// 投递失败分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("收件人无效: {reason}")]
    InvalidRecipient { reason: String },

    #[error("通知模板未找到: {template}")]
    UnknownTemplate { template: String },

    #[error("通知发送失败: {reason}")]
    SendFailure { reason: String },

    #[error("幂等账本写入失败: {detail}")]
    PersistenceFailure { detail: String },

    #[error("投递过程出现意外错误: {detail}")]
    Unexpected { detail: String },
}

impl DeliveryError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRecipient { .. } => "INVALID_RECIPIENT",
            Self::UnknownTemplate { .. } => "UNKNOWN_TEMPLATE",
            Self::SendFailure { .. } => "SEND_FAILURE",
            Self::PersistenceFailure { .. } => "PERSISTENCE_FAILURE",
            Self::Unexpected { .. } => "UNEXPECTED",
        }
    }

    /// 是否值得用同一个幂等键重试
    ///
    /// 发送失败和账本故障时账本中没有留下记录，重试是安全的。
    /// 意外错误可能发生在外部发送之后，不自动重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailure { .. } | Self::PersistenceFailure { .. })
    }
}

/// 工作者进程级错误
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("投递任务反序列化失败: {0}")]
    DeserializationFailed(String),

    #[error("未注册消息类型的协调器: {message_type}")]
    CoordinatorMissing { message_type: MessageType },

    #[error(transparent)]
    Shared(#[from] SharedError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeliveryError::SendFailure {
            reason: "provider timeout".to_string(),
        };
        assert_eq!(err.to_string(), "通知发送失败: provider timeout");
        assert_eq!(err.code(), "SEND_FAILURE");

        let err = DeliveryError::UnknownTemplate {
            template: "does_not_exist".to_string(),
        };
        assert_eq!(err.to_string(), "通知模板未找到: does_not_exist");

        let err = WorkerError::CoordinatorMissing {
            message_type: MessageType::Email,
        };
        assert_eq!(err.to_string(), "未注册消息类型的协调器: email");
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            DeliveryError::PersistenceFailure {
                detail: "connection reset".to_string()
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::InvalidRecipient {
                reason: "abc".to_string()
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::Unexpected {
                detail: "commit failed".to_string()
            }
            .is_retryable()
        );
        assert!(
            !DeliveryError::UnknownTemplate {
                template: "x".to_string()
            }
            .is_retryable()
        );
    }
}
