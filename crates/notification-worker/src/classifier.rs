//! 投递结果分类
//!
//! 把一次尝试中观察到的信号（插入结果、发送结果、存储故障）归约为唯一的 `Outcome`。
//! 分类是纯函数，不产生任何副作用；日志、指标和错误报告由 effects 模块负责。

use serde::Serialize;

use crate::error::DeliveryError;
use crate::ledger::StoreFault;
use crate::models::Delivery;

/// 账本插入阶段的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertSignal {
    Inserted,
    AlreadyRecorded,
    /// 插入或开启事务时抛出故障，故障内容通过 `StoreFault` 传入
    Failed,
}

/// 外部发送阶段的信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendSignal {
    NotAttempted,
    Delivered { provider_message_id: Option<String> },
    Failed { reason: String },
    /// 适配器 panic，无法确定是否已经发出
    Aborted { detail: String },
}

/// 一次投递的最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// 首次发送成功并已记账
    NewSendSuccess { provider_message_id: Option<String> },
    /// 插入前检查发现已经发送过
    DuplicateNormal,
    /// 与并发尝试竞争时在唯一约束上落败
    DuplicateRace,
    SendFailure { reason: String },
    PersistenceFailure { detail: String },
    Unexpected { detail: String },
    InvalidRecipient { reason: String },
    UnknownTemplate { template: String },
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewSendSuccess { .. } => "new_send_success",
            Self::DuplicateNormal => "duplicate_normal",
            Self::DuplicateRace => "duplicate_race",
            Self::SendFailure { .. } => "send_failure",
            Self::PersistenceFailure { .. } => "persistence_failure",
            Self::Unexpected { .. } => "unexpected",
            Self::InvalidRecipient { .. } => "invalid_recipient",
            Self::UnknownTemplate { .. } => "unknown_template",
        }
    }

    /// 调用方视角的成功：首次发送或任一种重复
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::NewSendSuccess { .. } | Self::DuplicateNormal | Self::DuplicateRace
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateNormal | Self::DuplicateRace)
    }

    /// 是否需要提交错误报告
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            Self::SendFailure { .. } | Self::PersistenceFailure { .. } | Self::Unexpected { .. }
        )
    }

    /// 失败详情，成功结果为 None
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::SendFailure { reason } | Self::InvalidRecipient { reason } => Some(reason),
            Self::PersistenceFailure { detail } | Self::Unexpected { detail } => Some(detail),
            Self::UnknownTemplate { template } => Some(template),
            Self::NewSendSuccess { .. } | Self::DuplicateNormal | Self::DuplicateRace => None,
        }
    }

    /// 转换为返回给调用方的结果
    pub fn into_result(self) -> Result<Delivery, DeliveryError> {
        match self {
            Self::NewSendSuccess {
                provider_message_id,
            } => Ok(Delivery::sent(provider_message_id)),
            Self::DuplicateNormal | Self::DuplicateRace => Ok(Delivery::duplicate()),
            Self::SendFailure { reason } => Err(DeliveryError::SendFailure { reason }),
            Self::PersistenceFailure { detail } => Err(DeliveryError::PersistenceFailure { detail }),
            Self::Unexpected { detail } => Err(DeliveryError::Unexpected { detail }),
            Self::InvalidRecipient { reason } => Err(DeliveryError::InvalidRecipient { reason }),
            Self::UnknownTemplate { template } => Err(DeliveryError::UnknownTemplate { template }),
        }
    }
}

/// 根据尝试信号分类
///
/// 判定顺序：
/// 1. 插入前已可见 → `DuplicateNormal`
/// 2. 幂等约束冲突（插入时或提交时）→ `DuplicateRace`
/// 3. 其他约束冲突 → `Unexpected`
/// 4. 插入阶段的非冲突故障 → `PersistenceFailure`
/// 5. 已插入且发送失败 → `SendFailure`
/// 6. 已插入、已发送、已提交 → `NewSendSuccess`
///
/// 其余组合（已发送但提交失败、适配器 panic 等）均为 `Unexpected`。
pub fn classify(insert: InsertSignal, send: SendSignal, fault: Option<StoreFault>) -> Outcome {
    if insert == InsertSignal::AlreadyRecorded {
        return Outcome::DuplicateNormal;
    }

    if let Some(StoreFault::UniqueViolation { constraint }) = &fault {
        return if constraint.is_idempotency_key() {
            Outcome::DuplicateRace
        } else {
            Outcome::Unexpected {
                detail: format!("违反非幂等唯一约束: {constraint:?}"),
            }
        };
    }

    match (insert, send, fault) {
        (InsertSignal::Failed, _, Some(StoreFault::Backend(detail))) => {
            Outcome::PersistenceFailure { detail }
        }
        (InsertSignal::Inserted, SendSignal::Failed { reason }, _) => Outcome::SendFailure { reason },
        (
            InsertSignal::Inserted,
            SendSignal::Delivered {
                provider_message_id,
            },
            None,
        ) => Outcome::NewSendSuccess {
            provider_message_id,
        },
        (InsertSignal::Inserted, SendSignal::Delivered { .. }, Some(fault)) => Outcome::Unexpected {
            detail: format!("外部发送已完成但账本提交失败: {fault}"),
        },
        (_, SendSignal::Aborted { detail }, _) => Outcome::Unexpected {
            detail: format!("发送适配器异常终止: {detail}"),
        },
        (insert, send, fault) => Outcome::Unexpected {
            detail: format!("无法识别的尝试状态: insert={insert:?}, send={send:?}, fault={fault:?}"),
        },
    }
}
