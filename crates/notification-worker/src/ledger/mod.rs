//! 幂等账本
//!
//! 账本记录"某个幂等键的某个模板已经发出"。一次投递尝试在一个事务内完成：
//! 插入记录 → 调用外部发送 → 成功则提交，失败则回滚。
//!
//! 并发安全完全依赖存储层的唯一约束：同一三元组的第二个插入者会阻塞在唯一索引上，
//! 等第一个事务结束后收到唯一约束冲突。冲突以结构化的 `ConstraintId` 返回，
//! 由分类器判断是否属于幂等竞争。

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{IdempotencyRecord, LedgerScope, NewLedgerEntry};

/// 幂等唯一约束的名称
pub const IDEMPOTENCY_CONSTRAINT: &str = "notification_ledger_idempotency_key";

/// 以 `UNIQUE (message_type, idempotency_key, message_template)` 建表时
/// Postgres 自动生成的约束名
pub const IDEMPOTENCY_CONSTRAINT_DEFAULT_NAME: &str =
    "notification_ledger_message_type_idempotency_key_message_template_key";

/// 存储层约束的结构化标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstraintId {
    /// 幂等三元组唯一约束
    IdempotencyKey,
    /// 其他命名约束
    Other(String),
    /// 存储层没有给出约束名
    Unnamed,
}

impl ConstraintId {
    /// 将存储层报告的约束名映射为结构化标识
    ///
    /// 这是唯一一处比较约束名的地方，重命名约束时只需修改这里。
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(IDEMPOTENCY_CONSTRAINT) | Some(IDEMPOTENCY_CONSTRAINT_DEFAULT_NAME) => {
                Self::IdempotencyKey
            }
            Some(other) => Self::Other(other.to_string()),
            None => Self::Unnamed,
        }
    }

    pub fn is_idempotency_key(&self) -> bool {
        matches!(self, Self::IdempotencyKey)
    }
}

/// 存储层故障
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreFault {
    #[error("唯一约束冲突: {constraint:?}")]
    UniqueViolation { constraint: ConstraintId },

    #[error("账本存储错误: {0}")]
    Backend(String),
}

impl StoreFault {
    pub fn unique(constraint: ConstraintId) -> Self {
        Self::UniqueViolation { constraint }
    }
}

/// 插入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 记录已写入当前事务，尚未提交
    Inserted,
    /// 插入前检查发现已有提交的记录
    AlreadyRecorded,
}

/// 账本存储
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 开启一次投递尝试（一个事务）
    async fn begin(&self) -> Result<Box<dyn LedgerAttempt>, StoreFault>;

    /// 查询已提交的记录
    async fn find(&self, scope: &LedgerScope) -> Result<Option<IdempotencyRecord>, StoreFault>;
}

/// 一次投递尝试
///
/// 未调用 `commit` 就被丢弃等同于回滚。
#[async_trait]
pub trait LedgerAttempt: Send {
    /// 插入记录，或在记录已存在时报告
    ///
    /// 并发尝试正在写入同一三元组时，该调用会等待对方结束；
    /// 对方提交后返回 `StoreFault::UniqueViolation`。
    async fn insert(&mut self, entry: &NewLedgerEntry) -> Result<InsertOutcome, StoreFault>;

    async fn commit(self: Box<Self>) -> Result<(), StoreFault>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreFault>;
}
