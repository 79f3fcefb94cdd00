//! Postgres 账本
//!
//! 每次尝试对应一个数据库事务。插入前先做一次可见性检查，命中时直接返回
//! `AlreadyRecorded`；未命中则执行 INSERT，并发写入同一三元组时由唯一索引
//! 阻塞等待，对方提交后以 23505 错误返回，约束名映射为 `ConstraintId`。

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use super::{ConstraintId, InsertOutcome, LedgerAttempt, LedgerStore, StoreFault};
use crate::models::{IdempotencyRecord, LedgerScope, NewLedgerEntry};

/// Postgres 账本
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerAttempt>, StoreFault> {
        let tx = self.pool.begin().await.map_err(store_fault)?;
        Ok(Box::new(PgAttempt { tx }))
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn find(&self, scope: &LedgerScope) -> Result<Option<IdempotencyRecord>, StoreFault> {
        sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT id, message_type, idempotency_key, message_template, recipient,
                   user_id, params, rendered_message, rendered_subject, created_at
            FROM notification_ledger
            WHERE message_type = $1 AND idempotency_key = $2 AND message_template = $3
            "#,
        )
        .bind(scope.message_type)
        .bind(&scope.idempotency_key)
        .bind(&scope.message_template)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_fault)
    }
}

struct PgAttempt {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerAttempt for PgAttempt {
    async fn insert(&mut self, entry: &NewLedgerEntry) -> Result<InsertOutcome, StoreFault> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notification_ledger
                WHERE message_type = $1 AND idempotency_key = $2 AND message_template = $3
            )
            "#,
        )
        .bind(entry.message_type)
        .bind(&entry.idempotency_key)
        .bind(&entry.message_template)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_fault)?;

        if exists {
            return Ok(InsertOutcome::AlreadyRecorded);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO notification_ledger
                (message_type, idempotency_key, message_template, recipient,
                 user_id, params, rendered_message, rendered_subject)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(entry.message_type)
        .bind(&entry.idempotency_key)
        .bind(&entry.message_template)
        .bind(&entry.recipient)
        .bind(&entry.user_id)
        .bind(&entry.params)
        .bind(&entry.rendered_message)
        .bind(&entry.rendered_subject)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_fault)?;

        debug!(id, scope = %entry.scope(), "账本记录已写入事务");
        Ok(InsertOutcome::Inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreFault> {
        self.tx.commit().await.map_err(store_fault)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreFault> {
        self.tx.rollback().await.map_err(store_fault)
    }
}

/// 将 sqlx 错误映射为账本故障
///
/// 唯一约束冲突保留约束名，交由 `ConstraintId::from_name` 识别。
fn store_fault(err: sqlx::Error) -> StoreFault {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return StoreFault::unique(ConstraintId::from_name(db_err.constraint()));
    }
    StoreFault::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_backend_faults() {
        assert!(matches!(
            store_fault(sqlx::Error::PoolTimedOut),
            StoreFault::Backend(_)
        ));
        assert!(matches!(
            store_fault(sqlx::Error::RowNotFound),
            StoreFault::Backend(_)
        ));
    }
}
