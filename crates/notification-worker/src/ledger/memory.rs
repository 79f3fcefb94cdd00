//! 进程内账本
//!
//! 复现 Postgres 唯一索引在并发事务下的行为：
//! - 已提交的记录在插入前检查中可见，返回 `AlreadyRecorded`
//! - 同一三元组的未提交写入会占住一个槽位，后来者等待槽位释放
//! - 等到的结果是对方已提交时，后来者收到唯一约束冲突
//!
//! 仅用于本地调试和测试，进程重启即丢失。

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{ConstraintId, InsertOutcome, LedgerAttempt, LedgerStore, StoreFault};
use crate::models::{IdempotencyRecord, LedgerScope, NewLedgerEntry};

/// 进程内账本
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Mutex<HashMap<LedgerScope, IdempotencyRecord>>,
    /// 正在写入的三元组，值为该三元组的排他槽位
    slots: Mutex<HashMap<LedgerScope, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicI64,
}

impl Inner {
    /// 释放槽位；没有其他等待者时一并移除
    ///
    /// 等待者在 `slots` 锁内克隆 Arc，因此在同一把锁内读取的引用计数是准确的：
    /// 映射表和 guard 各持有一份。
    fn release(&self, scope: &LedgerScope, guard: OwnedMutexGuard<()>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(scope)
            && Arc::strong_count(slot) == 2
        {
            slots.remove(scope);
        }
        drop(guard);
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交的记录数
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有已提交记录，按写入顺序排列
    pub fn records(&self) -> Vec<IdempotencyRecord> {
        let mut records: Vec<_> = self.inner.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerAttempt>, StoreFault> {
        Ok(Box::new(MemoryAttempt {
            inner: self.inner.clone(),
            staged: None,
        }))
    }

    async fn find(&self, scope: &LedgerScope) -> Result<Option<IdempotencyRecord>, StoreFault> {
        Ok(self.inner.records.lock().get(scope).cloned())
    }
}

struct Staged {
    scope: LedgerScope,
    record: IdempotencyRecord,
    guard: OwnedMutexGuard<()>,
}

struct MemoryAttempt {
    inner: Arc<Inner>,
    staged: Option<Staged>,
}

#[async_trait]
impl LedgerAttempt for MemoryAttempt {
    async fn insert(&mut self, entry: &NewLedgerEntry) -> Result<InsertOutcome, StoreFault> {
        if self.staged.is_some() {
            return Err(StoreFault::Backend("同一次尝试只能插入一条记录".to_string()));
        }

        let scope = entry.scope();
        if self.inner.records.lock().contains_key(&scope) {
            return Ok(InsertOutcome::AlreadyRecorded);
        }

        let slot = {
            let mut slots = self.inner.slots.lock();
            slots.entry(scope.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;

        // 等待期间对方可能已提交
        if self.inner.records.lock().contains_key(&scope) {
            debug!(scope = %scope, "等待并发写入后发现记录已提交");
            self.inner.release(&scope, guard);
            return Err(StoreFault::unique(ConstraintId::IdempotencyKey));
        }

        let record = IdempotencyRecord {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            message_type: entry.message_type,
            idempotency_key: entry.idempotency_key.clone(),
            message_template: entry.message_template.clone(),
            recipient: entry.recipient.clone(),
            user_id: entry.user_id.clone(),
            params: entry.params.clone(),
            rendered_message: entry.rendered_message.clone(),
            rendered_subject: entry.rendered_subject.clone(),
            created_at: Utc::now(),
        };

        self.staged = Some(Staged {
            scope,
            record,
            guard,
        });
        Ok(InsertOutcome::Inserted)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreFault> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };

        let conflict = {
            let mut records = self.inner.records.lock();
            if records.contains_key(&staged.scope) {
                true
            } else {
                records.insert(staged.scope.clone(), staged.record);
                false
            }
        };
        self.inner.release(&staged.scope, staged.guard);

        if conflict {
            return Err(StoreFault::unique(ConstraintId::IdempotencyKey));
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreFault> {
        if let Some(staged) = self.staged.take() {
            self.inner.release(&staged.scope, staged.guard);
        }
        Ok(())
    }
}

impl Drop for MemoryAttempt {
    fn drop(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.inner.release(&staged.scope, staged.guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;
    use std::time::Duration;

    fn entry(key: &str) -> NewLedgerEntry {
        NewLedgerEntry {
            message_type: MessageType::Sms,
            idempotency_key: key.to_string(),
            message_template: "booking_checkin_reminder".to_string(),
            recipient: "14155551234".to_string(),
            user_id: Some("user-1".to_string()),
            params: serde_json::json!({"guest_name": "Ana"}),
            rendered_message: "Hi Ana".to_string(),
            rendered_subject: None,
        }
    }

    #[tokio::test]
    async fn test_insert_commit_then_already_recorded() {
        let ledger = MemoryLedger::new();

        let mut attempt = ledger.begin().await.unwrap();
        assert_eq!(
            attempt.insert(&entry("key-1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        attempt.commit().await.unwrap();

        let mut second = ledger.begin().await.unwrap();
        assert_eq!(
            second.insert(&entry("key-1")).await.unwrap(),
            InsertOutcome::AlreadyRecorded
        );
        second.rollback().await.unwrap();

        assert_eq!(ledger.len(), 1);
        let record = ledger.find(&entry("key-1").scope()).await.unwrap().unwrap();
        assert_eq!(record.recipient, "14155551234");
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_rollback_leaves_no_record() {
        let ledger = MemoryLedger::new();

        let mut attempt = ledger.begin().await.unwrap();
        attempt.insert(&entry("key-1")).await.unwrap();
        attempt.rollback().await.unwrap();

        assert!(ledger.is_empty());
        assert!(ledger.inner.slots.lock().is_empty());

        // 回滚后可以重新写入
        let mut retry = ledger.begin().await.unwrap();
        assert_eq!(
            retry.insert(&entry("key-1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        retry.commit().await.unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let ledger = MemoryLedger::new();

        {
            let mut attempt = ledger.begin().await.unwrap();
            attempt.insert(&entry("key-1")).await.unwrap();
        }

        assert!(ledger.is_empty());
        assert!(ledger.inner.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_insert_waits_then_conflicts() {
        let ledger = MemoryLedger::new();

        let mut first = ledger.begin().await.unwrap();
        first.insert(&entry("key-1")).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut second = ledger.begin().await.unwrap();
                second.insert(&entry("key-1")).await
            })
        };

        // 第二个插入者被阻塞在槽位上
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.commit().await.unwrap();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(StoreFault::unique(ConstraintId::IdempotencyKey)));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_insert_proceeds_after_rollback() {
        let ledger = MemoryLedger::new();

        let mut first = ledger.begin().await.unwrap();
        first.insert(&entry("key-1")).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut second = ledger.begin().await.unwrap();
                let outcome = second.insert(&entry("key-1")).await;
                second.commit().await.unwrap();
                outcome
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.rollback().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(InsertOutcome::Inserted));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_scope_isolates_keys_templates_and_types() {
        let ledger = MemoryLedger::new();

        let base = entry("key-1");
        let other_template = NewLedgerEntry {
            message_template: "verification_code".to_string(),
            ..base.clone()
        };
        let other_type = NewLedgerEntry {
            message_type: MessageType::Email,
            ..base.clone()
        };

        for e in [&base, &other_template, &other_type, &entry("key-2")] {
            let mut attempt = ledger.begin().await.unwrap();
            assert_eq!(attempt.insert(e).await.unwrap(), InsertOutcome::Inserted);
            attempt.commit().await.unwrap();
        }

        assert_eq!(ledger.len(), 4);
        let ids: Vec<i64> = ledger.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
