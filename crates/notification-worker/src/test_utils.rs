//! 测试工具模块
//!
//! 提供计数发送器、记录型遥测/报告器和可编排故障的账本，
//! 供单元测试和 tests/ 下的集成测试共用。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::effects::{ErrorReport, ErrorReporter, TelemetryEmitter, TelemetryEvent};
use crate::ledger::{InsertOutcome, LedgerAttempt, LedgerStore, StoreFault};
use crate::models::{IdempotencyRecord, LedgerScope, MessageType, NewLedgerEntry};
use crate::recipient::Recipient;
use crate::sender::{ProviderReceipt, SendRejection, SenderAdapter};
use crate::templates::RenderedMessage;

// ==================== 计数发送器 ====================

/// 记录每次调用的发送器
///
/// 可配置前 N 次调用失败，以及每次调用的人为延迟（用于放大并发窗口）。
pub struct CountingSender {
    message_type: MessageType,
    calls: AtomicUsize,
    fail_first: usize,
    delay: Duration,
    sent: Mutex<Vec<(String, RenderedMessage)>>,
}

impl CountingSender {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            calls: AtomicUsize::new(0),
            fail_first: 0,
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// 前 `n` 次调用返回服务商不可用
    pub fn fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// 所有调用都失败
    pub fn failing(self) -> Self {
        self.fail_first(usize::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 总调用次数（含失败）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 成功发出的消息
    pub fn sent(&self) -> Vec<(String, RenderedMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SenderAdapter for CountingSender {
    fn message_type(&self) -> MessageType {
        self.message_type
    }

    fn provider(&self) -> &'static str {
        "counting"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<ProviderReceipt, SendRejection> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if call <= self.fail_first {
            return Err(SendRejection::Unavailable {
                provider: self.provider().to_string(),
                reason: format!("scripted failure #{call}"),
            });
        }

        self.sent
            .lock()
            .push((recipient.as_str().to_string(), message.clone()));

        Ok(ProviderReceipt {
            provider_message_id: Some(format!("counting-{call}")),
        })
    }
}

// ==================== 记录型遥测与报告 ====================

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl TelemetryEmitter for RecordingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn capture(&self, report: ErrorReport) {
        self.reports.lock().push(report);
    }
}

// ==================== 可编排故障的账本 ====================

/// 按预设脚本返回故障的账本
///
/// 用于模拟难以在真实存储上稳定复现的时序，例如外部发送完成后
/// 提交阶段才撞上唯一约束。
#[derive(Default)]
pub struct ScriptedLedger {
    begin_fault: Option<StoreFault>,
    insert_fault: Option<StoreFault>,
    commit_fault: Option<StoreFault>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl ScriptedLedger {
    /// 所有操作都成功
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_fault(fault: StoreFault) -> Self {
        Self {
            begin_fault: Some(fault),
            ..Self::default()
        }
    }

    pub fn insert_fault(fault: StoreFault) -> Self {
        Self {
            insert_fault: Some(fault),
            ..Self::default()
        }
    }

    pub fn commit_fault(fault: StoreFault) -> Self {
        Self {
            commit_fault: Some(fault),
            ..Self::default()
        }
    }

    pub fn begins(&self) -> usize {
        self.counters.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for ScriptedLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerAttempt>, StoreFault> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = &self.begin_fault {
            return Err(fault.clone());
        }

        Ok(Box::new(ScriptedAttempt {
            insert_fault: self.insert_fault.clone(),
            commit_fault: self.commit_fault.clone(),
            counters: self.counters.clone(),
        }))
    }

    async fn find(&self, _scope: &LedgerScope) -> Result<Option<IdempotencyRecord>, StoreFault> {
        Ok(None)
    }
}

struct ScriptedAttempt {
    insert_fault: Option<StoreFault>,
    commit_fault: Option<StoreFault>,
    counters: Arc<Counters>,
}

#[async_trait]
impl LedgerAttempt for ScriptedAttempt {
    async fn insert(&mut self, _entry: &NewLedgerEntry) -> Result<InsertOutcome, StoreFault> {
        match self.insert_fault.take() {
            Some(fault) => Err(fault),
            None => Ok(InsertOutcome::Inserted),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreFault> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        match self.commit_fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreFault> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
