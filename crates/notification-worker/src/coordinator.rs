//! 投递协调器
//!
//! 对一个幂等键的一次投递请求，保证外部发送最多生效一次：
//!
//! 1. 归一化并校验收件人
//! 2. 从注册表中查找模板并渲染
//! 3. 在账本事务中插入记录 → 调用外部发送 → 成功提交 / 失败回滚
//! 4. 分类结果、分发副作用、返回结果
//!
//! 重复请求（无论是顺序重放还是并发竞争）都返回 `Ok`，`already_sent` 为 true。
//!
//! 前提：被保护的外部发送必须能够容忍偶发的重复执行。发送成功但提交失败、
//! 或发送超时但服务商实际已送达时，下一次重试会再次发送。

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::classifier::{InsertSignal, Outcome, SendSignal, classify};
use crate::effects::{DispatchContext, EffectDispatcher};
use crate::error::DeliveryError;
use crate::ledger::{InsertOutcome, LedgerStore};
use crate::models::{Delivery, MessageType, NewLedgerEntry, SendRequest};
use crate::recipient::{self, Recipient};
use crate::sender::SenderAdapter;
use crate::templates::{RenderedMessage, TemplateRegistry};

/// 一次尝试的决策结果，尚未产生任何副作用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 归一化后的收件人；归一化失败时为原始输入
    pub recipient: String,
    pub outcome: Outcome,
}

/// 投递协调器，绑定一种消息类型
pub struct SendCoordinator {
    message_type: MessageType,
    ledger: Arc<dyn LedgerStore>,
    sender: Arc<dyn SenderAdapter>,
    templates: Arc<TemplateRegistry>,
    effects: EffectDispatcher,
}

impl SendCoordinator {
    pub fn new(
        message_type: MessageType,
        ledger: Arc<dyn LedgerStore>,
        sender: Arc<dyn SenderAdapter>,
        templates: Arc<TemplateRegistry>,
        effects: EffectDispatcher,
    ) -> Self {
        if sender.message_type() != message_type {
            warn!(
                coordinator = %message_type,
                sender = %sender.message_type(),
                "发送适配器与协调器的消息类型不一致"
            );
        }

        Self {
            message_type,
            ledger,
            sender,
            templates,
            effects,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// 投递一条通知
    #[instrument(
        skip(self, request),
        fields(
            message_type = %self.message_type,
            template = %request.template,
            idempotency_key = %request.idempotency_key
        )
    )]
    pub async fn send(&self, request: SendRequest) -> Result<Delivery, DeliveryError> {
        let started = Instant::now();
        let attempt = self.attempt(&request).await;

        let ctx = DispatchContext {
            message_type: self.message_type,
            template: &request.template,
            recipient: &attempt.recipient,
            idempotency_key: &request.idempotency_key,
            user_id: request.user_id.as_deref(),
        };
        self.effects
            .dispatch(&ctx, &attempt.outcome, started.elapsed());

        attempt.outcome.into_result()
    }

    /// 执行一次尝试并返回决策结果，不产生遥测和错误报告
    pub async fn attempt(&self, request: &SendRequest) -> Attempt {
        let recipient = match recipient::normalize(self.message_type, &request.recipient) {
            Ok(recipient) => recipient,
            Err(e) => {
                debug!(error = %e, "收件人校验失败");
                return Attempt {
                    recipient: request.recipient.clone(),
                    outcome: Outcome::InvalidRecipient {
                        reason: e.to_string(),
                    },
                };
            }
        };

        let outcome = self.deliver(&recipient, request).await;
        Attempt {
            recipient: recipient.into_inner(),
            outcome,
        }
    }

    async fn deliver(&self, recipient: &Recipient, request: &SendRequest) -> Outcome {
        let Some(renderer) = self.templates.resolve(self.message_type, &request.template) else {
            warn!(template = %request.template, "通知模板未注册");
            return Outcome::UnknownTemplate {
                template: request.template.clone(),
            };
        };

        let message = match renderer.render(&request.params) {
            Ok(message) => message,
            Err(e) => {
                return Outcome::Unexpected {
                    detail: e.to_string(),
                };
            }
        };

        let entry = NewLedgerEntry {
            message_type: self.message_type,
            idempotency_key: request.idempotency_key.clone(),
            message_template: request.template.clone(),
            recipient: recipient.as_str().to_string(),
            user_id: request.user_id.clone(),
            params: request.params.clone(),
            rendered_message: message.body.clone(),
            rendered_subject: message.subject.clone(),
        };

        self.guarded_send(recipient, &entry, &message).await
    }

    /// 在账本事务内执行外部发送
    async fn guarded_send(
        &self,
        recipient: &Recipient,
        entry: &NewLedgerEntry,
        message: &RenderedMessage,
    ) -> Outcome {
        let mut attempt = match self.ledger.begin().await {
            Ok(attempt) => attempt,
            Err(fault) => return classify(InsertSignal::Failed, SendSignal::NotAttempted, Some(fault)),
        };

        match attempt.insert(entry).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::AlreadyRecorded) => {
                if let Err(e) = attempt.rollback().await {
                    warn!(error = %e, "重复请求回滚事务失败");
                }
                return classify(InsertSignal::AlreadyRecorded, SendSignal::NotAttempted, None);
            }
            Err(fault) => {
                if let Err(e) = attempt.rollback().await {
                    warn!(error = %e, "插入失败后回滚事务失败");
                }
                return classify(InsertSignal::Failed, SendSignal::NotAttempted, Some(fault));
            }
        }

        let send = match AssertUnwindSafe(self.sender.send(recipient, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(receipt)) => SendSignal::Delivered {
                provider_message_id: receipt.provider_message_id,
            },
            Ok(Err(rejection)) => SendSignal::Failed {
                reason: rejection.to_string(),
            },
            Err(panic) => SendSignal::Aborted {
                detail: panic_message(panic.as_ref()),
            },
        };

        let fault = match send {
            SendSignal::Delivered { .. } => attempt.commit().await.err(),
            _ => {
                if let Err(e) = attempt.rollback().await {
                    warn!(error = %e, "发送失败后回滚事务失败");
                }
                None
            }
        };

        classify(InsertSignal::Inserted, send, fault)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
