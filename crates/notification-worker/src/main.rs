//! 通知投递服务
//!
//! 消费 Kafka 投递任务，经幂等账本保护后调用短信/邮件发送器。

use anyhow::Result;
use courier_shared::{
    config::{AppConfig, LedgerBackend},
    database::Database,
    kafka::KafkaProducer,
    observability,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use notification_worker::{
    MessageType, SendCoordinator,
    effects::{
        CompositeErrorReporter, EffectDispatcher, ErrorReporter, KafkaErrorReporter,
        MetricsTelemetry, TracingErrorReporter,
    },
    job::{SendJobConsumer, SendJobHandler},
    ledger::{LedgerStore, MemoryLedger, PgLedger},
    sender::{EmailSender, SenderAdapter, SmsSender, TimeoutSender},
    templates::TemplateRegistry,
};

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置，失败时使用默认值
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    // 2. 初始化日志与指标
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!("Starting {}...", SERVICE_NAME);
    info!(
        environment = %config.environment,
        ledger_backend = ?config.delivery.ledger_backend,
        "Configuration loaded"
    );

    // 3. 幂等账本
    let (ledger, database): (Arc<dyn LedgerStore>, Option<Database>) =
        match config.delivery.ledger_backend {
            LedgerBackend::Postgres => {
                let db = Database::connect(&config.database).await?;
                db.health_check().await?;
                db.run_migrations(&config.database.migrations_dir).await?;
                info!("Database connection established");
                let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(db.pool().clone()));
                (ledger, Some(db))
            }
            LedgerBackend::Memory => {
                warn!("使用进程内账本，重启后幂等记录将丢失");
                let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
                (ledger, None)
            }
        };

    // 4. 副作用：指标遥测 + 错误报告
    let producer = KafkaProducer::new(&config.kafka)?;
    let mut reporter = CompositeErrorReporter::new().with(Arc::new(TracingErrorReporter));
    if config.delivery.report_errors_to_kafka {
        reporter = reporter.with(Arc::new(KafkaErrorReporter::new(
            producer.clone(),
            config.kafka.error_report_topic.clone(),
        )));
    }
    info!(reporters = reporter.len(), "Error reporters initialized");
    let reporter: Arc<dyn ErrorReporter> = Arc::new(reporter);
    let effects = EffectDispatcher::new(Arc::new(MetricsTelemetry::new()), reporter);

    // 5. 每种消息类型一个协调器，共享账本和模板
    let templates = Arc::new(TemplateRegistry::with_defaults());
    info!(
        sms = ?templates.template_names(MessageType::Sms),
        email = ?templates.template_names(MessageType::Email),
        "Templates registered"
    );

    let send_timeout = Duration::from_millis(config.delivery.send_timeout_ms);
    let coordinator = |message_type: MessageType, sender: Arc<dyn SenderAdapter>| {
        Arc::new(SendCoordinator::new(
            message_type,
            ledger.clone(),
            Arc::new(TimeoutSender::new(sender, send_timeout)),
            templates.clone(),
            effects.clone(),
        ))
    };

    let sms_sender: Arc<dyn SenderAdapter> = Arc::new(SmsSender::new());
    let email_sender: Arc<dyn SenderAdapter> = Arc::new(EmailSender::default());
    let handler = Arc::new(
        SendJobHandler::new()
            .with_coordinator(coordinator(MessageType::Sms, sms_sender))
            .with_coordinator(coordinator(MessageType::Email, email_sender)),
    );

    // 6. 启动消费者
    let consumer = SendJobConsumer::new(&config.kafka, handler, producer)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    info!("{} started", SERVICE_NAME);

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    consumer_task.await??;

    if let Some(db) = database {
        db.close().await;
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
