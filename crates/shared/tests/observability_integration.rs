//! 可观测性与配置集成测试
//!
//! 测试指标记录函数、日志过滤器构建以及配置分层加载。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use courier_shared::observability::metrics::{
        get_handle, record_delivery, record_error_report, record_send_job,
    };

    #[test]
    fn test_record_delivery_outcomes() {
        record_delivery("sent", "booking_checkin_reminder", "new_send_success", false, 0.05);
        record_delivery("sent", "booking_checkin_reminder", "duplicate_normal", true, 0.01);
        record_delivery("sent", "booking_checkin_reminder", "duplicate_race", true, 0.12);
        record_delivery("send_failed", "booking_confirmation", "send_failure", false, 0.30);
        record_delivery("send_failed", "does_not_exist", "unknown_template", false, 0.0);
    }

    #[test]
    fn test_record_error_report_and_jobs() {
        record_error_report("booking_checkin_reminder", "send_failure");
        record_error_report("booking_checkin_reminder", "persistence_failure");
        record_send_job("sms", "delivered");
        record_send_job("email", "retry");
        record_send_job("sms", "dropped");
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        // 空字符串
        record_delivery("", "", "", false, 0.0);

        // 超长模板名
        let long_name = "x".repeat(1000);
        record_delivery("sent", &long_name, "new_send_success", false, 0.01);

        // 极端持续时间
        record_delivery("sent", "verification_code", "new_send_success", false, 999.99);
    }

    #[test]
    fn test_handle_absent_without_init() {
        // 测试进程中没有安装 recorder
        assert!(get_handle().is_none());
    }
}

// ============================================================================
// 日志过滤器测试
// ============================================================================

mod tracing_tests {
    use courier_shared::config::ObservabilityConfig;
    use courier_shared::observability::tracing::env_filter;

    #[test]
    fn test_env_filter_from_config_level() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };

        // RUST_LOG 未设置时使用配置中的级别
        if std::env::var("RUST_LOG").is_err() {
            let filter = env_filter(&config);
            assert!(filter.to_string().contains("debug"));
        }
    }
}

// ============================================================================
// 配置加载测试
// ============================================================================

mod config_tests {
    use courier_shared::config::{AppConfig, LedgerBackend};

    #[test]
    fn test_environment_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
            [observability]
            log_format = "pretty"

            [delivery]
            report_errors_to_kafka = false
            "#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("production.toml"),
            r#"
            [observability]
            log_format = "json"

            [delivery]
            report_errors_to_kafka = true
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path(), "notification-worker", "production").unwrap();

        assert!(config.is_production());
        assert!(config.observability.json_logs());
        assert!(config.delivery.report_errors_to_kafka);
        assert_eq!(config.delivery.ledger_backend, LedgerBackend::Postgres);
    }

    #[test]
    fn test_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");

        let config = AppConfig::load_from(&missing, "notification-worker", "development").unwrap();

        assert_eq!(config.service_name, "notification-worker");
        assert_eq!(config.kafka.jobs_topic, "courier.send.jobs");
        assert_eq!(config.delivery.send_timeout_ms, 10_000);
    }
}
