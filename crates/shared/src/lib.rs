//! 共享库
//!
//! 通知投递服务共用的配置、错误处理、数据库连接、Kafka 与可观测性基础设施。

pub mod config;
pub mod database;
pub mod error;
pub mod kafka;
pub mod observability;
