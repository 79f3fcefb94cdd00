//! 通知投递服务
//!
//! 以幂等键保证短信/邮件通知最多发送一次：调用方可以放心地重试同一个请求，
//! 重复请求返回成功而不会再次触达用户。
//!
//! - `coordinator`：一次投递的完整流程
//! - `ledger`：幂等账本（Postgres / 进程内）
//! - `classifier`：把尝试信号归约为最终结果
//! - `effects`：遥测与错误报告
//! - `job`：Kafka 投递任务消费者

pub mod classifier;
pub mod coordinator;
pub mod effects;
pub mod error;
pub mod job;
pub mod ledger;
pub mod models;
pub mod recipient;
pub mod sender;
pub mod templates;
pub mod test_utils;

pub use coordinator::SendCoordinator;
pub use error::DeliveryError;
pub use models::{Delivery, MessageType, SendRequest};
