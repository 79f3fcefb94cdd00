//! 收件人归一化与校验
//!
//! 短信收件人去掉所有非数字字符后必须是 11 位北美号码；
//! 邮件收件人去掉首尾空白后交给 validator 校验格式。
//! 归一化结果写入账本，也是外部发送器实际使用的地址。

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use validator::ValidateEmail;

use crate::models::MessageType;

/// 国家码 1 + 区号 [2-9]XX + 局号 [2-9]XX + 4 位用户号
static NANP_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^1[2-9]\d{2}[2-9]\d{6}$").expect("NANP 正则表达式无效")
});

/// 归一化后的收件人地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Recipient(String);

impl Recipient {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecipientError {
    #[error("收件人为空")]
    Empty,

    #[error("不是有效的北美手机号: {input}")]
    InvalidPhone { input: String },

    #[error("不是有效的邮箱地址: {input}")]
    InvalidEmail { input: String },
}

/// 按消息类型归一化收件人
pub fn normalize(message_type: MessageType, raw: &str) -> Result<Recipient, RecipientError> {
    match message_type {
        MessageType::Sms => normalize_phone(raw),
        MessageType::Email => normalize_email(raw),
    }
}

pub fn normalize_phone(raw: &str) -> Result<Recipient, RecipientError> {
    if raw.trim().is_empty() {
        return Err(RecipientError::Empty);
    }

    // 去掉 "+"、空格、括号、连字符等所有非数字字符
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if NANP_NUMBER.is_match(&digits) {
        Ok(Recipient(digits))
    } else {
        Err(RecipientError::InvalidPhone {
            input: raw.to_string(),
        })
    }
}

pub fn normalize_email(raw: &str) -> Result<Recipient, RecipientError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RecipientError::Empty);
    }

    if trimmed.validate_email() {
        Ok(Recipient(trimmed.to_string()))
    } else {
        Err(RecipientError::InvalidEmail {
            input: raw.to_string(),
        })
    }
}
