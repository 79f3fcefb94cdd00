//! 通知模板管理
//!
//! 模板按名称注册到 `TemplateRegistry`，由协调器在构造时注入。
//! 模板正文使用 `{{variable}}` 占位符，渲染是纯函数：同样的参数总是得到同样的结果。
//! 缺少变量视为渲染错误，而不是用默认值填充，避免发出内容残缺的通知。

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::models::MessageType;

/// 匹配 {{variable}} 格式的占位符
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("占位符正则表达式无效")
});

/// 渲染后的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// 邮件主题，短信为 None
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("模板 {template} 缺少参数: {param}")]
    MissingParam { template: String, param: String },

    #[error("模板 {template} 参数格式无效: {reason}")]
    InvalidParams { template: String, reason: String },
}

/// 模板渲染器
#[cfg_attr(test, mockall::automock)]
pub trait Renderer: Send + Sync {
    fn template_name(&self) -> &str;

    /// 该模板适用的消息类型
    fn message_type(&self) -> MessageType;

    fn render(&self, params: &Value) -> Result<RenderedMessage, RenderError>;
}

// ---------------------------------------------------------------------------
// 占位符模板
// ---------------------------------------------------------------------------

/// 基于 `{{variable}}` 占位符的模板
pub struct TemplateRenderer {
    name: String,
    message_type: MessageType,
    subject: Option<String>,
    body: String,
}

impl TemplateRenderer {
    pub fn sms(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_type: MessageType::Sms,
            subject: None,
            body: body.into(),
        }
    }

    pub fn email(
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            message_type: MessageType::Email,
            subject: Some(subject.into()),
            body: body.into(),
        }
    }

    /// 模板引用的全部变量名（去重，按首次出现顺序）
    pub fn variables(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let sources = self.subject.iter().chain(std::iter::once(&self.body));
        for source in sources {
            for caps in PLACEHOLDER.captures_iter(source) {
                let name = caps[1].to_string();
                if !seen.contains(&name) {
                    seen.push(name);
                }
            }
        }
        seen
    }

    fn fill(&self, source: &str, params: &serde_json::Map<String, Value>) -> Result<String, RenderError> {
        // 先确认所有变量都存在，replace_all 的闭包无法返回错误
        for caps in PLACEHOLDER.captures_iter(source) {
            let param = &caps[1];
            if lookup(params, param).is_none() {
                return Err(RenderError::MissingParam {
                    template: self.name.clone(),
                    param: param.to_string(),
                });
            }
        }

        let rendered = PLACEHOLDER.replace_all(source, |caps: &regex::Captures| {
            lookup(params, &caps[1]).unwrap_or_default()
        });
        Ok(rendered.into_owned())
    }
}

impl Renderer for TemplateRenderer {
    fn template_name(&self) -> &str {
        &self.name
    }

    fn message_type(&self) -> MessageType {
        self.message_type
    }

    fn render(&self, params: &Value) -> Result<RenderedMessage, RenderError> {
        let empty = serde_json::Map::new();
        let params = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(RenderError::InvalidParams {
                    template: self.name.clone(),
                    reason: format!("参数必须是 JSON 对象，实际为 {other}"),
                });
            }
        };

        let subject = match &self.subject {
            Some(subject) => Some(self.fill(subject, params)?),
            None => None,
        };
        let body = self.fill(&self.body, params)?;

        Ok(RenderedMessage { subject, body })
    }
}

/// 取出参数的文本表示
///
/// 字符串原样输出，数值和布尔值转为字面量；null 与嵌套结构视为缺失。
fn lookup(params: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// ---------------------------------------------------------------------------
// 模板注册表
// ---------------------------------------------------------------------------

/// 模板注册表
///
/// 按 (消息类型, 模板名) 查找渲染器，同名模板可以分别注册短信和邮件版本。
/// 同一消息类型下注册同名模板会覆盖旧的渲染器。
#[derive(Default, Clone)]
pub struct TemplateRegistry {
    renderers: HashMap<MessageType, HashMap<String, Arc<dyn Renderer>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建包含内置模板的注册表
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(Arc::new(TemplateRenderer::sms(
            "booking_checkin_reminder",
            "Hi {{guest_name}}, check-in for {{property_name}} opens at {{checkin_time}}. Reply STOP to opt out.",
        )));
        registry.register(Arc::new(TemplateRenderer::sms(
            "verification_code",
            "Your verification code is {{code}}. It expires in 10 minutes.",
        )));
        registry.register(Arc::new(TemplateRenderer::email(
            "booking_confirmation",
            "Your stay at {{property_name}} is confirmed",
            "Hi {{guest_name}},\n\nYour stay at {{property_name}} from {{checkin_date}} to {{checkout_date}} is confirmed.\n\nConfirmation code: {{confirmation_code}}",
        )));
        registry.register(Arc::new(TemplateRenderer::email(
            "password_reset",
            "Reset your password",
            "Hi {{name}},\n\nUse the link below to reset your password. It expires in 30 minutes.\n\n{{reset_url}}",
        )));

        registry
    }

    pub fn register(&mut self, renderer: Arc<dyn Renderer>) -> &mut Self {
        self.renderers
            .entry(renderer.message_type())
            .or_default()
            .insert(renderer.template_name().to_string(), renderer);
        self
    }

    /// 查找适用于指定消息类型的渲染器
    ///
    /// 模板只注册在其他消息类型下时返回 None。
    pub fn resolve(&self, message_type: MessageType, template: &str) -> Option<Arc<dyn Renderer>> {
        self.renderers.get(&message_type)?.get(template).cloned()
    }

    /// 指定消息类型下已注册的模板名，按字典序
    pub fn template_names(&self, message_type: MessageType) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .renderers
            .get(&message_type)
            .map(|by_name| by_name.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.renderers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
