//! Provider 抽象
//!
//! 所有后端实现 Provider：ask（纯文本调用）；支持工具调用的后端额外通过 tool_adapter()
//! 暴露多轮结构化协议（ToolCallAdapter）。不支持工具的后端返回 None。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::{ChatMessage, ToolCallRequest};
use crate::memory::MemoryContext;
use crate::tools::{ToolCallPolicy, ToolDeclaration};

/// provider 报告的非致命诊断（如限流详情）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDiagnostic {
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ProviderDiagnostic {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }
}

/// provider 调用错误
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timeout")]
    Timeout,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// 可作为 provider_error 事件上报的诊断
    pub fn diagnostic(&self) -> Option<ProviderDiagnostic> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(ProviderDiagnostic {
                category: "rate_limited".to_string(),
                message: self.to_string(),
                status: Some(429),
                retry_after_ms: Some(*retry_after_ms),
            }),
            ProviderError::Api { status, message } => Some(ProviderDiagnostic {
                category: "api_error".to_string(),
                message: message.clone(),
                status: Some(*status),
                retry_after_ms: None,
            }),
            ProviderError::Timeout => Some(ProviderDiagnostic::new("timeout", self.to_string())),
            _ => None,
        }
    }
}

/// provider 能力
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// 接受显式种子；为 false 时 AskRequest.seed 恒为 None
    pub supports_seed: bool,
}

/// 纯文本调用请求
#[derive(Debug, Clone, Copy)]
pub struct AskRequest<'a> {
    pub model: &'a str,
    pub system_prompt: Option<&'a str>,
    pub user_input: &'a str,
    pub tools: &'a [String],
    pub memory: &'a MemoryContext,
    pub tool_results: &'a [Value],
    pub seed: Option<u64>,
}

/// 纯文本调用响应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub output: Value,
    pub diagnostics: Vec<ProviderDiagnostic>,
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: Value::String(text.into()),
            diagnostics: Vec::new(),
        }
    }
}

/// 工具调用协议中的一轮 assistant 回复
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub diagnostics: Vec<ProviderDiagnostic>,
}

impl AssistantTurn {
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_calls: vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
            ..Self::default()
        }
    }
}

/// 多轮结构化工具调用协议
#[async_trait]
pub trait ToolCallAdapter: Send + Sync {
    async fn next_turn(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDeclaration],
        policy: &ToolCallPolicy,
    ) -> Result<AssistantTurn, ProviderError>;
}

/// 模型后端
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn ask(&self, request: AskRequest<'_>) -> Result<ProviderResponse, ProviderError>;

    /// 工具调用适配器；不支持工具时为 None
    fn tool_adapter(&self) -> Option<Arc<dyn ToolCallAdapter>> {
        None
    }
}
