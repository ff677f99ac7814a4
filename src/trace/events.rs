//! 规范事件（CanonicalEvent）：一次 AI 调用的有序、可回放记录
//!
//! 同一 call_id 下：恰好一个 started、零或多个 provider_error、恰好一个终止事件（completed / failed）。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ProviderDiagnostic;

/// 事件格式版本
pub const TRACE_VERSION: &str = "2024-10-01";
/// 事件摘要最大字符数
const SUMMARY_CHARS: usize = 200;

/// 调用级事件公共字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub trace_version: String,
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub call_id: String,
}

impl EventMeta {
    pub fn new(call_id: &str, provider: &str, model: &str) -> Self {
        Self {
            trace_version: TRACE_VERSION.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            provider: provider.to_string(),
            model: model.to_string(),
            call_id: call_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    AiCallStarted {
        #[serde(flatten)]
        meta: EventMeta,
        input_summary: String,
        tools_declared_count: usize,
        memory_enabled: bool,
    },
    AiCallCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        output_text: String,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
        duration_ms: u64,
    },
    AiCallFailed {
        #[serde(flatten)]
        meta: EventMeta,
        error_type: String,
        error_message: String,
        duration_ms: u64,
    },
    AiProviderError {
        #[serde(flatten)]
        meta: EventMeta,
        diagnostic: ProviderDiagnostic,
    },
    ToolCallRequested {
        #[serde(flatten)]
        meta: EventMeta,
        tool_call_id: String,
        tool_name: String,
        arguments_summary: String,
    },
    ToolCallCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        tool_call_id: String,
        tool_name: String,
        result_summary: String,
        duration_ms: u64,
    },
    ToolCallFailed {
        #[serde(flatten)]
        meta: EventMeta,
        tool_call_id: String,
        tool_name: String,
        error_type: String,
        error_message: String,
        duration_ms: u64,
    },
    MemoryRecall {
        call_id: String,
        timestamp: String,
        ai_profile: String,
        session: String,
        query: String,
        recalled: Vec<Value>,
        policy: Value,
        deterministic_hash: String,
        spaces_consulted: Vec<String>,
    },
    MemoryWrite {
        call_id: String,
        timestamp: String,
        ai_profile: String,
        session: String,
        written: Vec<Value>,
        reason: String,
    },
    /// 记忆协作方返回的审计事件，原样携带
    MemoryAudit { call_id: String, payload: Value },
}

impl CanonicalEvent {
    pub fn started(
        call_id: &str,
        provider: &str,
        model: &str,
        input_text: &str,
        tools_declared_count: usize,
        memory_enabled: bool,
    ) -> Self {
        CanonicalEvent::AiCallStarted {
            meta: EventMeta::new(call_id, provider, model),
            input_summary: summarize_text(input_text),
            tools_declared_count,
            memory_enabled,
        }
    }

    pub fn completed(
        call_id: &str,
        provider: &str,
        model: &str,
        output_text: &str,
        duration_ms: u64,
    ) -> Self {
        CanonicalEvent::AiCallCompleted {
            meta: EventMeta::new(call_id, provider, model),
            output_text: output_text.to_string(),
            tokens_in: None,
            tokens_out: None,
            duration_ms,
        }
    }

    pub fn failed(
        call_id: &str,
        provider: &str,
        model: &str,
        error_type: &str,
        error_message: &str,
        duration_ms: u64,
    ) -> Self {
        CanonicalEvent::AiCallFailed {
            meta: EventMeta::new(call_id, provider, model),
            error_type: error_type.to_string(),
            error_message: summarize_text(error_message),
            duration_ms,
        }
    }

    pub fn provider_error(
        call_id: &str,
        provider: &str,
        model: &str,
        diagnostic: ProviderDiagnostic,
    ) -> Self {
        CanonicalEvent::AiProviderError {
            meta: EventMeta::new(call_id, provider, model),
            diagnostic,
        }
    }

    pub fn tool_requested(
        meta: EventMeta,
        tool_call_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Self {
        CanonicalEvent::ToolCallRequested {
            meta,
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments_summary: summarize_payload(arguments),
        }
    }

    pub fn tool_completed(
        meta: EventMeta,
        tool_call_id: &str,
        tool_name: &str,
        result: &Value,
        duration_ms: u64,
    ) -> Self {
        CanonicalEvent::ToolCallCompleted {
            meta,
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            result_summary: summarize_payload(result),
            duration_ms,
        }
    }

    pub fn tool_failed(
        meta: EventMeta,
        tool_call_id: &str,
        tool_name: &str,
        error_type: &str,
        error_message: &str,
        duration_ms: u64,
    ) -> Self {
        CanonicalEvent::ToolCallFailed {
            meta,
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            error_type: error_type.to_string(),
            error_message: summarize_text(error_message),
            duration_ms,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            CanonicalEvent::AiCallStarted { meta, .. }
            | CanonicalEvent::AiCallCompleted { meta, .. }
            | CanonicalEvent::AiCallFailed { meta, .. }
            | CanonicalEvent::AiProviderError { meta, .. }
            | CanonicalEvent::ToolCallRequested { meta, .. }
            | CanonicalEvent::ToolCallCompleted { meta, .. }
            | CanonicalEvent::ToolCallFailed { meta, .. } => &meta.call_id,
            CanonicalEvent::MemoryRecall { call_id, .. }
            | CanonicalEvent::MemoryWrite { call_id, .. }
            | CanonicalEvent::MemoryAudit { call_id, .. } => call_id,
        }
    }

    /// 事件类型名（与序列化后的 `type` 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalEvent::AiCallStarted { .. } => "ai_call_started",
            CanonicalEvent::AiCallCompleted { .. } => "ai_call_completed",
            CanonicalEvent::AiCallFailed { .. } => "ai_call_failed",
            CanonicalEvent::AiProviderError { .. } => "ai_provider_error",
            CanonicalEvent::ToolCallRequested { .. } => "tool_call_requested",
            CanonicalEvent::ToolCallCompleted { .. } => "tool_call_completed",
            CanonicalEvent::ToolCallFailed { .. } => "tool_call_failed",
            CanonicalEvent::MemoryRecall { .. } => "memory_recall",
            CanonicalEvent::MemoryWrite { .. } => "memory_write",
            CanonicalEvent::MemoryAudit { .. } => "memory_audit",
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, CanonicalEvent::AiCallStarted { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::AiCallCompleted { .. } | CanonicalEvent::AiCallFailed { .. }
        )
    }

    /// started 事件上记录的实际模型
    pub fn started_model(&self) -> Option<&str> {
        match self {
            CanonicalEvent::AiCallStarted { meta, .. } if !meta.model.trim().is_empty() => {
                Some(&meta.model)
            }
            _ => None,
        }
    }
}

/// 检查事件序列的配对：每个 started 之后恰有一个同 id 的终止事件
pub fn check_call_pairing(events: &[CanonicalEvent]) -> Result<(), String> {
    for (idx, event) in events.iter().enumerate() {
        if !event.is_started() {
            continue;
        }
        let id = event.call_id();
        let terminals_before = events[..idx]
            .iter()
            .filter(|e| e.is_terminal() && e.call_id() == id)
            .count();
        if terminals_before > 0 {
            return Err(format!("call {id}: terminal event precedes started"));
        }
        let terminals_after = events[idx + 1..]
            .iter()
            .filter(|e| e.is_terminal() && e.call_id() == id)
            .count();
        if terminals_after != 1 {
            return Err(format!("call {id}: expected 1 terminal event, found {terminals_after}"));
        }
    }
    Ok(())
}

/// 文本摘要：超过上限时截断并追加 "..."
pub fn summarize_text(text: &str) -> String {
    let preview: String = text.chars().take(SUMMARY_CHARS).collect();
    if text.chars().count() > SUMMARY_CHARS {
        format!("{}...", preview)
    } else {
        preview
    }
}

pub fn summarize_payload(value: &Value) -> String {
    match value {
        Value::String(s) => summarize_text(s),
        other => summarize_text(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_type_matches_kind() {
        let ev = CanonicalEvent::started("c1", "mock", "mock-1", "hi", 0, false);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
        assert_eq!(json["call_id"], "c1");
        assert_eq!(json["model"], "mock-1");
    }

    #[test]
    fn test_pairing_detects_missing_terminal() {
        let events = vec![CanonicalEvent::started("c1", "mock", "m", "x", 0, false)];
        assert!(check_call_pairing(&events).is_err());

        let events = vec![
            CanonicalEvent::started("c1", "mock", "m", "x", 0, false),
            CanonicalEvent::completed("c1", "mock", "m", "ok", 3),
        ];
        assert!(check_call_pairing(&events).is_ok());
    }

    #[test]
    fn test_pairing_rejects_double_terminal() {
        let events = vec![
            CanonicalEvent::started("c1", "mock", "m", "x", 0, false),
            CanonicalEvent::failed("c1", "mock", "m", "Cancelled", "Cancelled", 1),
            CanonicalEvent::completed("c1", "mock", "m", "ok", 3),
        ];
        assert!(check_call_pairing(&events).is_err());
    }

    #[test]
    fn test_summarize_text_truncates() {
        let long = "a".repeat(SUMMARY_CHARS + 10);
        let summary = summarize_text(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), SUMMARY_CHARS + 3);
        assert_eq!(summarize_text("short"), "short");
    }
}
