//! 结构化消息：工具调用循环中发给 provider 的消息列表

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// provider 请求的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// 参数；strict_json 下字符串形式会再解析为对象
    pub arguments: Value,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// assistant 发起工具调用的消息
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// 工具结果消息，content 为结果 JSON
    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, result: &Value) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, result.to_string())
        }
    }
}

/// 构建初始消息列表：可选 system + user
pub fn initial_messages(system_prompt: Option<&str>, user_input: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }
    messages.push(ChatMessage::user(user_input));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_messages_skip_empty_system() {
        let msgs = initial_messages(Some(""), "hi");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);

        let msgs = initial_messages(Some("be brief"), "hi");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
    }

    #[test]
    fn test_tool_result_message() {
        let msg = ChatMessage::tool_result("t1", "lookup", &serde_json::json!({"ok": true}));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(msg.content, r#"{"ok":true}"#);
    }
}
