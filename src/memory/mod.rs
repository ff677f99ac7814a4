//! 记忆协作方接口
//!
//! - **recall**：按 profile 与查询召回条目，附带审计事件与确定性召回哈希
//! - **record**：持久化一次交互（输入、输出、工具事件），返回写入条目与审计事件
//!
//! 记忆引擎内部（空间、信任、冲突消解）不在本 crate 范围内；KeywordMemory 为进程内参考实现。

pub mod long_term;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::RootPaths;
use crate::core::error::Result;
use crate::core::program::AiProfile;
use crate::trace::{summarize_text, MemoryFacts, ToolEvent};

pub use long_term::{KeywordMemory, NoopMemory};

/// 记忆空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySpace {
    ShortTerm,
    Semantic,
    Profile,
}

impl MemorySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySpace::ShortTerm => "short_term",
            MemorySpace::Semantic => "semantic",
            MemorySpace::Profile => "profile",
        }
    }
}

/// 单条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub space: MemorySpace,
    pub text: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl MemoryItem {
    pub fn new(id: impl Into<String>, space: MemorySpace, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            space,
            text: text.into(),
            meta: Value::Null,
        }
    }
}

/// 召回得到的记忆上下文（按空间分组，顺序即召回顺序）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub short_term: Vec<MemoryItem>,
    pub semantic: Vec<MemoryItem>,
    pub profile: Vec<MemoryItem>,
}

impl MemoryContext {
    pub fn push(&mut self, item: MemoryItem) {
        match item.space {
            MemorySpace::ShortTerm => self.short_term.push(item),
            MemorySpace::Semantic => self.semantic.push(item),
            MemorySpace::Profile => self.profile.push(item),
        }
    }

    /// 按 short_term → semantic → profile 顺序遍历
    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.short_term
            .iter()
            .chain(self.semantic.iter())
            .chain(self.profile.iter())
    }

    pub fn item_count(&self) -> usize {
        self.short_term.len() + self.semantic.len() + self.profile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }
}

/// recall 请求
#[derive(Debug, Clone, Copy)]
pub struct RecallRequest<'a> {
    pub profile: &'a AiProfile,
    pub query: &'a str,
    pub state: &'a Value,
    pub identity: &'a Value,
    pub roots: &'a RootPaths,
    pub agent_id: Option<&'a str>,
}

/// recall 结果
#[derive(Debug, Clone, Default)]
pub struct RecallPack {
    pub payload: MemoryContext,
    /// 协作方自身的审计事件
    pub events: Vec<Value>,
    pub spaces_consulted: Vec<String>,
    pub policy: Value,
    pub recall_hash: String,
}

/// record 请求
#[derive(Debug, Clone, Copy)]
pub struct RecordRequest<'a> {
    pub profile: &'a AiProfile,
    pub state: &'a Value,
    pub input_text: &'a str,
    pub output_text: &'a str,
    pub tool_events: &'a [ToolEvent],
    pub identity: &'a Value,
    pub roots: &'a RootPaths,
    pub agent_id: Option<&'a str>,
}

/// record 结果
#[derive(Debug, Clone, Default)]
pub struct RecordPack {
    pub written: Vec<MemoryItem>,
    pub events: Vec<Value>,
}

#[async_trait]
pub trait MemoryCollaborator: Send + Sync {
    async fn recall_with_events(&self, request: RecallRequest<'_>) -> Result<RecallPack>;

    async fn record_with_events(&self, request: RecordRequest<'_>) -> Result<RecordPack>;

    /// 会话标识：state.session_id → identity.id → "anonymous"
    fn session_id(&self, state: &Value, identity: &Value) -> String {
        state
            .get("session_id")
            .or_else(|| identity.get("id"))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// agent 私有事实摘要（last_updated_step 由调用方填充）
    fn agent_facts(&self, _agent_id: &str) -> MemoryFacts {
        MemoryFacts::default()
    }
}

/// 召回内容的确定性哈希：规范 JSON 的 sha256
pub fn recall_hash(context: &MemoryContext) -> String {
    let items: Vec<Value> = context
        .items()
        .map(|item| json!({"id": item.id, "space": item.space.as_str(), "text": item.text}))
        .collect();
    let canonical = Value::Array(items).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// 进入 trace 的记忆快照：文本截断，丢弃 meta
pub fn redact_memory_context(context: &MemoryContext) -> Value {
    let redact = |items: &[MemoryItem]| -> Vec<Value> {
        items
            .iter()
            .map(|item| json!({"id": item.id, "text": summarize_text(&item.text)}))
            .collect()
    };
    json!({
        "short_term": redact(&context.short_term),
        "semantic": redact(&context.semantic),
        "profile": redact(&context.profile),
    })
}

/// 写入条目的 trace 形式
pub fn redact_items(items: &[MemoryItem]) -> Vec<Value> {
    items
        .iter()
        .map(|item| json!({"id": item.id, "space": item.space.as_str(), "text": summarize_text(&item.text)}))
        .collect()
}
