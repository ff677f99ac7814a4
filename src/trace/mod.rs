//! 追踪层：规范事件、AITrace、运行 trace 列表与步骤账本、可解释性日志

pub mod events;
pub mod explain;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use events::{check_call_pairing, summarize_payload, summarize_text, CanonicalEvent, EventMeta};
pub use explain::{ExplainEntry, ExplainEventType};

/// 工具循环中的子事件（tool_calls / tool_results 由此筛出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    Call {
        tool_call_id: String,
        name: String,
        arguments: Value,
    },
    Result {
        tool_call_id: String,
        name: String,
        ok: bool,
        result: Value,
    },
}

impl ToolEvent {
    pub fn is_call(&self) -> bool {
        matches!(self, ToolEvent::Call { .. })
    }

    pub fn is_result(&self) -> bool {
        matches!(self, ToolEvent::Result { .. })
    }
}

/// AITrace 上的错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceError {
    pub error_type: String,
    pub message: String,
}

/// 一次 agent / AI 调用的完整审计记录，构造后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiTrace {
    pub ai_name: String,
    pub ai_profile_name: String,
    pub agent_name: Option<String>,
    pub agent_id: Option<String>,
    pub role: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub input: String,
    pub input_structured: Option<Value>,
    pub input_format: String,
    pub output: String,
    /// 已脱敏的记忆快照
    pub memory: Value,
    pub tool_calls: Vec<ToolEvent>,
    pub tool_results: Vec<ToolEvent>,
    pub canonical_events: Vec<CanonicalEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
}

impl AiTrace {
    /// 从 tool_events 中拆出 tool_calls 与 tool_results
    pub fn split_tool_events(tool_events: &[ToolEvent]) -> (Vec<ToolEvent>, Vec<ToolEvent>) {
        let calls = tool_events.iter().filter(|e| e.is_call()).cloned().collect();
        let results = tool_events.iter().filter(|e| e.is_result()).cloned().collect();
        (calls, results)
    }

    /// 事件中的实际模型（started 事件优先），否则回落到 profile 声明
    pub fn model_from_events(events: &[CanonicalEvent], fallback: &str) -> String {
        events
            .iter()
            .find_map(|e| e.started_model())
            .unwrap_or(fallback)
            .to_string()
    }
}

/// 步骤结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
}

/// agent 私有记忆事实摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFacts {
    pub keys: Vec<String>,
    pub total: usize,
    pub last_updated_step: Option<u64>,
}

/// flow 运行的 trace 列表条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceRecord {
    AgentStepStart {
        agent_name: String,
        agent_id: Option<String>,
        ai_name: Option<String>,
        role: Option<String>,
        step_id: u64,
        reason: String,
    },
    AgentStepEnd {
        agent_name: String,
        agent_id: Option<String>,
        ai_name: Option<String>,
        role: Option<String>,
        step_id: u64,
        reason: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_facts: Option<MemoryFacts>,
    },
    AiTrace(Box<AiTrace>),
    AgentMergeSummary {
        policy: String,
        selected_agents: Vec<String>,
        rejected_agents: Vec<String>,
        lines: Vec<String>,
    },
    AgentMergeSelected {
        agent_name: String,
        lines: Vec<String>,
    },
    AgentMergeRejected {
        agent_name: String,
        lines: Vec<String>,
    },
    ParallelAgents {
        target: Option<String>,
        agents: Vec<AiTrace>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge_policy: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge_selected: Option<Vec<String>>,
    },
}

impl TraceRecord {
    /// 重新编号引用的步骤 id（合并并行分支时使用）
    pub fn remap_step_id(&mut self, map: impl Fn(u64) -> u64) {
        if let TraceRecord::AgentStepStart { step_id, .. } | TraceRecord::AgentStepEnd { step_id, .. } =
            self
        {
            *step_id = map(*step_id);
        }
        if let TraceRecord::AgentStepEnd {
            memory_facts: Some(facts),
            ..
        } = self
        {
            facts.last_updated_step = facts.last_updated_step.map(&map);
        }
    }
}

/// 步骤账本中的步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AgentStepStart,
    AgentStepEnd,
    AiCall,
}

/// 调用位置（源程序中的行列）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CallSite {
    pub fn at(line: u32, column: u32) -> Self {
        Self {
            line: Some(line),
            column: Some(column),
        }
    }
}

/// 步骤账本记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: u64,
    pub kind: StepKind,
    pub what: String,
    pub because: Option<String>,
    pub data: Value,
    #[serde(flatten)]
    pub site: CallSite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_tool_events() {
        let events = vec![
            ToolEvent::Call {
                tool_call_id: "t1".into(),
                name: "lookup".into(),
                arguments: serde_json::json!({"id": 42}),
            },
            ToolEvent::Result {
                tool_call_id: "t1".into(),
                name: "lookup".into(),
                ok: true,
                result: serde_json::json!({"status": "open"}),
            },
        ];
        let (calls, results) = AiTrace::split_tool_events(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_remap_step_ids() {
        let mut record = TraceRecord::AgentStepEnd {
            agent_name: "a".into(),
            agent_id: None,
            ai_name: None,
            role: None,
            step_id: 2,
            reason: "r".into(),
            status: StepStatus::Ok,
            error_message: None,
            memory_facts: Some(MemoryFacts {
                keys: vec![],
                total: 0,
                last_updated_step: Some(2),
            }),
        };
        record.remap_step_id(|id| id + 10);
        match record {
            TraceRecord::AgentStepEnd {
                step_id,
                memory_facts,
                ..
            } => {
                assert_eq!(step_id, 12);
                assert_eq!(memory_facts.unwrap().last_updated_step, Some(12));
            }
            _ => panic!("Expected AgentStepEnd"),
        }
    }

    #[test]
    fn test_trace_record_tag() {
        let record = TraceRecord::AgentMergeSelected {
            agent_name: "a".into(),
            lines: vec!["ok".into()],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "agent_merge_selected");
    }
}
