//! 并行 agent 结果合并
//!
//! 合并是纯函数：候选列表（按声明顺序）+ 策略 → 选中下标与合并输出。
//! 策略：first_ok / all_ok / collect / prefer（按 precedence）/ strict（输出必须一致），可附加 reducer。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::error::{Result, RuntimeError};
use crate::trace::TraceRecord;

/// 一个并行条目的输出
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub agent_name: String,
    pub output: Value,
}

impl MergeCandidate {
    pub fn new(agent_name: impl Into<String>, output: Value) -> Self {
        Self {
            agent_name: agent_name.into(),
            output,
        }
    }

    /// 非空输出：非 null，字符串或 text 字段去空白后非空，对象 / 数组非空
    pub fn is_ok(&self) -> bool {
        match &self.output {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Object(map) => match map.get("text") {
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Null) => false,
                Some(_) => true,
                None => !map.is_empty(),
            },
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }

    fn text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("text") {
                Some(Value::String(s)) => s.clone(),
                _ => self.output.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// 选择规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRule {
    FirstOk,
    AllOk,
    Collect,
    Prefer(Vec<String>),
    Strict,
}

impl MergeRule {
    pub fn name(&self) -> &'static str {
        match self {
            MergeRule::FirstOk => "first_ok",
            MergeRule::AllOk => "all_ok",
            MergeRule::Collect => "collect",
            MergeRule::Prefer(_) => "prefer",
            MergeRule::Strict => "strict",
        }
    }
}

/// 自定义归约函数
pub type ReduceFn = Arc<dyn Fn(&[MergeCandidate]) -> Value + Send + Sync>;

/// 对选中候选的归约
#[derive(Clone)]
pub enum MergeReducer {
    /// 拼接各输出的 text，结果为 {"text": …}
    Concat { separator: String },
    Custom(ReduceFn),
}

impl fmt::Debug for MergeReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeReducer::Concat { separator } => {
                f.debug_struct("Concat").field("separator", separator).finish()
            }
            MergeReducer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl MergeReducer {
    fn reduce(&self, selected: &[MergeCandidate]) -> Value {
        match self {
            MergeReducer::Concat { separator } => {
                let joined = selected
                    .iter()
                    .map(MergeCandidate::text)
                    .collect::<Vec<_>>()
                    .join(separator);
                json!({ "text": joined })
            }
            MergeReducer::Custom(f) => f(selected),
        }
    }
}

/// 声明的合并策略
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub rule: MergeRule,
    pub reducer: Option<MergeReducer>,
}

impl MergePolicy {
    pub fn new(rule: MergeRule) -> Self {
        Self { rule, reducer: None }
    }

    /// 从声明解析：policy 名 + 可选 precedence
    ///
    /// precedence 仅允许与 prefer 同用；prefer 必须给出非空、无重复的 precedence。
    pub fn parse(policy: &str, precedence: Option<Vec<String>>) -> Result<Self> {
        let name = policy.trim().to_lowercase();
        if name != "prefer" && precedence.is_some() {
            return Err(RuntimeError::MergePolicy(
                "precedence is only allowed with policy 'prefer'".to_string(),
            ));
        }
        let rule = match name.as_str() {
            "first_ok" => MergeRule::FirstOk,
            "all_ok" => MergeRule::AllOk,
            "collect" => MergeRule::Collect,
            "strict" => MergeRule::Strict,
            "prefer" => {
                let order = precedence.unwrap_or_default();
                if order.is_empty() {
                    return Err(RuntimeError::MergePolicy(
                        "policy 'prefer' requires a precedence list".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for entry in &order {
                    if !seen.insert(entry.as_str()) {
                        return Err(RuntimeError::MergePolicy(format!(
                            "duplicate precedence entry '{}'",
                            entry
                        )));
                    }
                }
                MergeRule::Prefer(order)
            }
            other => {
                return Err(RuntimeError::MergePolicy(format!(
                    "unknown merge policy '{}'",
                    other
                )))
            }
        };
        Ok(Self::new(rule))
    }

    pub fn with_reducer(mut self, reducer: MergeReducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn name(&self) -> &'static str {
        self.rule.name()
    }

    /// precedence 中的每一项都必须对应某个并行条目
    pub fn validate_entries(&self, entry_names: &[&str]) -> Result<()> {
        if let MergeRule::Prefer(order) = &self.rule {
            for name in order {
                if !entry_names.contains(&name.as_str()) {
                    return Err(RuntimeError::MergePolicy(format!(
                        "precedence entry '{}' does not match any agent in the block",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// 合并结果
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// 选中的候选下标（升序）
    pub selected: Vec<usize>,
    pub output: Value,
    /// 每个候选的解释行（与候选同序）
    pub lines: Vec<Vec<String>>,
}

fn outputs(candidates: &[MergeCandidate], indices: &[usize]) -> Value {
    Value::Array(indices.iter().map(|&i| candidates[i].output.clone()).collect())
}

pub fn merge_agent_candidates(candidates: &[MergeCandidate], policy: &MergePolicy) -> Result<MergeOutcome> {
    let name = policy.name();
    let empty_line = |c: &MergeCandidate| {
        if c.is_ok() {
            None
        } else {
            Some("output was empty".to_string())
        }
    };
    let mut lines: Vec<Vec<String>> = vec![Vec::new(); candidates.len()];

    let (selected, output) = match &policy.rule {
        MergeRule::FirstOk => {
            let idx = candidates
                .iter()
                .position(MergeCandidate::is_ok)
                .ok_or_else(|| RuntimeError::MergePolicy("first_ok: no agent produced output".to_string()))?;
            for (i, c) in candidates.iter().enumerate() {
                lines[i].push(match (i.cmp(&idx), empty_line(c)) {
                    (std::cmp::Ordering::Equal, _) => "first non-empty output".to_string(),
                    (_, Some(line)) => line,
                    (_, None) => "an earlier agent was selected".to_string(),
                });
            }
            (vec![idx], candidates[idx].output.clone())
        }
        MergeRule::AllOk => {
            if let Some(bad) = candidates.iter().find(|c| !c.is_ok()) {
                return Err(RuntimeError::MergePolicy(format!(
                    "all_ok: agent '{}' produced empty output",
                    bad.agent_name
                )));
            }
            let all: Vec<usize> = (0..candidates.len()).collect();
            for line in lines.iter_mut() {
                line.push("output was non-empty".to_string());
            }
            let out = outputs(candidates, &all);
            (all, out)
        }
        MergeRule::Collect => {
            let ok: Vec<usize> = (0..candidates.len()).filter(|&i| candidates[i].is_ok()).collect();
            for (i, c) in candidates.iter().enumerate() {
                lines[i].push(empty_line(c).unwrap_or_else(|| "collected".to_string()));
            }
            let out = outputs(candidates, &ok);
            (ok, out)
        }
        MergeRule::Prefer(order) => {
            let idx = order
                .iter()
                .find_map(|want| {
                    candidates
                        .iter()
                        .position(|c| &c.agent_name == want && c.is_ok())
                })
                .ok_or_else(|| RuntimeError::MergePolicy("prefer: no preferred agent produced output".to_string()))?;
            let rank = |agent: &str| order.iter().position(|o| o == agent);
            for (i, c) in candidates.iter().enumerate() {
                let line = if i == idx {
                    format!("highest precedence with output (rank {})", rank(&c.agent_name).map_or(0, |r| r + 1))
                } else if let Some(line) = empty_line(c) {
                    line
                } else if rank(&c.agent_name).is_none() {
                    "not listed in precedence".to_string()
                } else {
                    "lower precedence".to_string()
                };
                lines[i].push(line);
            }
            (vec![idx], candidates[idx].output.clone())
        }
        MergeRule::Strict => {
            let first = candidates
                .first()
                .ok_or_else(|| RuntimeError::MergePolicy("strict: no candidates".to_string()))?;
            if let Some(bad) = candidates.iter().find(|c| !c.is_ok()) {
                return Err(RuntimeError::MergePolicy(format!(
                    "strict: agent '{}' produced empty output",
                    bad.agent_name
                )));
            }
            if let Some(diff) = candidates.iter().find(|c| c.output != first.output) {
                return Err(RuntimeError::MergePolicy(format!(
                    "strict: agent '{}' disagrees with '{}'",
                    diff.agent_name, first.agent_name
                )));
            }
            for line in lines.iter_mut() {
                line.push("outputs agree".to_string());
            }
            ((0..candidates.len()).collect(), first.output.clone())
        }
    };

    let output = match &policy.reducer {
        Some(reducer) => {
            let chosen: Vec<MergeCandidate> = selected.iter().map(|&i| candidates[i].clone()).collect();
            reducer.reduce(&chosen)
        }
        None => output,
    };
    tracing::debug!(policy = name, selected = ?selected, "merge finished");
    Ok(MergeOutcome {
        selected,
        output,
        lines,
    })
}

/// 合并的 trace 记录：summary + 每个候选一条 selected / rejected
pub fn build_merge_trace_events(
    candidates: &[MergeCandidate],
    outcome: &MergeOutcome,
    policy: &MergePolicy,
) -> Vec<TraceRecord> {
    let selected_agents: Vec<String> = outcome
        .selected
        .iter()
        .map(|&i| candidates[i].agent_name.clone())
        .collect();
    let rejected_agents: Vec<String> = (0..candidates.len())
        .filter(|i| !outcome.selected.contains(i))
        .map(|i| candidates[i].agent_name.clone())
        .collect();
    let mut summary_lines = vec![format!("policy {}", policy.name())];
    if !selected_agents.is_empty() {
        summary_lines.push(format!("selected: {}", selected_agents.join(", ")));
    }
    if !rejected_agents.is_empty() {
        summary_lines.push(format!("rejected: {}", rejected_agents.join(", ")));
    }
    if policy.reducer.is_some() {
        summary_lines.push("reducer applied to selected outputs".to_string());
    }

    let mut records = vec![TraceRecord::AgentMergeSummary {
        policy: policy.name().to_string(),
        selected_agents,
        rejected_agents,
        lines: summary_lines,
    }];
    for (i, candidate) in candidates.iter().enumerate() {
        let lines = outcome.lines.get(i).cloned().unwrap_or_default();
        records.push(if outcome.selected.contains(&i) {
            TraceRecord::AgentMergeSelected {
                agent_name: candidate.agent_name.clone(),
                lines,
            }
        } else {
            TraceRecord::AgentMergeRejected {
                agent_name: candidate.agent_name.clone(),
                lines,
            }
        });
    }
    records
}
