//! 执行上下文：一次 flow 运行的可变状态
//!
//! 变量绑定、身份、trace 列表、步骤账本、agent 调用计数、tool_call_source 标记与取消令牌。
//! 同一时刻只由一条调用路径持有 `&mut`；并行块通过 branch / absorb 在各自的分支上下文中执行后按声明顺序合并。

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::builder::Runtime;
use crate::core::error::{Result, RuntimeError};
use crate::tools::{ToolCallContext, ToolCallSource};
use crate::trace::{CallSite, ExplainEntry, StepKind, StepRecord, TraceRecord};

/// 单次 flow 运行内 agent 调用上限
pub const AGENT_CALL_LIMIT: usize = 5;
/// 并行块条目上限
pub const PARALLEL_AGENT_LIMIT: usize = 3;

/// 调用点的隔离策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// 允许调用 agent
    #[default]
    Open,
    /// 禁止调用 agent（如沙箱化的工具执行）
    NoAgentCalls,
}

pub struct ExecutionContext {
    runtime: Arc<Runtime>,
    pub flow_name: Option<String>,
    /// 触发本次运行的用户动作
    pub action_id: Option<String>,
    pub state: Value,
    pub identity: Value,
    pub locals: HashMap<String, Value>,
    pub last_value: Option<Value>,
    /// 运行 trace 列表（只追加）
    pub traces: Vec<TraceRecord>,
    /// 步骤账本（只追加）
    pub steps: Vec<StepRecord>,
    pub explain: Vec<ExplainEntry>,
    pub last_ai_provider: Option<String>,
    next_step_id: u64,
    agent_call_count: usize,
    tool_call_source: ToolCallSource,
    isolation: Isolation,
    active_agent: Option<String>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            flow_name: None,
            action_id: None,
            state: Value::Object(Default::default()),
            identity: Value::Null,
            locals: HashMap::new(),
            last_value: None,
            traces: Vec::new(),
            steps: Vec::new(),
            explain: Vec::new(),
            last_ai_provider: None,
            next_step_id: 1,
            agent_call_count: 0,
            tool_call_source: ToolCallSource::User,
            isolation: Isolation::Open,
            active_agent: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_flow(mut self, name: impl Into<String>) -> Self {
        self.flow_name = Some(name.into());
        self
    }

    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_identity(mut self, identity: Value) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// 绑定局部变量
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn agent_call_count(&self) -> usize {
        self.agent_call_count
    }

    pub fn tool_call_source(&self) -> ToolCallSource {
        self.tool_call_source
    }

    pub fn active_agent(&self) -> Option<&str> {
        self.active_agent.as_deref()
    }

    /// 触发原因：用户动作优先，其次 flow 名
    pub fn step_reason(&self) -> String {
        if let Some(action) = self.action_id.as_deref().filter(|a| !a.is_empty()) {
            return format!("invoked by user action {}", action);
        }
        if let Some(flow) = self.flow_name.as_deref().filter(|f| !f.is_empty()) {
            return format!("invoked by flow {}", flow);
        }
        "invoked by user action".to_string()
    }

    /// 追加一条步骤记录，返回其 id（单调递增）
    pub fn record_step(
        &mut self,
        kind: StepKind,
        what: impl Into<String>,
        because: Option<String>,
        data: Value,
        site: CallSite,
    ) -> u64 {
        let id = self.next_step_id;
        self.next_step_id += 1;
        self.steps.push(StepRecord {
            id,
            kind,
            what: what.into(),
            because,
            data,
            site,
        });
        id
    }

    /// 调用 agent 前的护栏：隔离检查、计数递增、上限检查
    pub(crate) fn admit_agent_call(&mut self, agent_name: &str) -> Result<()> {
        if self.isolation == Isolation::NoAgentCalls {
            return Err(RuntimeError::AgentCallNotAllowed {
                agent: agent_name.to_string(),
                reason: "agent calls are disabled in this context".to_string(),
            });
        }
        if let Some(active) = self.active_agent.as_deref() {
            return Err(RuntimeError::AgentCallNotAllowed {
                agent: agent_name.to_string(),
                reason: format!("nested call from agent '{}'", active),
            });
        }
        if self.tool_call_source == ToolCallSource::Ai {
            return Err(RuntimeError::AgentCallNotAllowed {
                agent: agent_name.to_string(),
                reason: "agents cannot be called from ai-initiated tool calls".to_string(),
            });
        }
        self.agent_call_count += 1;
        if self.agent_call_count > AGENT_CALL_LIMIT {
            return Err(RuntimeError::AgentCallLimitExceeded {
                limit: AGENT_CALL_LIMIT,
            });
        }
        Ok(())
    }

    /// 标记当前正在执行的 agent，返回先前的值
    pub(crate) fn enter_agent(&mut self, agent_name: &str) -> Option<String> {
        self.active_agent.replace(agent_name.to_string())
    }

    pub(crate) fn exit_agent(&mut self, previous: Option<String>) {
        self.active_agent = previous;
    }

    /// 在作用域内把 tool_call_source 设为 ai，离开作用域（含错误路径）时恢复
    pub fn tool_source_scope(&mut self, source: ToolCallSource) -> ToolSourceScope<'_> {
        let previous = self.tool_call_source;
        self.tool_call_source = source;
        ToolSourceScope {
            ctx: self,
            previous,
        }
    }

    /// 传给工具执行器的显式上下文
    pub fn tool_call_context(&self, agent: Option<&str>) -> ToolCallContext {
        ToolCallContext {
            source: self.tool_call_source,
            flow: self.flow_name.clone(),
            agent: agent.map(str::to_string),
            cancel: self.cancel.clone(),
        }
    }

    /// 并行块第 index 个条目的分支上下文
    ///
    /// 共享 runtime、绑定快照与身份；trace / 步骤 / 可解释性日志为空；
    /// agent_call_count 预置为父计数 + index，使上限判定与顺序执行一致；取消令牌为父令牌的子令牌。
    pub(crate) fn branch(&self, index: usize) -> ExecutionContext {
        ExecutionContext {
            runtime: self.runtime.clone(),
            flow_name: self.flow_name.clone(),
            action_id: self.action_id.clone(),
            state: self.state.clone(),
            identity: self.identity.clone(),
            locals: self.locals.clone(),
            last_value: self.last_value.clone(),
            traces: Vec::new(),
            steps: Vec::new(),
            explain: Vec::new(),
            last_ai_provider: None,
            next_step_id: 1,
            agent_call_count: self.agent_call_count + index,
            tool_call_source: self.tool_call_source,
            isolation: self.isolation,
            active_agent: self.active_agent.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// 合并分支：步骤重新编号后追加，trace 与可解释性日志按原顺序追加，计数累加
    pub(crate) fn absorb(&mut self, branch: ExecutionContext, base_call_count: usize) {
        let offset = self.next_step_id - 1;
        let step_count = branch.steps.len() as u64;
        for mut step in branch.steps {
            step.id += offset;
            self.steps.push(step);
        }
        self.next_step_id += step_count;
        for mut record in branch.traces {
            record.remap_step_id(|id| id + offset);
            self.traces.push(record);
        }
        self.explain.extend(branch.explain);
        let executed = branch.agent_call_count.saturating_sub(base_call_count);
        self.agent_call_count += executed;
        if branch.last_ai_provider.is_some() {
            self.last_ai_provider = branch.last_ai_provider;
        }
    }
}

/// tool_call_source 作用域守卫：Drop 时恢复先前的值
pub struct ToolSourceScope<'a> {
    ctx: &'a mut ExecutionContext,
    previous: ToolCallSource,
}

impl Deref for ToolSourceScope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ToolSourceScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ToolSourceScope<'_> {
    fn drop(&mut self) {
        self.ctx.tool_call_source = self.previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::RuntimeBuilder;
    use crate::core::program::Program;
    use crate::trace::{StepStatus, TraceRecord};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(RuntimeBuilder::new(Program::new()).build())
    }

    #[test]
    fn test_step_reason_precedence() {
        assert_eq!(ctx().step_reason(), "invoked by user action");
        assert_eq!(ctx().with_flow("support").step_reason(), "invoked by flow support");
        assert_eq!(
            ctx().with_flow("support").with_action("btn-1").step_reason(),
            "invoked by user action btn-1"
        );
    }

    #[test]
    fn test_call_limit_fails_closed() {
        let mut ctx = ctx();
        for _ in 0..AGENT_CALL_LIMIT {
            ctx.admit_agent_call("a").unwrap();
        }
        let err = ctx.admit_agent_call("a").unwrap_err();
        assert_eq!(err.class_name(), "AgentCallLimitExceeded");
    }

    #[test]
    fn test_nested_and_isolated_calls_rejected() {
        let mut ctx = ctx();
        let prev = ctx.enter_agent("outer");
        let err = ctx.admit_agent_call("inner").unwrap_err();
        assert_eq!(err.class_name(), "AgentCallNotAllowed");
        ctx.exit_agent(prev);
        assert!(ctx.admit_agent_call("inner").is_ok());

        let mut isolated = self::ctx().with_isolation(Isolation::NoAgentCalls);
        assert!(isolated.admit_agent_call("a").is_err());
        assert_eq!(isolated.agent_call_count(), 0);
    }

    #[test]
    fn test_tool_source_scope_restores_on_drop() {
        let mut ctx = ctx();
        {
            let scoped = ctx.tool_source_scope(ToolCallSource::Ai);
            assert_eq!(scoped.tool_call_source(), ToolCallSource::Ai);
            assert_eq!(scoped.tool_call_context(None).source, ToolCallSource::Ai);
        }
        assert_eq!(ctx.tool_call_source(), ToolCallSource::User);
    }

    #[test]
    fn test_absorb_renumbers_steps() {
        let mut parent = ctx();
        parent.record_step(StepKind::AiCall, "before", None, Value::Null, CallSite::default());

        let mut branch = parent.branch(0);
        let id = branch.record_step(StepKind::AgentStepEnd, "agent a completed", None, Value::Null, CallSite::default());
        branch.traces.push(TraceRecord::AgentStepEnd {
            agent_name: "a".into(),
            agent_id: None,
            ai_name: None,
            role: None,
            step_id: id,
            reason: "r".into(),
            status: StepStatus::Ok,
            error_message: None,
            memory_facts: None,
        });
        branch.admit_agent_call("a").unwrap();

        parent.absorb(branch, 0);
        assert_eq!(parent.steps.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(parent.traces[0], TraceRecord::AgentStepEnd { step_id: 2, .. }));
        assert_eq!(parent.agent_call_count(), 1);
        let next = parent.record_step(StepKind::AiCall, "after", None, Value::Null, CallSite::default());
        assert_eq!(next, 3);
    }

    #[test]
    fn test_branch_presets_call_count() {
        let parent = ctx();
        let mut third = parent.branch(2);
        assert_eq!(third.agent_call_count(), 2);
        third.admit_agent_call("c").unwrap();
        assert_eq!(third.agent_call_count(), 3);
    }
}
