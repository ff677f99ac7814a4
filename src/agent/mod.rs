//! Agent 执行引擎
//!
//! - **run_agent_call**：单个 agent 的完整生命周期（护栏 → 步骤开始 → 记忆召回 → AI 调用 → 记忆写入 → 步骤结束）
//! - **run_agents_parallel**：受限并行块（最多 3 个条目），可选合并策略
//! - **execute_***：语句级入口，把结果绑定到目标变量与 last_value

pub mod input;
pub mod merge;
pub mod parallel;

use chrono::Utc;
use serde_json::{json, Value};

use crate::core::error::{Result, RuntimeError};
use crate::core::program::{AgentProfile, AiProfile};
use crate::core::ExecutionContext;
use crate::memory::{
    recall_hash, redact_items, redact_memory_context, MemoryItem, RecallRequest, RecordRequest,
};
use crate::pipeline::{run_ai_with_tools, AiCallRequest};
use crate::trace::{
    summarize_text, AiTrace, CallSite, CanonicalEvent, StepKind, StepStatus, ToolEvent, TraceError, TraceRecord,
};

pub use input::{ensure_object, prepare_ai_input, InputExpr, InputMode, PreparedInput};
pub use merge::{
    build_merge_trace_events, merge_agent_candidates, MergeCandidate, MergeOutcome, MergePolicy, MergeReducer,
    MergeRule, ReduceFn,
};
pub use parallel::run_agents_parallel;

/// 一次 agent 调用（语句或并行块条目）
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub agent_name: String,
    pub input: InputExpr,
    pub mode: InputMode,
    pub site: CallSite,
}

impl AgentCall {
    pub fn new(agent_name: impl Into<String>, input: InputExpr) -> Self {
        Self {
            agent_name: agent_name.into(),
            input,
            mode: InputMode::Text,
            site: CallSite::default(),
        }
    }

    pub fn structured(mut self) -> Self {
        self.mode = InputMode::Structured;
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.site = CallSite::at(line, column);
        self
    }
}

/// 单次调用结果
#[derive(Debug, Clone)]
pub struct AgentCallOutcome {
    /// 统一为对象的输出
    pub output: Value,
    pub trace: AiTrace,
    pub memory_written: usize,
}

/// 运行单个 agent；AITrace 追加到 ctx.traces
pub async fn run_agent_call(ctx: &mut ExecutionContext, call: &AgentCall) -> Result<AgentCallOutcome> {
    run_agent_lifecycle(ctx, call, true).await.map_err(|failure| failure.error)
}

/// 语句 `run agent … as target`：结果绑定到 locals[target] 与 last_value
pub async fn execute_run_agent(ctx: &mut ExecutionContext, call: &AgentCall, target: &str) -> Result<Value> {
    guard_target(ctx, target)?;
    let outcome = run_agent_call(ctx, call).await?;
    ctx.locals.insert(target.to_string(), outcome.output.clone());
    ctx.last_value = Some(outcome.output.clone());
    Ok(outcome.output)
}

/// 语句 `run agents in parallel … as target`
pub async fn execute_run_agents_parallel(
    ctx: &mut ExecutionContext,
    entries: &[AgentCall],
    merge: Option<&MergePolicy>,
    target: &str,
) -> Result<Value> {
    guard_target(ctx, target)?;
    let value = parallel::run_block(ctx, entries, merge, Some(target)).await?;
    ctx.locals.insert(target.to_string(), value.clone());
    ctx.last_value = Some(value.clone());
    Ok(value)
}

fn guard_target(ctx: &ExecutionContext, target: &str) -> Result<()> {
    if ctx.runtime().program.constants.contains(target) {
        return Err(RuntimeError::ConstantAssignment(target.to_string()));
    }
    Ok(())
}

/// 生命周期失败：错误本身，以及 AI 调用已完成时带错误标记的 AITrace
pub(crate) struct LifecycleFailure {
    pub error: RuntimeError,
    pub trace: Option<AiTrace>,
}

impl From<RuntimeError> for LifecycleFailure {
    fn from(error: RuntimeError) -> Self {
        Self { error, trace: None }
    }
}

/// 生命周期主体；`flat_trace` 为 false 时 AITrace 只随结果返回（并行块放入包装记录）
///
/// 步骤开始先于任何护栏与解析写入，失败时总有对应的失败步骤结束。
pub(crate) async fn run_agent_lifecycle(
    ctx: &mut ExecutionContext,
    call: &AgentCall,
    flat_trace: bool,
) -> std::result::Result<AgentCallOutcome, LifecycleFailure> {
    let runtime = ctx.runtime().clone();
    let known = runtime.program.agents.get(&call.agent_name);
    let agent_name = known.map_or_else(|| call.agent_name.clone(), |a| a.name.clone());
    let agent_id = known.map(AgentProfile::resolved_id);
    let ai_name = known.map(|a| a.ai_name.clone());
    let role = known.and_then(|a| a.role.clone());
    let reason = ctx.step_reason();
    let data = json!({
        "agent_name": agent_name,
        "agent_id": agent_id,
        "role": role,
    });

    let start_step = ctx.record_step(
        StepKind::AgentStepStart,
        format!("agent {} started", agent_name),
        Some(reason.clone()),
        data.clone(),
        call.site,
    );
    ctx.traces.push(TraceRecord::AgentStepStart {
        agent_name: agent_name.clone(),
        agent_id: agent_id.clone(),
        ai_name: ai_name.clone(),
        role: role.clone(),
        step_id: start_step,
        reason: reason.clone(),
    });
    tracing::info!(agent = %agent_name, step = start_step, "agent started");

    let result = admit_and_invoke(ctx, call, &reason).await;

    match result {
        Ok(outcome) => {
            if flat_trace {
                ctx.traces.push(TraceRecord::AiTrace(Box::new(outcome.trace.clone())));
            }
            let end_step = ctx.record_step(
                StepKind::AgentStepEnd,
                format!("agent {} completed", agent_name),
                Some(reason.clone()),
                data,
                call.site,
            );
            let mut facts = runtime
                .memory
                .agent_facts(agent_id.as_deref().unwrap_or(agent_name.as_str()));
            if outcome.memory_written > 0 {
                facts.last_updated_step = Some(end_step);
            }
            ctx.traces.push(TraceRecord::AgentStepEnd {
                agent_name: agent_name.clone(),
                agent_id,
                ai_name,
                role,
                step_id: end_step,
                reason,
                status: StepStatus::Ok,
                error_message: None,
                memory_facts: Some(facts),
            });
            tracing::info!(agent = %agent_name, step = end_step, memory_written = outcome.memory_written, "agent completed");
            Ok(outcome)
        }
        Err(mut failure) => {
            if flat_trace {
                if let Some(trace) = failure.trace.take() {
                    ctx.traces.push(TraceRecord::AiTrace(Box::new(trace)));
                }
            }
            let end_step = ctx.record_step(
                StepKind::AgentStepEnd,
                format!("agent {} failed", agent_name),
                Some(reason.clone()),
                data,
                call.site,
            );
            ctx.traces.push(TraceRecord::AgentStepEnd {
                agent_name: agent_name.clone(),
                agent_id,
                ai_name,
                role,
                step_id: end_step,
                reason,
                status: StepStatus::Error,
                error_message: Some(failure.error.to_string()),
                memory_facts: None,
            });
            tracing::warn!(agent = %agent_name, step = end_step, error = %failure.error, "agent failed");
            Err(failure)
        }
    }
}

/// 护栏与解析（计数先于未知 agent 检查）→ 标记活动 agent → 执行
async fn admit_and_invoke(
    ctx: &mut ExecutionContext,
    call: &AgentCall,
    reason: &str,
) -> std::result::Result<AgentCallOutcome, LifecycleFailure> {
    let runtime = ctx.runtime().clone();
    ctx.admit_agent_call(&call.agent_name)?;
    let agent = runtime
        .program
        .agents
        .get(&call.agent_name)
        .ok_or_else(|| RuntimeError::UnknownAgent(call.agent_name.clone()))?;
    let ai = runtime
        .program
        .ai_profiles
        .get(&agent.ai_name)
        .ok_or_else(|| RuntimeError::UnknownAi {
            agent: agent.name.clone(),
            ai: agent.ai_name.clone(),
        })?;
    let profile = match &agent.system_prompt {
        Some(prompt) => ai.with_system_prompt(Some(prompt.clone())),
        None => ai.clone(),
    };
    let agent_id = agent.resolved_id();

    let previous = ctx.enter_agent(&agent.name);
    let result = invoke_agent(ctx, agent, &profile, &agent_id, call, reason).await;
    ctx.exit_agent(previous);
    result
}

/// 输入求值 → 召回 → AI 调用 → 写入 → 组装 AITrace
async fn invoke_agent(
    ctx: &mut ExecutionContext,
    agent: &AgentProfile,
    profile: &AiProfile,
    agent_id: &str,
    call: &AgentCall,
    reason: &str,
) -> std::result::Result<AgentCallOutcome, LifecycleFailure> {
    let runtime = ctx.runtime().clone();
    let value = call.input.evaluate(&ctx.state, &ctx.identity, &ctx.locals)?;
    let prepared = prepare_ai_input(value, call.mode)?;
    let roots = runtime.root_paths();
    let call_id = uuid::Uuid::new_v4().to_string();
    let session = runtime.memory.session_id(&ctx.state, &ctx.identity);

    let recall = runtime
        .memory
        .recall_with_events(RecallRequest {
            profile,
            query: &prepared.text,
            state: &ctx.state,
            identity: &ctx.identity,
            roots: &roots,
            agent_id: Some(agent_id),
        })
        .await?;
    let recalled: Vec<MemoryItem> = recall.payload.items().cloned().collect();
    let deterministic_hash = if recall.recall_hash.is_empty() {
        recall_hash(&recall.payload)
    } else {
        recall.recall_hash.clone()
    };
    let mut events = vec![CanonicalEvent::MemoryRecall {
        call_id: call_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        ai_profile: profile.name.clone(),
        session: session.clone(),
        query: summarize_text(&prepared.text),
        recalled: redact_items(&recalled),
        policy: recall.policy.clone(),
        deterministic_hash,
        spaces_consulted: recall.spaces_consulted.clone(),
    }];
    events.extend(recall.events.iter().map(|payload| CanonicalEvent::MemoryAudit {
        call_id: call_id.clone(),
        payload: payload.clone(),
    }));

    ctx.record_step(
        StepKind::AiCall,
        format!("asked ai {}", profile.name),
        Some(reason.to_string()),
        json!({
            "agent_name": agent.name,
            "ai_name": profile.name,
            "call_id": call_id,
        }),
        call.site,
    );

    let mut tool_events: Vec<ToolEvent> = Vec::new();
    let request = AiCallRequest {
        profile,
        user_input: &prepared.text,
        memory: &recall.payload,
        input_format: prepared.format,
        input_structured: prepared.structured.as_ref(),
        call_id: Some(call_id.as_str()),
        agent_name: Some(agent.name.as_str()),
        agent_id: Some(agent_id),
        role: agent.role.as_deref(),
    };
    let output = run_ai_with_tools(ctx, request, &mut events, &mut tool_events).await?;

    let recorded = runtime
        .memory
        .record_with_events(RecordRequest {
            profile,
            state: &ctx.state,
            input_text: &prepared.text,
            output_text: &output.text,
            tool_events: &tool_events,
            identity: &ctx.identity,
            roots: &roots,
            agent_id: Some(agent_id),
        })
        .await;

    let (tool_calls, tool_results) = AiTrace::split_tool_events(&tool_events);
    let mut trace = AiTrace {
        ai_name: profile.name.clone(),
        ai_profile_name: profile.name.clone(),
        agent_name: Some(agent.name.clone()),
        agent_id: Some(agent_id.to_string()),
        role: agent.role.clone(),
        model: AiTrace::model_from_events(&events, &profile.model),
        system_prompt: profile.system_prompt.clone(),
        input: prepared.text.clone(),
        input_structured: prepared.structured.clone(),
        input_format: prepared.format.to_string(),
        output: output.text.clone(),
        memory: redact_memory_context(&recall.payload),
        tool_calls,
        tool_results,
        canonical_events: Vec::new(),
        error: None,
    };

    let written = match recorded {
        Ok(written) => written,
        Err(error) => {
            // 模型调用已完成：保留 started/completed 事件，AITrace 标记错误
            tracing::warn!(call_id = %call_id, error = %error, "memory write failed after ai call");
            trace.canonical_events = events;
            trace.error = Some(TraceError {
                error_type: error.root_class_name().to_string(),
                message: error.to_string(),
            });
            return Err(LifecycleFailure {
                error,
                trace: Some(trace),
            });
        }
    };
    events.push(CanonicalEvent::MemoryWrite {
        call_id: call_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        ai_profile: profile.name.clone(),
        session,
        written: redact_items(&written.written),
        reason: "interaction_recorded".to_string(),
    });
    events.extend(written.events.into_iter().map(|payload| CanonicalEvent::MemoryAudit {
        call_id: call_id.clone(),
        payload,
    }));
    trace.canonical_events = events;

    Ok(AgentCallOutcome {
        output: ensure_object(Value::String(output.text)),
        trace,
        memory_written: written.written.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::program::{MemoryConfig, Program};
    use crate::core::RuntimeBuilder;
    use crate::memory::KeywordMemory;
    use std::sync::Arc;

    fn runtime() -> Arc<crate::core::Runtime> {
        let program = Program::new()
            .ai(AiProfile::new("assistant", "mock-1").with_memory(MemoryConfig::all()))
            .agent(AgentProfile::new("triage", "assistant").with_role("support"))
            .agent(AgentProfile::new("writer", "assistant").with_system_prompt("write well"))
            .constant("LIMIT");
        RuntimeBuilder::new(program)
            .with_memory(Arc::new(KeywordMemory::default()))
            .build()
    }

    #[tokio::test]
    async fn test_single_call_records_ledger_and_trace() {
        let mut ctx = ExecutionContext::new(runtime()).with_flow("support");
        let call = AgentCall::new("triage", InputExpr::text("ticket #42 is urgent")).at(3, 5);
        let outcome = run_agent_call(&mut ctx, &call).await.unwrap();

        assert_eq!(outcome.output, json!({"text": "[mock-1] ticket #42 is urgent"}));
        assert_eq!(outcome.trace.model, "mock-1");
        assert_eq!(ctx.traces.len(), 3);
        assert!(matches!(ctx.traces[0], TraceRecord::AgentStepStart { .. }));
        assert!(matches!(ctx.traces[1], TraceRecord::AiTrace(_)));
        assert!(matches!(ctx.traces[2], TraceRecord::AgentStepEnd { status: StepStatus::Ok, .. }));

        let kinds: Vec<StepKind> = ctx.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::AgentStepStart, StepKind::AiCall, StepKind::AgentStepEnd]);
        assert_eq!(ctx.steps[0].because.as_deref(), Some("invoked by flow support"));
        assert_eq!(ctx.steps[0].site.line, Some(3));

        let kinds: Vec<&str> = outcome.trace.canonical_events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&"memory_recall"));
        assert!(kinds.contains(&"memory_write"));
    }

    #[tokio::test]
    async fn test_agent_prompt_override_keeps_shared_profile() {
        let rt = runtime();
        let mut ctx = ExecutionContext::new(rt.clone());
        let outcome = run_agent_call(&mut ctx, &AgentCall::new("writer", InputExpr::text("hi")))
            .await
            .unwrap();
        assert_eq!(outcome.trace.system_prompt.as_deref(), Some("write well"));
        assert!(rt.program.ai_profiles["assistant"].system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let mut ctx = ExecutionContext::new(runtime());
        let err = run_agent_call(&mut ctx, &AgentCall::new("ghost", InputExpr::text("x")))
            .await
            .unwrap_err();
        assert_eq!(err.class_name(), "UnknownAgent");
        assert_eq!(ctx.agent_call_count(), 1);
        let kinds: Vec<StepKind> = ctx.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::AgentStepStart, StepKind::AgentStepEnd]);
        assert!(matches!(
            &ctx.traces[0],
            TraceRecord::AgentStepStart { agent_name, agent_id: None, .. } if agent_name == "ghost"
        ));
        match ctx.traces.last() {
            Some(TraceRecord::AgentStepEnd { status, error_message, .. }) => {
                assert_eq!(*status, StepStatus::Error);
                assert!(error_message.as_deref().unwrap_or_default().contains("ghost"));
            }
            other => panic!("unexpected trace {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_limit_still_closes_step() {
        let mut ctx = ExecutionContext::new(runtime());
        for i in 0..5 {
            run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::text(format!("m{}", i))))
                .await
                .unwrap();
        }
        let before = ctx.steps.len();
        let err = run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::text("m5")))
            .await
            .unwrap_err();
        assert_eq!(err.class_name(), "AgentCallLimitExceeded");
        let kinds: Vec<StepKind> = ctx.steps[before..].iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::AgentStepStart, StepKind::AgentStepEnd]);
        assert_eq!(ctx.steps.last().map(|s| s.kind), Some(StepKind::AgentStepEnd));
        assert!(matches!(
            ctx.traces.last(),
            Some(TraceRecord::AgentStepEnd { status: StepStatus::Error, .. })
        ));
    }

    #[tokio::test]
    async fn test_nested_call_refused_with_failed_step() {
        let mut ctx = ExecutionContext::new(runtime());
        let previous = ctx.enter_agent("writer");
        let err = run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::text("x")))
            .await
            .unwrap_err();
        ctx.exit_agent(previous);
        assert_eq!(err.class_name(), "AgentCallNotAllowed");
        assert_eq!(ctx.steps.len(), 2);
        assert!(matches!(
            ctx.traces.last(),
            Some(TraceRecord::AgentStepEnd { status: StepStatus::Error, .. })
        ));
    }

    /// 召回为空、写入总是失败的记忆协作方
    struct FullDiskMemory;

    #[async_trait::async_trait]
    impl crate::memory::MemoryCollaborator for FullDiskMemory {
        async fn recall_with_events(&self, _request: RecallRequest<'_>) -> Result<crate::memory::RecallPack> {
            Ok(crate::memory::RecallPack::default())
        }

        async fn record_with_events(&self, _request: RecordRequest<'_>) -> Result<crate::memory::RecordPack> {
            Err(RuntimeError::Memory("disk full".to_string()))
        }
    }

    fn full_disk_runtime() -> Arc<crate::core::Runtime> {
        let program = Program::new()
            .ai(AiProfile::new("assistant", "mock-1").with_memory(MemoryConfig::all()))
            .agent(AgentProfile::new("triage", "assistant"))
            .agent(AgentProfile::new("writer", "assistant"));
        RuntimeBuilder::new(program)
            .with_memory(Arc::new(FullDiskMemory))
            .build()
    }

    #[tokio::test]
    async fn test_memory_write_failure_keeps_completed_call() {
        let mut ctx = ExecutionContext::new(full_disk_runtime());
        let err = run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::text("hello")))
            .await
            .unwrap_err();
        assert_eq!(err.class_name(), "MemoryError");

        assert_eq!(ctx.traces.len(), 3);
        let trace = match &ctx.traces[1] {
            TraceRecord::AiTrace(trace) => trace,
            other => panic!("unexpected trace {:?}", other),
        };
        assert_eq!(trace.output, "[mock-1] hello");
        let error = trace.error.as_ref().unwrap();
        assert_eq!(error.error_type, "MemoryError");
        assert!(error.message.contains("disk full"));

        let kinds: Vec<&str> = trace.canonical_events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["memory_recall", "ai_call_started", "ai_call_completed"]);
        assert!(crate::trace::check_call_pairing(&trace.canonical_events).is_ok());
        match &trace.canonical_events[0] {
            CanonicalEvent::MemoryRecall { deterministic_hash, .. } => {
                assert_eq!(deterministic_hash, &recall_hash(&crate::memory::MemoryContext::default()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            ctx.traces[2],
            TraceRecord::AgentStepEnd { status: StepStatus::Error, .. }
        ));
    }

    #[tokio::test]
    async fn test_memory_write_failure_in_parallel_block_lands_in_wrapper() {
        let mut ctx = ExecutionContext::new(full_disk_runtime());
        let block = vec![
            AgentCall::new("triage", InputExpr::text("one")),
            AgentCall::new("writer", InputExpr::text("two")),
        ];
        let err = run_agents_parallel(&mut ctx, &block, None).await.unwrap_err();
        assert_eq!(err.root_class_name(), "MemoryError");
        match ctx.traces.last() {
            Some(TraceRecord::ParallelAgents { agents, .. }) => {
                assert_eq!(agents.len(), 1);
                assert_eq!(agents[0].agent_name.as_deref(), Some("triage"));
                assert!(agents[0].error.is_some());
                assert_eq!(agents[0].canonical_events.len(), 3);
            }
            other => panic!("unexpected trace {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_input_marks_step_failed() {
        let mut ctx = ExecutionContext::new(runtime());
        let err = run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::var("missing")))
            .await
            .unwrap_err();
        assert_eq!(err.class_name(), "InvalidInput");
        match ctx.traces.last() {
            Some(TraceRecord::AgentStepEnd { status, error_message, .. }) => {
                assert_eq!(*status, StepStatus::Error);
                assert!(error_message.as_deref().unwrap_or_default().contains("missing"));
            }
            other => panic!("unexpected trace {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_binds_target_and_refuses_constants() {
        let mut ctx = ExecutionContext::new(runtime()).bind("ticket", json!({"id": 42}));
        let call = AgentCall::new("triage", InputExpr::var("ticket")).structured();
        let value = execute_run_agent(&mut ctx, &call, "summary").await.unwrap();
        assert_eq!(ctx.locals.get("summary"), Some(&value));
        assert_eq!(ctx.last_value.as_ref(), Some(&value));

        let err = execute_run_agent(&mut ctx, &call, "LIMIT").await.unwrap_err();
        assert_eq!(err.class_name(), "ConstantAssignment");
        assert_eq!(ctx.agent_call_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_facts_track_write_step() {
        let mut ctx = ExecutionContext::new(runtime()).with_state(json!({"session_id": "s1"}));
        run_agent_call(&mut ctx, &AgentCall::new("triage", InputExpr::text("remember: tier = gold")))
            .await
            .unwrap();
        match ctx.traces.last() {
            Some(TraceRecord::AgentStepEnd {
                step_id,
                memory_facts: Some(facts),
                ..
            }) => {
                assert_eq!(facts.last_updated_step, Some(*step_id));
                assert!(facts.keys.contains(&"tier".to_string()));
            }
            other => panic!("unexpected trace {:?}", other),
        }
    }
}
