//! 受限并行 agent 块
//!
//! 条目数超过 3 时在执行任何 agent 之前失败。concurrent 模式下每个条目在自己的分支上下文中运行，
//! 在途数受 TaskScheduler 限制；结果与 trace 一律按声明顺序合并回主上下文。
//! 某条目失败时取消其后的条目，失败条目及之前条目的 trace 保留，之后条目的缓冲被丢弃。

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::merge::{build_merge_trace_events, merge_agent_candidates, MergeCandidate, MergePolicy};
use super::{run_agent_lifecycle, AgentCall, AgentCallOutcome, LifecycleFailure};
use crate::config::ParallelMode;
use crate::core::error::{Result, RuntimeError};
use crate::core::{ExecutionContext, TaskScheduler, PARALLEL_AGENT_LIMIT};
use crate::trace::{AiTrace, TraceRecord};

/// 运行并行块；有合并策略时返回合并输出，否则返回按声明顺序的输出列表
pub async fn run_agents_parallel(
    ctx: &mut ExecutionContext,
    entries: &[AgentCall],
    merge: Option<&MergePolicy>,
) -> Result<Value> {
    run_block(ctx, entries, merge, None).await
}

pub(crate) async fn run_block(
    ctx: &mut ExecutionContext,
    entries: &[AgentCall],
    merge: Option<&MergePolicy>,
    target: Option<&str>,
) -> Result<Value> {
    if entries.len() > PARALLEL_AGENT_LIMIT {
        return Err(RuntimeError::ParallelAgentLimitExceeded {
            count: entries.len(),
            limit: PARALLEL_AGENT_LIMIT,
        });
    }
    if let Some(policy) = merge {
        let names: Vec<&str> = entries.iter().map(|e| e.agent_name.as_str()).collect();
        policy.validate_entries(&names)?;
    }

    let runtime = ctx.runtime().clone();
    let mode = runtime.config.runtime.parallel_mode;
    tracing::info!(entries = entries.len(), ?mode, "parallel block started");

    let run = match mode {
        ParallelMode::Sequential => run_sequential(ctx, entries).await,
        ParallelMode::Concurrent => {
            run_concurrent(ctx, entries, runtime.config.runtime.effective_in_flight()).await
        }
    };

    let outcomes = match run {
        Ok(outcomes) => outcomes,
        Err((completed, err)) => {
            push_wrapper(ctx, target, completed, None, None);
            return Err(err);
        }
    };

    let candidates: Vec<MergeCandidate> = entries
        .iter()
        .zip(outcomes.iter())
        .map(|(entry, outcome)| MergeCandidate::new(entry.agent_name.clone(), outcome.output.clone()))
        .collect();
    let traces: Vec<AiTrace> = outcomes.into_iter().map(|o| o.trace).collect();

    let Some(policy) = merge else {
        push_wrapper(ctx, target, traces, None, None);
        return Ok(Value::Array(candidates.into_iter().map(|c| c.output).collect()));
    };

    match merge_agent_candidates(&candidates, policy) {
        Ok(outcome) => {
            ctx.traces.extend(build_merge_trace_events(&candidates, &outcome, policy));
            let selected = outcome
                .selected
                .iter()
                .map(|&i| candidates[i].agent_name.clone())
                .collect();
            push_wrapper(ctx, target, traces, Some(policy.name()), Some(selected));
            Ok(outcome.output)
        }
        Err(err) => {
            push_wrapper(ctx, target, traces, Some(policy.name()), None);
            Err(err)
        }
    }
}

type BlockFailure = (Vec<AiTrace>, RuntimeError);

/// 依次在主上下文上执行
async fn run_sequential(
    ctx: &mut ExecutionContext,
    entries: &[AgentCall],
) -> std::result::Result<Vec<AgentCallOutcome>, BlockFailure> {
    let mut outcomes: Vec<AgentCallOutcome> = Vec::with_capacity(entries.len());
    for entry in entries {
        match run_agent_lifecycle(ctx, entry, false).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(failure) => {
                let completed = completed_traces(outcomes, failure.trace);
                return Err((completed, RuntimeError::agent_failed(&entry.agent_name, failure.error)));
            }
        }
    }
    Ok(outcomes)
}

/// 各条目在分支上下文中并发执行，之后按声明顺序合并
async fn run_concurrent(
    ctx: &mut ExecutionContext,
    entries: &[AgentCall],
    max_in_flight: usize,
) -> std::result::Result<Vec<AgentCallOutcome>, BlockFailure> {
    let base_count = ctx.agent_call_count();
    let scheduler = TaskScheduler::new(max_in_flight);
    let branches: Vec<ExecutionContext> = (0..entries.len()).map(|i| ctx.branch(i)).collect();
    let tokens: Vec<CancellationToken> = branches.iter().map(|b| b.cancel_token().clone()).collect();

    let futures = branches
        .into_iter()
        .zip(entries.iter())
        .enumerate()
        .map(|(index, (mut branch, entry))| {
            let scheduler = &scheduler;
            let later: Vec<CancellationToken> = tokens[index + 1..].to_vec();
            async move {
                let cancel = branch.cancel_token().clone();
                let result = match scheduler.acquire(&cancel).await {
                    Ok(_permit) => run_agent_lifecycle(&mut branch, entry, false).await,
                    Err(err) => Err(LifecycleFailure::from(err)),
                };
                if result.is_err() {
                    later.iter().for_each(CancellationToken::cancel);
                }
                (branch, result)
            }
        });
    let finished = join_all(futures).await;

    let mut outcomes: Vec<AgentCallOutcome> = Vec::with_capacity(entries.len());
    for (index, (branch, result)) in finished.into_iter().enumerate() {
        ctx.absorb(branch, base_count + index);
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(failure) => {
                let discarded = entries.len() - index - 1;
                if discarded > 0 {
                    tracing::warn!(
                        failed = %entries[index].agent_name,
                        discarded,
                        "parallel block aborted, later entries discarded"
                    );
                }
                let completed = completed_traces(outcomes, failure.trace);
                return Err((
                    completed,
                    RuntimeError::agent_failed(&entries[index].agent_name, failure.error),
                ));
            }
        }
    }
    Ok(outcomes)
}

/// 已完成条目的 trace，加上失败条目已完成 AI 调用时的错误 trace
fn completed_traces(outcomes: Vec<AgentCallOutcome>, failed: Option<AiTrace>) -> Vec<AiTrace> {
    outcomes.into_iter().map(|o| o.trace).chain(failed).collect()
}

fn push_wrapper(
    ctx: &mut ExecutionContext,
    target: Option<&str>,
    agents: Vec<AiTrace>,
    merge_policy: Option<&str>,
    merge_selected: Option<Vec<String>>,
) {
    ctx.traces.push(TraceRecord::ParallelAgents {
        target: target.map(str::to_string),
        agents,
        merge_policy: merge_policy.map(str::to_string),
        merge_selected,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{InputExpr, MergeRule};
    use crate::config::AppConfig;
    use crate::core::program::{AgentProfile, AiProfile, Program};
    use crate::core::RuntimeBuilder;
    use crate::llm::MockProvider;
    use serde_json::json;
    use std::sync::Arc;

    fn program() -> Program {
        Program::new()
            .ai(AiProfile::new("fast", "mock-fast"))
            .ai(AiProfile::new("slow", "mock-slow"))
            .agent(AgentProfile::new("a", "fast"))
            .agent(AgentProfile::new("b", "slow"))
            .agent(AgentProfile::new("c", "fast"))
            .agent(AgentProfile::new("d", "slow"))
    }

    fn ctx_with(mode: ParallelMode, provider: Arc<MockProvider>) -> ExecutionContext {
        let mut config = AppConfig::default();
        config.runtime.parallel_mode = mode;
        let rt = RuntimeBuilder::new(program())
            .with_config(config)
            .with_provider(provider)
            .build();
        ExecutionContext::new(rt).with_flow("fanout")
    }

    fn entries() -> Vec<AgentCall> {
        vec![
            AgentCall::new("a", InputExpr::text("one")),
            AgentCall::new("b", InputExpr::text("two")),
            AgentCall::new("c", InputExpr::text("three")),
        ]
    }

    #[tokio::test]
    async fn test_limit_checked_before_any_work() {
        let provider = Arc::new(MockProvider::new());
        let mut ctx = ctx_with(ParallelMode::Concurrent, provider.clone());
        let mut four = entries();
        four.push(AgentCall::new("d", InputExpr::text("four")));
        let err = run_agents_parallel(&mut ctx, &four, None).await.unwrap_err();
        assert_eq!(err.class_name(), "ParallelAgentLimitExceeded");
        assert_eq!(provider.calls(), 0);
        assert!(ctx.traces.is_empty());
    }

    #[tokio::test]
    async fn test_both_modes_keep_declared_order() {
        for mode in [ParallelMode::Concurrent, ParallelMode::Sequential] {
            let mut ctx = ctx_with(mode, Arc::new(MockProvider::new()));
            let value = run_agents_parallel(&mut ctx, &entries(), None).await.unwrap();
            assert_eq!(
                value,
                json!([
                    {"text": "[mock-fast] one"},
                    {"text": "[mock-slow] two"},
                    {"text": "[mock-fast] three"},
                ])
            );
            let ids: Vec<u64> = ctx.steps.iter().map(|s| s.id).collect();
            assert_eq!(ids, (1..=9).collect::<Vec<u64>>());
            assert_eq!(ctx.agent_call_count(), 3);
            match ctx.traces.last() {
                Some(TraceRecord::ParallelAgents { agents, .. }) => {
                    let names: Vec<_> = agents.iter().filter_map(|t| t.agent_name.clone()).collect();
                    assert_eq!(names, vec!["a", "b", "c"]);
                }
                other => panic!("unexpected trace {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_merge_policy_records_selection() {
        let mut ctx = ctx_with(ParallelMode::Concurrent, Arc::new(MockProvider::new()));
        let policy = MergePolicy::parse("prefer", Some(vec!["b".into(), "a".into()])).unwrap();
        let value = run_agents_parallel(&mut ctx, &entries(), Some(&policy)).await.unwrap();
        assert_eq!(value, json!({"text": "[mock-slow] two"}));
        assert!(ctx
            .traces
            .iter()
            .any(|t| matches!(t, TraceRecord::AgentMergeSummary { policy, .. } if policy == "prefer")));
        match ctx.traces.last() {
            Some(TraceRecord::ParallelAgents { merge_selected, .. }) => {
                assert_eq!(merge_selected.as_deref(), Some(&["b".to_string()][..]));
            }
            other => panic!("unexpected trace {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_precedence_must_match_entries() {
        let mut ctx = ctx_with(ParallelMode::Concurrent, Arc::new(MockProvider::new()));
        let policy = MergePolicy::parse("prefer", Some(vec!["z".into()])).unwrap();
        let err = run_agents_parallel(&mut ctx, &entries(), Some(&policy)).await.unwrap_err();
        assert_eq!(err.class_name(), "MergePolicyError");
        assert_eq!(ctx.agent_call_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_names_agent_and_keeps_prior_progress() {
        for mode in [ParallelMode::Concurrent, ParallelMode::Sequential] {
            let mut ctx = ctx_with(mode, Arc::new(MockProvider::new()));
            let block = vec![
                AgentCall::new("a", InputExpr::text("one")),
                AgentCall::new("ghost", InputExpr::text("two")),
                AgentCall::new("c", InputExpr::text("three")),
            ];
            let err = run_agents_parallel(&mut ctx, &block, None).await.unwrap_err();
            assert_eq!(err.agent_name(), Some("ghost"));
            assert_eq!(err.root_class_name(), "UnknownAgent");
            match ctx.traces.last() {
                Some(TraceRecord::ParallelAgents { agents, merge_policy, .. }) => {
                    assert_eq!(agents.len(), 1);
                    assert!(merge_policy.is_none());
                }
                other => panic!("unexpected trace {:?}", other),
            }
            assert!(!ctx
                .traces
                .iter()
                .any(|t| matches!(t, TraceRecord::AgentStepStart { agent_name, .. } if agent_name == "c")));
        }
    }

    #[tokio::test]
    async fn test_collect_with_concat_reducer() {
        let mut ctx = ctx_with(ParallelMode::Concurrent, Arc::new(MockProvider::new()));
        let policy = MergePolicy::new(MergeRule::Collect).with_reducer(crate::agent::MergeReducer::Concat {
            separator: "\n".into(),
        });
        let value = run_agents_parallel(&mut ctx, &entries()[..2], Some(&policy)).await.unwrap();
        assert_eq!(value, json!({"text": "[mock-fast] one\n[mock-slow] two"}));
    }
}
