//! AI 调用管线：一次逻辑模型调用的完整编排
//!
//! 路由（canary / shadow）→ 种子派生 → started 事件 → 纯文本缓存调用或工具调用循环 → 终止事件。
//! 任一环节出错：标记 ai 边界、写可解释性 error 条目、追加恰好一个 call-failed、附上错误 AITrace 后重新抛出。

pub mod cache;
pub mod seed;
pub mod shadow;
pub mod tool_loop;

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{Result, RuntimeError};
use crate::core::program::AiProfile;
use crate::core::ExecutionContext;
use crate::llm::{initial_messages, normalize_ai_text, AskRequest, ProviderError, RouteDecision};
use crate::memory::{redact_memory_context, MemoryContext};
use crate::observability::{record_ai_event, record_ai_metrics, AiCallStatus};
use crate::tools::{build_declarations, ToolCallPolicy, ToolCallSource};
use crate::trace::{
    AiTrace, CanonicalEvent, ExplainEntry, ExplainEventType, ToolEvent, TraceError, TraceRecord,
};

pub use cache::{CacheKey, TextCallCache};
pub use seed::{derive_seed, SeedInputs};
pub use shadow::{spawn_shadow_compare, ShadowCompare};
pub use tool_loop::{LoopTermination, ToolLoop, ToolLoopOutcome};

/// 一次 AI 调用的输入
#[derive(Debug, Clone, Copy)]
pub struct AiCallRequest<'a> {
    pub profile: &'a AiProfile,
    pub user_input: &'a str,
    pub memory: &'a MemoryContext,
    pub input_format: &'a str,
    pub input_structured: Option<&'a Value>,
    /// 与记忆事件共享的调用 id；None 时新生成
    pub call_id: Option<&'a str>,
    pub agent_name: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub role: Option<&'a str>,
}

impl<'a> AiCallRequest<'a> {
    pub fn new(profile: &'a AiProfile, user_input: &'a str, memory: &'a MemoryContext) -> Self {
        Self {
            profile,
            user_input,
            memory,
            input_format: "text",
            input_structured: None,
            call_id: None,
            agent_name: None,
            agent_id: None,
            role: None,
        }
    }
}

/// 一次 AI 调用的结果
#[derive(Debug)]
pub struct AiCallOutput {
    pub call_id: String,
    pub text: String,
    pub model: String,
    pub provider: String,
    pub seed: u64,
    pub cache_hit: bool,
    /// 工具循环的结束原因；纯文本分支为 None
    pub termination: Option<LoopTermination>,
    pub shadow: Option<JoinHandle<()>>,
}

/// 受取消令牌与超时约束的 provider 调用
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ProviderError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RuntimeError::Provider(e)),
            Err(_) => Err(RuntimeError::Provider(ProviderError::Timeout)),
        },
    }
}

/// 分支执行结果
struct BranchOutput {
    text: String,
    cache_hit: bool,
    termination: Option<LoopTermination>,
    /// 已确认可用的 shadow 模型
    shadow_model: Option<String>,
}

struct CallPlan<'a> {
    call_id: &'a str,
    provider: &'a str,
    route: &'a RouteDecision,
    seed: u64,
}

/// 执行一次 AI 调用；规范事件追加到 `events`，工具子事件追加到 `tool_events`
pub async fn run_ai_with_tools(
    ctx: &mut ExecutionContext,
    request: AiCallRequest<'_>,
    events: &mut Vec<CanonicalEvent>,
    tool_events: &mut Vec<ToolEvent>,
) -> Result<AiCallOutput> {
    let runtime = ctx.runtime().clone();
    let profile = request.profile;
    let call_id = request
        .call_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let provider_name = if profile.provider.trim().is_empty() {
        runtime.config.llm.default_provider.trim().to_lowercase()
    } else {
        profile.provider_name()
    };

    let route = match runtime.router.as_ref() {
        Some(router) => router.route(&profile.model, request.user_input, ctx.flow_name.as_deref()),
        None => RouteDecision::direct(&profile.model),
    };
    let seed = derive_seed(
        request.input_structured,
        runtime.config.determinism.seed,
        &SeedInputs {
            model: &route.selected_model,
            user_input: request.user_input,
            ai_profile: &profile.name,
            flow: ctx.flow_name.as_deref(),
            input_format: request.input_format,
            provider: &provider_name,
        },
    );

    events.push(CanonicalEvent::started(
        &call_id,
        &provider_name,
        &route.selected_model,
        request.user_input,
        profile.exposed_tools.len(),
        profile.memory.enabled(),
    ));
    ctx.explain.push(
        ExplainEntry::generation(ExplainEventType::Start, seed, &provider_name, &route.selected_model)
            .inputs(json!({
                "input": request.user_input,
                "input_format": request.input_format,
                "system_prompt": profile.system_prompt,
            }))
            .parameters(json!({
                "tools": profile.exposed_tools,
                "memory_enabled": profile.memory.enabled(),
            }))
            .metadata(json!({
                "call_id": call_id,
                "ai_profile": profile.name,
                "canary_hit": route.canary_hit,
                "shadow_model": route.shadow_model,
            })),
    );

    let started = Instant::now();
    let plan = CallPlan {
        call_id: &call_id,
        provider: &provider_name,
        route: &route,
        seed,
    };
    let result = run_branch(ctx, &request, &plan, events, tool_events).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(branch) => {
            events.push(CanonicalEvent::completed(
                &call_id,
                &provider_name,
                &route.selected_model,
                &branch.text,
                duration_ms,
            ));
            ctx.explain.push(
                ExplainEntry::generation(ExplainEventType::Finish, seed, &provider_name, &route.selected_model)
                    .outputs(json!({"text": branch.text, "cache_hit": branch.cache_hit}))
                    .metadata(json!({
                        "call_id": call_id,
                        "duration_ms": duration_ms,
                        "termination": branch.termination,
                    })),
            );
            record_ai_metrics(&runtime.metrics, request.user_input, &branch.text, branch.cache_hit);
            record_ai_event(
                AiCallStatus::Ok,
                &call_id,
                &provider_name,
                &route.selected_model,
                duration_ms,
                None,
            );
            ctx.last_ai_provider = Some(provider_name.clone());

            let shadow = match (&branch.shadow_model, branch.termination) {
                (Some(shadow_model), None) => match runtime.providers.resolve(&provider_name) {
                    Ok(provider) => Some(spawn_shadow_compare(ShadowCompare {
                        provider,
                        call_id: call_id.clone(),
                        shadow_model: shadow_model.clone(),
                        system_prompt: profile.system_prompt.clone(),
                        input: request.user_input.to_string(),
                        tools: profile.exposed_tools.clone(),
                        memory: request.memory.clone(),
                        primary_output: branch.text.clone(),
                        secrets: runtime.secrets.clone(),
                        metrics: runtime.metrics.clone(),
                        cancel: ctx.cancel_token().child_token(),
                        timeout: Duration::from_secs(runtime.config.llm.timeouts.request.max(1)),
                    })),
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "shadow compare skipped");
                        None
                    }
                },
                _ => None,
            };

            Ok(AiCallOutput {
                call_id,
                text: branch.text,
                model: route.selected_model.clone(),
                provider: provider_name,
                seed,
                cache_hit: branch.cache_hit,
                termination: branch.termination,
                shadow,
            })
        }
        Err(err) => {
            let error_type = err.root_class_name();
            let message = err.to_string();
            ctx.explain.push(
                ExplainEntry::generation(ExplainEventType::Error, seed, &provider_name, &route.selected_model)
                    .metadata(json!({
                        "call_id": call_id,
                        "error_type": error_type,
                        "message": message,
                        "duration_ms": duration_ms,
                    })),
            );
            if let RuntimeError::Provider(provider_err) = &err {
                if let Some(diagnostic) = provider_err.diagnostic() {
                    events.push(CanonicalEvent::provider_error(
                        &call_id,
                        &provider_name,
                        &route.selected_model,
                        diagnostic,
                    ));
                }
            }
            events.push(CanonicalEvent::failed(
                &call_id,
                &provider_name,
                &route.selected_model,
                error_type,
                &message,
                duration_ms,
            ));
            runtime.metrics.record_failure();
            record_ai_event(
                AiCallStatus::Error,
                &call_id,
                &provider_name,
                &route.selected_model,
                duration_ms,
                Some(error_type),
            );

            let (tool_calls, tool_results) = AiTrace::split_tool_events(tool_events);
            ctx.traces.push(TraceRecord::AiTrace(Box::new(AiTrace {
                ai_name: profile.name.clone(),
                ai_profile_name: profile.name.clone(),
                agent_name: request.agent_name.map(str::to_string),
                agent_id: request.agent_id.map(str::to_string),
                role: request.role.map(str::to_string),
                model: AiTrace::model_from_events(events, &profile.model),
                system_prompt: profile.system_prompt.clone(),
                input: request.user_input.to_string(),
                input_structured: request.input_structured.cloned(),
                input_format: request.input_format.to_string(),
                output: String::new(),
                memory: redact_memory_context(request.memory),
                tool_calls,
                tool_results,
                canonical_events: events.clone(),
                error: Some(TraceError {
                    error_type: error_type.to_string(),
                    message: message.clone(),
                }),
            })));

            Err(RuntimeError::ai_boundary(err))
        }
    }
}

/// 可失败区域：确保模型可用、解析 provider、选择分支
async fn run_branch(
    ctx: &mut ExecutionContext,
    request: &AiCallRequest<'_>,
    plan: &CallPlan<'_>,
    events: &mut Vec<CanonicalEvent>,
    tool_events: &mut Vec<ToolEvent>,
) -> Result<BranchOutput> {
    let runtime = ctx.runtime().clone();
    let profile = request.profile;
    let model = plan.route.selected_model.as_str();
    let request_timeout = Duration::from_secs(runtime.config.llm.timeouts.request.max(1));

    let mut shadow_model = plan.route.shadow_model.clone();
    if let Some(router) = runtime.router.as_ref() {
        let roots = runtime.root_paths();
        router.ensure_model(model, &roots).await?;
        if let Some(shadow) = plan.route.shadow_model.as_deref() {
            if let Err(e) = router.ensure_model(shadow, &roots).await {
                tracing::warn!(call_id = %plan.call_id, shadow, error = %e, "shadow model unavailable, compare skipped");
                shadow_model = None;
            }
        }
    }
    let provider = runtime.providers.resolve(plan.provider)?;

    let adapter = if profile.exposed_tools.is_empty() {
        None
    } else {
        let adapter = runtime.providers.tool_adapter(plan.provider);
        if adapter.is_none() {
            tracing::debug!(
                call_id = %plan.call_id,
                provider = %plan.provider,
                "provider has no tool adapter, using text call"
            );
        }
        adapter
    };

    match adapter {
        None => {
            let key = CacheKey {
                provider: plan.provider,
                model,
                system_prompt: profile.system_prompt.as_deref(),
                input: request.user_input,
                tools: &profile.exposed_tools,
                memory: request.memory,
            }
            .digest();
            if let Some(cached) = runtime.cache.get(&key) {
                tracing::debug!(call_id = %plan.call_id, "text call cache hit");
                return Ok(BranchOutput {
                    text: normalize_ai_text(&cached, &runtime.secrets),
                    cache_hit: true,
                    termination: None,
                    shadow_model,
                });
            }
            let seed = provider.capabilities().supports_seed.then_some(plan.seed);
            let response = guarded(
                ctx.cancel_token(),
                request_timeout,
                provider.ask(AskRequest {
                    model,
                    system_prompt: profile.system_prompt.as_deref(),
                    user_input: request.user_input,
                    tools: &profile.exposed_tools,
                    memory: request.memory,
                    tool_results: &[],
                    seed,
                }),
            )
            .await?;
            for diagnostic in response.diagnostics {
                events.push(CanonicalEvent::provider_error(
                    plan.call_id,
                    plan.provider,
                    model,
                    diagnostic,
                ));
            }
            let text = normalize_ai_text(&response.output, &runtime.secrets);
            runtime.cache.insert(key, response.output);
            Ok(BranchOutput {
                text,
                cache_hit: false,
                termination: None,
                shadow_model,
            })
        }
        Some(adapter) => {
            let declarations = build_declarations(&runtime.program, &profile.exposed_tools);
            let scope = ctx.tool_source_scope(ToolCallSource::Ai);
            let call = scope.tool_call_context(request.agent_name);
            let outcome = ToolLoop {
                adapter,
                executor: runtime.tools.clone(),
                call_id: plan.call_id,
                provider: plan.provider,
                model,
                messages: initial_messages(profile.system_prompt.as_deref(), request.user_input),
                declarations: &declarations,
                policy: ToolCallPolicy::ai_default(),
                call,
                request_timeout,
            }
            .run(events, tool_events)
            .await;
            // 错误路径同样在此恢复 tool_call_source
            drop(scope);
            let outcome = outcome?;
            runtime.metrics.record_tool_calls(outcome.tool_calls);
            Ok(BranchOutput {
                text: normalize_ai_text(&Value::String(outcome.text), &runtime.secrets),
                cache_hit: false,
                termination: Some(outcome.termination),
                shadow_model,
            })
        }
    }
}
