//! Agentflow 演示入口
//!
//! 加载配置、初始化日志，用 Mock provider 与关键词记忆跑一次 agent 调用，并以 JSON 打印 trace。

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use agentflow::config::load_config;
use agentflow::core::{AgentProfile, AiProfile, MemoryConfig, Program};
use agentflow::memory::KeywordMemory;
use agentflow::observability;
use agentflow::tools::{EchoTool, ToolRegistry};
use agentflow::{run_agent_call, AgentCall, ExecutionContext, InputExpr, RuntimeBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let config = load_config(config_path).context("Failed to load config")?;

    let program = Program::new()
        .ai(AiProfile::new("assistant", "mock-1")
            .with_prompt("You triage support tickets.")
            .with_memory(MemoryConfig::all()))
        .agent(AgentProfile::new("triage", "assistant").with_role("support"));

    let runtime = RuntimeBuilder::new(program)
        .with_config(config)
        .with_config_router()
        .with_memory(Arc::new(KeywordMemory::default()))
        .with_tool_registry(ToolRegistry::new().with(EchoTool))
        .build();

    let mut ctx = ExecutionContext::new(runtime.clone())
        .with_flow("support")
        .with_state(json!({"session_id": "demo"}));
    let call = AgentCall::new("triage", InputExpr::text("ticket #42 is urgent")).at(1, 1);
    let outcome = run_agent_call(&mut ctx, &call).await.context("Agent call failed")?;

    tracing::info!(output = %outcome.output, "agent finished");
    let report = json!({
        "output": outcome.output,
        "traces": ctx.traces,
        "steps": ctx.steps,
        "explain": ctx.explain,
        "metrics": runtime.metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
