//! Agentflow - Agent 与 AI 调用运行时
//!
//! 模块划分：
//! - **agent**: 单 agent 调用生命周期、受限并行块与合并策略
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 程序定义、执行上下文、运行时构建、错误类型、并行调度
//! - **llm**: provider 抽象、注册表、路由（canary / shadow）、Mock 实现
//! - **memory**: 记忆协作方接口与进程内关键词记忆
//! - **observability**: 日志初始化与 AI 调用指标
//! - **pipeline**: AI 调用管线（缓存文本调用 / 工具调用循环、种子、shadow 对照）
//! - **tools**: 工具声明、注册表与执行器
//! - **trace**: 规范事件、AITrace、步骤账本与可解释性日志

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod tools;
pub mod trace;

pub use agent::{
    execute_run_agent, execute_run_agents_parallel, run_agent_call, run_agents_parallel, AgentCall, InputExpr,
    InputMode, MergePolicy,
};
pub use crate::core::{ExecutionContext, Runtime, RuntimeBuilder, RuntimeError};
