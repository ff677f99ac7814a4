//! 运行时错误类型
//!
//! 配置错误、隔离违规、资源护栏与 AI 调用失败统一为 RuntimeError；
//! class_name() 给出机器可读的错误类别，供 call-failed 事件与上层分类使用。

use thiserror::Error;

use crate::llm::ProviderError;

/// 错误产生的边界（供上游分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Ai,
    Tools,
    Memory,
}

impl Boundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            Boundary::Ai => "ai",
            Boundary::Tools => "tools",
            Boundary::Memory => "memory",
        }
    }
}

/// Agent / AI 调用过程中可能出现的错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Agent '{agent}' references unknown AI '{ai}'")]
    UnknownAi { agent: String, ai: String },

    #[error("Agent call not allowed for '{agent}': {reason}")]
    AgentCallNotAllowed { agent: String, reason: String },

    #[error("Agent call limit exceeded in flow (limit {limit})")]
    AgentCallLimitExceeded { limit: usize },

    #[error("Parallel agent limit exceeded ({count} entries, limit {limit})")]
    ParallelAgentLimitExceeded { count: usize, limit: usize },

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Invalid agent input: {0}")]
    InvalidInput(String),

    #[error("Invalid tool arguments for '{tool}': {message}")]
    ToolArgumentsInvalid { tool: String, message: String },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// AI 调用本身失败；source 为内部原因，boundary 固定标记为 ai
    #[error("{source}")]
    AiCallFailed {
        boundary: Boundary,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("Agent '{agent}' failed: {source}")]
    AgentFailed {
        agent: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("Merge policy error: {0}")]
    MergePolicy(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Model router error: {0}")]
    Router(String),

    #[error("Cannot assign to constant '{0}'")]
    ConstantAssignment(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// 将内部错误标记为 AI 边界产生的失败；已标记的错误原样返回
    pub fn ai_boundary(err: RuntimeError) -> Self {
        match err {
            already @ RuntimeError::AiCallFailed { .. } => already,
            other => RuntimeError::AiCallFailed {
                boundary: Boundary::Ai,
                source: Box::new(other),
            },
        }
    }

    pub fn agent_failed(agent: impl Into<String>, err: RuntimeError) -> Self {
        RuntimeError::AgentFailed {
            agent: agent.into(),
            source: Box::new(err),
        }
    }

    /// 机器可读的错误类别名
    pub fn class_name(&self) -> &'static str {
        match self {
            RuntimeError::UnknownAgent(_) => "UnknownAgent",
            RuntimeError::UnknownAi { .. } => "UnknownAI",
            RuntimeError::AgentCallNotAllowed { .. } => "AgentCallNotAllowed",
            RuntimeError::AgentCallLimitExceeded { .. } => "AgentCallLimitExceeded",
            RuntimeError::ParallelAgentLimitExceeded { .. } => "ParallelAgentLimitExceeded",
            RuntimeError::UnknownProvider(_) => "UnknownProvider",
            RuntimeError::InvalidInput(_) => "InvalidInput",
            RuntimeError::ToolArgumentsInvalid { .. } => "ToolArgumentsInvalid",
            RuntimeError::Provider(_) => "ProviderError",
            RuntimeError::AiCallFailed { .. } => "AICallFailed",
            RuntimeError::AgentFailed { .. } => "AgentFailed",
            RuntimeError::MergePolicy(_) => "MergePolicyError",
            RuntimeError::Memory(_) => "MemoryError",
            RuntimeError::Router(_) => "RouterError",
            RuntimeError::ConstantAssignment(_) => "ConstantAssignment",
            RuntimeError::Cancelled => "Cancelled",
            RuntimeError::Config(_) => "ConfigError",
        }
    }

    /// 最内层原因的类别名（穿透 AiCallFailed / AgentFailed 包装）
    pub fn root_class_name(&self) -> &'static str {
        match self {
            RuntimeError::AiCallFailed { source, .. } | RuntimeError::AgentFailed { source, .. } => {
                source.root_class_name()
            }
            other => other.class_name(),
        }
    }

    pub fn boundary(&self) -> Option<Boundary> {
        match self {
            RuntimeError::AiCallFailed { boundary, .. } => Some(*boundary),
            RuntimeError::AgentFailed { source, .. } => source.boundary(),
            _ => None,
        }
    }

    /// 对整个 flow 运行致命（除 Provider 诊断外均致命）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RuntimeError::Provider(ProviderError::RateLimited { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            RuntimeError::Cancelled => true,
            RuntimeError::AiCallFailed { source, .. } | RuntimeError::AgentFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// 并行块中失败的 agent 名
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            RuntimeError::AgentFailed { agent, .. } => Some(agent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ai_boundary_wraps_once() {
        let err = RuntimeError::ai_boundary(RuntimeError::Cancelled);
        let err = RuntimeError::ai_boundary(err);
        assert_eq!(err.class_name(), "AICallFailed");
        assert_eq!(err.root_class_name(), "Cancelled");
        assert_eq!(err.boundary(), Some(Boundary::Ai));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_agent_failed_surfaces_name() {
        let inner = RuntimeError::AgentCallLimitExceeded { limit: 5 };
        let err = RuntimeError::agent_failed("triage", inner);
        assert_eq!(err.agent_name(), Some("triage"));
        assert!(err.to_string().contains("Agent 'triage' failed"));
        assert_eq!(err.root_class_name(), "AgentCallLimitExceeded");
    }

    #[test]
    fn test_rate_limit_is_not_fatal() {
        let err = RuntimeError::Provider(ProviderError::RateLimited { retry_after_ms: 500 });
        assert!(!err.is_fatal());
        assert!(RuntimeError::UnknownAgent("x".into()).is_fatal());
    }
}
