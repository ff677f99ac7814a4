//! 工具执行器
//!
//! ToolExecutor 是运行时消费的接口：execute(tool_name, args, call_ctx) -> ToolOutcome，失败以结果形式返回而非错误。
//! RegistryToolExecutor 持有 ToolRegistry 与全局超时，可被 flow 的取消令牌中断；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolRegistry;
use crate::trace::summarize_payload;

/// 工具调用的发起方
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallSource {
    /// 用户动作或 flow 语句直接调用
    #[default]
    User,
    /// 模型在工具调用循环中请求
    Ai,
}

impl ToolCallSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallSource::User => "user",
            ToolCallSource::Ai => "ai",
        }
    }
}

/// 随每次工具调用显式传递的上下文
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub source: ToolCallSource,
    pub flow: Option<String>,
    pub agent: Option<String>,
    pub cancel: CancellationToken,
}

/// 工具调用结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(Value),
    Failed { error_type: String, message: String },
}

impl ToolOutcome {
    pub fn failed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ToolOutcome::Failed {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok(_))
    }

    /// 回传给模型的结果体
    pub fn to_result_value(&self) -> Value {
        match self {
            ToolOutcome::Ok(value) => value.clone(),
            ToolOutcome::Failed { error_type, message } => serde_json::json!({
                "error": {"type": error_type, "message": message}
            }),
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, args: Value, call: &ToolCallContext) -> ToolOutcome;
}

/// 基于注册表的执行器：对每次调用施加超时并响应取消
pub struct RegistryToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl RegistryToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

#[async_trait]
impl ToolExecutor for RegistryToolExecutor {
    async fn execute(&self, tool_name: &str, args: Value, call: &ToolCallContext) -> ToolOutcome {
        let start = Instant::now();
        let args_preview = summarize_payload(&args);
        let outcome = match self.registry.get(tool_name) {
            None => ToolOutcome::failed("UnknownTool", format!("Unknown tool: {tool_name}")),
            Some(tool) => {
                tokio::select! {
                    _ = call.cancel.cancelled() => ToolOutcome::failed("Cancelled", "Cancelled"),
                    result = timeout(self.timeout, tool.execute(args)) => match result {
                        Ok(Ok(value)) => ToolOutcome::Ok(value),
                        Ok(Err(e)) => ToolOutcome::failed("ToolFailed", e),
                        Err(_) => ToolOutcome::failed(
                            "ToolTimeout",
                            format!("Tool '{}' timed out after {}s", tool_name, self.timeout.as_secs()),
                        ),
                    },
                }
            }
        };

        let status = match &outcome {
            ToolOutcome::Ok(_) => "ok",
            ToolOutcome::Failed { error_type, .. } => error_type.as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "source": call.source.as_str(),
            "flow": call.flow,
            "agent": call.agent,
            "ok": outcome.is_ok(),
            "outcome": status,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_execute_known_and_unknown() {
        let executor = RegistryToolExecutor::new(ToolRegistry::new().with(EchoTool), 5);
        let call = ToolCallContext::default();
        let ok = executor
            .execute("echo", serde_json::json!({"text": "hi"}), &call)
            .await;
        assert_eq!(ok, ToolOutcome::Ok(serde_json::json!({"text": "hi"})));

        let missing = executor.execute("nope", Value::Null, &call).await;
        assert!(matches!(missing, ToolOutcome::Failed { ref error_type, .. } if error_type == "UnknownTool"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_tool() {
        let executor = RegistryToolExecutor::new(ToolRegistry::new().with(SlowTool), 60);
        let call = ToolCallContext::default();
        call.cancel.cancel();
        let outcome = executor.execute("slow", Value::Null, &call).await;
        assert_eq!(outcome, ToolOutcome::failed("Cancelled", "Cancelled"));
    }
}
