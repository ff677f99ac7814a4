//! Shadow 对照调用：用 shadow 模型重放一次纯文本调用并与主输出比较
//!
//! 后台执行、结果只记指标与日志；失败被吞掉，不影响主调用与其 trace。flow 取消时随之中止。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::llm::{normalize_ai_text, AskRequest, Provider};
use crate::memory::MemoryContext;
use crate::observability::AiMetrics;

pub struct ShadowCompare {
    pub provider: Arc<dyn Provider>,
    pub call_id: String,
    pub shadow_model: String,
    pub system_prompt: Option<String>,
    pub input: String,
    pub tools: Vec<String>,
    pub memory: MemoryContext,
    pub primary_output: String,
    pub secrets: Vec<String>,
    pub metrics: Arc<AiMetrics>,
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

/// 启动对照调用；返回的句柄仅供测试等待
pub fn spawn_shadow_compare(compare: ShadowCompare) -> JoinHandle<()> {
    tokio::spawn(async move {
        let request = AskRequest {
            model: &compare.shadow_model,
            system_prompt: compare.system_prompt.as_deref(),
            user_input: &compare.input,
            tools: &compare.tools,
            memory: &compare.memory,
            tool_results: &[],
            seed: None,
        };
        let result = tokio::select! {
            _ = compare.cancel.cancelled() => {
                tracing::debug!(call_id = %compare.call_id, "shadow call cancelled");
                return;
            }
            r = tokio::time::timeout(compare.timeout, compare.provider.ask(request)) => r,
        };
        match result {
            Ok(Ok(response)) => {
                let shadow_output = normalize_ai_text(&response.output, &compare.secrets);
                let matched = shadow_output == compare.primary_output;
                compare.metrics.record_shadow(Some(matched));
                tracing::info!(
                    event = "shadow_compare",
                    call_id = %compare.call_id,
                    shadow_model = %compare.shadow_model,
                    matched,
                    "shadow compare finished"
                );
            }
            Ok(Err(e)) => {
                compare.metrics.record_shadow(None);
                tracing::warn!(call_id = %compare.call_id, shadow_model = %compare.shadow_model, error = %e, "shadow call failed");
            }
            Err(_) => {
                compare.metrics.record_shadow(None);
                tracing::warn!(call_id = %compare.call_id, shadow_model = %compare.shadow_model, "shadow call timed out");
            }
        }
    })
}
