//! Mock provider（用于测试与演示，无需 API）
//!
//! 纯文本：回显用户输入；带召回记忆时附带条数。不支持工具调用，调用次数可查询。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{AskRequest, Provider, ProviderResponse};
use crate::llm::ProviderError;

/// Mock provider：回显用户输入
#[derive(Debug, Default)]
pub struct MockProvider {
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 实际 ask 次数（缓存命中不计）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ask(&self, request: AskRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let recalled = request.memory.item_count();
        let text = if recalled > 0 {
            format!(
                "[{}] {} ({} memories)",
                request.model, request.user_input, recalled
            )
        } else {
            format!("[{}] {}", request.model, request.user_input)
        };
        Ok(ProviderResponse::text(text))
    }
}
