//! LLM 层：provider 抽象、注册表、模型路由、输出归一化与 Mock 实现

pub mod message;
pub mod mock;
pub mod normalize;
pub mod router;
pub mod traits;

use std::collections::HashMap;
use std::sync::Arc;

pub use message::{initial_messages, ChatMessage, Role, ToolCallRequest};
pub use mock::MockProvider;
pub use normalize::{normalize_ai_text, redact_secrets};
pub use router::{CanaryRouter, ModelRouter, RouteDecision};
pub use traits::{
    AskRequest, AssistantTurn, Provider, ProviderCapabilities, ProviderDiagnostic, ProviderError,
    ProviderResponse, ToolCallAdapter,
};

use crate::core::error::{Result, RuntimeError};

/// 按名字（小写）索引的 provider 集合
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 provider；同名覆盖
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().trim().to_lowercase(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownProvider(name.to_string()))
    }

    /// 工具调用适配器；未注册或不支持工具时为 None
    pub fn tool_adapter(&self, name: &str) -> Option<Arc<dyn ToolCallAdapter>> {
        self.providers
            .get(&name.trim().to_lowercase())
            .and_then(|p| p.tool_adapter())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_case_insensitive() {
        let registry = ProviderRegistry::new().with(Arc::new(MockProvider::new()));
        assert!(registry.resolve(" Mock ").is_ok());
        assert!(registry.tool_adapter("mock").is_none());
        assert!(matches!(
            registry.resolve("openai"),
            Err(RuntimeError::UnknownProvider(_))
        ));
    }
}
