//! 运行时构建器：统一组装程序定义、配置与各协作方
//!
//! Runtime 在多个 flow 运行之间共享（Arc）；缓存与指标是其中唯一的可变共享状态。

use std::sync::Arc;

use crate::config::{AppConfig, RootPaths};
use crate::core::program::Program;
use crate::llm::{CanaryRouter, MockProvider, ModelRouter, Provider, ProviderRegistry};
use crate::memory::{MemoryCollaborator, NoopMemory};
use crate::observability::AiMetrics;
use crate::pipeline::TextCallCache;
use crate::tools::{RegistryToolExecutor, ToolExecutor, ToolRegistry};

/// 共享运行时
pub struct Runtime {
    pub program: Program,
    pub config: AppConfig,
    pub providers: ProviderRegistry,
    pub memory: Arc<dyn MemoryCollaborator>,
    pub router: Option<Arc<dyn ModelRouter>>,
    pub tools: Arc<dyn ToolExecutor>,
    pub cache: TextCallCache,
    pub metrics: Arc<AiMetrics>,
    /// 已展开的密钥值，用于输出脱敏
    pub secrets: Vec<String>,
}

impl Runtime {
    pub fn root_paths(&self) -> RootPaths {
        self.config.app.root_paths()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("agents", &self.program.agents.len())
            .field("ai_profiles", &self.program.ai_profiles.len())
            .field("providers", &self.providers)
            .field("router", &self.router.is_some())
            .finish()
    }
}

/// Runtime 构建器
pub struct RuntimeBuilder {
    program: Program,
    config: AppConfig,
    providers: ProviderRegistry,
    memory: Option<Arc<dyn MemoryCollaborator>>,
    router: Option<Arc<dyn ModelRouter>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    metrics: Option<Arc<AiMetrics>>,
}

impl RuntimeBuilder {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            config: AppConfig::default(),
            providers: ProviderRegistry::new(),
            memory: None,
            router: None,
            tools: None,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.register(provider);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryCollaborator>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// 按 [router] 配置构建 CanaryRouter；未配置任何模型时不启用路由
    pub fn with_config_router(mut self) -> Self {
        if !self.config.router.models.is_empty() {
            self.router = Some(Arc::new(CanaryRouter::from_config(&self.config.router)));
        }
        self
    }

    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 用注册表构建执行器，超时取 tools.tool_timeout_secs
    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.tools = Some(Arc::new(RegistryToolExecutor::new(
            registry,
            self.config.tools.tool_timeout_secs,
        )));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let mut providers = self.providers;
        if providers.resolve("mock").is_err() {
            providers.register(Arc::new(MockProvider::new()));
        }
        let tools = self.tools.unwrap_or_else(|| {
            Arc::new(RegistryToolExecutor::new(
                ToolRegistry::new(),
                self.config.tools.tool_timeout_secs,
            ))
        });
        let secrets = self.config.secrets.resolve();
        Arc::new(Runtime {
            cache: TextCallCache::from_config(&self.config.cache),
            memory: self.memory.unwrap_or_else(|| Arc::new(NoopMemory)),
            metrics: self.metrics.unwrap_or_default(),
            router: self.router,
            program: self.program,
            config: self.config,
            providers,
            tools,
            secrets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let runtime = RuntimeBuilder::new(Program::new()).build();
        assert!(runtime.providers.resolve("mock").is_ok());
        assert!(runtime.router.is_none());
        assert!(runtime.secrets.is_empty());
    }

    #[test]
    fn test_config_router_only_when_configured() {
        let mut config = AppConfig::default();
        let runtime = RuntimeBuilder::new(Program::new())
            .with_config(config.clone())
            .with_config_router()
            .build();
        assert!(runtime.router.is_none());

        config
            .router
            .models
            .insert("m".into(), crate::config::ModelRouteSection::default());
        let runtime = RuntimeBuilder::new(Program::new())
            .with_config(config)
            .with_config_router()
            .build();
        assert!(runtime.router.is_some());
    }
}
