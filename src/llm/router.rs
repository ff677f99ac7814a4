//! 模型路由：把声明的模型名映射为实际模型（canary 分流）与可选的 shadow 对照模型
//!
//! 路由是纯计算；ensure_model 可被多个 flow 并发调用，须幂等。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::{ModelRouteSection, RootPaths, RouterSection};
use crate::core::error::{Result, RuntimeError};

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub selected_model: String,
    pub shadow_model: Option<String>,
    pub canary_hit: bool,
}

impl RouteDecision {
    /// 不做任何映射
    pub fn direct(model: &str) -> Self {
        Self {
            selected_model: model.to_string(),
            shadow_model: None,
            canary_hit: false,
        }
    }
}

#[async_trait]
pub trait ModelRouter: Send + Sync {
    /// key 一般为输入文本；同一 (flow, key) 必须得到同一结果
    fn route(&self, declared_model: &str, key: &str, flow_name: Option<&str>) -> RouteDecision;

    /// 确保模型可用（upsert，重复调用无副作用）
    async fn ensure_model(&self, model: &str, roots: &RootPaths) -> Result<()>;
}

/// 配置驱动的 canary / shadow 路由器
#[derive(Debug, Default)]
pub struct CanaryRouter {
    routes: HashMap<String, ModelRouteSection>,
    loaded: RwLock<HashSet<String>>,
}

impl CanaryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(section: &RouterSection) -> Self {
        Self {
            routes: section.models.clone(),
            loaded: RwLock::new(HashSet::new()),
        }
    }

    /// 追加一条路由规则
    pub fn with_route(mut self, declared_model: impl Into<String>, route: ModelRouteSection) -> Self {
        self.routes.insert(declared_model.into(), route);
        self
    }

    /// 已确保可用的模型（按名字排序）
    pub fn loaded_models(&self) -> Vec<String> {
        let mut models: Vec<String> = match self.loaded.read() {
            Ok(set) => set.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        models.sort();
        models
    }
}

/// 稳定分桶：sha256(flow:key) 映射到 [0, 1)
fn bucket(flow_name: Option<&str>, key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(flow_name.unwrap_or("").as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

#[async_trait]
impl ModelRouter for CanaryRouter {
    fn route(&self, declared_model: &str, key: &str, flow_name: Option<&str>) -> RouteDecision {
        let Some(route) = self.routes.get(declared_model) else {
            return RouteDecision::direct(declared_model);
        };
        let mut decision = RouteDecision::direct(declared_model);
        if let Some(target) = route.canary_target.as_deref().filter(|t| !t.is_empty()) {
            if route.canary_fraction > 0.0 && bucket(flow_name, key) < route.canary_fraction {
                decision.selected_model = target.to_string();
                decision.canary_hit = true;
            }
        }
        decision.shadow_model = route
            .shadow_target
            .as_deref()
            .filter(|s| !s.is_empty() && *s != decision.selected_model)
            .map(str::to_string);
        decision
    }

    async fn ensure_model(&self, model: &str, _roots: &RootPaths) -> Result<()> {
        if model.trim().is_empty() {
            return Err(RuntimeError::Router("model name is empty".to_string()));
        }
        let mut loaded = self
            .loaded
            .write()
            .map_err(|_| RuntimeError::Router("model registry lock poisoned".to_string()))?;
        if loaded.insert(model.to_string()) {
            tracing::debug!(model = %model, "model registered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn route(canary: Option<&str>, fraction: f64, shadow: Option<&str>) -> ModelRouteSection {
        ModelRouteSection {
            canary_target: canary.map(str::to_string),
            canary_fraction: fraction,
            shadow_target: shadow.map(str::to_string),
        }
    }

    #[test]
    fn test_unknown_model_passes_through() {
        let router = CanaryRouter::new();
        assert_eq!(router.route("m", "x", None), RouteDecision::direct("m"));
    }

    #[test]
    fn test_full_canary_always_hits() {
        let router = CanaryRouter::new().with_route("m", route(Some("m-next"), 1.0, None));
        let decision = router.route("m", "any input", Some("flow"));
        assert_eq!(decision.selected_model, "m-next");
        assert!(decision.canary_hit);
    }

    #[test]
    fn test_zero_fraction_never_hits() {
        let router = CanaryRouter::new().with_route("m", route(Some("m-next"), 0.0, Some("m-shadow")));
        let decision = router.route("m", "any input", None);
        assert_eq!(decision.selected_model, "m");
        assert!(!decision.canary_hit);
        assert_eq!(decision.shadow_model.as_deref(), Some("m-shadow"));
    }

    #[test]
    fn test_routing_is_stable() {
        let router = CanaryRouter::new().with_route("m", route(Some("m-next"), 0.5, None));
        let first = router.route("m", "ticket #42", Some("support"));
        for _ in 0..10 {
            assert_eq!(router.route("m", "ticket #42", Some("support")), first);
        }
    }

    #[tokio::test]
    async fn test_ensure_model_is_idempotent_under_concurrency() {
        let router = Arc::new(CanaryRouter::new());
        let roots = RootPaths::default();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                let roots = roots.clone();
                tokio::spawn(async move { router.ensure_model("mock-1", &roots).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(router.loaded_models(), vec!["mock-1".to_string()]);
    }
}
