//! 运行时配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGENTFLOW__*` 覆盖（双下划线表示嵌套，如 `AGENTFLOW__DETERMINISM__SEED=7`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub runtime: RuntimeSection,
    pub llm: LlmSection,
    pub determinism: DeterminismSection,
    pub cache: CacheSection,
    pub tools: ToolsSection,
    pub secrets: SecretsSection,
    pub router: RouterSection,
}

/// [app] 段：应用名与路径（传给记忆协作方与路由器）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    pub project_root: Option<PathBuf>,
    pub app_path: Option<PathBuf>,
}

/// 协作方（记忆、路由器）所需的根路径
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootPaths {
    pub project_root: Option<PathBuf>,
    pub app_path: Option<PathBuf>,
}

impl AppSection {
    pub fn root_paths(&self) -> RootPaths {
        RootPaths {
            project_root: self.project_root.clone(),
            app_path: self.app_path.clone(),
        }
    }
}

/// 并行块的执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// 有界并发，结果与 trace 按声明顺序合并
    #[default]
    Concurrent,
    /// 严格按声明顺序逐个执行
    Sequential,
}

/// [runtime] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    #[serde(default)]
    pub parallel_mode: ParallelMode,
    /// 并行块同时在途的 agent 数，取值 1..=3
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    3
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            parallel_mode: ParallelMode::default(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl RuntimeSection {
    pub fn effective_in_flight(&self) -> usize {
        self.max_in_flight.clamp(1, crate::core::PARALLEL_AGENT_LIMIT)
    }
}

/// [llm] 段：默认 provider 与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// AI profile 未声明 provider 时使用
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "mock".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 provider 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [determinism] 段：全局种子
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeterminismSection {
    pub seed: Option<u64>,
}

/// [cache] 段：纯文本调用缓存
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_max_entries() -> usize {
    512
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [secrets] 段：输出文本中需要脱敏的值
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecretsSection {
    /// 字面量密钥
    #[serde(default)]
    pub values: Vec<String>,
    /// 环境变量名，取其值作为密钥
    #[serde(default)]
    pub env: Vec<String>,
}

impl SecretsSection {
    /// 展开为实际密钥值（忽略空值与未设置的变量）
    pub fn resolve(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .values
            .iter()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect();
        for name in &self.env {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    out.push(value);
                }
            }
        }
        out
    }
}

/// [router] 段：按声明模型名配置 canary / shadow
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouterSection {
    #[serde(default)]
    pub models: HashMap<String, ModelRouteSection>,
}

/// [router.models.<name>]
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelRouteSection {
    pub canary_target: Option<String>,
    /// 命中 canary 的流量比例，0..=1
    #[serde(default)]
    pub canary_fraction: f64,
    pub shadow_target: Option<String>,
}

/// 从 config 目录加载配置，环境变量 AGENTFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGENTFLOW__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGENTFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    fn validate(&self) -> Result<(), config::ConfigError> {
        for (model, route) in &self.router.models {
            if !(0.0..=1.0).contains(&route.canary_fraction) {
                return Err(config::ConfigError::Message(format!(
                    "router.models.{model}.canary_fraction must be within 0..=1"
                )));
            }
        }
        Ok(())
    }
}
