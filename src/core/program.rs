//! 程序定义：Agent / AI Profile / 工具声明
//!
//! 由外层语言编译器产出，加载后只读；多个 agent 可共享同一个 AiProfile。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 记忆空间开关
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub short_term: bool,
    #[serde(default)]
    pub semantic: bool,
    #[serde(default)]
    pub profile: bool,
}

impl MemoryConfig {
    pub fn enabled(&self) -> bool {
        self.short_term || self.semantic || self.profile
    }

    pub fn all() -> Self {
        Self {
            short_term: true,
            semantic: true,
            profile: true,
        }
    }
}

/// AI Profile：模型、provider、系统提示词、暴露的工具与记忆配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiProfile {
    pub name: String,
    pub model: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub exposed_tools: Vec<String>,
    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_provider() -> String {
    "mock".to_string()
}

impl AiProfile {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            provider: default_provider(),
            system_prompt: None,
            exposed_tools: Vec::new(),
            memory: MemoryConfig::default(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// 返回覆盖了系统提示词的新 profile，原值不变
    pub fn with_system_prompt(&self, prompt: Option<String>) -> Self {
        Self {
            system_prompt: prompt,
            ..self.clone()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 追加暴露工具；重复名忽略，保持声明顺序
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: HashSet<String> = self.exposed_tools.iter().cloned().collect();
        for tool in tools {
            let tool = tool.into();
            if seen.insert(tool.clone()) {
                self.exposed_tools.push(tool);
            }
        }
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// provider 名统一小写，缺省为 mock
    pub fn provider_name(&self) -> String {
        let trimmed = self.provider.trim();
        if trimmed.is_empty() {
            default_provider()
        } else {
            trimmed.to_lowercase()
        }
    }
}

/// Agent 声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    /// 显式 id；缺省时由名字派生
    #[serde(default)]
    pub agent_id: Option<String>,
    pub ai_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, ai_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_id: None,
            ai_name: ai_name.into(),
            role: None,
            system_prompt: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn resolved_id(&self) -> String {
        match &self.agent_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => agent_id_from_name(&self.name),
        }
    }
}

/// 由名字派生稳定的 agent id：`agent_` + sha256 前 12 位十六进制
pub fn agent_id_from_name(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.trim().to_lowercase().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("agent_{}", &digest[..12])
}

/// 工具输入/输出字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// text / number / boolean / json / list
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// 程序中的工具定义（ToolDeclaration 由其派生）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub output_fields: Vec<FieldSpec>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_fields: Vec::new(),
            output_fields: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input(mut self, field: FieldSpec) -> Self {
        self.input_fields.push(field);
        self
    }

    pub fn output(mut self, field: FieldSpec) -> Self {
        self.output_fields.push(field);
        self
    }
}

/// 程序定义表：agents / ai_profiles / tools / 常量名
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
    #[serde(default)]
    pub ai_profiles: HashMap<String, AiProfile>,
    #[serde(default)]
    pub tools: HashMap<String, ToolDefinition>,
    #[serde(default)]
    pub constants: HashSet<String>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent: AgentProfile) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn ai(mut self, profile: AiProfile) -> Self {
        self.ai_profiles.insert(profile.name.clone(), profile);
        self
    }

    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    pub fn constant(mut self, name: impl Into<String>) -> Self {
        self.constants.insert(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_does_not_mutate_shared_profile() {
        let shared = AiProfile::new("assistant", "mock-1").with_prompt("base");
        let overridden = shared.with_system_prompt(Some("agent prompt".into()));
        assert_eq!(shared.system_prompt.as_deref(), Some("base"));
        assert_eq!(overridden.system_prompt.as_deref(), Some("agent prompt"));
        assert_eq!(overridden.model, shared.model);
    }

    #[test]
    fn test_agent_id_is_stable() {
        let a = AgentProfile::new("Triage", "assistant");
        let b = AgentProfile::new("triage", "assistant");
        assert_eq!(a.resolved_id(), b.resolved_id());
        assert!(a.resolved_id().starts_with("agent_"));
        let explicit = AgentProfile::new("triage", "assistant").with_agent_id("t-1");
        assert_eq!(explicit.resolved_id(), "t-1");
    }

    #[test]
    fn test_tools_keep_order_without_duplicates() {
        let profile = AiProfile::new("a", "m").with_tools(["lookup", "echo", "lookup"]);
        assert_eq!(profile.exposed_tools, vec!["lookup", "echo"]);
    }

    #[test]
    fn test_provider_name_defaults_to_mock() {
        let profile = AiProfile::new("a", "m").with_provider("  OpenAI ");
        assert_eq!(profile.provider_name(), "openai");
        assert_eq!(AiProfile::new("a", "m").with_provider("").provider_name(), "mock");
    }
}
