//! 确定性种子
//!
//! 优先级：结构化输入中的 `seed` → 全局配置 determinism.seed → (model, input, profile, flow, input_format, provider) 的哈希。
//! 种子只用于可解释性日志与接受显式种子的 provider，不影响 provider 选择。

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// 哈希派生所需的调用属性
#[derive(Debug, Clone, Copy)]
pub struct SeedInputs<'a> {
    pub model: &'a str,
    pub user_input: &'a str,
    pub ai_profile: &'a str,
    pub flow: Option<&'a str>,
    pub input_format: &'a str,
    pub provider: &'a str,
}

pub fn derive_seed(structured: Option<&Value>, global: Option<u64>, inputs: &SeedInputs<'_>) -> u64 {
    explicit_seed(structured)
        .or(global)
        .unwrap_or_else(|| hashed_seed(inputs))
}

fn explicit_seed(structured: Option<&Value>) -> Option<u64> {
    match structured?.get("seed")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn hashed_seed(inputs: &SeedInputs<'_>) -> u64 {
    let canonical = json!({
        "model": inputs.model,
        "input": inputs.user_input,
        "ai_profile": inputs.ai_profile,
        "flow": inputs.flow,
        "input_format": inputs.input_format,
        "provider": inputs.provider,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
