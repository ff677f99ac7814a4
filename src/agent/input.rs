//! Agent 输入：表达式求值与按输入模式规范化

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::core::error::{Result, RuntimeError};

/// 输入模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    /// 标量文本
    #[default]
    Text,
    /// 任意 JSON，规范化为稳定文本并保留结构化形式
    Structured,
}

impl InputMode {
    pub fn format_tag(&self) -> &'static str {
        match self {
            InputMode::Text => "text",
            InputMode::Structured => "structured",
        }
    }
}

/// 调用点上的输入表达式
#[derive(Debug, Clone, PartialEq)]
pub enum InputExpr {
    Literal(Value),
    /// 局部变量
    Var(String),
    /// 路径：首段为 `state` / `identity` 或局部变量名
    Path(Vec<String>),
}

impl InputExpr {
    pub fn text(s: impl Into<String>) -> Self {
        InputExpr::Literal(Value::String(s.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        InputExpr::Var(name.into())
    }

    /// `"state.ticket.id"` 形式
    pub fn path(dotted: &str) -> Self {
        InputExpr::Path(dotted.split('.').map(str::to_string).collect())
    }

    pub fn evaluate(&self, state: &Value, identity: &Value, locals: &HashMap<String, Value>) -> Result<Value> {
        match self {
            InputExpr::Literal(v) => Ok(v.clone()),
            InputExpr::Var(name) => locals
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidInput(format!("unknown variable '{}'", name))),
            InputExpr::Path(segments) => {
                let (head, rest) = segments
                    .split_first()
                    .ok_or_else(|| RuntimeError::InvalidInput("empty input path".to_string()))?;
                let root = match head.as_str() {
                    "state" => state,
                    "identity" => identity,
                    name => locals
                        .get(name)
                        .ok_or_else(|| RuntimeError::InvalidInput(format!("unknown variable '{}'", name)))?,
                };
                let mut current = root;
                for seg in rest {
                    current = match current {
                        Value::Object(map) => map.get(seg),
                        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        RuntimeError::InvalidInput(format!("path '{}' not found", segments.join(".")))
                    })?;
                }
                Ok(current.clone())
            }
        }
    }
}

/// 规范化后的 AI 输入
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInput {
    pub text: String,
    pub structured: Option<Value>,
    pub format: &'static str,
}

pub fn prepare_ai_input(value: Value, mode: InputMode) -> Result<PreparedInput> {
    match mode {
        InputMode::Text => {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(RuntimeError::InvalidInput(format!(
                        "text input must be a scalar, got {}",
                        type_name(&other)
                    )))
                }
            };
            Ok(PreparedInput {
                text,
                structured: None,
                format: mode.format_tag(),
            })
        }
        InputMode::Structured => Ok(PreparedInput {
            // serde_json 的 Map 默认按键排序，序列化结果稳定
            text: value.to_string(),
            structured: Some(value),
            format: mode.format_tag(),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// 输出统一为对象；标量放入 `text` 键
pub fn ensure_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert("text".to_string(), other);
            Value::Object(map)
        }
    }
}
