//! 工具声明与调用策略
//!
//! 由程序中的工具定义生成 JSON Schema 形式的 ToolDeclaration，交给 provider 的工具调用协议；
//! 未定义的工具给出空对象 schema。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::program::{FieldSpec, Program};

/// 单个工具的声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub strict: bool,
}

/// 工具调用循环的策略（执行中只读）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallPolicy {
    pub allow_tools: bool,
    pub max_calls: usize,
    pub max_total_turns: usize,
    pub strict_json: bool,
    pub retry_on_parse_error: bool,
}

impl ToolCallPolicy {
    /// AI 调用使用的固定策略：最多 3 次工具调用、6 轮
    pub fn ai_default() -> Self {
        Self {
            allow_tools: true,
            max_calls: 3,
            max_total_turns: 6,
            strict_json: true,
            retry_on_parse_error: false,
        }
    }
}

impl Default for ToolCallPolicy {
    fn default() -> Self {
        Self::ai_default()
    }
}

fn json_type(type_name: &str) -> &'static str {
    match type_name.trim().to_lowercase().as_str() {
        "text" | "string" => "string",
        "number" | "float" | "decimal" => "number",
        "int" | "integer" => "integer",
        "boolean" | "bool" => "boolean",
        "list" | "array" => "array",
        "json" | "object" | "record" | "map" => "object",
        _ => "string",
    }
}

/// 字段列表转 JSON Schema（object）
pub fn build_json_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        properties.insert(field.name.clone(), json!({"type": json_type(&field.type_name)}));
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }
    let mut schema = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        schema["required"] = Value::Array(required);
    }
    schema
}

/// 按暴露顺序为每个工具名生成声明
pub fn build_declarations(program: &Program, exposed: &[String]) -> Vec<ToolDeclaration> {
    exposed
        .iter()
        .map(|name| match program.tools.get(name) {
            Some(def) => ToolDeclaration {
                name: name.clone(),
                description: def.description.clone(),
                input_schema: build_json_schema(&def.input_fields),
                output_schema: Some(build_json_schema(&def.output_fields)),
                strict: false,
            },
            None => ToolDeclaration {
                name: name.clone(),
                description: None,
                input_schema: json!({"type": "object", "properties": {}}),
                output_schema: None,
                strict: false,
            },
        })
        .collect()
}
