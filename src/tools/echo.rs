//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::Tool;

/// Echo 工具：回显 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text. Args: {\"text\": \"message\"}"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing 'text' argument".to_string())?;
        Ok(json!({ "text": text }))
    }
}
