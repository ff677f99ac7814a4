//! 可解释性日志：按阶段（generation）与事件类型（start / finish / error）记录输入、种子、provider、模型

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainEventType {
    Start,
    Finish,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainEntry {
    pub stage: String,
    pub event_type: ExplainEventType,
    pub timestamp: String,
    pub seed: u64,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ExplainEntry {
    pub fn generation(event_type: ExplainEventType, seed: u64, provider: &str, model: &str) -> Self {
        Self {
            stage: "generation".to_string(),
            event_type,
            timestamp: Utc::now().to_rfc3339(),
            seed,
            provider: provider.to_string(),
            model: model.to_string(),
            inputs: None,
            outputs: None,
            parameters: None,
            metadata: None,
        }
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
