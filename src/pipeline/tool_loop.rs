//! 工具调用循环
//!
//! 每轮把消息列表与工具声明交给适配器：
//! - 回复不含工具请求 → FinalAnswer
//! - 含工具请求 → 执行工具、追加结果消息，进入下一轮
//! - 达到 max_calls / max_total_turns → 以最近一次文本正常结束（CallCapReached / TurnCapReached）

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::core::error::{Result, RuntimeError};
use crate::llm::{ChatMessage, ToolCallAdapter, ToolCallRequest};
use crate::pipeline::guarded;
use crate::tools::{ToolCallContext, ToolCallPolicy, ToolDeclaration, ToolExecutor, ToolOutcome};
use crate::trace::{CanonicalEvent, EventMeta, ToolEvent};

/// 循环结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopTermination {
    FinalAnswer,
    TurnCapReached,
    CallCapReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopOutcome {
    pub text: String,
    pub termination: LoopTermination,
    pub tool_calls: usize,
}

pub struct ToolLoop<'a> {
    pub adapter: Arc<dyn ToolCallAdapter>,
    pub executor: Arc<dyn ToolExecutor>,
    pub call_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub declarations: &'a [ToolDeclaration],
    pub policy: ToolCallPolicy,
    pub call: ToolCallContext,
    pub request_timeout: Duration,
}

impl ToolLoop<'_> {
    fn meta(&self) -> EventMeta {
        EventMeta::new(self.call_id, self.provider, self.model)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declarations.iter().any(|d| d.name == name)
    }

    /// strict_json 下字符串参数须能解析为 JSON 对象
    fn parse_arguments(&self, request: &ToolCallRequest) -> std::result::Result<Value, String> {
        match &request.arguments {
            Value::Object(_) => Ok(request.arguments.clone()),
            Value::Null => Ok(Value::Object(Default::default())),
            Value::String(raw) if self.policy.strict_json => {
                match serde_json::from_str::<Value>(raw) {
                    Ok(v @ Value::Object(_)) => Ok(v),
                    Ok(_) => Err("arguments must be a JSON object".to_string()),
                    Err(e) => Err(format!("arguments are not valid JSON: {e}")),
                }
            }
            other if self.policy.strict_json => {
                Err(format!("arguments must be a JSON object, got {other}"))
            }
            other => Ok(other.clone()),
        }
    }

    pub async fn run(
        mut self,
        events: &mut Vec<CanonicalEvent>,
        tool_events: &mut Vec<ToolEvent>,
    ) -> Result<ToolLoopOutcome> {
        let mut calls = 0usize;
        let mut last_text = String::new();

        for turn in 0..self.policy.max_total_turns {
            let assistant = guarded(
                &self.call.cancel,
                self.request_timeout,
                self.adapter
                    .next_turn(self.model, &self.messages, self.declarations, &self.policy),
            )
            .await?;
            for diagnostic in &assistant.diagnostics {
                events.push(CanonicalEvent::provider_error(
                    self.call_id,
                    self.provider,
                    self.model,
                    diagnostic.clone(),
                ));
            }
            if let Some(text) = assistant.text.as_deref().filter(|t| !t.trim().is_empty()) {
                last_text = text.to_string();
            }
            if assistant.tool_calls.is_empty() || !self.policy.allow_tools {
                return Ok(ToolLoopOutcome {
                    text: last_text,
                    termination: LoopTermination::FinalAnswer,
                    tool_calls: calls,
                });
            }

            tracing::debug!(call_id = %self.call_id, turn, requested = assistant.tool_calls.len(), "tool turn");
            self.messages.push(ChatMessage::assistant_tool_calls(
                assistant.text.clone().unwrap_or_default(),
                assistant.tool_calls.clone(),
            ));

            for request in &assistant.tool_calls {
                if calls >= self.policy.max_calls {
                    return Ok(ToolLoopOutcome {
                        text: last_text,
                        termination: LoopTermination::CallCapReached,
                        tool_calls: calls,
                    });
                }
                let args = match self.parse_arguments(request) {
                    Ok(args) => args,
                    Err(message) if !self.policy.retry_on_parse_error => {
                        return Err(RuntimeError::ToolArgumentsInvalid {
                            tool: request.name.clone(),
                            message,
                        });
                    }
                    Err(message) => {
                        let outcome = ToolOutcome::failed("ToolArgumentsInvalid", message);
                        self.messages.push(ChatMessage::tool_result(
                            &request.id,
                            &request.name,
                            &outcome.to_result_value(),
                        ));
                        continue;
                    }
                };

                tool_events.push(ToolEvent::Call {
                    tool_call_id: request.id.clone(),
                    name: request.name.clone(),
                    arguments: args.clone(),
                });
                events.push(CanonicalEvent::tool_requested(self.meta(), &request.id, &request.name, &args));

                let started = Instant::now();
                let outcome = if self.is_declared(&request.name) {
                    calls += 1;
                    self.executor.execute(&request.name, args, &self.call).await
                } else {
                    ToolOutcome::failed(
                        "ToolNotDeclared",
                        format!("Tool '{}' is not exposed to this AI", request.name),
                    )
                };
                if self.call.cancel.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                let result = outcome.to_result_value();
                match &outcome {
                    ToolOutcome::Ok(value) => events.push(CanonicalEvent::tool_completed(
                        self.meta(),
                        &request.id,
                        &request.name,
                        value,
                        duration_ms,
                    )),
                    ToolOutcome::Failed { error_type, message } => {
                        events.push(CanonicalEvent::tool_failed(
                            self.meta(),
                            &request.id,
                            &request.name,
                            error_type,
                            message,
                            duration_ms,
                        ))
                    }
                }
                tool_events.push(ToolEvent::Result {
                    tool_call_id: request.id.clone(),
                    name: request.name.clone(),
                    ok: outcome.is_ok(),
                    result: result.clone(),
                });
                self.messages
                    .push(ChatMessage::tool_result(&request.id, &request.name, &result));
            }
        }

        Ok(ToolLoopOutcome {
            text: last_text,
            termination: LoopTermination::TurnCapReached,
            tool_calls: calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::llm::{AssistantTurn, ProviderError};

    /// 按脚本逐轮回复的适配器
    struct Scripted {
        turns: Mutex<Vec<AssistantTurn>>,
    }

    impl Scripted {
        fn new(mut turns: Vec<AssistantTurn>) -> Arc<Self> {
            turns.reverse();
            Arc::new(Self {
                turns: Mutex::new(turns),
            })
        }
    }

    #[async_trait]
    impl ToolCallAdapter for Scripted {
        async fn next_turn(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolDeclaration],
            _policy: &ToolCallPolicy,
        ) -> std::result::Result<AssistantTurn, ProviderError> {
            let next = self.turns.lock().unwrap().pop();
            Ok(next.unwrap_or_else(|| AssistantTurn::tool_call("again", "lookup", json!({"id": 1}))))
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for Counting {
        async fn execute(&self, _name: &str, args: Value, _call: &ToolCallContext) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutcome::Ok(json!({"echo": args}))
        }
    }

    fn lookup_decl() -> Vec<ToolDeclaration> {
        vec![ToolDeclaration {
            name: "lookup".into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {}}),
            output_schema: None,
            strict: false,
        }]
    }

    fn tool_loop<'a>(
        adapter: Arc<dyn ToolCallAdapter>,
        executor: Arc<dyn ToolExecutor>,
        decls: &'a [ToolDeclaration],
    ) -> ToolLoop<'a> {
        ToolLoop {
            adapter,
            executor,
            call_id: "c1",
            provider: "scripted",
            model: "m",
            messages: vec![ChatMessage::user("hi")],
            declarations: decls,
            policy: ToolCallPolicy::ai_default(),
            call: ToolCallContext::default(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_final_answer_after_one_tool() {
        let adapter = Scripted::new(vec![
            AssistantTurn::tool_call("t1", "lookup", json!({"id": 42})),
            AssistantTurn::final_answer("ticket 42 is open"),
        ]);
        let executor = Arc::new(Counting::default());
        let decls = lookup_decl();
        let (mut events, mut tool_events) = (Vec::new(), Vec::new());
        let outcome = tool_loop(adapter, executor.clone(), &decls)
            .run(&mut events, &mut tool_events)
            .await
            .unwrap();
        assert_eq!(outcome.termination, LoopTermination::FinalAnswer);
        assert_eq!(outcome.text, "ticket 42 is open");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tool_events.len(), 2);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["tool_call_requested", "tool_call_completed"]);
    }

    #[tokio::test]
    async fn test_call_cap_is_normal_termination() {
        let adapter = Scripted::new(vec![]);
        let executor = Arc::new(Counting::default());
        let decls = lookup_decl();
        let (mut events, mut tool_events) = (Vec::new(), Vec::new());
        let outcome = tool_loop(adapter, executor.clone(), &decls)
            .run(&mut events, &mut tool_events)
            .await
            .unwrap();
        assert_eq!(outcome.termination, LoopTermination::CallCapReached);
        assert_eq!(outcome.tool_calls, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_turn_cap_with_undeclared_tool() {
        let adapter = Scripted::new(vec![]);
        let executor = Arc::new(Counting::default());
        let (mut events, mut tool_events) = (Vec::new(), Vec::new());
        let outcome = tool_loop(adapter, executor.clone(), &[])
            .run(&mut events, &mut tool_events)
            .await
            .unwrap();
        assert_eq!(outcome.termination, LoopTermination::TurnCapReached);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(events.iter().all(|e| e.kind() != "tool_call_completed"));
    }

    #[tokio::test]
    async fn test_strict_json_rejects_bad_arguments() {
        let adapter = Scripted::new(vec![AssistantTurn::tool_call("t1", "lookup", json!("{not json"))]);
        let executor = Arc::new(Counting::default());
        let decls = lookup_decl();
        let (mut events, mut tool_events) = (Vec::new(), Vec::new());
        let err = tool_loop(adapter, executor, &decls)
            .run(&mut events, &mut tool_events)
            .await
            .unwrap_err();
        assert_eq!(err.class_name(), "ToolArgumentsInvalid");
    }

    #[tokio::test]
    async fn test_string_arguments_are_parsed() {
        let adapter = Scripted::new(vec![
            AssistantTurn::tool_call("t1", "lookup", json!(r#"{"id": 42}"#)),
            AssistantTurn::final_answer("done"),
        ]);
        let executor = Arc::new(Counting::default());
        let decls = lookup_decl();
        let (mut events, mut tool_events) = (Vec::new(), Vec::new());
        tool_loop(adapter, executor, &decls)
            .run(&mut events, &mut tool_events)
            .await
            .unwrap();
        assert!(matches!(&tool_events[0], ToolEvent::Call { arguments, .. } if arguments["id"] == 42));
    }
}
