//! 可观测性：日志初始化、AI 调用指标与结构化调用日志

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing subscriber；RUST_LOG 未设置时为 info。重复调用无副作用。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 进程级 AI 调用计数器
#[derive(Debug, Default)]
pub struct AiMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    input_chars: AtomicU64,
    output_chars: AtomicU64,
    tool_calls: AtomicU64,
    shadow_calls: AtomicU64,
    shadow_mismatches: AtomicU64,
    shadow_failures: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AiMetricsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub input_chars: u64,
    pub output_chars: u64,
    pub tool_calls: u64,
    pub shadow_calls: u64,
    pub shadow_mismatches: u64,
    pub shadow_failures: u64,
}

impl AiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AiMetricsSnapshot {
        AiMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            input_chars: self.input_chars.load(Ordering::Relaxed),
            output_chars: self.output_chars.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            shadow_calls: self.shadow_calls.load(Ordering::Relaxed),
            shadow_mismatches: self.shadow_mismatches.load(Ordering::Relaxed),
            shadow_failures: self.shadow_failures.load(Ordering::Relaxed),
        }
    }

    pub fn record_failure(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_calls(&self, n: usize) {
        self.tool_calls.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// 一次 shadow 对照的结果；matched 为 None 表示 shadow 调用失败
    pub fn record_shadow(&self, matched: Option<bool>) {
        self.shadow_calls.fetch_add(1, Ordering::Relaxed);
        match matched {
            Some(true) => {}
            Some(false) => {
                self.shadow_mismatches.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.shadow_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// 成功调用的指标更新
pub fn record_ai_metrics(metrics: &AiMetrics, input: &str, output: &str, cache_hit: bool) {
    metrics.calls.fetch_add(1, Ordering::Relaxed);
    if cache_hit {
        metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .input_chars
        .fetch_add(input.chars().count() as u64, Ordering::Relaxed);
    metrics
        .output_chars
        .fetch_add(output.chars().count() as u64, Ordering::Relaxed);
}

/// 调用结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiCallStatus {
    Ok,
    Error,
}

/// 每次 AI 调用一行结构化日志
pub fn record_ai_event(
    status: AiCallStatus,
    call_id: &str,
    provider: &str,
    model: &str,
    duration_ms: u64,
    error_type: Option<&str>,
) {
    match status {
        AiCallStatus::Ok => tracing::info!(
            event = "ai_call",
            status = "ok",
            call_id = %call_id,
            provider = %provider,
            model = %model,
            duration_ms,
            "ai call completed"
        ),
        AiCallStatus::Error => tracing::warn!(
            event = "ai_call",
            status = "error",
            call_id = %call_id,
            provider = %provider,
            model = %model,
            duration_ms,
            error_type = error_type.unwrap_or("unknown"),
            "ai call failed"
        ),
    }
}
