//! 任务调度：并行 agent 块的在途上限
//!
//! 并行块中的每个条目先取得许可再执行；许可数即同时在途的 agent 数（1..=3）。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::error::{Result, RuntimeError};
use crate::core::PARALLEL_AGENT_LIMIT;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl TaskScheduler {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.clamp(1, PARALLEL_AGENT_LIMIT);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// 获取执行许可；等待期间取消则返回 Cancelled
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RuntimeError::Cancelled)
            }
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(PARALLEL_AGENT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_is_clamped() {
        assert_eq!(TaskScheduler::new(0).max_in_flight(), 1);
        assert_eq!(TaskScheduler::new(10).max_in_flight(), PARALLEL_AGENT_LIMIT);
    }

    #[tokio::test]
    async fn test_acquire_respects_cancel() {
        let scheduler = TaskScheduler::new(1);
        let token = CancellationToken::new();
        let _held = scheduler.acquire(&token).await.unwrap();
        token.cancel();
        assert!(matches!(
            scheduler.acquire(&token).await,
            Err(RuntimeError::Cancelled)
        ));
    }
}
