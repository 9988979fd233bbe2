//! 重试策略
//!
//! 唯一的重试/退避实现，仅由 TaskExecutor 使用：按错误类别谓词判断是否重试，
//! 指数退避（base × 2^n，封顶 max_delay）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::ToolError;

type RetryPredicate = Arc<dyn Fn(&ToolError) -> bool + Send + Sync>;

/// 一次带重试执行的结果：最终结果与实际重试次数
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ToolError>,
    /// 重试次数（不含首次调用）
    pub retries: u32,
}

/// 可复用的重试策略
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    should_retry: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl RetryPolicy {
    /// 默认只重试瞬时错误（上游不可用、超时）
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            should_retry: Arc::new(ToolError::is_transient),
        }
    }

    /// 替换错误类别谓词
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ToolError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 attempt 次重试前的等待时间（attempt 从 0 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, err: &ToolError) -> bool {
        (self.should_retry)(err)
    }

    /// 执行 op，失败且可重试时按退避等待后再次调用；op 的参数为当前尝试序号（从 0 开始）
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        retries: attempt,
                    }
                }
                Err(err) if attempt < self.max_retries && self.should_retry(&err) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return RetryOutcome {
                        result: Err(err),
                        retries: attempt,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(8))
    }
}
