//! 任务执行器
//!
//! 持有 ToolRegistry、重试策略与全局并发许可；execute(task) 调用能力、施加硬超时（软 SLA 的 2 倍）、
//! 重试瞬时错误、在边界校验输出，最终返回 completed / failed 的 Task，错误不会逃逸到调用方。
//! 每次状态转换后通过 TaskEventSink 发出 TaskStatusChanged；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::types::{Task, TaskFailure};
use super::validate::validate_tool_output;
use crate::config::ExecutorSection;
use crate::core::{RetryPolicy, ToolError};
use crate::persistence::Project;
use crate::tools::{InvocationContext, ToolRegistry};

/// 任务状态变化的接收方（TaskStatusChanged 事件）
#[async_trait]
pub trait TaskEventSink: Send + Sync {
    async fn task_status_changed(&self, task: &Task);

    /// 运行中会话被关闭，终态结果被丢弃
    async fn task_discarded(&self, task: &Task);
}

/// 单次执行的上下文：会话取消令牌与项目快照
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// 会话关闭时触发
    pub cancel: CancellationToken,
    pub project: Option<Project>,
}

/// 任务执行器
pub struct TaskExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorSection,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorSection) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            registry,
            config,
            retry,
            permits,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行任务直到终态
    ///
    /// - 会话已取消：queued 任务不会开始执行，原样返回
    /// - 执行期间会话被关闭：结果被丢弃，不发出终态事件，只通知 task_discarded
    pub async fn execute(
        &self,
        mut task: Task,
        ctx: ExecutionContext,
        sink: &dyn TaskEventSink,
    ) -> Task {
        if ctx.cancel.is_cancelled() {
            return task;
        }

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    task.fail(TaskFailure::from(&ToolError::Unavailable(
                        "executor shut down".to_string(),
                    )));
                    sink.task_status_changed(&task).await;
                    return task;
                }
            },
            _ = ctx.cancel.cancelled() => return task,
        };

        if ctx.cancel.is_cancelled() || !task.mark_running() {
            return task;
        }
        sink.task_status_changed(&task).await;

        let task_type = task.task_type;
        let soft_sla = self.config.soft_sla(task_type);
        let hard_ceiling = self.config.hard_ceiling(task_type);
        let registry = Arc::clone(&self.registry);
        let started = Instant::now();

        let outcome = self
            .retry
            .run(|attempt| {
                let registry = Arc::clone(&registry);
                let input = task.input.clone();
                let invocation = InvocationContext {
                    task_id: task.id.clone(),
                    project_id: task.project_id.clone(),
                    session_id: task.session_id.clone(),
                    attempt,
                    project: ctx.project.clone(),
                };
                async move {
                    let attempt_start = Instant::now();
                    let result = match timeout(
                        hard_ceiling,
                        registry.invoke(task_type, &input, &invocation),
                    )
                    .await
                    {
                        Ok(Ok(raw)) => validate_tool_output(task_type, raw),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(ToolError::Timeout(hard_ceiling)),
                    };
                    audit(&invocation, task_type.as_str(), &result, attempt_start.elapsed());
                    result
                }
            })
            .await;

        let elapsed = started.elapsed();
        task.retry_count = outcome.retries;
        task.sla_exceeded = elapsed > soft_sla;
        if task.sla_exceeded {
            tracing::warn!(
                task_id = %task.id,
                task_type = %task_type,
                elapsed_ms = elapsed.as_millis() as u64,
                sla_ms = soft_sla.as_millis() as u64,
                "task exceeded soft SLA"
            );
        }

        match outcome.result {
            Ok(result) => {
                task.complete(result);
            }
            Err(err) => {
                tracing::warn!(task_id = %task.id, code = %err.code(), error = %err, "task failed");
                task.fail(TaskFailure::from(&err));
            }
        }

        if ctx.cancel.is_cancelled() {
            tracing::info!(task_id = %task.id, "session closed during execution, discarding result");
            sink.task_discarded(&task).await;
            return task;
        }

        sink.task_status_changed(&task).await;
        task
    }
}

fn audit(
    ctx: &InvocationContext,
    task_type: &str,
    result: &Result<super::ToolResult, ToolError>,
    duration: Duration,
) {
    let outcome = match result {
        Ok(_) => "ok".to_string(),
        Err(e) => e.code().to_string(),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "task_id": ctx.task_id,
        "task_type": task_type,
        "attempt": ctx.attempt,
        "ok": result.is_ok(),
        "outcome": outcome,
        "duration_ms": duration.as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}
