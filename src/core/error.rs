//! 错误分类与错误码
//!
//! ToolError 是能力与执行器之间传递的失败分类，决定是否重试；
//! OrchestratorError 是对外接口的同步失败（任务从未进入 queued）。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误码（写入 failed 任务，随响应返回给客户端）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    UnsupportedTaskError,
    ToolUnavailableError,
    RateLimitedError,
    TimeoutError,
    MalformedResponseError,
    SessionClosedError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::UnsupportedTaskError => "UnsupportedTaskError",
            ErrorCode::ToolUnavailableError => "ToolUnavailableError",
            ErrorCode::RateLimitedError => "RateLimitedError",
            ErrorCode::TimeoutError => "TimeoutError",
            ErrorCode::MalformedResponseError => "MalformedResponseError",
            ErrorCode::SessionClosedError => "SessionClosedError",
        };
        f.write_str(s)
    }
}

/// 工具调用失败（能力实现与 TaskExecutor 共用）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Invalid task input: {0}")]
    Validation(String),

    #[error("Unsupported task type: {0}")]
    UnsupportedTask(String),

    #[error("Tool unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed tool response: {0}")]
    MalformedResponse(String),
}

impl ToolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::Validation(_) => ErrorCode::ValidationError,
            ToolError::UnsupportedTask(_) => ErrorCode::UnsupportedTaskError,
            ToolError::Unavailable(_) => ErrorCode::ToolUnavailableError,
            ToolError::RateLimited { .. } => ErrorCode::RateLimitedError,
            ToolError::Timeout(_) => ErrorCode::TimeoutError,
            ToolError::MalformedResponse(_) => ErrorCode::MalformedResponseError,
        }
    }

    /// 瞬时错误：上游不可用或超时，可重试
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Unavailable(_) | ToolError::Timeout(_))
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ToolError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// 面向用户的提示文案
    pub fn user_message(&self) -> String {
        match self {
            ToolError::Unavailable(_) => "The FDA data service is currently unavailable. \
                You can retry shortly, search the FDA databases directly, \
                or continue with another analysis step."
                .to_string(),
            ToolError::RateLimited { retry_after_secs } => format!(
                "Too many requests to the data source. Please retry in {} seconds.",
                retry_after_secs
            ),
            ToolError::Timeout(_) => {
                "The analysis took too long to complete. Please try again.".to_string()
            }
            ToolError::MalformedResponse(_) => {
                "The data source returned an unexpected response. Please try again.".to_string()
            }
            ToolError::Validation(msg) => format!("Invalid request: {}", msg),
            ToolError::UnsupportedTask(name) => format!("Unsupported command: {}", name),
        }
    }
}

/// 编排器对外接口的同步错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Too many pending tasks, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Validation(_)
            | OrchestratorError::UnknownProject(_)
            | OrchestratorError::SessionNotFound(_)
            | OrchestratorError::TaskNotFound(_) => ErrorCode::ValidationError,
            OrchestratorError::SessionClosed(_) => ErrorCode::SessionClosedError,
            OrchestratorError::RateLimited { .. } => ErrorCode::RateLimitedError,
            OrchestratorError::Persistence(_) => ErrorCode::ToolUnavailableError,
        }
    }
}

/// 外部存储协作方的错误
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
