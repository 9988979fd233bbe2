//! 任务数据模型
//!
//! Task 的状态单调推进：queued → running → {completed | failed}；
//! queued 也可直接进入 failed（会话关闭时取消）。失败任务只能以新 Task 重新提交，不原地修改。

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::ToolResult;
use crate::core::{ErrorCode, ToolError};

/// 任务 ID
pub type TaskId = String;
/// 会话 ID
pub type SessionId = String;
/// 项目 ID
pub type ProjectId = String;
/// 用户 ID
pub type UserId = String;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// 进程内单调递增的提交序号
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// 见到持久化的序号后，保证之后分配的序号更大
pub fn observe_sequence(seen: u64) {
    NEXT_SEQUENCE.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ClassifyDevice,
    PredicateSearch,
    FindGuidance,
    ComparePredicate,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::ClassifyDevice,
        TaskType::PredicateSearch,
        TaskType::FindGuidance,
        TaskType::ComparePredicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ClassifyDevice => "classify_device",
            TaskType::PredicateSearch => "predicate_search",
            TaskType::FindGuidance => "find_guidance",
            TaskType::ComparePredicate => "compare_predicate",
        }
    }

    /// 对应的斜杠命令
    pub fn command(&self) -> &'static str {
        match self {
            TaskType::ClassifyDevice => "/classify-device",
            TaskType::PredicateSearch => "/predicate-search",
            TaskType::FindGuidance => "/find-guidance",
            TaskType::ComparePredicate => "/compare-predicate",
        }
    }

    pub fn from_command(token: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.command().eq_ignore_ascii_case(token))
    }

    /// 评分类任务：completed 时必须带 confidence
    pub fn is_scoring(&self) -> bool {
        !matches!(self, TaskType::FindGuidance)
    }

    /// 帮助文案中的用法说明
    pub fn usage(&self) -> &'static str {
        match self {
            TaskType::ClassifyDevice => "/classify-device <device description>",
            TaskType::PredicateSearch => "/predicate-search <device name or keywords>",
            TaskType::FindGuidance => "/find-guidance <topic>",
            TaskType::ComparePredicate => "/compare-predicate <K-number> [device description]",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type: {}", s))
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 是否允许从当前状态推进到 next
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    /// 排序用的阶段序号
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 任务输入：自由文本 + 结构化参数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TaskInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

/// 待提交的任务请求（解析完成、尚未分配 ID）
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_type: TaskType,
    pub input: TaskInput,
    pub resubmitted_from: Option<TaskId>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType, input: TaskInput) -> Self {
        Self {
            task_type,
            input,
            resubmitted_from: None,
        }
    }

    /// 以失败任务为原型构造重新提交的请求
    pub fn resubmission_of(task: &Task) -> Self {
        Self {
            task_type: task.task_type,
            input: task.input.clone(),
            resubmitted_from: Some(task.id.clone()),
        }
    }
}

/// failed 任务携带的错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub code: ErrorCode,
    /// 面向用户的提示
    pub message: String,
    /// 技术细节（日志 / 排障用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl TaskFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            retry_after: None,
        }
    }

    /// 会话关闭导致的取消
    pub fn session_closed() -> Self {
        Self::new(
            ErrorCode::SessionClosedError,
            "Session closed before the task started",
        )
    }

    /// 运行中被会话关闭打断，结果已丢弃
    pub fn interrupted() -> Self {
        Self::new(
            ErrorCode::SessionClosedError,
            "Session closed while the task was running, result discarded",
        )
    }
}

impl From<&ToolError> for TaskFailure {
    fn from(err: &ToolError) -> Self {
        Self {
            code: err.code(),
            message: err.user_message(),
            detail: Some(err.to_string()),
            retry_after: err.retry_after_secs(),
        }
    }
}

/// 单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub input: TaskInput,
    pub status: TaskStatus,
    pub result: Option<ToolResult>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    /// 提交序号（跨会话排序）
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// 完成时间超过软 SLA
    #[serde(default)]
    pub sla_exceeded: bool,
    #[serde(default)]
    pub resubmitted_from: Option<TaskId>,
}

impl Task {
    pub fn new(
        session_id: SessionId,
        project_id: ProjectId,
        user_id: UserId,
        request: TaskRequest,
    ) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            session_id,
            project_id,
            user_id,
            task_type: request.task_type,
            input: request.input,
            status: TaskStatus::Queued,
            result: None,
            error: None,
            sequence: next_sequence(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            sla_exceeded: false,
            resubmitted_from: request.resubmitted_from,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    /// queued → running；非法转换返回 false 且不修改
    pub fn mark_running(&mut self) -> bool {
        if !self.status.can_advance_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// running → completed
    pub fn complete(&mut self, result: ToolResult) -> bool {
        if !self.status.can_advance_to(TaskStatus::Completed) {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        true
    }

    /// {queued, running} → failed
    pub fn fail(&mut self, failure: TaskFailure) -> bool {
        if !self.status.can_advance_to(TaskStatus::Failed) {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn confidence(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ToolResult;

    fn queued() -> Task {
        Task::new(
            "session_1".into(),
            "project_1".into(),
            "user_1".into(),
            TaskRequest::new(TaskType::ClassifyDevice, TaskInput::text("cardiac monitor")),
        )
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut task = queued();
        assert!(!task.complete(ToolResult::text("early", 0.5)));
        assert!(task.mark_running());
        assert!(!task.mark_running());
        assert!(task.complete(ToolResult::text("done", 0.9)));
        assert!(!task.fail(TaskFailure::new(ErrorCode::TimeoutError, "late")));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_queued_task_can_be_cancelled() {
        let mut task = queued();
        assert!(task.fail(TaskFailure::session_closed()));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.mark_running());
    }

    #[test]
    fn test_sequence_increases() {
        let a = queued();
        let b = queued();
        assert!(b.sequence > a.sequence);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_observed_sequence_is_never_reused() {
        let seen = next_sequence() + 1_000;
        observe_sequence(seen);
        assert!(queued().sequence > seen);
    }

    #[test]
    fn test_command_round_trip() {
        for t in TaskType::ALL {
            assert_eq!(TaskType::from_command(t.command()), Some(t));
            assert_eq!(t.as_str().parse::<TaskType>(), Ok(t));
        }
        assert_eq!(TaskType::from_command("/CLASSIFY-DEVICE"), Some(TaskType::ClassifyDevice));
        assert_eq!(TaskType::from_command("/help"), None);
    }

    #[test]
    fn test_resubmission_references_original() {
        let mut task = queued();
        task.fail(TaskFailure::new(ErrorCode::ToolUnavailableError, "down"));
        let request = TaskRequest::resubmission_of(&task);
        assert_eq!(request.resubmitted_from.as_deref(), Some(task.id.as_str()));
        assert_eq!(request.task_type, TaskType::ClassifyDevice);
    }

    #[test]
    fn test_serializes_type_field() {
        let json = serde_json::to_value(queued()).unwrap();
        assert_eq!(json["type"], "classify_device");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["retryCount"], 0);
    }
}
