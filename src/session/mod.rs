//! 会话层：按 (项目, 用户) 维护有序、可恢复的任务历史

mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::{ProjectId, SessionId, Task, UserId};

pub use manager::SessionManager;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// 有排队或运行中的任务
    Active,
    /// 无待办任务，仍在不活跃窗口内
    Idle,
    /// 终态
    Closed,
}

/// 单个会话
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// 提交顺序；终态结果原地更新对应槽位
    pub task_history: Vec<Task>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// 会话关闭时取消尚未开始的任务
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(project_id: ProjectId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            project_id,
            user_id,
            created_at: now,
            status: SessionStatus::Idle,
            task_history: Vec::new(),
            last_activity: now,
            closed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// 排队或运行中的任务数
    pub fn pending_count(&self) -> usize {
        self.task_history.iter().filter(|t| t.is_pending()).count()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.task_history.iter().find(|t| t.id == task_id)
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// 按待办任务重新推导 active / idle
    fn refresh_status(&mut self) {
        if self.is_closed() {
            return;
        }
        self.status = if self.pending_count() > 0 {
            SessionStatus::Active
        } else {
            SessionStatus::Idle
        };
    }

    /// 无待办且超过不活跃窗口
    pub fn is_expired(&self, idle_timeout: chrono::Duration) -> bool {
        !self.is_closed() && self.pending_count() == 0 && Utc::now() - self.last_activity > idle_timeout
    }
}
