//! 会话管理器
//!
//! 索引（会话表、(项目, 用户) → 会话、任务 → 会话）由一把读写锁保护；每个会话再有自己的互斥锁，
//! 历史的写入在会话锁内串行，不同会话完全并行。
//! 锁顺序：持有会话锁时可以再取索引锁，反之不行。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{Session, SessionStatus};
use crate::config::SessionSection;
use crate::core::OrchestratorError;
use crate::task::{ProjectId, SessionId, Task, TaskFailure, TaskId, TaskRequest, TaskStatus, UserId};

/// 准入被拒时建议的重试间隔
const ADMISSION_RETRY_AFTER_SECS: u64 = 5;

struct SessionSlot {
    project_id: ProjectId,
    session: Arc<Mutex<Session>>,
}

#[derive(Default)]
struct SessionIndex {
    sessions: HashMap<SessionId, SessionSlot>,
    /// 当前未关闭的会话
    owners: HashMap<(ProjectId, UserId), SessionId>,
    tasks: HashMap<TaskId, SessionId>,
}

/// 会话管理器
pub struct SessionManager {
    index: RwLock<SessionIndex>,
    config: SessionSection,
}

impl SessionManager {
    pub fn new(config: SessionSection) -> Self {
        Self {
            index: RwLock::new(SessionIndex::default()),
            config,
        }
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, OrchestratorError> {
        self.index
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.session.clone())
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    /// 获取 (项目, 用户) 的当前会话，没有则创建；并发调用返回同一个会话
    pub async fn get_or_create_session(&self, project_id: &str, user_id: &str) -> Session {
        let mut index = self.index.write().await;
        let key = (project_id.to_string(), user_id.to_string());
        let existing = index
            .owners
            .get(&key)
            .and_then(|id| index.sessions.get(id))
            .map(|slot| slot.session.clone());
        if let Some(session) = existing {
            drop(index);
            let mut session = session.lock().await;
            session.touch();
            return session.clone();
        }

        let session = Session::new(project_id.to_string(), user_id.to_string());
        let snapshot = session.clone();
        index.owners.insert(key, session.id.clone());
        index.sessions.insert(
            session.id.clone(),
            SessionSlot {
                project_id: project_id.to_string(),
                session: Arc::new(Mutex::new(session)),
            },
        );
        tracing::info!(session_id = %snapshot.id, project_id, user_id, "session created");
        snapshot
    }

    /// 追加一个 queued 任务，历史槽位在提交时占定
    pub async fn submit_task(
        &self,
        session_id: &str,
        request: TaskRequest,
    ) -> Result<Task, OrchestratorError> {
        let slot = self.slot(session_id).await?;
        let task = {
            let mut session = slot.lock().await;
            if session.is_closed() {
                return Err(OrchestratorError::SessionClosed(session_id.to_string()));
            }
            if session.pending_count() >= self.config.max_pending_tasks {
                tracing::warn!(session_id, pending = session.pending_count(), "task admission rejected");
                return Err(OrchestratorError::RateLimited {
                    retry_after_secs: ADMISSION_RETRY_AFTER_SECS,
                });
            }
            let task = Task::new(
                session.id.clone(),
                session.project_id.clone(),
                session.user_id.clone(),
                request,
            );
            session.task_history.push(task.clone());
            session.touch();
            session.refresh_status();
            task
        };
        self.index
            .write()
            .await
            .tasks
            .insert(task.id.clone(), session_id.to_string());
        Ok(task)
    }

    /// 用任务的新状态更新历史槽位
    ///
    /// 会话已关闭、任务不存在或状态回退时返回 false，调用方应丢弃该事件。
    pub async fn record_transition(&self, task: &Task) -> bool {
        let Ok(slot) = self.slot(&task.session_id).await else {
            return false;
        };
        let mut session = slot.lock().await;
        if session.is_closed() {
            tracing::debug!(task_id = %task.id, "session closed, transition discarded");
            return false;
        }
        let Some(entry) = session.task_history.iter_mut().find(|t| t.id == task.id) else {
            return false;
        };
        if entry.status != task.status && !entry.status.can_advance_to(task.status) {
            tracing::warn!(
                task_id = %task.id,
                from = %entry.status,
                to = %task.status,
                "non-monotonic task transition ignored"
            );
            return false;
        }
        *entry = task.clone();
        session.touch();
        session.refresh_status();
        true
    }

    /// 运行中被关闭的任务：结果丢弃，历史槽位以 SessionClosedError 收尾
    ///
    /// 返回收尾后的任务；槽位已是终态或不存在时返回 None。
    pub async fn settle_discarded(&self, task: &Task) -> Option<Task> {
        let slot = self.slot(&task.session_id).await.ok()?;
        let mut session = slot.lock().await;
        let entry = session.task_history.iter_mut().find(|t| t.id == task.id)?;
        if !entry.fail(TaskFailure::interrupted()) {
            return None;
        }
        entry.retry_count = task.retry_count;
        let settled = entry.clone();
        session.refresh_status();
        Some(settled)
    }

    /// 重连时取回完整会话（含历史）
    pub async fn resume(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let slot = self.slot(session_id).await?;
        let session = slot.lock().await;
        Ok(session.clone())
    }

    /// 会话的取消令牌
    pub async fn cancel_token(&self, session_id: &str) -> Option<CancellationToken> {
        let slot = self.slot(session_id).await.ok()?;
        let session = slot.lock().await;
        Some(session.cancel.clone())
    }

    /// 关闭会话：排队中的任务以 SessionClosedError 失败，运行中的任务结果将被丢弃
    ///
    /// 返回被取消的任务（已是 failed）。
    pub async fn close(&self, session_id: &str) -> Result<Vec<Task>, OrchestratorError> {
        let slot = {
            let mut index = self.index.write().await;
            let slot = index
                .sessions
                .get(session_id)
                .map(|s| s.session.clone())
                .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
            index.owners.retain(|_, id| id != session_id);
            slot
        };

        let mut session = slot.lock().await;
        if session.is_closed() {
            return Ok(Vec::new());
        }
        session.status = SessionStatus::Closed;
        session.closed_at = Some(Utc::now());
        session.cancel.cancel();

        let mut cancelled = Vec::new();
        for task in session.task_history.iter_mut() {
            if task.status == TaskStatus::Queued && task.fail(TaskFailure::session_closed()) {
                cancelled.push(task.clone());
            }
        }
        tracing::info!(
            session_id,
            cancelled = cancelled.len(),
            "session closed"
        );
        Ok(cancelled)
    }

    /// 级联关闭项目下的全部会话
    pub async fn close_project(&self, project_id: &str) -> Vec<Task> {
        let ids: Vec<SessionId> = self
            .index
            .read()
            .await
            .sessions
            .iter()
            .filter(|(_, slot)| slot.project_id == project_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut cancelled = Vec::new();
        for id in ids {
            if let Ok(tasks) = self.close(&id).await {
                cancelled.extend(tasks);
            }
        }
        cancelled
    }

    /// 关闭超过不活跃窗口的空闲会话，清除关闭已久的会话；返回新关闭的会话 ID
    pub async fn sweep(&self) -> Vec<SessionId> {
        let idle_timeout = chrono::Duration::seconds(self.config.idle_timeout_secs as i64);
        let slots: Vec<(SessionId, Arc<Mutex<Session>>)> = self
            .index
            .read()
            .await
            .sessions
            .iter()
            .map(|(id, slot)| (id.clone(), slot.session.clone()))
            .collect();

        let mut expired = Vec::new();
        let mut purge = Vec::new();
        for (id, slot) in slots {
            let session = slot.lock().await;
            if session.is_expired(idle_timeout) {
                expired.push(id);
            } else if session
                .closed_at
                .map(|at| Utc::now() - at > idle_timeout)
                .unwrap_or(false)
            {
                purge.push(id);
            }
        }

        for id in &expired {
            if let Err(e) = self.close(id).await {
                tracing::warn!(session_id = %id, error = %e, "sweep close failed");
            }
        }
        if !purge.is_empty() {
            let mut index = self.index.write().await;
            for id in &purge {
                index.sessions.remove(id);
            }
            index.tasks.retain(|_, sid| !purge.contains(sid));
        }
        if !expired.is_empty() || !purge.is_empty() {
            tracing::info!(closed = expired.len(), purged = purge.len(), "session sweep");
        }
        expired
    }

    /// 按任务 ID 查找（轮询用）
    pub async fn find_task(&self, task_id: &str) -> Option<Task> {
        let session_id = self.index.read().await.tasks.get(task_id).cloned()?;
        let slot = self.slot(&session_id).await.ok()?;
        let session = slot.lock().await;
        session.task(task_id).cloned()
    }

    /// 未关闭的会话数
    pub async fn open_count(&self) -> usize {
        self.index.read().await.owners.len()
    }
}
