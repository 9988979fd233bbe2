//! 编排器：对外唯一入口
//!
//! 接收任务请求 → 会话追加 queued 任务 → 后台执行 → 每次 TaskStatusChanged 依次驱动
//! 会话历史、持久化、仪表盘与通知中枢。只有编排器认识其他所有组件，其余组件只依赖数据类型。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::command::{parse_command, ParsedCommand};
use super::response::AgentResponse;
use crate::core::{OrchestratorError, PersistenceError};
use crate::dashboard::{ActivityItem, ClassificationView, DashboardAggregator, DashboardSnapshot};
use crate::gateway::{Event, EventType, NotificationHub};
use crate::persistence::{Persistence, ProjectStore, ProjectUpdate};
use crate::session::{Session, SessionManager};
use crate::task::{
    ExecutionContext, PredicateDevice, Task, TaskEventSink, TaskExecutor, TaskFailure, TaskRequest,
    TaskStatus, TaskType,
};
use crate::tools::ToolRegistry;

/// handleTaskRequest 的结果
#[derive(Debug, Clone)]
pub enum Submission {
    /// 已入队，可按 id 轮询或等待推送
    Queued(Task),
    /// 无法识别的输入，直接回复帮助
    Help(AgentResponse),
}

/// 健康检查摘要
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub open_sessions: usize,
    pub connections: usize,
    pub supported_task_types: Vec<TaskType>,
}

/// 编排器
pub struct Orchestrator {
    executor: TaskExecutor,
    sessions: SessionManager,
    dashboard: DashboardAggregator,
    hub: Arc<NotificationHub>,
    projects: Arc<dyn ProjectStore>,
    persistence: Arc<dyn Persistence>,
    inflight: TaskTracker,
    /// 串行化账本重建
    hydration: Mutex<()>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub(crate) fn new(
        executor: TaskExecutor,
        sessions: SessionManager,
        dashboard: DashboardAggregator,
        hub: Arc<NotificationHub>,
        projects: Arc<dyn ProjectStore>,
        persistence: Arc<dyn Persistence>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            executor,
            sessions,
            dashboard,
            hub,
            projects,
            persistence,
            inflight: TaskTracker::new(),
            hydration: Mutex::new(()),
            sweep_interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.executor.registry()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// 启动通知心跳与会话清理
    pub fn start(self: &Arc<Self>) {
        self.hub.start();

        let this = Arc::clone(self);
        let token = self.shutdown.clone();
        self.inflight.spawn(async move {
            let mut ticker = tokio::time::interval(this.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.sessions.sweep().await;
                    }
                }
            }
        });
    }

    /// 停止接收新任务，等待执行中的任务结束（至多 grace），然后关闭通知中枢
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.inflight.close();
        if tokio::time::timeout(grace, self.inflight.wait()).await.is_err() {
            tracing::warn!(remaining = self.inflight.len(), "in-flight tasks still running at shutdown");
        }
        self.hub.shutdown().await;
        tracing::info!("orchestrator stopped");
    }

    /// 处理一条用户消息
    pub async fn handle_task_request(
        self: &Arc<Self>,
        project_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<Submission, OrchestratorError> {
        require_ids(project_id, user_id)?;
        match parse_command(message)? {
            ParsedCommand::Unrecognized { text } => {
                tracing::debug!(project_id, input = %text, "unrecognized input, replying with help");
                Ok(Submission::Help(AgentResponse::help(self.registry().help_text())))
            }
            ParsedCommand::Task(request) => {
                let task = self.submit_request(project_id, user_id, request).await?;
                Ok(Submission::Queued(task))
            }
        }
    }

    /// 重新提交失败的任务（新 Task，引用原任务）
    pub async fn resubmit(self: &Arc<Self>, task_id: &str) -> Result<Task, OrchestratorError> {
        let original = self
            .sessions
            .find_task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if original.status != TaskStatus::Failed {
            return Err(OrchestratorError::Validation(format!(
                "only failed tasks can be resubmitted, {} is {}",
                task_id, original.status
            )));
        }
        self.submit_request(
            &original.project_id,
            &original.user_id,
            TaskRequest::resubmission_of(&original),
        )
        .await
    }

    /// 提交已解析的结构化请求（跳过命令解析）
    pub async fn submit_request(
        self: &Arc<Self>,
        project_id: &str,
        user_id: &str,
        request: TaskRequest,
    ) -> Result<Task, OrchestratorError> {
        require_ids(project_id, user_id)?;
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::RateLimited { retry_after_secs: 30 });
        }
        let session = self.sessions.get_or_create_session(project_id, user_id).await;
        let task = match self.sessions.submit_task(&session.id, request.clone()).await {
            // 会话恰好在两步之间被关闭：换新会话再提交一次
            Err(OrchestratorError::SessionClosed(_)) => {
                let session = self.sessions.get_or_create_session(project_id, user_id).await;
                self.sessions.submit_task(&session.id, request).await?
            }
            other => other?,
        };
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            session_id = %task.session_id,
            project_id,
            "task queued"
        );

        self.apply_transition(&task).await;
        let cancel = self
            .sessions
            .cancel_token(&task.session_id)
            .await
            .unwrap_or_default();
        self.spawn_execution(task.clone(), cancel);
        Ok(task)
    }

    fn spawn_execution(self: &Arc<Self>, task: Task, cancel: CancellationToken) {
        let this = Arc::clone(self);
        self.inflight.spawn(async move {
            let project = match this.projects.get(&task.project_id).await {
                Ok(project) => project,
                Err(e) => {
                    tracing::warn!(project_id = %task.project_id, error = %e, "project lookup failed");
                    None
                }
            };
            let ctx = ExecutionContext { cancel, project };
            this.executor.execute(task, ctx, this.as_ref()).await;
        });
    }

    /// 一次状态变化的完整扇出；会话拒绝（已关闭 / 状态回退）时整个事件被丢弃
    async fn apply_transition(&self, task: &Task) {
        if !self.sessions.record_transition(task).await {
            tracing::debug!(task_id = %task.id, status = %task.status, "transition discarded");
            return;
        }
        self.fan_out(task).await;
    }

    async fn fan_out(&self, task: &Task) {
        // 先于写入持久化，避免本次状态被当成历史数据读回
        if let Err(e) = self.ensure_hydrated(&task.project_id, true).await {
            tracing::error!(project_id = %task.project_id, error = %e, "failed to load persisted dashboard");
        }
        if let Err(e) = self.persistence.save_task(task).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to persist task");
        }

        if let Some(item) = self.dashboard.record(task).await {
            self.publish_activity(&task.project_id, &item).await;
        }
        if !task.is_terminal() {
            return;
        }

        let snapshot = self.dashboard.get_snapshot(&task.project_id).await;
        if task.task_type == TaskType::ClassifyDevice && task.status == TaskStatus::Completed {
            self.hub.publish(
                &task.project_id,
                Event::new(
                    EventType::ClassificationCompleted,
                    task.project_id.clone(),
                    json!({
                        "taskId": task.id,
                        "classification": snapshot.classification,
                        "version": snapshot.version,
                    }),
                ),
            );
            self.update_project(task, snapshot.classification.as_ref()).await;
        }

        let response = AgentResponse::for_task(task);
        self.hub.publish(
            &task.project_id,
            Event::new(
                EventType::AgentInteraction,
                task.project_id.clone(),
                serde_json::to_value(&response).unwrap_or_default(),
            ),
        );
    }

    async fn publish_activity(&self, project_id: &str, item: &ActivityItem) {
        if let Err(e) = self.persistence.append_activity(project_id, item).await {
            tracing::error!(project_id, error = %e, "failed to persist activity");
        }
        self.hub.publish(
            project_id,
            Event::new(
                EventType::ActivityAdded,
                project_id,
                serde_json::to_value(item).unwrap_or_default(),
            ),
        );
    }

    /// 最新分类写回项目；项目由外部 CRUD 管理，不存在时只记录
    async fn update_project(&self, task: &Task, classification: Option<&ClassificationView>) {
        let Some(view) = classification.filter(|c| c.task_id == task.id) else {
            return;
        };
        let update = ProjectUpdate {
            device_class: Some(view.device_class.clone()),
            product_code: Some(view.product_code.clone()),
            regulatory_pathway: Some(view.regulatory_pathway.clone()),
        };
        match self.projects.update(&task.project_id, update).await {
            Ok(project) => {
                self.hub.publish(
                    &task.project_id,
                    Event::new(
                        EventType::ProjectUpdated,
                        task.project_id.clone(),
                        serde_json::to_value(&project).unwrap_or_default(),
                    ),
                );
            }
            Err(PersistenceError::NotFound(_)) => {
                tracing::debug!(project_id = %task.project_id, "project not in store, skip update");
            }
            Err(e) => {
                tracing::error!(project_id = %task.project_id, error = %e, "project update failed");
            }
        }
    }

    /// 本进程首次触及项目时，从持久化层重建账本
    ///
    /// 上一进程遗留的未完成任务已无执行者，以 SessionClosedError 收尾并写回。
    /// create_empty 为 true 时即使没有持久化数据也建立账本，之后的写入不会再被当成历史读回。
    async fn ensure_hydrated(&self, project_id: &str, create_empty: bool) -> Result<(), PersistenceError> {
        if self.dashboard.is_known(project_id).await {
            return Ok(());
        }
        let _guard = self.hydration.lock().await;
        if self.dashboard.is_known(project_id).await {
            return Ok(());
        }
        let mut tasks = self.persistence.load_tasks(project_id).await?;
        let activity = self.persistence.load_activity(project_id).await?;
        if tasks.is_empty() && activity.is_empty() && !create_empty {
            return Ok(());
        }
        for task in tasks.iter_mut().filter(|t| t.is_pending()) {
            task.fail(TaskFailure::interrupted());
            self.persistence.save_task(task).await?;
        }
        self.dashboard.hydrate(project_id, tasks, activity).await;
        Ok(())
    }

    /// 项目快照；首次访问时从持久化层重建
    pub async fn get_snapshot(&self, project_id: &str) -> Result<DashboardSnapshot, OrchestratorError> {
        self.ensure_hydrated(project_id, false).await?;
        Ok(self.dashboard.get_snapshot(project_id).await)
    }

    pub async fn classification(
        &self,
        project_id: &str,
    ) -> Result<Option<ClassificationView>, OrchestratorError> {
        Ok(self.get_snapshot(project_id).await?.classification)
    }

    pub async fn predicates(&self, project_id: &str) -> Result<Vec<PredicateDevice>, OrchestratorError> {
        Ok(self.get_snapshot(project_id).await?.predicate_devices)
    }

    /// 重连：取回会话及完整历史
    pub async fn resume_session(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        self.sessions.resume(session_id).await
    }

    /// 显式关闭会话
    pub async fn close_session(&self, session_id: &str) -> Result<Vec<Task>, OrchestratorError> {
        let cancelled = self.sessions.close(session_id).await?;
        for task in &cancelled {
            self.fan_out(task).await;
        }
        Ok(cancelled)
    }

    /// 删除项目：级联关闭会话并丢弃仪表盘与持久化数据；返回项目是否存在过
    pub async fn delete_project(&self, project_id: &str) -> Result<bool, OrchestratorError> {
        let cancelled = self.sessions.close_project(project_id).await;
        let known = self.dashboard.is_known(project_id).await;
        self.dashboard.forget(project_id).await;
        self.persistence.purge_project(project_id).await?;
        let stored = self.projects.delete(project_id).await?;

        self.hub.publish(
            project_id,
            Event::new(
                EventType::ProjectUpdated,
                project_id,
                json!({ "id": project_id, "deleted": true }),
            ),
        );
        tracing::info!(project_id, cancelled = cancelled.len(), "project deleted");
        Ok(known || stored || !cancelled.is_empty())
    }

    pub async fn find_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.sessions
            .find_task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    /// 轮询路径：与推送的 agent_interaction 负载相同
    pub async fn poll_response(&self, task_id: &str) -> Result<(Task, AgentResponse), OrchestratorError> {
        let task = self.find_task(task_id).await?;
        let response = AgentResponse::for_task(&task);
        Ok((task, response))
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.shutdown.is_cancelled() { "stopping" } else { "ok" },
            open_sessions: self.sessions.open_count().await,
            connections: self.hub.connection_count(),
            supported_task_types: self.registry().supported_types(),
        }
    }
}

fn require_ids(project_id: &str, user_id: &str) -> Result<(), OrchestratorError> {
    if project_id.trim().is_empty() || user_id.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "projectId and userId are required".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl TaskEventSink for Orchestrator {
    async fn task_status_changed(&self, task: &Task) {
        self.apply_transition(task).await;
    }

    /// 不推送、不写活动，只让历史、持久化与仪表盘计数不再把它算作待办
    async fn task_discarded(&self, task: &Task) {
        let Some(settled) = self.sessions.settle_discarded(task).await else {
            return;
        };
        // 项目已删除
        if !self.dashboard.is_known(&settled.project_id).await {
            return;
        }
        if let Err(e) = self.persistence.save_task(&settled).await {
            tracing::error!(task_id = %settled.id, error = %e, "failed to persist discarded task");
        }
        self.dashboard.settle(&settled).await;
    }
}
