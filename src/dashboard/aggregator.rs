//! 仪表盘聚合器
//!
//! 每个项目一份账本：按任务 ID 存放、按 (创建时间, 提交序号) 排列的任务 + 只追加的活动日志。
//! 快照总是从账本整体重算（不做增量修补），内容变化时 version 递增。

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{ActivityItem, ClassificationView, DashboardSnapshot, Progress, Statistics};
use crate::core::ErrorCode;
use crate::task::{observe_sequence, ProjectId, StructuredData, Task, TaskId, TaskStatus, TaskType};
use crate::tools::matching::round_score;
use crate::tools::rank_predicates;

#[derive(Default)]
struct ProjectLedger {
    /// task id → 最新状态
    tasks: HashMap<TaskId, Task>,
    activity: Vec<ActivityItem>,
    snapshot: Option<DashboardSnapshot>,
}

impl ProjectLedger {
    /// 记录任务的新状态；首次出现或状态前进时返回 true
    fn upsert(&mut self, task: &Task) -> bool {
        match self.tasks.get(&task.id) {
            Some(existing) if existing.status == task.status => {
                self.tasks.insert(task.id.clone(), task.clone());
                false
            }
            Some(existing) if !existing.status.can_advance_to(task.status) => false,
            _ => {
                self.tasks.insert(task.id.clone(), task.clone());
                true
            }
        }
    }

    /// 按提交先后排列；跨进程的序号不可比，先比创建时间
    fn ordered(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        tasks
    }

    fn compute(&self, project_id: &str, activity_limit: usize) -> DashboardSnapshot {
        let ordered = self.ordered();
        let classification = ordered
            .iter()
            .rev()
            .filter(|t| t.task_type == TaskType::ClassifyDevice && t.status == TaskStatus::Completed)
            .find_map(|t| {
                let result = t.result.as_ref()?;
                let c = result.classification()?;
                Some(ClassificationView {
                    device_class: c.device_class.clone(),
                    product_code: c.product_code.clone(),
                    regulatory_pathway: c.regulatory_pathway.clone(),
                    confidence: result.confidence,
                    reasoning: c.reasoning.clone(),
                    cfr_sections: c.cfr_sections.clone(),
                    status: t.status,
                    task_id: t.id.clone(),
                })
            });

        // 新的检索覆盖旧检索中同一 K 号的条目
        let mut by_k_number = HashMap::new();
        for task in ordered.iter().filter(|t| t.status == TaskStatus::Completed) {
            if let Some(StructuredData::Predicates { devices }) =
                task.result.as_ref().and_then(|r| r.structured_data.as_ref())
            {
                for device in devices {
                    by_k_number.insert(device.k_number.to_uppercase(), device.clone());
                }
            }
        }
        let mut predicate_devices: Vec<_> = by_k_number.into_values().collect();
        rank_predicates(&mut predicate_devices);

        let completed_type = |task_type: TaskType| {
            self.tasks
                .values()
                .any(|t| t.task_type == task_type && t.status == TaskStatus::Completed)
        };
        let steps = [
            completed_type(TaskType::ClassifyDevice),
            completed_type(TaskType::PredicateSearch),
            completed_type(TaskType::FindGuidance),
            completed_type(TaskType::ComparePredicate),
        ];
        let done = steps.iter().filter(|s| **s).count();
        let progress = Progress {
            classification: steps[0],
            predicates: steps[1],
            guidance: steps[2],
            comparison: steps[3],
            percent_complete: (done * 100 / steps.len()) as u8,
            pending_tasks: self.tasks.values().filter(|t| t.is_pending()).count(),
        };

        let scored: Vec<f64> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed && t.task_type.is_scoring())
            .filter_map(|t| t.confidence())
            .collect();
        let statistics = Statistics {
            total_tasks: self.tasks.len(),
            completed_tasks: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            failed_tasks: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            timed_out_tasks: self
                .tasks
                .values()
                .filter(|t| t.error.as_ref().map(|e| e.code) == Some(ErrorCode::TimeoutError))
                .count(),
            average_confidence: if scored.is_empty() {
                None
            } else {
                Some(round_score(scored.iter().sum::<f64>() / scored.len() as f64))
            },
            predicate_count: predicate_devices.len(),
        };

        DashboardSnapshot {
            project_id: project_id.to_string(),
            classification,
            predicate_devices,
            progress,
            recent_activity: self.activity.iter().rev().take(activity_limit).cloned().collect(),
            statistics,
            version: 0,
        }
    }

    /// 重算并缓存；内容未变时沿用旧 version
    fn refresh(&mut self, project_id: &str, activity_limit: usize) -> DashboardSnapshot {
        let mut next = self.compute(project_id, activity_limit);
        match &self.snapshot {
            Some(prev) if prev.same_content(&next) => return prev.clone(),
            Some(prev) => next.version = prev.version + 1,
            None => next.version = 1,
        }
        self.snapshot = Some(next.clone());
        next
    }
}

/// 仪表盘聚合器
pub struct DashboardAggregator {
    projects: RwLock<HashMap<ProjectId, ProjectLedger>>,
    activity_limit: usize,
}

impl DashboardAggregator {
    pub fn new(activity_limit: usize) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            activity_limit: activity_limit.max(1),
        }
    }

    /// 记录一次任务状态变化；产生新的活动条目时返回它
    pub async fn record(&self, task: &Task) -> Option<ActivityItem> {
        let mut projects = self.projects.write().await;
        let ledger = projects.entry(task.project_id.clone()).or_default();
        if !ledger.upsert(task) {
            return None;
        }
        let item = ActivityItem::for_transition(task)?;
        ledger.activity.push(item.clone());
        Some(item)
    }

    /// 静默写入终态（不产生活动条目），用于被丢弃结果的任务
    pub async fn settle(&self, task: &Task) {
        let mut projects = self.projects.write().await;
        if let Some(ledger) = projects.get_mut(&task.project_id) {
            ledger.upsert(task);
        }
    }

    /// 任务到达终态：记录并重算快照
    pub async fn on_task_completed(&self, task: &Task) -> DashboardSnapshot {
        self.record(task).await;
        self.get_snapshot(&task.project_id).await
    }

    /// 当前快照；无变化时重复调用返回相同 version
    pub async fn get_snapshot(&self, project_id: &str) -> DashboardSnapshot {
        let mut projects = self.projects.write().await;
        match projects.get_mut(project_id) {
            Some(ledger) => ledger.refresh(project_id, self.activity_limit),
            None => DashboardSnapshot::empty(project_id),
        }
    }

    /// 是否已有该项目的账本
    pub async fn is_known(&self, project_id: &str) -> bool {
        self.projects.read().await.contains_key(project_id)
    }

    /// 从持久化数据重建账本（已有账本时不覆盖）
    pub async fn hydrate(&self, project_id: &str, tasks: Vec<Task>, activity: Vec<ActivityItem>) {
        let mut projects = self.projects.write().await;
        if projects.contains_key(project_id) {
            return;
        }
        if let Some(max) = tasks.iter().map(|t| t.sequence).max() {
            observe_sequence(max);
        }
        let ledger = ProjectLedger {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            activity,
            snapshot: None,
        };
        tracing::debug!(project_id, tasks = ledger.tasks.len(), "dashboard ledger hydrated");
        projects.insert(project_id.to_string(), ledger);
    }

    /// 项目删除时丢弃账本
    pub async fn forget(&self, project_id: &str) {
        self.projects.write().await.remove(project_id);
    }
}
