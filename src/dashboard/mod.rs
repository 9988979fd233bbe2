//! 仪表盘：活动日志与按项目聚合的快照

mod aggregator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{PredicateDevice, ProjectId, Task, TaskId, TaskStatus, TaskType};

pub use aggregator::DashboardAggregator;

/// 活动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    TaskSubmitted,
    Classification,
    PredicateSearch,
    GuidanceLookup,
    PredicateComparison,
    Error,
}

/// 活动日志条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub id: String,
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub title: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityItem {
    /// 由任务状态变化派生；running 不产生条目
    pub fn for_transition(task: &Task) -> Option<Self> {
        let (kind, title) = match task.status {
            TaskStatus::Queued => (
                ActivityKind::TaskSubmitted,
                format!("{} requested", step_label(task.task_type)),
            ),
            TaskStatus::Running => return None,
            TaskStatus::Completed => completed_entry(task),
            TaskStatus::Failed => {
                let reason = task
                    .error
                    .as_ref()
                    .map(|e| e.code.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                (
                    ActivityKind::Error,
                    format!("{} failed: {}", step_label(task.task_type), reason),
                )
            }
        };
        Some(Self {
            id: format!("act_{}", uuid::Uuid::new_v4()),
            task_id: task.id.clone(),
            kind,
            title,
            timestamp: task.completed_at.unwrap_or_else(Utc::now),
        })
    }
}

fn step_label(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::ClassifyDevice => "Device classification",
        TaskType::PredicateSearch => "Predicate search",
        TaskType::FindGuidance => "Guidance lookup",
        TaskType::ComparePredicate => "Predicate comparison",
    }
}

fn completed_entry(task: &Task) -> (ActivityKind, String) {
    let result = task.result.as_ref();
    match task.task_type {
        TaskType::ClassifyDevice => {
            let title = match result.and_then(|r| r.classification()) {
                Some(c) => format!("Device classified as {} ({})", c.device_class, c.product_code),
                None => "Device classification completed".to_string(),
            };
            (ActivityKind::Classification, title)
        }
        TaskType::PredicateSearch => {
            let count = result.map(|r| r.predicates().len()).unwrap_or(0);
            (
                ActivityKind::PredicateSearch,
                format!("Found {} potential predicate device(s)", count),
            )
        }
        TaskType::FindGuidance => (
            ActivityKind::GuidanceLookup,
            format!("Guidance lookup: {}", truncate(&task.input.text, 60)),
        ),
        TaskType::ComparePredicate => (
            ActivityKind::PredicateComparison,
            format!("Predicate comparison: {}", truncate(&task.input.text, 60)),
        ),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

/// 分类视图（`GET /projects/{id}/classification`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationView {
    pub device_class: String,
    pub product_code: String,
    pub regulatory_pathway: String,
    pub confidence: f64,
    pub reasoning: String,
    pub cfr_sections: Vec<String>,
    pub status: TaskStatus,
    pub task_id: TaskId,
}

/// 各步骤完成情况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub classification: bool,
    pub predicates: bool,
    pub guidance: bool,
    pub comparison: bool,
    /// 0..=100
    pub percent_complete: u8,
    pub pending_tasks: usize,
}

/// 统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// 单独计数，用于 SLA 报告
    pub timed_out_tasks: usize,
    pub average_confidence: Option<f64>,
    pub predicate_count: usize,
}

/// 项目仪表盘快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub project_id: ProjectId,
    pub classification: Option<ClassificationView>,
    pub predicate_devices: Vec<PredicateDevice>,
    pub progress: Progress,
    pub recent_activity: Vec<ActivityItem>,
    pub statistics: Statistics,
    /// 内容变化时递增
    pub version: u64,
}

impl DashboardSnapshot {
    pub fn empty(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            classification: None,
            predicate_devices: Vec::new(),
            progress: Progress::default(),
            recent_activity: Vec::new(),
            statistics: Statistics::default(),
            version: 0,
        }
    }

    /// 除 version 外内容相同
    pub fn same_content(&self, other: &DashboardSnapshot) -> bool {
        self.project_id == other.project_id
            && self.classification == other.classification
            && self.predicate_devices == other.predicate_devices
            && self.progress == other.progress
            && self.recent_activity == other.recent_activity
            && self.statistics == other.statistics
    }
}
