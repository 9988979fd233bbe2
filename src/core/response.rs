//! 对外的 Agent 响应（轮询与推送共用同一形状）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{SourceType, Task, TaskId, TaskStatus};

/// 帮助回复的固定置信度
pub const HELP_CONFIDENCE: f64 = 0.95;

/// 引用来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
}

/// `{ id, content, type: "agent_response", confidence, sources, timestamp }`
///
/// 任务响应的 id 即任务 ID，客户端按 id 幂等应用，轮询与推送先到后到都一样。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub confidence: f64,
    pub sources: Vec<Source>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl AgentResponse {
    fn new(id: String, content: String, confidence: f64, sources: Vec<Source>) -> Self {
        Self {
            id,
            content,
            response_type: "agent_response".to_string(),
            confidence,
            sources,
            timestamp: Utc::now(),
            task_id: None,
            status: None,
        }
    }

    /// 无法识别的输入：列出可用命令
    pub fn help(content: String) -> Self {
        Self::new(
            format!("help_{}", uuid::Uuid::new_v4()),
            content,
            HELP_CONFIDENCE,
            Vec::new(),
        )
    }

    /// 任务当前状态对应的响应
    pub fn for_task(task: &Task) -> Self {
        let (content, confidence, sources) = match (&task.status, &task.result, &task.error) {
            (TaskStatus::Completed, Some(result), _) => (
                result.content.clone(),
                result.confidence,
                result
                    .citations
                    .iter()
                    .map(|c| Source {
                        title: c.title().to_string(),
                        url: c.url().to_string(),
                        source_type: c.source_type(),
                    })
                    .collect(),
            ),
            (TaskStatus::Failed, _, Some(failure)) => (failure.message.clone(), 0.0, Vec::new()),
            (status, _, _) => (format!("Your {} request is {}.", task.task_type, status), 0.0, Vec::new()),
        };
        let mut response = Self::new(task.id.clone(), content, confidence, sources);
        response.task_id = Some(task.id.clone());
        response.status = Some(task.status);
        response.timestamp = task.completed_at.unwrap_or(task.created_at);
        response
    }
}
