//! 推送协议：事件信封与客户端消息

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::ProjectId;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ClassificationCompleted,
    ProjectUpdated,
    ActivityAdded,
    ConnectionEstablished,
    AgentInteraction,
}

/// 事件信封 `{ type, projectId, payload, timestamp }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub project_id: ProjectId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, project_id: impl Into<ProjectId>, payload: Value) -> Self {
        Self {
            event_type,
            project_id: project_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// 序列化失败时退化为只含类型的 JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{:?}","projectId":"{}"}}"#, self.event_type, self.project_id)
        })
    }
}

/// WebSocket 客户端发来的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "projectId")]
        project_id: ProjectId,
    },
    Unsubscribe,
    Ping,
}
