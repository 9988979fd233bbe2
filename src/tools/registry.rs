//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / invoke），由 ToolRegistry 按任务类型注册与查找；
//! 注册表本身无副作用，I/O 全部发生在能力内部。未注册的类型返回 UnsupportedTask，绝不静默。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::persistence::Project;
use crate::task::{ProjectId, SessionId, TaskId, TaskInput, TaskType};

/// 单次调用的上下文
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub session_id: SessionId,
    /// 第几次尝试（从 0 开始）
    pub attempt: u32,
    pub project: Option<Project>,
}

/// 能力 trait：名称、描述、参数 schema、异步调用（返回未经校验的 JSON）
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 结构化参数 JSON Schema，默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn invoke(&self, input: &TaskInput, ctx: &InvocationContext) -> Result<Value, ToolError>;
}

/// 能力注册表：按任务类型存储 Arc<dyn Capability>
#[derive(Default)]
pub struct ToolRegistry {
    capabilities: HashMap<TaskType, Arc<dyn Capability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, capability: impl Capability + 'static) {
        self.register_arc(task_type, Arc::new(capability));
    }

    pub fn register_arc(&mut self, task_type: TaskType, capability: Arc<dyn Capability>) {
        tracing::debug!(task_type = %task_type, capability = capability.name(), "capability registered");
        self.capabilities.insert(task_type, capability);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(&task_type).cloned()
    }

    pub async fn invoke(
        &self,
        task_type: TaskType,
        input: &TaskInput,
        ctx: &InvocationContext,
    ) -> Result<Value, ToolError> {
        let capability = self
            .capabilities
            .get(&task_type)
            .ok_or_else(|| ToolError::UnsupportedTask(task_type.to_string()))?;
        capability.invoke(input, ctx).await
    }

    /// 已注册的任务类型（按命令表顺序）
    pub fn supported_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.capabilities.contains_key(t))
            .collect()
    }

    /// 帮助文案：列出可用命令
    pub fn help_text(&self) -> String {
        let mut out = String::from(
            "I can help with regulatory analysis for your device. Available commands:\n",
        );
        for t in TaskType::ALL {
            match self.capabilities.get(&t) {
                Some(cap) => out.push_str(&format!("- `{}`: {}\n", t.usage(), cap.description())),
                None => out.push_str(&format!("- `{}` (currently unavailable)\n", t.usage())),
            }
        }
        out
    }

    /// 能力清单 JSON（命令、描述、参数 schema）
    pub fn to_schema_json(&self) -> String {
        let entries: Vec<Value> = self
            .supported_types()
            .into_iter()
            .filter_map(|t| {
                self.capabilities.get(&t).map(|cap| {
                    serde_json::json!({
                        "task_type": t.as_str(),
                        "command": t.command(),
                        "name": cap.name(),
                        "description": cap.description(),
                        "parameters": cap.parameters_schema(),
                    })
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}
