//! 外部协作者：项目存储与任务 / 活动持久化
//!
//! 项目 CRUD 不在本引擎内，这里只定义编排器需要的读写接口。
//! 内存实现用于测试与单机部署；开启 `async-sqlite` 时可用 SQLite 实现。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::PersistenceError;
use crate::dashboard::ActivityItem;
use crate::task::{ProjectId, Task};

pub use memory::{MemoryPersistence, MemoryProjectStore};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

/// 监管项目（编排器只关心器械描述与分类字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub device_description: String,
    #[serde(default)]
    pub intended_use: String,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub regulatory_pathway: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<ProjectId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_description: String::new(),
            intended_use: String::new(),
            device_class: None,
            product_code: None,
            regulatory_pathway: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.device_description = description.into();
        self
    }

    /// 应用字段更新；返回是否有变化
    pub fn apply(&mut self, update: &ProjectUpdate) -> bool {
        let mut changed = false;
        for (field, value) in [
            (&mut self.device_class, &update.device_class),
            (&mut self.product_code, &update.product_code),
            (&mut self.regulatory_pathway, &update.regulatory_pathway),
        ] {
            if value.is_some() && *field != *value {
                *field = value.clone();
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// 分类完成后回写项目的字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub device_class: Option<String>,
    pub product_code: Option<String>,
    pub regulatory_pathway: Option<String>,
}

/// 项目存储（get / update / delete）
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PersistenceError>;

    /// 更新项目字段；项目不存在返回 NotFound
    async fn update(&self, project_id: &str, update: ProjectUpdate)
        -> Result<Project, PersistenceError>;

    /// 删除项目；返回是否存在
    async fn delete(&self, project_id: &str) -> Result<bool, PersistenceError>;
}

/// 任务与活动日志持久化
#[async_trait]
pub trait Persistence: Send + Sync {
    /// 按任务 ID 覆盖写入最新状态
    async fn save_task(&self, task: &Task) -> Result<(), PersistenceError>;

    async fn append_activity(
        &self,
        project_id: &str,
        item: &ActivityItem,
    ) -> Result<(), PersistenceError>;

    /// 项目的全部任务，按提交序号升序
    async fn load_tasks(&self, project_id: &str) -> Result<Vec<Task>, PersistenceError>;

    /// 项目的活动日志，按追加顺序
    async fn load_activity(&self, project_id: &str) -> Result<Vec<ActivityItem>, PersistenceError>;

    /// 删除项目下的任务与活动
    async fn purge_project(&self, project_id: &str) -> Result<(), PersistenceError>;
}
