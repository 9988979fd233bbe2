//! 内存实现

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Persistence, Project, ProjectStore, ProjectUpdate};
use crate::core::PersistenceError;
use crate::dashboard::ActivityItem;
use crate::task::{ProjectId, Task, TaskId};

/// 内存项目存储
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<ProjectId, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) {
        self.projects.write().await.insert(project.id.clone(), project);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PersistenceError> {
        Ok(self.projects.read().await.get(project_id).cloned())
    }

    async fn update(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<Project, PersistenceError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("project {}", project_id)))?;
        project.apply(&update);
        Ok(project.clone())
    }

    async fn delete(&self, project_id: &str) -> Result<bool, PersistenceError> {
        Ok(self.projects.write().await.remove(project_id).is_some())
    }
}

#[derive(Default)]
struct ProjectRecords {
    tasks: HashMap<TaskId, Task>,
    activity: Vec<ActivityItem>,
}

/// 内存任务 / 活动持久化
#[derive(Default)]
pub struct MemoryPersistence {
    projects: RwLock<HashMap<ProjectId, ProjectRecords>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_task(&self, task: &Task) -> Result<(), PersistenceError> {
        let mut projects = self.projects.write().await;
        projects
            .entry(task.project_id.clone())
            .or_default()
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn append_activity(
        &self,
        project_id: &str,
        item: &ActivityItem,
    ) -> Result<(), PersistenceError> {
        let mut projects = self.projects.write().await;
        projects
            .entry(project_id.to_string())
            .or_default()
            .activity
            .push(item.clone());
        Ok(())
    }

    async fn load_tasks(&self, project_id: &str) -> Result<Vec<Task>, PersistenceError> {
        let projects = self.projects.read().await;
        let mut tasks: Vec<Task> = projects
            .get(project_id)
            .map(|r| r.tasks.values().cloned().collect())
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    async fn load_activity(&self, project_id: &str) -> Result<Vec<ActivityItem>, PersistenceError> {
        let projects = self.projects.read().await;
        Ok(projects
            .get(project_id)
            .map(|r| r.activity.clone())
            .unwrap_or_default())
    }

    async fn purge_project(&self, project_id: &str) -> Result<(), PersistenceError> {
        self.projects.write().await.remove(project_id);
        Ok(())
    }
}
