//! SQLite 持久化（sqlx）
//!
//! 任务与活动以 JSON 文本存储，按项目建索引；重启后由编排器 hydrate 仪表盘。

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;

use super::{Persistence, Project, ProjectStore, ProjectUpdate};
use crate::core::PersistenceError;
use crate::dashboard::ActivityItem;
use crate::task::Task;

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

/// SQLite 存储：同时实现 ProjectStore 与 Persistence
pub struct SqliteStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        tracing::info!(path = %db_path.as_ref().display(), "sqlite store opened");
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reg_projects (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reg_tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reg_activity (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reg_tasks_project ON reg_tasks(project_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reg_activity_project ON reg_activity(project_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 写入或覆盖项目
    pub async fn put_project(&self, project: &Project) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(project)?;
        sqlx::query(
            "INSERT INTO reg_projects (id, body) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(&project.id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn get(&self, project_id: &str) -> Result<Option<Project>, PersistenceError> {
        let row = sqlx::query("SELECT body FROM reg_projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<Project, PersistenceError> {
        let mut project = self
            .get(project_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("project {}", project_id)))?;
        if project.apply(&update) {
            self.put_project(&project).await?;
        }
        Ok(project)
    }

    async fn delete(&self, project_id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM reg_projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn save_task(&self, task: &Task) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(task)?;
        sqlx::query(
            "INSERT INTO reg_tasks (id, project_id, session_id, sequence, status, body)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
        )
        .bind(&task.id)
        .bind(&task.project_id)
        .bind(&task.session_id)
        .bind(task.sequence as i64)
        .bind(task.status.to_string())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_activity(
        &self,
        project_id: &str,
        item: &ActivityItem,
    ) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(item)?;
        sqlx::query("INSERT INTO reg_activity (id, project_id, body) VALUES (?, ?, ?)")
            .bind(&item.id)
            .bind(project_id)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_tasks(&self, project_id: &str) -> Result<Vec<Task>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT body FROM reg_tasks WHERE project_id = ? ORDER BY sequence ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                serde_json::from_str(&body).map_err(PersistenceError::from)
            })
            .collect()
    }

    async fn load_activity(&self, project_id: &str) -> Result<Vec<ActivityItem>, PersistenceError> {
        let rows = sqlx::query("SELECT body FROM reg_activity WHERE project_id = ? ORDER BY seq ASC")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                serde_json::from_str(&body).map_err(PersistenceError::from)
            })
            .collect()
    }

    async fn purge_project(&self, project_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM reg_tasks WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM reg_activity WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
