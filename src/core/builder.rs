//! 编排器构建器：统一的组件初始化逻辑
//!
//! HTTP 服务、集成测试共用同一套装配；未显式提供的组件按配置创建默认实现。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{Orchestrator, PersistenceError, ToolError};
use crate::dashboard::DashboardAggregator;
use crate::gateway::NotificationHub;
use crate::persistence::{MemoryPersistence, MemoryProjectStore, Persistence, ProjectStore};
use crate::session::SessionManager;
use crate::task::TaskExecutor;
use crate::tools::{build_registry, ToolRegistry};

/// 存储后端：项目存储与任务/活动持久化
pub struct Storage {
    pub projects: Arc<dyn ProjectStore>,
    pub persistence: Arc<dyn Persistence>,
}

impl Storage {
    /// 纯内存（进程退出即丢失）
    pub fn memory() -> Self {
        Self {
            projects: Arc::new(MemoryProjectStore::new()),
            persistence: Arc::new(MemoryPersistence::new()),
        }
    }

    /// 按配置打开存储：设置了 sqlite_path 且启用 async-sqlite 时使用 SQLite
    pub async fn open(config: &AppConfig) -> Result<Self, PersistenceError> {
        match config.persistence.sqlite_path.as_ref() {
            #[cfg(feature = "async-sqlite")]
            Some(path) => {
                let store = Arc::new(crate::persistence::SqliteStore::open(path).await?);
                tracing::info!(path = %path.display(), "using sqlite storage");
                Ok(Self {
                    projects: store.clone(),
                    persistence: store,
                })
            }
            #[cfg(not(feature = "async-sqlite"))]
            Some(path) => {
                tracing::warn!(
                    path = %path.display(),
                    "sqlite_path set but async-sqlite feature is disabled, using memory storage"
                );
                Ok(Self::memory())
            }
            None => Ok(Self::memory()),
        }
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    storage: Option<Storage>,
    hub: Option<Arc<NotificationHub>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            storage: None,
            hub: None,
        }
    }

    /// 替换能力注册表（测试中注入 Mock 能力）
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_project_store(mut self, projects: Arc<dyn ProjectStore>) -> Self {
        let storage = self.storage.take().unwrap_or_else(Storage::memory);
        self.storage = Some(Storage {
            projects,
            persistence: storage.persistence,
        });
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        let storage = self.storage.take().unwrap_or_else(Storage::memory);
        self.storage = Some(Storage {
            projects: storage.projects,
            persistence,
        });
        self
    }

    pub fn with_hub(mut self, hub: Arc<NotificationHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// 未显式提供注册表时按配置构建；上游客户端无法创建时返回错误
    pub fn build(self) -> Result<Arc<Orchestrator>, ToolError> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => build_registry(&self.config)?,
        };
        tracing::info!(
            capabilities = ?registry.supported_types(),
            "capability registry ready"
        );

        let storage = self.storage.unwrap_or_else(Storage::memory);
        let hub = self
            .hub
            .unwrap_or_else(|| Arc::new(NotificationHub::new(&self.config.notifications)));

        Ok(Arc::new(Orchestrator::new(
            TaskExecutor::new(Arc::new(registry), self.config.executor.clone()),
            SessionManager::new(self.config.session.clone()),
            DashboardAggregator::new(self.config.dashboard.activity_limit),
            hub,
            storage.projects,
            storage.persistence,
            Duration::from_secs(self.config.session.sweep_interval_secs.max(1)),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    #[test]
    fn test_offline_config_registers_every_type() {
        let mut config = AppConfig::default();
        config.fda.offline = true;
        let orchestrator = OrchestratorBuilder::new(config).build().unwrap();
        assert_eq!(orchestrator.registry().supported_types().len(), TaskType::ALL.len());
    }

    #[tokio::test]
    async fn test_storage_without_sqlite_path_is_memory() {
        let storage = Storage::open(&AppConfig::default()).await.unwrap();
        assert!(storage.projects.get("p").await.unwrap().is_none());
    }
}
