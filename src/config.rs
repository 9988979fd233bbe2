//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REG_AGENT__*` 覆盖（双下划线表示嵌套，如 `REG_AGENT__FDA__OFFLINE=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::task::TaskType;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub executor: ExecutorSection,
    pub session: SessionSection,
    pub dashboard: DashboardSection,
    pub notifications: NotificationSection,
    pub fda: FdaSection,
    pub persistence: PersistenceSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [server] 段：HTTP 与 WebSocket 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_ws_bind")]
    pub ws_bind: String,
    /// HTTP 同时处理的请求上限
    #[serde(default = "default_max_http_concurrency")]
    pub max_http_concurrency: usize,
    /// 关闭时等待执行中任务的时间
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ws_bind() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_max_http_concurrency() -> usize {
    256
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_bind: default_http_bind(),
            ws_bind: default_ws_bind(),
            max_http_concurrency: default_max_http_concurrency(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// [executor] 段：并发、重试、各任务类型的软 SLA
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 瞬时错误的最大重试次数（不含首次）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 硬超时 = 软 SLA × 该系数
    #[serde(default = "default_hard_ceiling_factor")]
    pub hard_ceiling_factor: u32,
    #[serde(default)]
    pub sla: SlaSection,
}

fn default_max_concurrent_tasks() -> usize {
    16
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_hard_ceiling_factor() -> u32 {
    2
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            hard_ceiling_factor: default_hard_ceiling_factor(),
            sla: SlaSection::default(),
        }
    }
}

impl ExecutorSection {
    /// 任务类型的软 SLA
    pub fn soft_sla(&self, task_type: TaskType) -> Duration {
        let secs = match task_type {
            TaskType::ClassifyDevice => self.sla.classify_device_secs,
            TaskType::PredicateSearch => self.sla.predicate_search_secs,
            TaskType::FindGuidance => self.sla.find_guidance_secs,
            TaskType::ComparePredicate => self.sla.compare_predicate_secs,
        };
        Duration::from_millis((secs * 1000.0) as u64)
    }

    /// 任务类型的硬超时（软 SLA 的倍数，至少 2 倍）
    pub fn hard_ceiling(&self, task_type: TaskType) -> Duration {
        self.soft_sla(task_type) * self.hard_ceiling_factor.max(2)
    }
}

/// [executor.sla] 段（秒，可为小数）
#[derive(Debug, Clone, Deserialize)]
pub struct SlaSection {
    #[serde(default = "default_classify_sla")]
    pub classify_device_secs: f64,
    #[serde(default = "default_predicate_sla")]
    pub predicate_search_secs: f64,
    #[serde(default = "default_guidance_sla")]
    pub find_guidance_secs: f64,
    #[serde(default = "default_compare_sla")]
    pub compare_predicate_secs: f64,
}

fn default_classify_sla() -> f64 {
    5.0
}

fn default_predicate_sla() -> f64 {
    30.0
}

fn default_guidance_sla() -> f64 {
    15.0
}

fn default_compare_sla() -> f64 {
    30.0
}

impl Default for SlaSection {
    fn default() -> Self {
        Self {
            classify_device_secs: default_classify_sla(),
            predicate_search_secs: default_predicate_sla(),
            find_guidance_secs: default_guidance_sla(),
            compare_predicate_secs: default_compare_sla(),
        }
    }
}

/// [session] 段：空闲窗口、准入上限、清扫周期
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 单个会话允许同时 queued/running 的任务数
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_max_pending_tasks() -> usize {
    8
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_pending_tasks: default_max_pending_tasks(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// [dashboard] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardSection {
    /// 活动流保留条数
    #[serde(default = "default_activity_limit")]
    pub activity_limit: usize,
}

fn default_activity_limit() -> usize {
    50
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            activity_limit: default_activity_limit(),
        }
    }
}

/// [notifications] 段：心跳与每连接发送缓冲
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_outbound_buffer() -> usize {
    64
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// [fda] 段：上游数据源
#[derive(Debug, Clone, Deserialize)]
pub struct FdaSection {
    #[serde(default = "default_fda_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    /// 单个上游的并发上限（准入控制点）
    #[serde(default = "default_fda_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_fda_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_guidance_base_url")]
    pub guidance_base_url: String,
    /// 是否抓取指南原文摘要
    #[serde(default)]
    pub fetch_guidance_excerpts: bool,
    /// 离线模式：使用内置 Mock 能力，不访问上游
    #[serde(default)]
    pub offline: bool,
}

fn default_fda_base_url() -> String {
    "https://api.fda.gov".to_string()
}

fn default_fda_max_concurrent() -> usize {
    4
}

fn default_fda_request_timeout() -> u64 {
    20
}

fn default_guidance_base_url() -> String {
    "https://www.fda.gov".to_string()
}

impl Default for FdaSection {
    fn default() -> Self {
        Self {
            base_url: default_fda_base_url(),
            api_key: None,
            max_concurrent: default_fda_max_concurrent(),
            request_timeout_secs: default_fda_request_timeout(),
            guidance_base_url: default_guidance_base_url(),
            fetch_guidance_excerpts: false,
            offline: false,
        }
    }
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PersistenceSection {
    /// 设置后（且启用 async-sqlite feature）任务与活动写入 SQLite
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 REG_AGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REG_AGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REG_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
