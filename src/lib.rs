//! reg-agent - 法规分析 Agent 任务编排与实时通知引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试策略、命令解析、编排器、优雅关闭
//! - **task**: 任务与工具结果模型、结果校验、执行器
//! - **tools**: 能力注册表、上游数据源客户端、FDA 分类 / 前置器械 / 指南 / 对比能力
//! - **session**: 会话与会话管理
//! - **dashboard**: 活动流与仪表盘聚合
//! - **gateway**: 通知中枢、WebSocket 推送与 HTTP API
//! - **persistence**: 项目存储与任务持久化（内存 / SQLite）

pub mod config;
pub mod core;
pub mod dashboard;
pub mod gateway;
pub mod observability;
pub mod persistence;
pub mod session;
pub mod task;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, Submission};
