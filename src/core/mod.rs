//! 核心层：错误分类、重试策略、命令解析、响应、编排器与关闭处理

pub mod builder;
pub mod command;
pub mod error;
pub mod orchestrator;
pub mod response;
pub mod retry;
pub mod shutdown;

pub use builder::{OrchestratorBuilder, Storage};
pub use command::{parse_command, ParsedCommand};
pub use error::{ErrorCode, OrchestratorError, PersistenceError, ToolError};
pub use orchestrator::{HealthReport, Orchestrator, Submission};
pub use response::{AgentResponse, Source, HELP_CONFIDENCE};
pub use retry::{RetryOutcome, RetryPolicy};
pub use shutdown::{drain, serve_until_shutdown, ShutdownReason, ShutdownSignal};
