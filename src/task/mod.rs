//! 任务层：数据模型、工具结果、输出校验、执行器

pub mod executor;
pub mod result;
pub mod types;
pub mod validate;

pub use executor::{ExecutionContext, TaskEventSink, TaskExecutor};
pub use result::{
    Citation, ClassificationData, ComparisonData, GuidanceDocument, PredicateDevice, SourceType,
    StructuredData, ToolResult,
};
pub use types::{
    next_sequence, observe_sequence, ProjectId, SessionId, Task, TaskFailure, TaskId, TaskInput, TaskRequest,
    TaskStatus, TaskType, UserId,
};
pub use validate::{submission_number_regex, validate_tool_output};
