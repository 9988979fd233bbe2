//! 斜杠命令解析
//!
//! 在任何分发之前把原始消息解析成带类型的命令；无法识别的输入是一等的 `Unrecognized` 分支（回复帮助）。

use crate::core::OrchestratorError;
use crate::task::{submission_number_regex, TaskInput, TaskRequest, TaskType};

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
    Task(TaskRequest),
    Unrecognized { text: String },
}

/// 解析用户消息
///
/// 已知命令缺少必要参数时返回 Validation 错误，任务不会进入队列。
pub fn parse_command(message: &str) -> Result<ParsedCommand, OrchestratorError> {
    let trimmed = message.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };

    let Some(task_type) = TaskType::from_command(head) else {
        return Ok(ParsedCommand::Unrecognized {
            text: trimmed.to_string(),
        });
    };

    if rest.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "missing input, usage: {}",
            task_type.usage()
        )));
    }

    let mut input = TaskInput::text(rest);
    if task_type == TaskType::ComparePredicate {
        let k_number = submission_number_regex()
            .find(rest)
            .map(|m| m.as_str().to_uppercase())
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "a 510(k) number is required, usage: {}",
                    task_type.usage()
                ))
            })?;
        input = input.with_param("k_number", serde_json::Value::String(k_number));
    }

    Ok(ParsedCommand::Task(TaskRequest::new(task_type, input)))
}
