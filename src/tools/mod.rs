//! 能力层：openFDA / FDA 网站数据源上的监管分析工具

pub mod classification;
pub mod compare;
pub mod guidance;
pub mod matching;
pub mod mock;
pub mod predicate_search;
pub mod registry;
pub mod source;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::core::ToolError;
use crate::task::{Citation, TaskType};

pub use classification::ClassificationTool;
pub use compare::ComparePredicateTool;
pub use guidance::{default_catalog, GuidanceEntry, GuidanceSearchTool};
pub use mock::{MockCapability, LATENCY_PARAM};
pub use predicate_search::{rank_predicates, PredicateSearchTool};
pub use registry::{Capability, InvocationContext, ToolRegistry};
pub use source::SourceClient;

/// 组装能力原始输出；confidence 为 None 时省略该字段
pub(crate) fn tool_output<D: Serialize>(
    content: String,
    confidence: Option<f64>,
    citations: &[Citation],
    data: &D,
) -> Result<Value, ToolError> {
    let data = serde_json::to_value(data)
        .map_err(|e| ToolError::MalformedResponse(format!("serialize data: {}", e)))?;
    let citations = serde_json::to_value(citations)
        .map_err(|e| ToolError::MalformedResponse(format!("serialize citations: {}", e)))?;
    let mut output = serde_json::json!({
        "content": content,
        "citations": citations,
        "data": data,
    });
    if let Some(c) = confidence {
        output["confidence"] = serde_json::json!(c);
    }
    Ok(output)
}

/// 按配置构建注册表：离线模式全部使用固定应答
pub fn build_registry(config: &AppConfig) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    if config.fda.offline {
        tracing::info!("FDA sources offline, using canned capabilities");
        for task_type in TaskType::ALL {
            registry.register(task_type, MockCapability::offline(task_type));
        }
        return Ok(registry);
    }

    let fda = &config.fda;
    let openfda = Arc::new(SourceClient::new(
        "openfda",
        &fda.base_url,
        fda.api_key.clone(),
        fda.max_concurrent,
        fda.request_timeout_secs,
    )?);
    let fda_web = Arc::new(SourceClient::new(
        "fda-web",
        &fda.guidance_base_url,
        None,
        fda.max_concurrent,
        fda.request_timeout_secs,
    )?);

    registry.register(TaskType::ClassifyDevice, ClassificationTool::new(openfda.clone()));
    registry.register(TaskType::PredicateSearch, PredicateSearchTool::new(openfda.clone()));
    registry.register(
        TaskType::FindGuidance,
        GuidanceSearchTool::new(fda_web, fda.fetch_guidance_excerpts),
    );
    registry.register(TaskType::ComparePredicate, ComparePredicateTool::new(openfda));
    Ok(registry)
}
