//! 器械分类能力：openFDA classification 数据库
//!
//! 按器械名称检索产品代码，选出与描述最接近的一条，给出器械等级、监管路径与 CFR 条款。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use super::matching::{overlap_score, round_score};
use super::source::SourceClient;
use super::tool_output;
use super::{Capability, InvocationContext};
use crate::core::ToolError;
use crate::task::{Citation, ClassificationData, SourceType, TaskInput};

/// 结构化参数
#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ClassifyParams {
    /// 候选产品代码数量（默认 5）
    limit: Option<u32>,
}

/// openFDA classification 记录（只取用到的字段）
#[derive(Debug, Deserialize)]
struct ClassificationRecord {
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    device_class: String,
    #[serde(default)]
    product_code: String,
    #[serde(default)]
    regulation_number: String,
    #[serde(default)]
    medical_specialty_description: String,
}

/// 器械分类
pub struct ClassificationTool {
    client: Arc<SourceClient>,
}

impl ClassificationTool {
    pub fn new(client: Arc<SourceClient>) -> Self {
        Self { client }
    }
}

/// openFDA 的等级代码 → 展示文案
pub fn device_class_label(code: &str) -> &'static str {
    match code.trim() {
        "1" => "Class I",
        "2" => "Class II",
        "3" => "Class III",
        _ => "Unclassified",
    }
}

/// 等级 → 常规监管路径
pub fn regulatory_pathway(device_class: &str) -> &'static str {
    match device_class {
        "Class I" => "510(k) Exempt",
        "Class II" => "510(k)",
        "Class III" => "PMA",
        _ => "De Novo",
    }
}

/// 21 CFR 条款引用（eCFR 链接）
pub fn cfr_citation(regulation_number: &str) -> Citation {
    let part = regulation_number.split('.').next().unwrap_or(regulation_number);
    Citation::new(
        format!("21 CFR {}", regulation_number),
        format!(
            "https://www.ecfr.gov/current/title-21/part-{}/section-{}",
            part, regulation_number
        ),
        SourceType::CfrSection,
    )
}

#[async_trait]
impl Capability for ClassificationTool {
    fn name(&self) -> &str {
        "fda_classification"
    }

    fn description(&self) -> &str {
        "Determine FDA device class, product code and regulatory pathway"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(ClassifyParams)).unwrap_or_default()
    }

    async fn invoke(&self, input: &TaskInput, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let query = input.text.trim();
        if query.is_empty() {
            return Err(ToolError::Validation("device description is required".into()));
        }
        let params: ClassifyParams =
            serde_json::from_value(Value::Object(input.params.clone())).unwrap_or_default();
        let limit = params.limit.unwrap_or(5).clamp(1, 25);

        let response = self
            .client
            .get_json(
                "/device/classification.json",
                &[
                    ("search", format!("device_name:\"{}\"", query.replace('"', ""))),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let records: Vec<ClassificationRecord> = serde_json::from_value(
            response.get("results").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| ToolError::MalformedResponse(format!("classification results: {}", e)))?;

        let best = records
            .into_iter()
            .map(|r| (overlap_score(query, &r.device_name), r))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .ok_or_else(|| {
                ToolError::Validation(format!("no FDA classification matches '{}'", query))
            })?;
        let (score, record) = best;

        let device_class = device_class_label(&record.device_class).to_string();
        let pathway = regulatory_pathway(&device_class).to_string();
        let mut citations = Vec::new();
        let mut cfr_sections = Vec::new();
        if !record.regulation_number.is_empty() {
            let citation = cfr_citation(&record.regulation_number);
            cfr_sections.push(citation.title().to_string());
            citations.push(citation);
        }
        let reasoning = format!(
            "'{}' most closely matches product code {} ({}) reviewed by the {} panel.",
            query, record.product_code, record.device_name, record.medical_specialty_description
        );
        let confidence = round_score(0.5 + 0.5 * score);
        let content = format!(
            "**Classification:** {}\n\n**Product code:** {}\n\n**Pathway:** {}\n\n{}",
            device_class, record.product_code, pathway, reasoning
        );

        tracing::debug!(task_id = %ctx.task_id, product_code = %record.product_code, "classification matched");

        tool_output(
            content,
            Some(confidence),
            &citations,
            &ClassificationData {
                device_class,
                product_code: record.product_code,
                regulatory_pathway: pathway,
                reasoning,
                cfr_sections,
            },
        )
    }
}
