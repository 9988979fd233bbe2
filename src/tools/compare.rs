//! 前置器械对比
//!
//! `/compare-predicate K123456 <描述>`：取回该 510(k) 记录，与项目器械的描述 / 产品代码对比，
//! 给出相同点、差异与实质等同（substantial equivalence）倾向。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::matching::{keywords, overlap_score, round_score};
use super::predicate_search::{premarket_citation, premarket_records};
use super::source::SourceClient;
use super::tool_output;
use super::{Capability, InvocationContext};
use crate::core::ToolError;
use crate::task::{submission_number_regex, ComparisonData, TaskInput};

const EQUIVALENCE_THRESHOLD: f64 = 0.6;

/// 前置器械对比
pub struct ComparePredicateTool {
    client: Arc<SourceClient>,
}

impl ComparePredicateTool {
    pub fn new(client: Arc<SourceClient>) -> Self {
        Self { client }
    }
}

/// 从输入中取出 K 号（优先结构化参数）与剩余描述
fn split_input(input: &TaskInput) -> Option<(String, String)> {
    let found = submission_number_regex().find(&input.text);
    let rest = match found {
        Some(m) => format!("{} {}", &input.text[..m.start()], &input.text[m.end()..]),
        None => input.text.clone(),
    };
    let k_number = input
        .params
        .get("k_number")
        .and_then(Value::as_str)
        .or_else(|| found.map(|m| m.as_str()))?;
    Some((k_number.to_uppercase(), rest.trim().to_string()))
}

#[async_trait]
impl Capability for ComparePredicateTool {
    fn name(&self) -> &str {
        "fda_predicate_compare"
    }

    fn description(&self) -> &str {
        "Compare your device against a specific cleared predicate"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "k_number": { "type": "string", "pattern": "^(K|DEN)\\d{6}$" }
            },
            "required": []
        })
    }

    async fn invoke(&self, input: &TaskInput, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let (k_number, description) = split_input(input)
            .ok_or_else(|| ToolError::Validation("a 510(k) number such as K123456 is required".into()))?;

        let subject = if description.is_empty() {
            ctx.project
                .as_ref()
                .map(|p| p.device_description.clone())
                .unwrap_or_default()
        } else {
            description
        };
        if subject.trim().is_empty() {
            return Err(ToolError::Validation(
                "describe your device or set the project device description".into(),
            ));
        }

        let response = self
            .client
            .get_json(
                "/device/510k.json",
                &[("search", format!("k_number:{}", k_number)), ("limit", "1".to_string())],
            )
            .await?;
        let record = premarket_records(&response)?
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::Validation(format!("510(k) {} not found", k_number)))?;

        let subject_terms = keywords(&subject);
        let predicate_terms = keywords(&record.device_name);
        let mut similarities: Vec<String> = subject_terms
            .intersection(&predicate_terms)
            .map(|t| format!("Both devices are described as '{}'", t))
            .collect();
        let mut differences: Vec<String> = subject_terms
            .difference(&predicate_terms)
            .map(|t| format!("'{}' is not part of the predicate description", t))
            .collect();

        let project_code = ctx.project.as_ref().and_then(|p| p.product_code.clone());
        let same_code = match project_code.as_deref() {
            Some(code) if code.eq_ignore_ascii_case(&record.product_code) => {
                similarities.insert(0, format!("Same product code ({})", code));
                true
            }
            Some(code) => {
                differences.insert(
                    0,
                    format!("Product code differs ({} vs {})", code, record.product_code),
                );
                false
            }
            None => false,
        };

        let overlap = overlap_score(&subject, &record.device_name);
        let confidence = round_score(0.3 + 0.4 * overlap + if same_code { 0.3 } else { 0.0 });
        let substantially_equivalent = confidence >= EQUIVALENCE_THRESHOLD;

        let content = format!(
            "Comparison with **{}** ({}, cleared {}): {} similarities, {} differences. {}",
            record.k_number,
            record.device_name,
            record.decision_date,
            similarities.len(),
            differences.len(),
            if substantially_equivalent {
                "The predicate looks like a reasonable basis for substantial equivalence."
            } else {
                "Substantial equivalence to this predicate looks doubtful."
            }
        );
        let citations = vec![premarket_citation(&record.k_number, &record.device_name)];

        tool_output(
            content,
            Some(confidence),
            &citations,
            &ComparisonData {
                k_number: record.k_number,
                device_name: record.device_name,
                similarities,
                differences,
                substantially_equivalent,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_input_from_text() {
        let (k, rest) = split_input(&TaskInput::text("k192345 wearable ECG patch")).unwrap();
        assert_eq!(k, "K192345");
        assert_eq!(rest, "wearable ECG patch");
    }

    #[test]
    fn test_split_input_prefers_params() {
        let input = TaskInput::text("patch").with_param("k_number", serde_json::json!("den200001"));
        let (k, rest) = split_input(&input).unwrap();
        assert_eq!(k, "DEN200001");
        assert_eq!(rest, "patch");
    }

    #[test]
    fn test_split_input_requires_number() {
        assert!(split_input(&TaskInput::text("compare with my monitor")).is_none());
    }
}
