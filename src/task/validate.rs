//! 工具输出的严格校验
//!
//! 能力返回的是上游/模型给出的 JSON（形状不可信），在 TaskExecutor 边界统一校验：
//! `{ content: string, confidence?: number, citations?: [Citation], data?: object }`。
//! 形状不符一律 MalformedResponse，不做静默修补。

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::result::{
    Citation, ClassificationData, ComparisonData, GuidanceDocument, PredicateDevice,
    StructuredData, ToolResult,
};
use super::types::TaskType;
use crate::core::ToolError;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolOutput {
    content: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    citations: Vec<Citation>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RawPredicates {
    devices: Vec<PredicateDevice>,
}

#[derive(Deserialize)]
struct RawGuidance {
    documents: Vec<GuidanceDocument>,
}

/// 510(k) / De Novo 编号
pub fn submission_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(K\d{6}|DEN\d{6})\b").expect("valid regex"))
}

fn malformed(msg: impl Into<String>) -> ToolError {
    ToolError::MalformedResponse(msg.into())
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), ToolError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(malformed(format!("{} {} outside [0, 1]", name, value)))
    }
}

/// 将工具原始输出校验并规范化为 ToolResult
pub fn validate_tool_output(task_type: TaskType, raw: Value) -> Result<ToolResult, ToolError> {
    if !raw.is_object() {
        return Err(malformed("tool output must be a JSON object"));
    }
    let raw: RawToolOutput =
        serde_json::from_value(raw).map_err(|e| malformed(e.to_string()))?;

    let confidence = match raw.confidence {
        Some(c) => {
            check_unit_interval("confidence", c)?;
            c
        }
        None if task_type.is_scoring() => {
            return Err(malformed(format!("missing confidence for {}", task_type)));
        }
        None => {
            tracing::warn!(task_type = %task_type, "tool result has no confidence, reporting 0");
            0.0
        }
    };

    let structured_data = match raw.data {
        Some(data) => Some(validate_data(task_type, data)?),
        None => return Err(malformed(format!("missing data payload for {}", task_type))),
    };

    Ok(ToolResult {
        content: raw.content,
        confidence,
        citations: raw.citations,
        structured_data,
    })
}

fn validate_data(task_type: TaskType, data: Value) -> Result<StructuredData, ToolError> {
    let shape_err = |e: serde_json::Error| malformed(format!("{} data: {}", task_type, e));
    match task_type {
        TaskType::ClassifyDevice => {
            let c: ClassificationData = serde_json::from_value(data).map_err(shape_err)?;
            if c.device_class.trim().is_empty() {
                return Err(malformed("empty device_class"));
            }
            Ok(StructuredData::Classification(c))
        }
        TaskType::PredicateSearch => {
            let p: RawPredicates = serde_json::from_value(data).map_err(shape_err)?;
            for device in &p.devices {
                if !submission_number_regex().is_match(&device.k_number) {
                    return Err(malformed(format!("invalid k_number '{}'", device.k_number)));
                }
                check_unit_interval("confidence_score", device.confidence_score)?;
            }
            Ok(StructuredData::Predicates { devices: p.devices })
        }
        TaskType::FindGuidance => {
            let g: RawGuidance = serde_json::from_value(data).map_err(shape_err)?;
            for doc in &g.documents {
                check_unit_interval("relevance", doc.relevance)?;
            }
            Ok(StructuredData::Guidance {
                documents: g.documents,
            })
        }
        TaskType::ComparePredicate => {
            let c: ComparisonData = serde_json::from_value(data).map_err(shape_err)?;
            if !submission_number_regex().is_match(&c.k_number) {
                return Err(malformed(format!("invalid k_number '{}'", c.k_number)));
            }
            Ok(StructuredData::Comparison(c))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classification_output(confidence: Value) -> Value {
        json!({
            "content": "Class II device",
            "confidence": confidence,
            "citations": [{
                "title": "21 CFR 870.2300",
                "url": "https://www.ecfr.gov/current/title-21/part-870/section-870.2300",
                "sourceType": "CFR_SECTION"
            }],
            "data": {
                "device_class": "Class II",
                "product_code": "DRT",
                "regulatory_pathway": "510(k)",
                "cfr_sections": ["21 CFR 870.2300"]
            }
        })
    }

    #[test]
    fn test_valid_classification() {
        let result =
            validate_tool_output(TaskType::ClassifyDevice, classification_output(json!(0.92)))
                .unwrap();
        assert_eq!(result.confidence, 0.92);
        assert_eq!(result.classification().unwrap().device_class, "Class II");
        assert_eq!(result.citations.len(), 1);
    }

    #[test]
    fn test_missing_confidence_on_scoring_task_is_malformed() {
        let mut raw = classification_output(json!(0.5));
        raw.as_object_mut().unwrap().remove("confidence");
        let err = validate_tool_output(TaskType::ClassifyDevice, raw).unwrap_err();
        assert!(matches!(err, ToolError::MalformedResponse(_)));
    }

    #[test]
    fn test_missing_confidence_on_guidance_defaults_to_zero() {
        let raw = json!({"content": "nothing found", "data": {"documents": []}});
        let result = validate_tool_output(TaskType::FindGuidance, raw).unwrap();
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_confidence_out_of_range() {
        let err = validate_tool_output(TaskType::ClassifyDevice, classification_output(json!(1.4)))
            .unwrap_err();
        assert!(matches!(err, ToolError::MalformedResponse(_)));
    }

    #[test]
    fn test_string_confidence_rejected() {
        let err =
            validate_tool_output(TaskType::ClassifyDevice, classification_output(json!("high")))
                .unwrap_err();
        assert!(matches!(err, ToolError::MalformedResponse(_)));
    }

    #[test]
    fn test_unexpected_top_level_field_rejected() {
        let mut raw = classification_output(json!(0.9));
        raw["score"] = json!(3);
        assert!(validate_tool_output(TaskType::ClassifyDevice, raw).is_err());
    }

    #[test]
    fn test_predicate_k_number_checked() {
        let raw = json!({
            "content": "1 predicate",
            "confidence": 0.8,
            "data": {"devices": [{
                "k_number": "X12",
                "device_name": "Monitor",
                "confidence_score": 0.8
            }]}
        });
        let err = validate_tool_output(TaskType::PredicateSearch, raw).unwrap_err();
        assert!(err.to_string().contains("k_number"));
    }

    #[test]
    fn test_predicates_parse_clearance_date() {
        let raw = json!({
            "content": "1 predicate",
            "confidence": 0.8,
            "data": {"devices": [{
                "k_number": "K192345",
                "device_name": "Cardiac Monitor",
                "intended_use": "Arrhythmia detection",
                "confidence_score": 0.8,
                "clearance_date": "2019-11-04"
            }]}
        });
        let result = validate_tool_output(TaskType::PredicateSearch, raw).unwrap();
        let date = result.predicates()[0].clearance_date.unwrap();
        assert_eq!(date.to_string(), "2019-11-04");
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(validate_tool_output(TaskType::FindGuidance, json!("text")).is_err());
    }
}
