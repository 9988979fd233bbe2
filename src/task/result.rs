//! 工具结果与引用
//!
//! ToolResult 只能由 validate::validate_tool_output 从工具原始输出构造（测试辅助构造除外），
//! Citation 附加后不可变。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 引用来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "FDA_510K")]
    Fda510k,
    #[serde(rename = "CFR_SECTION")]
    CfrSection,
    #[serde(rename = "FDA_GUIDANCE")]
    FdaGuidance,
}

/// 法规来源引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Citation {
    title: String,
    url: String,
    source_type: SourceType,
}

impl Citation {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            source_type,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationData {
    pub device_class: String,
    pub product_code: String,
    pub regulatory_pathway: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub cfr_sections: Vec<String>,
}

/// 前置器械（predicate device）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDevice {
    pub k_number: String,
    pub device_name: String,
    #[serde(default)]
    pub intended_use: String,
    pub confidence_score: f64,
    #[serde(default)]
    pub clearance_date: Option<NaiveDate>,
}

/// 指南文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceDocument {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// 前置器械对比结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonData {
    pub k_number: String,
    pub device_name: String,
    #[serde(default)]
    pub similarities: Vec<String>,
    #[serde(default)]
    pub differences: Vec<String>,
    pub substantially_equivalent: bool,
}

/// 按任务类型区分的结构化载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredData {
    Classification(ClassificationData),
    Predicates { devices: Vec<PredicateDevice> },
    Guidance { documents: Vec<GuidanceDocument> },
    Comparison(ComparisonData),
}

/// 规范化后的工具输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: String,
    pub confidence: f64,
    pub citations: Vec<Citation>,
    pub structured_data: Option<StructuredData>,
}

impl ToolResult {
    /// 纯文本结果（无结构化载荷）
    pub fn text(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
            citations: Vec::new(),
            structured_data: None,
        }
    }

    pub fn classification(&self) -> Option<&ClassificationData> {
        match &self.structured_data {
            Some(StructuredData::Classification(c)) => Some(c),
            _ => None,
        }
    }

    pub fn predicates(&self) -> &[PredicateDevice] {
        match &self.structured_data {
            Some(StructuredData::Predicates { devices }) => devices,
            _ => &[],
        }
    }
}
