//! 前置器械检索：openFDA 510(k) 数据库
//!
//! 按器械名称检索已获批的 510(k) 记录，按相似度降序排列（相同分数按批准日期升序）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use super::matching::{overlap_score, round_score};
use super::source::SourceClient;
use super::tool_output;
use super::{Capability, InvocationContext};
use crate::core::ToolError;
use crate::task::{Citation, PredicateDevice, SourceType, TaskInput};

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct PredicateSearchParams {
    /// 返回条数上限（默认 10）
    limit: Option<u32>,
    /// 限定产品代码
    product_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenFdaSection {
    #[serde(default)]
    device_name: Option<String>,
}

/// openFDA 510(k) 记录
#[derive(Debug, Deserialize)]
pub(crate) struct PremarketRecord {
    #[serde(default)]
    pub k_number: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub applicant: String,
    #[serde(default)]
    pub decision_date: String,
    #[serde(default)]
    pub product_code: String,
    #[serde(default)]
    openfda: OpenFdaSection,
}

impl PremarketRecord {
    pub fn clearance_date(&self) -> Option<NaiveDate> {
        let raw = self.decision_date.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
            .ok()
    }

    /// 记录中没有适应症字段，用法规通用名描述用途
    pub fn intended_use(&self) -> String {
        match self.openfda.device_name.as_deref() {
            Some(generic) if !generic.is_empty() => {
                format!("{} (product code {})", generic, self.product_code)
            }
            _ => format!("Product code {}", self.product_code),
        }
    }
}

/// 510(k) 摘要页引用
pub fn premarket_citation(k_number: &str, device_name: &str) -> Citation {
    Citation::new(
        format!("510(k) {}: {}", k_number, device_name),
        format!(
            "https://www.accessdata.fda.gov/scripts/cdrh/cfdocs/cfpmn/pmn.cfm?ID={}",
            k_number
        ),
        SourceType::Fda510k,
    )
}

/// 按置信度降序、批准日期升序排序（无日期排在最后）
pub fn rank_predicates(devices: &mut [PredicateDevice]) {
    devices.sort_by(|a, b| {
        b.confidence_score
            .total_cmp(&a.confidence_score)
            .then_with(|| match (a.clearance_date, b.clearance_date) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });
}

/// 从响应中取出 results 数组
pub(crate) fn premarket_records(response: &Value) -> Result<Vec<PremarketRecord>, ToolError> {
    serde_json::from_value(response.get("results").cloned().unwrap_or(Value::Array(vec![])))
        .map_err(|e| ToolError::MalformedResponse(format!("510(k) results: {}", e)))
}

/// 前置器械检索
pub struct PredicateSearchTool {
    client: Arc<SourceClient>,
}

impl PredicateSearchTool {
    pub fn new(client: Arc<SourceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for PredicateSearchTool {
    fn name(&self) -> &str {
        "fda_510k_search"
    }

    fn description(&self) -> &str {
        "Search cleared 510(k) devices that could serve as predicates"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(PredicateSearchParams)).unwrap_or_default()
    }

    async fn invoke(&self, input: &TaskInput, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let query = input.text.trim();
        if query.is_empty() {
            return Err(ToolError::Validation("search keywords are required".into()));
        }
        let params: PredicateSearchParams =
            serde_json::from_value(Value::Object(input.params.clone())).unwrap_or_default();
        let limit = params.limit.unwrap_or(10).clamp(1, 50);

        let mut search = format!("device_name:\"{}\"", query.replace('"', ""));
        if let Some(code) = params.product_code.as_deref().filter(|c| !c.is_empty()) {
            search = format!("{} AND product_code:{}", search, code);
        }

        let response = self
            .client
            .get_json(
                "/device/510k.json",
                &[("search", search), ("limit", limit.to_string())],
            )
            .await?;
        let records = premarket_records(&response)?;

        let mut devices: Vec<PredicateDevice> = records
            .iter()
            .filter(|r| !r.k_number.is_empty())
            .map(|r| PredicateDevice {
                k_number: r.k_number.clone(),
                device_name: r.device_name.clone(),
                intended_use: r.intended_use(),
                confidence_score: round_score(0.4 + 0.6 * overlap_score(query, &r.device_name)),
                clearance_date: r.clearance_date(),
            })
            .collect();
        rank_predicates(&mut devices);

        let citations: Vec<Citation> = devices
            .iter()
            .take(5)
            .map(|d| premarket_citation(&d.k_number, &d.device_name))
            .collect();
        let confidence = devices.first().map(|d| d.confidence_score).unwrap_or(0.0);

        let mut content = format!("Found {} potential predicate device(s) for '{}'.\n", devices.len(), query);
        for d in devices.iter().take(5) {
            let applicant = records
                .iter()
                .find(|r| r.k_number == d.k_number)
                .map(|r| r.applicant.as_str())
                .unwrap_or("");
            content.push_str(&format!(
                "\n- **{}** {} ({}), similarity {:.0}%",
                d.k_number,
                d.device_name,
                applicant,
                d.confidence_score * 100.0
            ));
        }

        tracing::debug!(task_id = %ctx.task_id, found = devices.len(), "predicate search finished");

        tool_output(
            content,
            Some(confidence),
            &citations,
            &serde_json::json!({ "devices": devices }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(k: &str, score: f64, date: Option<&str>) -> PredicateDevice {
        PredicateDevice {
            k_number: k.into(),
            device_name: "Monitor".into(),
            intended_use: String::new(),
            confidence_score: score,
            clearance_date: date.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
        }
    }

    #[test]
    fn test_rank_by_confidence_then_earliest_clearance() {
        let mut devices = vec![
            device("K000001", 0.7, Some("2020-01-01")),
            device("K000002", 0.9, None),
            device("K000003", 0.7, Some("2015-06-30")),
            device("K000004", 0.7, None),
        ];
        rank_predicates(&mut devices);
        let order: Vec<&str> = devices.iter().map(|d| d.k_number.as_str()).collect();
        assert_eq!(order, vec!["K000002", "K000003", "K000001", "K000004"]);
    }

    #[test]
    fn test_record_parsing() {
        let response = serde_json::json!({
            "results": [{
                "k_number": "K192345",
                "device_name": "ECG Monitor",
                "applicant": "Acme Medical",
                "decision_date": "20191104",
                "product_code": "DRT",
                "openfda": {"device_name": "Monitor, Cardiac"}
            }]
        });
        let records = premarket_records(&response).unwrap();
        assert_eq!(records[0].clearance_date().unwrap().to_string(), "2019-11-04");
        assert_eq!(records[0].intended_use(), "Monitor, Cardiac (product code DRT)");
    }

    #[test]
    fn test_citation_points_to_pmn_database() {
        let c = premarket_citation("K192345", "ECG Monitor");
        assert!(c.url().ends_with("ID=K192345"));
        assert_eq!(c.source_type(), SourceType::Fda510k);
    }
}
