//! 离线 / 测试用能力
//!
//! 返回预设的原始输出，可注入延迟与失败；`fda.offline = true` 时整套注册表都用它。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use super::{Capability, InvocationContext};
use crate::core::ToolError;
use crate::task::{GuidanceDocument, PredicateDevice, TaskInput, TaskType};

/// 输入参数中的延迟覆盖（毫秒）
pub const LATENCY_PARAM: &str = "mock_latency_ms";

/// 预设响应的能力
pub struct MockCapability {
    name: String,
    /// 依次返回；只剩最后一个时重复返回
    script: Mutex<VecDeque<Result<Value, ToolError>>>,
    latency: Duration,
    calls: Arc<AtomicU32>,
}

impl MockCapability {
    pub fn new(name: impl Into<String>, response: Result<Value, ToolError>) -> Self {
        Self::scripted(name, vec![response])
    }

    pub fn scripted(name: impl Into<String>, responses: Vec<Result<Value, ToolError>>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(responses.into()),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn raw(output: Value) -> Self {
        Self::new("mock_raw", Ok(output))
    }

    pub fn failing(error: ToolError) -> Self {
        Self::new("mock_failing", Err(error))
    }

    pub fn classification(device_class: &str, product_code: &str, confidence: f64) -> Self {
        let pathway = super::classification::regulatory_pathway(device_class);
        Self::raw(json!({
            "content": format!("**Classification:** {}\n\n**Product code:** {}\n\n**Pathway:** {}",
                device_class, product_code, pathway),
            "confidence": confidence,
            "citations": [],
            "data": {
                "device_class": device_class,
                "product_code": product_code,
                "regulatory_pathway": pathway,
                "reasoning": "offline classification",
                "cfr_sections": []
            }
        }))
    }

    pub fn predicates(devices: Vec<PredicateDevice>) -> Self {
        let confidence = devices
            .iter()
            .map(|d| d.confidence_score)
            .fold(0.0_f64, f64::max);
        let citations: Vec<Value> = devices
            .iter()
            .map(|d| {
                serde_json::to_value(super::predicate_search::premarket_citation(
                    &d.k_number,
                    &d.device_name,
                ))
                .unwrap_or(Value::Null)
            })
            .collect();
        Self::raw(json!({
            "content": format!("Found {} potential predicate device(s).", devices.len()),
            "confidence": confidence,
            "citations": citations,
            "data": { "devices": devices }
        }))
    }

    pub fn guidance(documents: Vec<GuidanceDocument>) -> Self {
        let mut output = json!({
            "content": format!("{} guidance document(s).", documents.len()),
            "citations": [],
            "data": { "documents": documents }
        });
        if let Some(top) = documents.first() {
            output["confidence"] = json!(top.relevance);
        }
        Self::raw(output)
    }

    pub fn comparison(k_number: &str, confidence: f64) -> Self {
        Self::raw(json!({
            "content": format!("Comparison with {}", k_number),
            "confidence": confidence,
            "citations": [],
            "data": {
                "k_number": k_number,
                "device_name": "Predicate device",
                "similarities": ["Same intended use"],
                "differences": [],
                "substantially_equivalent": confidence >= 0.6
            }
        }))
    }

    /// 离线模式下各任务类型的固定应答
    pub fn offline(task_type: TaskType) -> Self {
        let mock = match task_type {
            TaskType::ClassifyDevice => Self::classification("Class II", "DRT", 0.8),
            TaskType::PredicateSearch => Self::predicates(vec![PredicateDevice {
                k_number: "K000000".into(),
                device_name: "Offline predicate".into(),
                intended_use: "Offline data".into(),
                confidence_score: 0.7,
                clearance_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            }]),
            TaskType::FindGuidance => Self::guidance(vec![GuidanceDocument {
                title: "The 510(k) Program: Evaluating Substantial Equivalence in Premarket Notifications [510(k)]".into(),
                url: "https://www.fda.gov/regulatory-information/search-fda-guidance-documents/510k-program-evaluating-substantial-equivalence-premarket-notifications-510k".into(),
                relevance: 0.5,
                excerpt: None,
            }]),
            TaskType::ComparePredicate => Self::comparison("K000000", 0.6),
        };
        mock.named(format!("offline_{}", task_type.as_str()))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 调用计数（含失败的调用）
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    fn next_response(&self) -> Result<Value, ToolError> {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if script.len() > 1 {
            script
                .pop_front()
                .unwrap_or_else(|| Err(ToolError::Unavailable("empty script".into())))
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ToolError::Unavailable("empty script".into())))
        }
    }
}

#[async_trait]
impl Capability for MockCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Canned responses without network access"
    }

    async fn invoke(&self, input: &TaskInput, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = input
            .params
            .get(LATENCY_PARAM)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.next_response()
    }
}
