//! FDA 指南文档检索
//!
//! 在指南目录中按关键词重叠打分，取前几篇；可选地经 FDA 网站客户端抓取原文并用 html2text 提取摘要。
//! 非评分类任务：无匹配时不给 confidence。

use std::sync::Arc;

use async_trait::async_trait;
use html2text::from_read;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::matching::{overlap_score, round_score};
use super::source::SourceClient;
use super::tool_output;
use super::{Capability, InvocationContext};
use crate::core::ToolError;
use crate::task::{Citation, GuidanceDocument, SourceType, TaskInput};

const MAX_RESULTS: usize = 3;
const EXCERPT_CHARS: usize = 400;

/// 目录条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceEntry {
    pub title: String,
    /// 相对 FDA 网站根的路径
    pub path: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl GuidanceEntry {
    fn new(title: &str, path: &str, topics: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            path: path.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// 内置的常用器械指南目录
pub fn default_catalog() -> Vec<GuidanceEntry> {
    const PREFIX: &str = "/regulatory-information/search-fda-guidance-documents";
    vec![
        GuidanceEntry::new(
            "The 510(k) Program: Evaluating Substantial Equivalence in Premarket Notifications [510(k)]",
            &format!("{PREFIX}/510k-program-evaluating-substantial-equivalence-premarket-notifications-510k"),
            &["510k", "predicate", "substantial", "equivalence", "premarket", "notification"],
        ),
        GuidanceEntry::new(
            "Deciding When to Submit a 510(k) for a Change to an Existing Device",
            &format!("{PREFIX}/deciding-when-submit-510k-change-existing-device"),
            &["510k", "change", "modification", "existing"],
        ),
        GuidanceEntry::new(
            "Content of Premarket Submissions for Device Software Functions",
            &format!("{PREFIX}/content-premarket-submissions-device-software-functions"),
            &["software", "samd", "documentation", "premarket"],
        ),
        GuidanceEntry::new(
            "Cybersecurity in Medical Devices: Quality System Considerations and Content of Premarket Submissions",
            &format!("{PREFIX}/cybersecurity-medical-devices-quality-system-considerations-and-content-premarket-submissions"),
            &["cybersecurity", "security", "software", "connected", "wireless"],
        ),
        GuidanceEntry::new(
            "Applying Human Factors and Usability Engineering to Medical Devices",
            &format!("{PREFIX}/applying-human-factors-and-usability-engineering-medical-devices"),
            &["human", "factors", "usability", "user", "interface"],
        ),
        GuidanceEntry::new(
            "Use of International Standard ISO 10993-1, Biological evaluation of medical devices",
            &format!("{PREFIX}/use-international-standard-iso-10993-1-biological-evaluation-medical-devices-part-1-evaluation-and"),
            &["biocompatibility", "iso", "10993", "biological", "implant", "contact"],
        ),
        GuidanceEntry::new(
            "Requests for Feedback and Meetings for Medical Device Submissions: The Q-Submission Program",
            &format!("{PREFIX}/requests-feedback-and-meetings-medical-device-submissions-q-submission-program"),
            &["presubmission", "pre", "sub", "meeting", "feedback", "q"],
        ),
        GuidanceEntry::new(
            "De Novo Classification Process (Evaluation of Automatic Class III Designation)",
            &format!("{PREFIX}/de-novo-classification-process-evaluation-automatic-class-iii-designation"),
            &["de", "novo", "classification", "novel", "class"],
        ),
        GuidanceEntry::new(
            "Electromagnetic Compatibility (EMC) of Medical Devices",
            &format!("{PREFIX}/electromagnetic-compatibility-emc-medical-devices"),
            &["emc", "electromagnetic", "compatibility", "electrical", "monitor"],
        ),
        GuidanceEntry::new(
            "Clinical Decision Support Software",
            &format!("{PREFIX}/clinical-decision-support-software"),
            &["clinical", "decision", "support", "software", "ai", "algorithm"],
        ),
    ]
}

/// 指南检索
pub struct GuidanceSearchTool {
    client: Arc<SourceClient>,
    catalog: Vec<GuidanceEntry>,
    fetch_excerpts: bool,
}

impl GuidanceSearchTool {
    pub fn new(client: Arc<SourceClient>, fetch_excerpts: bool) -> Self {
        Self::with_catalog(client, default_catalog(), fetch_excerpts)
    }

    pub fn with_catalog(
        client: Arc<SourceClient>,
        catalog: Vec<GuidanceEntry>,
        fetch_excerpts: bool,
    ) -> Self {
        Self {
            client,
            catalog,
            fetch_excerpts,
        }
    }

    /// 按相关度排序的匹配条目
    pub fn rank(&self, query: &str) -> Vec<(f64, &GuidanceEntry)> {
        let mut scored: Vec<(f64, &GuidanceEntry)> = self
            .catalog
            .iter()
            .map(|e| {
                let haystack = format!("{} {}", e.title, e.topics.join(" "));
                (overlap_score(query, &haystack), e)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(MAX_RESULTS);
        scored
    }

    async fn excerpt(&self, path: &str) -> Option<String> {
        let html = match self.client.get_text(path).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(path, error = %e, "guidance excerpt fetch failed");
                return None;
            }
        };
        let text = from_read(html.as_bytes(), 120).ok()?;
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return None;
        }
        Some(text.chars().take(EXCERPT_CHARS).collect())
    }
}

#[async_trait]
impl Capability for GuidanceSearchTool {
    fn name(&self) -> &str {
        "fda_guidance_search"
    }

    fn description(&self) -> &str {
        "Find FDA guidance documents relevant to a topic"
    }

    async fn invoke(&self, input: &TaskInput, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let query = input.text.trim();
        if query.is_empty() {
            return Err(ToolError::Validation("guidance topic is required".into()));
        }

        let ranked = self.rank(query);
        let mut documents = Vec::with_capacity(ranked.len());
        let mut citations = Vec::with_capacity(ranked.len());
        for (score, entry) in &ranked {
            let url = format!("https://www.fda.gov{}", entry.path);
            let excerpt = if self.fetch_excerpts {
                self.excerpt(&entry.path).await
            } else {
                None
            };
            citations.push(Citation::new(entry.title.clone(), url.clone(), SourceType::FdaGuidance));
            documents.push(GuidanceDocument {
                title: entry.title.clone(),
                url,
                relevance: round_score(*score),
                excerpt,
            });
        }

        let content = if documents.is_empty() {
            format!("No FDA guidance documents matched '{}'. Try broader terms.", query)
        } else {
            let mut s = format!("Relevant FDA guidance for '{}':\n", query);
            for d in &documents {
                s.push_str(&format!("\n- [{}]({})", d.title, d.url));
            }
            s
        };
        let confidence = documents.first().map(|d| round_score(0.5 + 0.5 * d.relevance));

        tracing::debug!(task_id = %ctx.task_id, matched = documents.len(), "guidance search finished");

        tool_output(
            content,
            confidence,
            &citations,
            &serde_json::json!({ "documents": documents }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{validate_tool_output, TaskType};

    fn tool() -> GuidanceSearchTool {
        let client = Arc::new(SourceClient::new("fda-web", "http://127.0.0.1:9", None, 1, 1).unwrap());
        GuidanceSearchTool::new(client, false)
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            task_id: "task_g".into(),
            project_id: "p".into(),
            session_id: "s".into(),
            attempt: 0,
            project: None,
        }
    }

    #[test]
    fn test_rank_prefers_topic_overlap() {
        let t = tool();
        let ranked = t.rank("cybersecurity for wireless software");
        assert!(!ranked.is_empty());
        assert!(ranked[0].1.title.starts_with("Cybersecurity"));
        assert!(ranked.len() <= MAX_RESULTS);
    }

    #[tokio::test]
    async fn test_output_passes_validation() {
        let raw = tool()
            .invoke(&TaskInput::text("substantial equivalence predicate"), &ctx())
            .await
            .unwrap();
        let result = validate_tool_output(TaskType::FindGuidance, raw).unwrap();
        assert!(result.confidence > 0.0);
        assert!(result
            .citations
            .iter()
            .all(|c| c.source_type() == SourceType::FdaGuidance));
    }

    #[tokio::test]
    async fn test_no_match_has_zero_confidence() {
        let raw = tool()
            .invoke(&TaskInput::text("zzzz qqqq"), &ctx())
            .await
            .unwrap();
        assert!(raw.get("confidence").is_none());
        let result = validate_tool_output(TaskType::FindGuidance, raw).unwrap();
        assert_eq!(result.confidence, 0.0);
    }
}
