//! 上游数据源客户端
//!
//! 每个外部数据源（openFDA API、FDA 网站）只有一个 SourceClient 实例，由共享它的能力持有 Arc；
//! 内部 Semaphore 限制对该上游的并发，这是对低配额 API 的准入控制点。
//! HTTP 状态统一映射为 ToolError：429 → RateLimited，5xx / 连接失败 → Unavailable，
//! 请求超时 → Timeout，响应体无法解析 → MalformedResponse。

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::ToolError;

const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// 单个上游数据源的共享客户端
pub struct SourceClient {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: Client,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl SourceClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        max_concurrent: usize,
        timeout_secs: u64,
    ) -> Result<Self, ToolError> {
        let name = name.into();
        let timeout = Duration::from_secs(timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reg-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ToolError::Unavailable(format!("{} http client: {}", name, e)))?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前空闲的并发许可数
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// GET JSON；openFDA 对「无匹配」返回 404，这里视为空结果集
    pub async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ToolError> {
        let mut params: Vec<(&str, String)> = query.to_vec();
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        let _permit = self.acquire().await?;
        let response = self.send(self.http.get(self.url(path)).query(&params)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(serde_json::json!({ "results": [] }));
        }
        let response = self.check_status(response)?;
        let body = response.bytes().await.map_err(|e| self.body_error(e))?;
        serde_json::from_slice(&body)
            .map_err(|e| ToolError::MalformedResponse(format!("{}: {}", self.name, e)))
    }

    /// GET 文本（HTML 页面等）
    pub async fn get_text(&self, path: &str) -> Result<String, ToolError> {
        let _permit = self.acquire().await?;
        let response = self.send(self.http.get(self.url(path))).await?;
        let response = self.check_status(response)?;
        response.text().await.map_err(|e| self.body_error(e))
    }

    /// 许可覆盖整个请求，包括读取响应体
    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, ToolError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| ToolError::Unavailable(format!("{} client closed", self.name)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ToolError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(self.timeout)
            } else {
                ToolError::Unavailable(format!("{}: {}", self.name, e))
            }
        })
    }

    fn body_error(&self, e: reqwest::Error) -> ToolError {
        if e.is_timeout() {
            ToolError::Timeout(self.timeout)
        } else if e.is_decode() {
            ToolError::MalformedResponse(format!("{}: {}", self.name, e))
        } else {
            ToolError::Unavailable(format!("{}: {}", self.name, e))
        }
    }

    fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, ToolError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ToolError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(ToolError::Unavailable(format!(
                "{} returned {}",
                self.name, status
            )));
        }
        Err(ToolError::Validation(format!(
            "{} rejected the query ({})",
            self.name, status
        )))
    }
}
