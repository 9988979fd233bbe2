//! HTTP API（axum）
//!
//! 提交与轮询任务、会话恢复/关闭、仪表盘读取、项目删除与健康检查。
//! 错误映射：400 校验失败，404 未找到，409 会话已关闭，429 `{error, retryAfter}`，503 `{error}`。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;

use crate::core::{AgentResponse, Orchestrator, OrchestratorError, Submission};
use crate::task::Task;

type AppState = Arc<Orchestrator>;

/// 对外错误：把 OrchestratorError 映射为状态码与 JSON 体
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        match self.0 {
            OrchestratorError::Validation(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            OrchestratorError::UnknownProject(_)
            | OrchestratorError::SessionNotFound(_)
            | OrchestratorError::TaskNotFound(_) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            OrchestratorError::SessionClosed(_) => {
                (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
            }
            OrchestratorError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({ "error": message, "retryAfter": retry_after_secs })),
            )
                .into_response(),
            OrchestratorError::Persistence(ref e) => {
                tracing::error!(error = %e, "storage failure");
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": message }))).into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub project_id: String,
    pub user_id: String,
}

/// 轮询结果：任务本身与对应的 Agent 响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskView {
    task: Task,
    response: AgentResponse,
}

/// 构建路由；max_concurrency 为同时处理的请求上限
pub fn router(orchestrator: Arc<Orchestrator>, max_concurrency: usize) -> Router {
    Router::new()
        .route("/api/agent/chat", post(api_chat))
        .route("/api/agent/tasks/:id", get(api_task_get))
        .route("/api/agent/tasks/:id/resubmit", post(api_task_resubmit))
        .route("/api/sessions/:id", get(api_session_get).delete(api_session_close))
        .route("/projects/:id", axum::routing::delete(api_project_delete))
        .route("/projects/:id/dashboard", get(api_dashboard))
        .route("/projects/:id/classification", get(api_classification))
        .route("/projects/:id/predicates", get(api_predicates))
        .route("/api/agent/capabilities", get(api_capabilities))
        .route("/api/health", get(api_health))
        .layer(ConcurrencyLimitLayer::new(max_concurrency.max(1)))
        .with_state(orchestrator)
}

async fn api_chat(
    State(orchestrator): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let submission = orchestrator
        .handle_task_request(&req.project_id, &req.user_id, &req.message)
        .await?;
    Ok(match submission {
        Submission::Queued(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
        Submission::Help(response) => (StatusCode::OK, Json(response)).into_response(),
    })
}

async fn api_task_get(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let (task, response) = orchestrator.poll_response(&id).await?;
    Ok(Json(TaskView { task, response }))
}

async fn api_task_resubmit(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = orchestrator.resubmit(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn api_session_get(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = orchestrator.resume_session(&id).await?;
    Ok(Json(session).into_response())
}

async fn api_session_close(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = orchestrator.close_session(&id).await?;
    Ok(Json(json!({
        "sessionId": id,
        "cancelledTasks": cancelled.iter().map(|t| &t.id).collect::<Vec<_>>(),
    })))
}

async fn api_project_delete(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if orchestrator.delete_project(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(OrchestratorError::UnknownProject(id).into())
    }
}

async fn api_dashboard(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = orchestrator.get_snapshot(&id).await?;
    Ok(Json(snapshot).into_response())
}

async fn api_classification(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match orchestrator.classification(&id).await? {
        Some(view) => Ok(Json(view).into_response()),
        None => Err(OrchestratorError::UnknownProject(format!("{} has no classification", id)).into()),
    }
}

async fn api_predicates(
    State(orchestrator): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let predicates = orchestrator.predicates(&id).await?;
    Ok(Json(predicates).into_response())
}

/// 已注册能力的命令、描述与参数 schema
async fn api_capabilities(State(orchestrator): State<AppState>) -> Response {
    let schema: serde_json::Value =
        serde_json::from_str(&orchestrator.registry().to_schema_json()).unwrap_or_default();
    Json(schema).into_response()
}

async fn api_health(State(orchestrator): State<AppState>) -> Response {
    Json(orchestrator.health().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::OrchestratorBuilder;
    use crate::task::TaskType;
    use crate::tools::{MockCapability, ToolRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let mut registry = ToolRegistry::new();
        registry.register(
            TaskType::ClassifyDevice,
            MockCapability::classification("Class II", "DRT", 0.92),
        );
        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .build()
            .unwrap();
        router(orchestrator, 8)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chat(message: &str) -> Request<Body> {
        Request::post("/api/agent/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "message": message, "projectId": "proj_1", "userId": "user_1" }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_chat_queues_task() {
        let response = app().oneshot(chat("/classify-device cardiac monitor")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["type"], "classify_device");
        assert!(body["id"].as_str().unwrap().starts_with("task_"));
    }

    #[tokio::test]
    async fn test_chat_unrecognized_returns_help() {
        let response = app().oneshot(chat("hello there")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["type"], "agent_response");
        assert_eq!(body["confidence"], 0.95);
    }

    #[tokio::test]
    async fn test_chat_missing_input_is_bad_request() {
        let response = app().oneshot(chat("/classify-device")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let response = app()
            .oneshot(Request::get("/api/agent/tasks/task_missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_rate_limited_maps_to_429_with_retry_after() {
        let response = ApiError(OrchestratorError::RateLimited { retry_after_secs: 5 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[test]
    fn test_session_closed_maps_to_409() {
        let response = ApiError(OrchestratorError::SessionClosed("s".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_empty_project_dashboard() {
        let response = app()
            .oneshot(Request::get("/projects/proj_9/dashboard").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 0);
    }
}
