//! 用量查询 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::get,
};

use crate::common::auth;

use super::handlers::{clear_usage, get_usage, get_usage_stats};
use super::store::UsageRecorder;

/// 用量查询 API 状态
#[derive(Clone)]
pub struct UsageApiState {
    pub admin_api_key: String,
    pub recorder: Arc<UsageRecorder>,
}

/// 用量 API 认证中间件
async fn usage_auth_middleware(
    State(state): State<UsageApiState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, &state.admin_api_key) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// 创建用量查询 API 路由
///
/// 返回 Router<()>，可直接 nest 到主应用
pub fn create_usage_router(admin_api_key: impl Into<String>, recorder: Arc<UsageRecorder>) -> Router {
    let state = UsageApiState {
        admin_api_key: admin_api_key.into(),
        recorder,
    };

    Router::new()
        .route("/usage", get(get_usage).delete(clear_usage))
        .route("/usage/stats", get(get_usage_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            usage_auth_middleware,
        ))
        .with_state(state)
}
