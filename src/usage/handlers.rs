//! 用量查询 API 处理器

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

use super::router::UsageApiState;
use super::types::UsageQuery;

/// GET /api/admin/usage
pub async fn get_usage(
    State(state): State<UsageApiState>,
    Query(query): Query<UsageQuery>,
) -> impl IntoResponse {
    // 校验时间格式
    if let Some(ref t) = query.start_time {
        if chrono::DateTime::parse_from_rfc3339(t).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("无效的 startTime 格式，需要 RFC3339 格式: {}", t)}
                })),
            )
                .into_response();
        }
    }
    if let Some(ref t) = query.end_time {
        if chrono::DateTime::parse_from_rfc3339(t).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("无效的 endTime 格式，需要 RFC3339 格式: {}", t)}
                })),
            )
                .into_response();
        }
    }
    match state.recorder.query(query).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("查询用量记录失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("查询失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/admin/usage/stats
pub async fn get_usage_stats(State(state): State<UsageApiState>) -> impl IntoResponse {
    match state.recorder.get_stats().await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("获取用量统计失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("统计失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// DELETE /api/admin/usage 查询参数
#[derive(serde::Deserialize)]
pub struct ClearUsageQuery {
    pub before: Option<String>,
}

/// DELETE /api/admin/usage
pub async fn clear_usage(
    State(state): State<UsageApiState>,
    Query(query): Query<ClearUsageQuery>,
) -> impl IntoResponse {
    let before = query.before;

    // 校验 before 时间格式
    if let Some(ref before_str) = before {
        if chrono::DateTime::parse_from_rfc3339(before_str).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("无效的时间格式，需要 RFC3339 格式: {}", before_str)}
                })),
            )
                .into_response();
        }
    }

    match state.recorder.clear(before).await {
        Ok(count) => Json(serde_json::json!({
            "success": true,
            "message": format!("已清除 {} 条记录", count)
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("清空用量记录失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("清空失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}
