//! 代理中间件与共享状态

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};

use crate::channel::{ChannelStatus, ChannelStore};
use crate::common::auth;
use crate::dedup::PendingRequests;
use crate::dispatch::RetryPolicy;
use crate::usage::UsageRecorder;

use super::types::ErrorResponse;

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 渠道/别名/令牌存储
    pub store: ChannelStore,
    /// 用量记录服务
    pub recorder: Arc<UsageRecorder>,
    /// 上游 HTTP 客户端
    pub client: reqwest::Client,
    /// 重试策略
    pub policy: RetryPolicy,
    /// 模型过滤为空时是否回退到完整允许集合
    pub model_filter_fallback: bool,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
    /// 幂等键在途表
    pub pending: Arc<PendingRequests>,
}

/// 调用方令牌认证中间件
///
/// 提取 Bearer / x-api-key，以 SHA-256 摘要查找令牌记录，
/// 命中后把 TokenRecord 挂到请求扩展上供处理器使用。
pub async fn token_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = auth::extract_api_key(&request) else {
        return unauthorized();
    };

    match state.store.authenticate(&auth::sha256_hex(&key)).await {
        Ok(Some(token)) if token.status == ChannelStatus::Active => {
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Ok(_) => unauthorized(),
        Err(e) => {
            tracing::error!("令牌查询失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal_error()),
            )
                .into_response()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::authentication_error()),
    )
        .into_response()
}

/// CORS 中间件层
///
/// 当前配置允许所有来源，面向公开 API 服务场景。
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
