//! 代理 API 类型定义

use serde::Serialize;

// === 错误响应 ===

/// API 错误响应
///
/// error.type 是稳定的机器可读错误码，message 面向人阅读。
/// 不向调用方泄露上游凭据或内部错误原文。
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    /// 创建新的错误响应
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    /// 创建认证错误响应
    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Invalid API key")
    }

    /// 没有可用渠道
    pub fn no_available_channels() -> Self {
        Self::new("no_available_channels", "no_available_channels")
    }

    /// 所有渠道耗尽且没有可透传的上游响应
    pub fn upstream_unavailable() -> Self {
        Self::new("upstream_unavailable", "upstream_unavailable")
    }

    /// 幂等键冲突
    pub fn duplicate_request() -> Self {
        Self::new(
            "duplicate_request",
            "A request with this Idempotency-Key is already in flight",
        )
    }

    /// 请求格式错误
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message)
    }

    /// 内部错误（细节只进日志）
    pub fn internal_error() -> Self {
        Self::new("internal_error", "internal error")
    }
}

// === Models 端点类型 ===

/// 模型信息（OpenAI /v1/models 形态）
#[derive(Debug, Serialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// 模型列表响应
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<Model>,
}
