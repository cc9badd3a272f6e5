//! API Key 提取与校验

use axum::body::Body;
use axum::http::Request;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 从请求中提取 API Key
///
/// 依次尝试：
/// - `x-api-key` header
/// - `Authorization: Bearer <key>` header
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// 常量时间字符串比较，防止时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// 计算字符串的 SHA-256 摘要（十六进制小写）
///
/// 调用方令牌以摘要形式存储，网关不落盘明文密钥
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
