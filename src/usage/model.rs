//! 用量记录数据模型

use serde::Serialize;

/// 一次调度产生的用量记录
///
/// 每个顶层调度恰好写一条：成功归属选中渠道，
/// 失败归属最后尝试的渠道，纯传输失败没有渠道、token 记 0。
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub request_id: String,
    pub timestamp: String,
    /// 调用方令牌 id
    pub token_id: String,
    /// 成功或最后尝试的渠道 id；纯传输失败时为空
    pub channel_id: Option<String>,
    pub model: Option<String>,
    pub path: String,
    pub stream: bool,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    /// "ok" 或 "error"
    pub status: String,
    /// 最终上游 HTTP 状态码；纯传输失败时为空
    pub status_code: Option<u16>,
}
