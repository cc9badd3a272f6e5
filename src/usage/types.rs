//! 用量查询 API 请求/响应类型

use serde::{Deserialize, Serialize};

/// 查询过滤器
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub model: Option<String>,
    pub channel: Option<String>,
    /// "ok" 或 "error"
    pub status: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// 分页响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageListResponse {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub records: Vec<UsageRecordResponse>,
}

/// 单条记录响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecordResponse {
    pub id: i64,
    pub request_id: String,
    pub timestamp: String,
    pub token_id: String,
    pub channel_id: Option<String>,
    pub model: Option<String>,
    pub path: String,
    pub stream: bool,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub status: String,
    pub status_code: Option<u16>,
}

/// 统计响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatsResponse {
    pub total_requests: u64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub models: Vec<ModelUsageStats>,
    pub channels: Vec<ChannelUsageStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsageStats {
    pub model: String,
    pub count: u64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUsageStats {
    pub channel_id: String,
    pub count: u64,
    pub total_tokens: i64,
    pub error_count: u64,
}
