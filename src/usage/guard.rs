//! 用量记录守卫
//!
//! 每个顶层调度创建一个守卫，Drop 时写一条用量记录。
//! 靠 Drop 语义保证恰好一条：正常返回、提前出错、调用方断连
//! 把流中途丢弃，都会落到同一条路径上；中途观察到的部分用量
//! 也因此不会丢。

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::model::UsageRecord;
use super::store::UsageRecorder;
use crate::convert::types::TokenUsage;

/// 调度用量守卫
pub struct UsageGuard {
    recorder: Arc<UsageRecorder>,
    request_id: String,
    token_id: String,
    path: String,
    model: Option<String>,
    stream: bool,
    channel_id: Option<String>,
    ok: bool,
    status_code: Option<u16>,
    /// 与流式转码器共享的用量计数
    usage: Arc<Mutex<TokenUsage>>,
    start: Instant,
}

impl UsageGuard {
    pub fn new(
        recorder: Arc<UsageRecorder>,
        token_id: impl Into<String>,
        path: impl Into<String>,
        model: Option<String>,
        stream: bool,
    ) -> Self {
        Self {
            recorder,
            request_id: uuid::Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            path: path.into(),
            model,
            stream,
            channel_id: None,
            ok: false,
            status_code: None,
            usage: Arc::new(Mutex::new(TokenUsage::default())),
            start: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// 共享的用量计数单元，交给流式转码器随流更新
    pub fn usage_cell(&self) -> Arc<Mutex<TokenUsage>> {
        self.usage.clone()
    }

    /// 一次性写入用量（非流式路径）
    pub fn set_usage(&self, usage: TokenUsage) {
        *self.usage.lock() = usage;
    }

    /// 记录归属渠道（成功渠道或最后尝试的渠道）
    pub fn set_channel(&mut self, channel_id: impl Into<String>) {
        self.channel_id = Some(channel_id.into());
    }

    /// 记录最终结果分类与上游状态码
    pub fn set_outcome(&mut self, ok: bool, status_code: Option<u16>) {
        self.ok = ok;
        self.status_code = status_code;
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let usage = *self.usage.lock();
        let record = UsageRecord {
            id: 0,
            request_id: std::mem::take(&mut self.request_id),
            timestamp: chrono::Utc::now().to_rfc3339(),
            token_id: std::mem::take(&mut self.token_id),
            channel_id: self.channel_id.take(),
            model: self.model.take(),
            path: std::mem::take(&mut self.path),
            stream: self.stream,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total(),
            latency_ms: self.start.elapsed().as_millis() as i64,
            status: if self.ok { "ok" } else { "error" }.to_string(),
            status_code: self.status_code,
        };
        tracing::debug!(
            request_id = %record.request_id,
            channel = record.channel_id.as_deref().unwrap_or("-"),
            tokens = record.total_tokens,
            status = %record.status,
            "写入用量记录"
        );
        self.recorder.record(record);
    }
}
