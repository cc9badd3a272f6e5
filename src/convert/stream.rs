//! SSE 流式转码器
//!
//! 两个独立的有状态转换：逐块消费一侧方言的 `event:`/`data:` 帧流，
//! 产出另一侧方言的帧流。单趟、按行缓冲——一帧可能跨多次网络读取，
//! 行尾残片保留到下一次调用。单帧数据解析失败时静默跳过，保持流存活。
//! 事件顺序严格保留，文本增量不合并、不重排。

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;

use super::types::{AnthropicStreamEvent, OpenAiStreamChunk, TokenUsage};
use super::{map_finish_reason, map_stop_reason};

/// OpenAI 流的终止帧
const DONE_FRAME: &str = "data: [DONE]\n\n";

/// SSE 转码器统一接口：逐块喂入，流结束时补尾
pub trait SseTranscode: Send + 'static {
    /// 喂入一段原始字节，返回已可输出的完整帧
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes>;
    /// 上游流结束，处理残留缓冲并补发协议要求的收尾帧
    fn finish(&mut self) -> Vec<Bytes>;
}

// === Anthropic → OpenAI ===

/// Anthropic SSE 事件流 → OpenAI chunk 流
pub struct AnthropicToOpenAiStream {
    buf: String,
    /// 当前 `event:` 行声明的事件类型
    event_type: String,
    message_id: String,
    model: String,
    done_sent: bool,
    usage: Arc<Mutex<TokenUsage>>,
}

impl AnthropicToOpenAiStream {
    pub fn new(usage: Arc<Mutex<TokenUsage>>) -> Self {
        Self {
            buf: String::new(),
            event_type: String::new(),
            message_id: String::new(),
            model: String::new(),
            done_sent: false,
            usage,
        }
    }

    fn handle_payload(&mut self, payload: &str, out: &mut Vec<Bytes>) {
        let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(payload) else {
            // 单帧数据坏掉不中断整个流
            return;
        };
        // data 里的 type 比 event: 行更可靠（兼容只发 data 的上游）
        let event_type = event
            .event_type
            .clone()
            .unwrap_or_else(|| self.event_type.clone());

        match event_type.as_str() {
            "message_start" => {
                if let Some(message) = &event.message {
                    if let Some(id) = &message.id {
                        self.message_id = id.clone();
                    }
                    if let Some(model) = &message.model {
                        self.model = model.clone();
                    }
                    let mut chunk = self.base_chunk();
                    chunk["choices"] = json!([{
                        "index": 0,
                        "delta": {"role": "assistant", "content": ""},
                        "finish_reason": null,
                    }]);
                    if let Some(usage) = message.usage {
                        self.usage.lock().prompt_tokens = usage.input_tokens;
                        chunk["usage"] = json!({
                            "prompt_tokens": usage.input_tokens,
                            "completion_tokens": 0,
                            "total_tokens": usage.input_tokens,
                        });
                    }
                    out.push(frame_data(&chunk));
                }
            }
            "content_block_delta" => {
                let text = event
                    .delta
                    .as_ref()
                    .filter(|d| d.delta_type.as_deref() == Some("text_delta"))
                    .and_then(|d| d.text.as_deref());
                if let Some(text) = text {
                    let mut chunk = self.base_chunk();
                    chunk["choices"] = json!([{
                        "index": 0,
                        "delta": {"content": text},
                        "finish_reason": null,
                    }]);
                    out.push(frame_data(&chunk));
                }
            }
            "message_delta" => {
                let stop_reason = event
                    .delta
                    .as_ref()
                    .and_then(|d| d.stop_reason.as_deref());
                let mut chunk = self.base_chunk();
                chunk["choices"] = json!([{
                    "index": 0,
                    "delta": {},
                    "finish_reason": map_stop_reason(stop_reason),
                }]);
                if let Some(usage) = event.usage {
                    self.usage.lock().completion_tokens = usage.output_tokens;
                    chunk["usage"] = json!({
                        "prompt_tokens": 0,
                        "completion_tokens": usage.output_tokens,
                        "total_tokens": usage.output_tokens,
                    });
                }
                out.push(frame_data(&chunk));
            }
            "message_stop" => {
                if !self.done_sent {
                    self.done_sent = true;
                    out.push(Bytes::from_static(DONE_FRAME.as_bytes()));
                }
            }
            // ping、content_block_start 等事件在 OpenAI 侧没有对应物
            _ => {}
        }
    }

    fn base_chunk(&self) -> serde_json::Value {
        json!({
            "id": super::openai_response_id(if self.message_id.is_empty() {
                None
            } else {
                Some(self.message_id.as_str())
            }),
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
        })
    }
}

impl SseTranscode for AnthropicToOpenAiStream {
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(newline) = self.buf.find('\n') {
            let line = self.buf[..newline].trim().to_string();
            self.buf.drain(..=newline);

            if let Some(event_type) = line.strip_prefix("event:") {
                self.event_type = event_type.trim().to_string();
            } else if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() {
                    self.handle_payload(payload, &mut out);
                }
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        // 处理残留的最后一行（上游没有以换行收尾的情况）
        let rest = std::mem::take(&mut self.buf);
        let line = rest.trim();
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim();
            if !payload.is_empty() && payload != "[DONE]" {
                self.handle_payload(payload, &mut out);
            }
        }
        // 上游没发 message_stop 时兜底补终止帧
        if !self.done_sent {
            self.done_sent = true;
            out.push(Bytes::from_static(DONE_FRAME.as_bytes()));
        }
        out
    }
}

// === OpenAI → Anthropic ===

/// OpenAI chunk 流 → Anthropic SSE 事件流
///
/// 源流没有信封事件，首个内容 chunk 到达时合成 `message_start` +
/// `content_block_start`；终止 chunk 合成 `content_block_stop` +
/// `message_delta`；流结束兜底补 `message_stop`。
pub struct OpenAiToAnthropicStream {
    buf: String,
    /// 合成 message_start 时使用的模型名（chunk 自带 model 时优先）
    model: String,
    sent_message_start: bool,
    stop_sent: bool,
    /// 已分配的内容块序号，相对信封是否已发出计算增量下标
    content_block_index: usize,
    usage: Arc<Mutex<TokenUsage>>,
}

impl OpenAiToAnthropicStream {
    pub fn new(model: impl Into<String>, usage: Arc<Mutex<TokenUsage>>) -> Self {
        Self {
            buf: String::new(),
            model: model.into(),
            sent_message_start: false,
            stop_sent: false,
            content_block_index: 0,
            usage,
        }
    }

    /// 当前活跃内容块的下标
    fn active_index(&self) -> usize {
        self.content_block_index
            .saturating_sub(if self.sent_message_start { 1 } else { 0 })
    }

    fn handle_payload(&mut self, payload: &str, out: &mut Vec<Bytes>) {
        let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(payload) else {
            return;
        };

        let first = chunk.choices.first();
        let delta_content = first.and_then(|c| c.delta.content.as_deref());
        let finish_reason = first.and_then(|c| c.finish_reason.as_deref());

        if let Some(usage) = chunk.usage {
            let mut tracked = self.usage.lock();
            if usage.prompt_tokens > 0 {
                tracked.prompt_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                tracked.completion_tokens = usage.completion_tokens;
            }
        }

        if !self.sent_message_start {
            let message_start = json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4()),
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.model.as_deref().unwrap_or(&self.model),
                    "content": [],
                    "stop_reason": null,
                    "usage": {
                        "input_tokens": chunk.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                        "output_tokens": 0,
                    },
                },
            });
            out.push(frame_event("message_start", &message_start));
            let block_start = json!({
                "type": "content_block_start",
                "index": self.content_block_index,
                "content_block": {"type": "text", "text": ""},
            });
            out.push(frame_event("content_block_start", &block_start));
            self.sent_message_start = true;
            self.content_block_index += 1;
        }

        if let Some(text) = delta_content {
            if !text.is_empty() {
                let event = json!({
                    "type": "content_block_delta",
                    "index": self.active_index(),
                    "delta": {"type": "text_delta", "text": text},
                });
                out.push(frame_event("content_block_delta", &event));
            }
        }

        if let Some(finish_reason) = finish_reason {
            let block_stop = json!({
                "type": "content_block_stop",
                "index": self.active_index(),
            });
            out.push(frame_event("content_block_stop", &block_stop));
            let message_delta = json!({
                "type": "message_delta",
                "delta": {"stop_reason": map_finish_reason(Some(finish_reason))},
                "usage": {
                    "output_tokens": chunk.usage.map(|u| u.completion_tokens).unwrap_or(0),
                },
            });
            out.push(frame_event("message_delta", &message_delta));
        }
    }

    fn message_stop(&mut self) -> Bytes {
        self.stop_sent = true;
        frame_event("message_stop", &json!({"type": "message_stop"}))
    }
}

impl SseTranscode for OpenAiToAnthropicStream {
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(newline) = self.buf.find('\n') {
            let line = self.buf[..newline].trim().to_string();
            self.buf.drain(..=newline);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                if !self.stop_sent {
                    let stop = self.message_stop();
                    out.push(stop);
                }
                continue;
            }
            self.handle_payload(payload, &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buf);
        let line = rest.trim();
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim();
            if !payload.is_empty() && payload != "[DONE]" {
                self.handle_payload(payload, &mut out);
            }
        }
        // 信封已发出但上游没走到 [DONE]：兜底收尾
        if self.sent_message_start && !self.stop_sent {
            let stop = self.message_stop();
            out.push(stop);
        }
        out
    }
}

fn frame_data(value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

fn frame_event(event_type: &str, value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, value))
}
