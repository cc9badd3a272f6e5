//! 两种方言的请求/响应类型定义
//!
//! 字段集合并不对等，转换是尽力而为的有损映射。已知字段显式建模，
//! 未知字段通过 flatten 原样保留，避免静默丢字段；
//! 消息 content 可能是字符串或内容块数组，保持 Value 灵活处理。

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === 共用 ===

/// 一次请求的 token 用量（以 OpenAI 命名为内部标准）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// OpenAI `stop` 字段：单个字符串或字符串数组
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

// === OpenAI chat completion 请求 ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    /// 可以是 string 或内容块数组
    pub content: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// === Anthropic messages 请求 ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    /// 可以是 string 或 ContentBlock 数组
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<AnthropicMessage>,
    /// string 或 `{type:"text", text}` 块数组
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// === 响应 ===

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    /// ContentBlock 数组，块类型按 `type` 字段区分
    #[serde(default)]
    pub content: Vec<Value>,
    pub stop_reason: Option<String>,
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiChoiceMessage {
    #[serde(default)]
    pub role: Option<String>,
    /// 正常为 string；上游返回块数组时原样忽略非文本形态
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: OpenAiChoiceMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    pub usage: Option<OpenAiUsage>,
}

// === 流式事件（解析侧） ===

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicStreamMessage {
    pub id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicStreamDelta {
    #[serde(rename = "type")]
    pub delta_type: Option<String>,
    pub text: Option<String>,
    pub stop_reason: Option<String>,
}

/// Anthropic SSE 事件的数据载荷
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub message: Option<AnthropicStreamMessage>,
    pub delta: Option<AnthropicStreamDelta>,
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamDelta {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChoice {
    #[serde(default)]
    pub delta: OpenAiStreamDelta,
    pub finish_reason: Option<String>,
}

/// OpenAI SSE chunk 的数据载荷
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiStreamChoice>,
    pub usage: Option<OpenAiUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// stop 字段兼容 string 与数组两种形态
    #[test]
    fn test_stop_sequences_untagged() {
        let req: OpenAiRequest =
            serde_json::from_str(r#"{"messages": [], "stop": "END"}"#).unwrap();
        assert_eq!(req.stop.unwrap().into_vec(), vec!["END"]);

        let req: OpenAiRequest =
            serde_json::from_str(r#"{"messages": [], "stop": ["a", "b"]}"#).unwrap();
        assert_eq!(req.stop.unwrap().into_vec(), vec!["a", "b"]);
    }

    /// 未建模字段经 flatten 保留
    #[test]
    fn test_extra_fields_preserved() {
        let req: OpenAiRequest = serde_json::from_str(
            r#"{"model": "m", "messages": [], "logit_bias": {"50256": -100}}"#,
        )
        .unwrap();
        assert!(req.extra.contains_key("logit_bias"));

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["logit_bias"]["50256"], -100);
    }

    #[test]
    fn test_anthropic_usage_defaults() {
        let usage: AnthropicUsage = serde_json::from_str("{}").unwrap();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }

    #[test]
    fn test_stream_event_parse() {
        let event: AnthropicStreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type.as_deref(), Some("content_block_delta"));
        assert_eq!(event.delta.unwrap().text.as_deref(), Some("Hi"));
    }
}
