//! OpenAI ↔ Anthropic 双向格式转换
//!
//! 纯函数、无状态。两种方言字段集合不同，转换是尽力而为的有损映射，
//! 两个方向都只保证 model、角色、文本内容不丢。

pub mod stream;
pub mod types;

use serde_json::{Value, json};

use crate::channel::Dialect;
use types::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, OpenAiMessage, OpenAiRequest,
    OpenAiResponse, StopSequences, TokenUsage,
};

/// Anthropic 要求 max_tokens 必填，OpenAI 请求缺省时的默认值
const DEFAULT_MAX_TOKENS: u32 = 4096;

// === 请求转换 ===

/// OpenAI chat completion 请求 → Anthropic messages 请求
///
/// system 角色消息被拼接进独立的 system 字段（多条消息以空行分隔），
/// 其余消息保留角色与内容，块数组内容原样透传。
pub fn openai_to_anthropic_request(req: OpenAiRequest) -> AnthropicRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for msg in req.messages {
        if msg.role == "system" {
            system_parts.push(content_to_text(&msg.content, "\n"));
        } else {
            let role = if msg.role == "assistant" {
                "assistant"
            } else {
                "user"
            };
            messages.push(AnthropicMessage {
                role: role.to_string(),
                content: msg.content,
            });
        }
    }

    AnthropicRequest {
        model: req.model,
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(Value::String(system_parts.join("\n\n")))
        },
        max_tokens: Some(req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.map(StopSequences::into_vec),
        extra: serde_json::Map::new(),
    }
}

/// Anthropic messages 请求 → OpenAI chat completion 请求
///
/// system 字段变为开头的一条 system 消息；
/// 块数组内容被压平成纯字符串（只保留 text 块，其余块在此方向丢弃）。
pub fn anthropic_to_openai_request(req: AnthropicRequest) -> OpenAiRequest {
    let mut messages = Vec::new();

    if let Some(system) = req.system {
        let text = match &system {
            Value::String(s) => s.clone(),
            Value::Array(_) => content_to_text(&system, "\n\n"),
            _ => String::new(),
        };
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Value::String(text),
            extra: serde_json::Map::new(),
        });
    }

    for msg in req.messages {
        let content = match &msg.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };
        messages.push(OpenAiMessage {
            role: msg.role,
            content: Value::String(content),
            extra: serde_json::Map::new(),
        });
    }

    OpenAiRequest {
        model: req.model,
        messages,
        stream: req.stream,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.map(StopSequences::Many),
        extra: serde_json::Map::new(),
    }
}

// === 终止原因映射 ===

/// Anthropic stop_reason → OpenAI finish_reason
pub fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => "stop",
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

/// OpenAI finish_reason → Anthropic stop_reason
pub fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

// === 标识符换前缀 ===

/// 生成 OpenAI 风格的响应 id，有源 id 时沿用
pub fn openai_response_id(source: Option<&str>) -> String {
    match source {
        Some(id) if !id.is_empty() => format!("chatcmpl-{}", id),
        _ => format!("chatcmpl-{}", uuid::Uuid::new_v4()),
    }
}

/// 生成 Anthropic 风格的响应 id：chatcmpl- 前缀替换为 msg_，无源 id 时新建
pub fn anthropic_response_id(source: Option<&str>) -> String {
    match source {
        Some(id) if !id.is_empty() => id.replacen("chatcmpl-", "msg_", 1),
        _ => format!("msg_{}", uuid::Uuid::new_v4()),
    }
}

// === 响应转换（非流式） ===

/// Anthropic messages 响应 → OpenAI chat completion 响应
///
/// 所有 text 内容块拼成单条消息。
pub fn anthropic_to_openai_response(resp: &AnthropicResponse) -> Value {
    let text: String = resp
        .content
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();

    let mut out = json!({
        "id": openai_response_id(resp.id.as_deref()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": map_stop_reason(resp.stop_reason.as_deref()),
        }],
    });
    if let Some(usage) = &resp.usage {
        out["usage"] = json!({
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.input_tokens + usage.output_tokens,
        });
    }
    out
}

/// OpenAI chat completion 响应 → Anthropic messages 响应
///
/// usage 总是输出，缺省字段记 0。
pub fn openai_to_anthropic_response(resp: &OpenAiResponse) -> Value {
    let first = resp.choices.first();
    let text = first
        .and_then(|c| c.message.content.as_ref())
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let usage = resp.usage.unwrap_or_default();

    json!({
        "id": anthropic_response_id(resp.id.as_deref()),
        "type": "message",
        "role": "assistant",
        "model": resp.model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": map_finish_reason(first.and_then(|c| c.finish_reason.as_deref())),
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        },
    })
}

// === 调度引擎入口 ===

/// 请求体跨方言转换，方言相同时原样返回
pub fn convert_request_body(body: &str, from: Dialect, to: Dialect) -> anyhow::Result<String> {
    if from == to {
        return Ok(body.to_string());
    }
    let converted = match (from, to) {
        (Dialect::OpenAi, Dialect::Anthropic) => {
            let req: OpenAiRequest = serde_json::from_str(body)?;
            serde_json::to_string(&openai_to_anthropic_request(req))?
        }
        (Dialect::Anthropic, Dialect::OpenAi) => {
            let req: AnthropicRequest = serde_json::from_str(body)?;
            serde_json::to_string(&anthropic_to_openai_request(req))?
        }
        _ => unreachable!("方言相同的情况已在上方短路"),
    };
    Ok(converted)
}

/// 响应体跨方言转换，同时抽取 token 用量
///
/// 返回 (响应 JSON, 用量)。方言相同时只抽取用量，响应原样返回。
pub fn convert_response_body(
    body: &[u8],
    from: Dialect,
    to: Dialect,
) -> anyhow::Result<(Value, TokenUsage)> {
    match (from, to) {
        (Dialect::Anthropic, Dialect::OpenAi) => {
            let resp: AnthropicResponse = serde_json::from_slice(body)?;
            let usage = resp
                .usage
                .map(|u| TokenUsage {
                    prompt_tokens: u.input_tokens,
                    completion_tokens: u.output_tokens,
                })
                .unwrap_or_default();
            Ok((anthropic_to_openai_response(&resp), usage))
        }
        (Dialect::OpenAi, Dialect::Anthropic) => {
            let resp: OpenAiResponse = serde_json::from_slice(body)?;
            let usage = resp
                .usage
                .map(|u| TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                })
                .unwrap_or_default();
            Ok((openai_to_anthropic_response(&resp), usage))
        }
        _ => {
            let value: Value = serde_json::from_slice(body)?;
            let usage = usage_from_value(from, &value);
            Ok((value, usage))
        }
    }
}

/// 从响应 JSON 中按方言抽取用量计数，缺失字段记 0
pub fn usage_from_value(dialect: Dialect, value: &Value) -> TokenUsage {
    let Some(usage) = value.get("usage") else {
        return TokenUsage::default();
    };
    match dialect {
        Dialect::OpenAi => TokenUsage {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        },
        Dialect::Anthropic => TokenUsage {
            prompt_tokens: usage
                .get("input_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            completion_tokens: usage
                .get("output_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        },
    }
}

/// 把 string 或块数组形态的内容压成纯文本
fn content_to_text(content: &Value, joiner: &str) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(joiner),
        _ => String::new(),
    }
}
