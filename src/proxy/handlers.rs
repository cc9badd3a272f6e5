//! 代理处理器
//!
//! 入站请求的完整路径：解析请求 → 解析候选模型 → 过滤/排序渠道 →
//! 调度 → 按需转码响应。每个请求在自己的任务上处理，
//! 流式响应逐块下发，不做整体缓冲。

use std::collections::{BTreeSet, VecDeque};
use std::io;

use axum::{
    Extension,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::channel::types::Dialect;
use crate::channel::{TokenRecord, select};
use crate::convert::stream::{AnthropicToOpenAiStream, OpenAiToAnthropicStream, SseTranscode};
use crate::dispatch::{self, DispatchContext, UpstreamReply};
use crate::usage::UsageGuard;

use super::middleware::AppState;
use super::types::{ErrorResponse, Model, ModelsResponse};

/// /v1/* 代理入口
pub async fn proxy_handler(
    State(state): State<AppState>,
    Extension(token): Extension<TokenRecord>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());

    let body_bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::invalid_request("failed to read request body"),
            );
        }
    };
    let body_text = if body_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body_bytes).into_owned())
    };

    let parsed = body_text
        .as_deref()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok());
    let model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());
    let is_stream = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    // 入站路径决定调用方方言
    let caller_dialect = if path.starts_with("/v1/messages") {
        Dialect::Anthropic
    } else {
        Dialect::OpenAi
    };

    // 幂等键去重：键按令牌隔离，在途/未过期期间拒绝重复
    let _pending = match parts
        .headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
    {
        Some(key) => {
            let scoped = format!("{}:{}", token.id, key);
            match state.pending.claim(&scoped) {
                Some(pending_guard) => Some(pending_guard),
                None => {
                    return error_response(
                        StatusCode::CONFLICT,
                        ErrorResponse::duplicate_request(),
                    );
                }
            }
        }
        None => None,
    };

    // 配置快照：一次调度内不变，渠道变更只影响后续请求
    let channels = match state.store.list_active().await {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!("读取渠道列表失败: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(),
            );
        }
    };
    let aliases = match state.store.alias_snapshot().await {
        Ok(aliases) => aliases,
        Err(e) => {
            tracing::error!("读取别名快照失败: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(),
            );
        }
    };

    let allowed = select::filter_allowed(channels, &token);
    let candidates = model
        .as_deref()
        .map(|m| select::resolve_model_names(m, &aliases));
    let model_filtered = select::filter_by_model(&allowed, candidates.as_deref(), &aliases);

    // 模型过滤为空时回退到完整允许集合（可配置关闭，关闭后干净地 503）
    let pool = if !model_filtered.is_empty() {
        model_filtered
    } else if state.model_filter_fallback {
        allowed
    } else {
        Vec::new()
    };
    if pool.is_empty() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::no_available_channels(),
        );
    }

    let ordered = select::weighted_order(pool);
    tracing::debug!(
        token = %token.id,
        model = model.as_deref().unwrap_or("-"),
        candidates = ordered.len(),
        "开始调度"
    );

    let ctx = DispatchContext {
        client: state.client.clone(),
        policy: state.policy,
        caller_dialect,
        method: parts.method.clone(),
        path: path.clone(),
        query,
        headers: parts.headers.clone(),
        body: body_text,
        is_stream,
    };

    let mut usage_guard = UsageGuard::new(
        state.recorder.clone(),
        &token.id,
        &path,
        model.clone(),
        is_stream,
    );

    let outcome = dispatch::dispatch(&ctx, &ordered).await;
    if let Some(channel) = &outcome.channel {
        usage_guard.set_channel(&channel.id);
    }

    match outcome.reply {
        // 纯传输失败：没有任何上游响应可透传
        None => {
            usage_guard.set_outcome(false, None);
            error_response(
                StatusCode::BAD_GATEWAY,
                ErrorResponse::upstream_unavailable(),
            )
        }
        Some(UpstreamReply::Json {
            status,
            content_type,
            body,
            usage,
        }) => {
            usage_guard.set_outcome(true, Some(status));
            usage_guard.set_usage(usage);
            raw_response(status, content_type.as_deref(), body)
        }
        Some(UpstreamReply::Stream(upstream)) => {
            usage_guard.set_outcome(true, Some(upstream.status().as_u16()));
            let channel_dialect = outcome
                .channel
                .as_ref()
                .map(|ch| ch.dialect)
                .unwrap_or(caller_dialect);
            stream_response(upstream, channel_dialect, caller_dialect, model, usage_guard)
        }
        // 耗尽：最后观察到的上游响应原样透传
        Some(UpstreamReply::Failure(upstream)) => {
            usage_guard.set_outcome(false, Some(upstream.status().as_u16()));
            failure_passthrough(upstream).await
        }
    }
}

/// GET /v1/models：聚合 active 渠道的模型与可见别名
pub async fn models_handler(State(state): State<AppState>) -> Response {
    let channels = match state.store.list_active().await {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!("读取渠道列表失败: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(),
            );
        }
    };
    let aliases = match state.store.alias_snapshot().await {
        Ok(aliases) => aliases,
        Err(e) => {
            tracing::error!("读取别名快照失败: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(),
            );
        }
    };

    let mut ids = BTreeSet::new();
    for channel in &channels {
        for model in &channel.models {
            // alias_only 的规范 id 不对外展示
            if aliases.alias_only.contains(&model.id) {
                continue;
            }
            ids.insert(model.id.clone());
        }
    }
    // 全局别名：指向的模型被任一 active 渠道声明时可见
    for (alias, model_id) in &aliases.global {
        if channels.iter().any(|ch| ch.advertises_model(model_id)) {
            ids.insert(alias.clone());
        }
    }
    // 渠道内别名：所属渠道声明对应模型时可见
    for (alias, hits) in &aliases.channel_aliases {
        let visible = hits.iter().any(|hit| {
            channels
                .iter()
                .any(|ch| ch.id == hit.channel_id && ch.advertises_model(&hit.model_id))
        });
        if visible {
            ids.insert(alias.clone());
        }
    }

    let created = chrono::Utc::now().timestamp();
    let data = ids
        .into_iter()
        .map(|id| Model {
            id,
            object: "model".to_string(),
            created,
            owned_by: "relay".to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
    .into_response()
}

fn error_response(status: StatusCode, error: ErrorResponse) -> Response {
    (status, Json(error)).into_response()
}

/// 按上游状态与内容构建透传响应
fn raw_response(status: u16, content_type: Option<&str>, body: Bytes) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::internal_error(),
        )
    })
}

/// 耗尽后的失败透传：保留上游状态与响应体
async fn failure_passthrough(upstream: reqwest::Response) -> Response {
    let status = upstream.status().as_u16();
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    match upstream.bytes().await {
        Ok(bytes) => raw_response(status, content_type.as_deref(), bytes),
        Err(e) => {
            tracing::warn!("读取上游失败响应体失败: {}", e);
            error_response(
                StatusCode::BAD_GATEWAY,
                ErrorResponse::upstream_unavailable(),
            )
        }
    }
}

/// 流式成功响应：按方言组合选择转码器，逐块下发
fn stream_response(
    upstream: reqwest::Response,
    channel_dialect: Dialect,
    caller_dialect: Dialect,
    model: Option<String>,
    usage_guard: UsageGuard,
) -> Response {
    let status = upstream.status();
    let byte_stream = Box::pin(upstream.bytes_stream());

    let body = match (channel_dialect, caller_dialect) {
        (Dialect::Anthropic, Dialect::OpenAi) => Body::from_stream(transcoded(
            byte_stream,
            AnthropicToOpenAiStream::new(usage_guard.usage_cell()),
            usage_guard,
        )),
        (Dialect::OpenAi, Dialect::Anthropic) => Body::from_stream(transcoded(
            byte_stream,
            OpenAiToAnthropicStream::new(model.unwrap_or_default(), usage_guard.usage_cell()),
            usage_guard,
        )),
        // 同方言：逐块透传
        _ => Body::from_stream(transcoded(byte_stream, PassthroughStream, usage_guard)),
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::internal_error(),
            )
        })
}

/// 同方言透传用的空转码器
struct PassthroughStream;

impl SseTranscode for PassthroughStream {
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(chunk)]
    }

    fn finish(&mut self) -> Vec<Bytes> {
        Vec::new()
    }
}

struct TranscodeState<S, T> {
    upstream: S,
    transcoder: T,
    pending: VecDeque<Bytes>,
    done: bool,
    /// 流结束或被调用方丢弃时随状态一起 Drop，落用量记录
    _usage_guard: UsageGuard,
}

/// 把上游字节流接到转码器上，产出下游帧流
///
/// 单帧转换失败在转码器内部吞掉；上游传输中断时补发收尾帧后结束，
/// 已转发的内容保持可用。
fn transcoded<S, T>(
    upstream: S,
    transcoder: T,
    usage_guard: UsageGuard,
) -> impl Stream<Item = Result<Bytes, io::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
    T: SseTranscode,
{
    let state = TranscodeState {
        upstream,
        transcoder,
        pending: VecDeque::new(),
        done: false,
        _usage_guard: usage_guard,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.transcoder.push(&bytes);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    tracing::warn!("上游流中断: {}", e);
                    let frames = state.transcoder.finish();
                    state.pending.extend(frames);
                    state.done = true;
                }
                None => {
                    let frames = state.transcoder.finish();
                    state.pending.extend(frames);
                    state.done = true;
                }
            }
        }
    })
}
