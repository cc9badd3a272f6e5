//! 调度与重试引擎
//!
//! 对排好序的渠道列表逐个发起上游调用：渠道内轮换 API Key，
//! 轮内遍历全部渠道，轮间固定延迟。状态机按
//! 轮 → 渠道 → Key → (成功 | 渠道耗尽 | 轮耗尽) 推进，
//! 每层用显式的结果哨兵而不是控制流贯穿。
//! 一次调度内上游调用严格串行，任意时刻至多一个在途请求。

use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::channel::select::shuffle_keys;
use crate::channel::types::{Channel, Dialect, normalize_base_url};
use crate::convert::{self, types::TokenUsage};

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 对完整渠道顺序的遍历轮数（≥1）
    pub rounds: u32,
    /// 轮间延迟
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rounds: 1,
            delay: Duration::from_millis(200),
        }
    }
}

/// 一次入站请求的调度上下文
///
/// 调度期间视为不可变快照，渠道配置变更只影响后续请求。
pub struct DispatchContext {
    pub client: reqwest::Client,
    pub policy: RetryPolicy,
    /// 调用方使用的方言（由入站路径决定）
    pub caller_dialect: Dialect,
    pub method: Method,
    /// 入站路径（/v1/...）
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// 原始请求体文本
    pub body: Option<String>,
    /// 调用方是否要求流式响应
    pub is_stream: bool,
}

/// 成功接受或失败透传的上游结果
pub enum UpstreamReply {
    /// 非流式成功：响应体已按调用方方言转换，用量已抽取
    Json {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
        usage: TokenUsage,
    },
    /// 流式成功：响应交由上层逐块转码/透传
    Stream(reqwest::Response),
    /// 失败：最后观察到的非 2xx 上游响应，原样透传
    Failure(reqwest::Response),
}

/// 调度结果：被消费一次后即丢弃，核心不持久化
pub struct DispatchOutcome {
    /// 成功时为选中渠道，失败时为最后尝试的渠道
    pub channel: Option<Channel>,
    pub ok: bool,
    /// 纯传输失败时为 None
    pub reply: Option<UpstreamReply>,
}

/// 单次 Key 尝试的结果哨兵
enum KeyAttempt {
    /// 2xx，立即接受
    Success(reqwest::Response),
    /// 传输失败（None）或 408/429/5xx，渠道内换 Key 继续
    Retryable(Option<reqwest::Response>),
    /// 其他非 2xx：该渠道放弃，本轮继续下一渠道
    Terminal(reqwest::Response),
}

/// 响应状态是否可重试
fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// 调度入口：按给定顺序重试，首个 2xx 立即返回
///
/// 全部轮次耗尽后返回最后观察到的响应（或纯传输失败）。
/// 轮间不重排渠道顺序；渠道内 Key 每轮重新洗牌。
pub async fn dispatch(ctx: &DispatchContext, ordered: &[Channel]) -> DispatchOutcome {
    let rounds = ctx.policy.rounds.max(1);
    let mut last_response: Option<reqwest::Response> = None;
    let mut last_channel: Option<&Channel> = None;
    // 转换后的请求体跨渠道复用（同方言渠道只转换一次）
    let mut converted_body: Option<String> = None;

    let mut round = 0;
    loop {
        let mut saw_retryable = false;

        'channels: for channel in ordered {
            last_channel = Some(channel);

            let body = match body_for_dialect(ctx, channel.dialect, &mut converted_body) {
                Ok(body) => body,
                Err(e) => {
                    // 请求体转换失败对该渠道是终止性的，其他渠道继续
                    tracing::warn!(channel = %channel.id, "请求体转换失败: {}", e);
                    continue;
                }
            };

            let mut keys = channel.api_keys();
            if keys.is_empty() {
                tracing::warn!(channel = %channel.id, "渠道没有可用的 API Key，跳过");
                continue;
            }
            shuffle_keys(&mut keys);

            for key in &keys {
                match attempt(ctx, channel, key, body.as_deref()).await {
                    KeyAttempt::Success(response) => {
                        match finalize_success(ctx, channel, response).await {
                            Ok(reply) => {
                                return DispatchOutcome {
                                    channel: Some(channel.clone()),
                                    ok: true,
                                    reply: Some(reply),
                                };
                            }
                            Err(e) => {
                                // 响应体读取/转换失败按渠道终止处理，重试继续
                                tracing::warn!(channel = %channel.id, "上游响应处理失败: {}", e);
                                last_response = None;
                                continue 'channels;
                            }
                        }
                    }
                    KeyAttempt::Retryable(response) => {
                        saw_retryable = true;
                        last_response = response;
                    }
                    KeyAttempt::Terminal(response) => {
                        last_response = Some(response);
                        continue 'channels;
                    }
                }
            }
        }

        round += 1;
        if round >= rounds || !saw_retryable {
            break;
        }
        // 轮间退避；调用方取消时这里随任务一起中止
        tokio::time::sleep(ctx.policy.delay).await;
    }

    DispatchOutcome {
        channel: last_channel.cloned(),
        ok: false,
        reply: last_response.map(UpstreamReply::Failure),
    }
}

/// 单次 Key 尝试：构建出站请求、执行、按状态分类
async fn attempt(
    ctx: &DispatchContext,
    channel: &Channel,
    key: &str,
    body: Option<&str>,
) -> KeyAttempt {
    let url = build_target_url(ctx, channel);
    let headers = build_outbound_headers(ctx, channel, key);

    #[cfg(feature = "sensitive-logs")]
    if let Some(body) = body {
        tracing::debug!(
            channel = %channel.id,
            url = %url,
            "出站请求体: {}",
            crate::common::truncate_with_ellipsis(body, 4096)
        );
    }

    let mut request = ctx.client.request(ctx.method.clone(), &url).headers(headers);
    if let Some(body) = body {
        request = request.body(body.to_string());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                KeyAttempt::Success(response)
            } else if is_retryable_status(status) {
                tracing::debug!(channel = %channel.id, status, "上游返回可重试状态");
                KeyAttempt::Retryable(Some(response))
            } else {
                tracing::debug!(channel = %channel.id, status, "上游返回终止状态，放弃该渠道");
                KeyAttempt::Terminal(response)
            }
        }
        Err(e) => {
            tracing::warn!(channel = %channel.id, "上游传输失败: {}", e);
            KeyAttempt::Retryable(None)
        }
    }
}

/// 2xx 接受后的收尾：流式原样交出，非流式读体、转换方言、抽取用量
async fn finalize_success(
    ctx: &DispatchContext,
    channel: &Channel,
    response: reqwest::Response,
) -> anyhow::Result<UpstreamReply> {
    if ctx.is_stream {
        return Ok(UpstreamReply::Stream(response));
    }

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let bytes = response.bytes().await?;

    if channel.dialect != ctx.caller_dialect {
        let (value, usage) =
            convert::convert_response_body(&bytes, channel.dialect, ctx.caller_dialect)?;
        Ok(UpstreamReply::Json {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(serde_json::to_vec(&value)?),
            usage,
        })
    } else {
        // 同方言透传；体不是合法 JSON 时用量记 0，不影响成功
        let usage = serde_json::from_slice::<serde_json::Value>(&bytes)
            .map(|v| convert::usage_from_value(channel.dialect, &v))
            .unwrap_or_default();
        Ok(UpstreamReply::Json {
            status,
            content_type,
            body: bytes,
            usage,
        })
    }
}

/// 出站目标地址：规范化 base URL + 按方言改写的路径 + 原查询串
fn build_target_url(ctx: &DispatchContext, channel: &Channel) -> String {
    let base = normalize_base_url(&channel.base_url);
    let path = rewrite_path(&ctx.path, ctx.caller_dialect, channel.dialect);
    match &ctx.query {
        Some(query) => format!("{}{}?{}", base, path, query),
        None => format!("{}{}", base, path),
    }
}

/// 方言不同的聊天端点互换路径，其余路径透传
fn rewrite_path(path: &str, from: Dialect, to: Dialect) -> String {
    if from == to {
        return path.to_string();
    }
    match (path, to) {
        ("/v1/chat/completions", Dialect::Anthropic) => "/v1/messages".to_string(),
        ("/v1/messages", Dialect::OpenAi) => "/v1/chat/completions".to_string(),
        _ => path.to_string(),
    }
}

/// 出站 header：剥掉逐跳与入站凭据，注入渠道凭据与自定义 header
fn build_outbound_headers(ctx: &DispatchContext, channel: &Channel, key: &str) -> HeaderMap {
    let mut headers = ctx.headers.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(AUTHORIZATION);
    headers.remove("x-api-key");

    // Bearer 与 x-api-key 同时下发，兼容两种方言的鉴权习惯
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key)) {
        headers.insert(AUTHORIZATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert("x-api-key", value);
    }

    if channel.dialect == Dialect::Anthropic && !headers.contains_key("anthropic-version") {
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
    }

    if let Some(custom) = &channel.custom_headers {
        for (name, value) in custom {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(channel = %channel.id, header = %name, "自定义 header 非法，忽略");
                }
            }
        }
    }

    headers
}

/// 取目标方言的请求体，跨方言时惰性转换并缓存
fn body_for_dialect(
    ctx: &DispatchContext,
    to: Dialect,
    converted: &mut Option<String>,
) -> anyhow::Result<Option<String>> {
    let Some(raw) = &ctx.body else {
        return Ok(None);
    };
    if to == ctx.caller_dialect {
        return Ok(Some(raw.clone()));
    }
    if converted.is_none() {
        *converted = Some(convert::convert_request_body(raw, ctx.caller_dialect, to)?);
    }
    Ok(converted.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::channel::types::{ChannelStatus, ModelEntry};

    fn test_channel(id: &str, base_url: &str, api_key: &str, dialect: Dialect) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            dialect,
            weight: 1,
            status: ChannelStatus::Active,
            rate_limit: None,
            models: vec![ModelEntry {
                id: "test-model".to_string(),
                input_price: None,
                output_price: None,
            }],
            custom_headers: None,
            owner: None,
        }
    }

    fn test_ctx(rounds: u32) -> DispatchContext {
        DispatchContext {
            client: reqwest::Client::new(),
            policy: RetryPolicy {
                rounds,
                delay: Duration::from_millis(1),
            },
            caller_dialect: Dialect::OpenAi,
            method: Method::POST,
            path: "/v1/chat/completions".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Some(
                r#"{"model":"test-model","messages":[{"role":"user","content":"hi"}]}"#.to_string(),
            ),
            is_stream: false,
        }
    }

    /// 起一个固定状态码的 mock 上游，返回 base_url
    async fn spawn_status_upstream(status: u16, counter: Arc<AtomicUsize>) -> String {
        let app = axum::Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::from_u16(status).unwrap(),
                    Json(json!({"error": {"type": "upstream_error", "message": "mock"}})),
                )
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// 回显路径、鉴权 header 和请求体的 mock 上游
    async fn spawn_echo_upstream() -> String {
        let app = axum::Router::new().fallback(|request: Request<Body>| async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string())
            };
            Json(json!({
                "path": parts.uri.path(),
                "authorization": header("authorization"),
                "x_api_key": header("x-api-key"),
                "x_custom": header("x-custom"),
                "anthropic_version": header("anthropic-version"),
                "body": String::from_utf8_lossy(&body),
            }))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// rounds=3、2 个 Key 全 500：恰好 3 轮 × 2 Key = 6 次尝试后失败
    #[tokio::test]
    async fn test_retry_exhaustion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let base = spawn_status_upstream(500, counter.clone()).await;
        let channels = vec![test_channel("a", &base, "k1\nk2", Dialect::OpenAi)];

        let outcome = dispatch(&test_ctx(3), &channels).await;
        assert!(!outcome.ok);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert_eq!(outcome.channel.unwrap().id, "a");
        // 最后观察到的响应被保留、原样透传
        match outcome.reply {
            Some(UpstreamReply::Failure(response)) => {
                assert_eq!(response.status().as_u16(), 500);
            }
            _ => panic!("应返回最后一次失败响应"),
        }
    }

    /// 404 是渠道级终止：3 个 Key 只尝试 1 次；429 则换 Key 重试
    #[tokio::test]
    async fn test_terminal_vs_retryable() {
        let counter_404 = Arc::new(AtomicUsize::new(0));
        let base_404 = spawn_status_upstream(404, counter_404.clone()).await;
        let channels = vec![test_channel("a", &base_404, "k1\nk2\nk3", Dialect::OpenAi)];
        let outcome = dispatch(&test_ctx(1), &channels).await;
        assert!(!outcome.ok);
        assert_eq!(counter_404.load(Ordering::SeqCst), 1);

        let counter_429 = Arc::new(AtomicUsize::new(0));
        let base_429 = spawn_status_upstream(429, counter_429.clone()).await;
        let channels = vec![test_channel("b", &base_429, "k1\nk2\nk3", Dialect::OpenAi)];
        let outcome = dispatch(&test_ctx(1), &channels).await;
        assert!(!outcome.ok);
        assert_eq!(counter_429.load(Ordering::SeqCst), 3);
    }

    /// 首个 2xx 立即接受，后续渠道与轮次不再尝试
    #[tokio::test]
    async fn test_first_success_short_circuit() {
        let failing = Arc::new(AtomicUsize::new(0));
        let base_fail = spawn_status_upstream(500, failing.clone()).await;
        let ok_counter = Arc::new(AtomicUsize::new(0));
        let base_ok = spawn_status_upstream(200, ok_counter.clone()).await;

        let channels = vec![
            test_channel("fail", &base_fail, "k1", Dialect::OpenAi),
            test_channel("ok", &base_ok, "k1\nk2", Dialect::OpenAi),
        ];

        let outcome = dispatch(&test_ctx(3), &channels).await;
        assert!(outcome.ok);
        assert_eq!(outcome.channel.as_ref().unwrap().id, "ok");
        // 失败渠道每轮 1 次、成功渠道 1 次后停止
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(ok_counter.load(Ordering::SeqCst), 1);
    }

    /// 传输失败的渠道不终止本轮，成功渠道兜住
    #[tokio::test]
    async fn test_transport_failure_falls_through() {
        let ok_counter = Arc::new(AtomicUsize::new(0));
        let base_ok = spawn_status_upstream(200, ok_counter.clone()).await;

        let channels = vec![
            // 连接拒绝：127.0.0.1:9 基本不可达
            test_channel("dead", "http://127.0.0.1:9", "k1", Dialect::OpenAi),
            test_channel("ok", &base_ok, "k1", Dialect::OpenAi),
        ];

        let outcome = dispatch(&test_ctx(1), &channels).await;
        assert!(outcome.ok);
        assert_eq!(outcome.channel.unwrap().id, "ok");
        assert_eq!(ok_counter.load(Ordering::SeqCst), 1);
    }

    /// 凭据注入、host 剥离、自定义 header、跨方言路径与请求体改写
    #[tokio::test]
    async fn test_outbound_request_build() {
        let base = spawn_echo_upstream().await;
        let mut channel = test_channel("anthropic-ch", &base, "sk-secret", Dialect::Anthropic);
        channel.custom_headers = Some(
            [("x-custom".to_string(), "custom-value".to_string())]
                .into_iter()
                .collect(),
        );

        let mut ctx = test_ctx(1);
        // 流式路径拿到原始响应，便于直接检查回显
        ctx.is_stream = true;
        ctx.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-key"));

        let outcome = dispatch(&ctx, &[channel]).await;
        assert!(outcome.ok);

        let response = match outcome.reply {
            Some(UpstreamReply::Stream(response)) => response,
            _ => panic!("流式成功应返回原始响应"),
        };
        let echoed: serde_json::Value = response.json().await.unwrap();
        // OpenAI 入站 → Anthropic 渠道：路径改写
        assert_eq!(echoed["path"], "/v1/messages");
        // 入站凭据被渠道凭据替换
        assert_eq!(echoed["authorization"], "Bearer sk-secret");
        assert_eq!(echoed["x_api_key"], "sk-secret");
        assert_eq!(echoed["x_custom"], "custom-value");
        assert_eq!(echoed["anthropic_version"], "2023-06-01");
        // 请求体按 Anthropic 方言重建
        let body: serde_json::Value =
            serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    /// 非流式跨方言成功：响应体转换、用量抽取
    #[tokio::test]
    async fn test_json_success_converts_response() {
        let app = axum::Router::new().fallback(|| async {
            Json(json!({
                "id": "msg_01",
                "type": "message",
                "model": "claude-3-sonnet",
                "content": [{"type": "text", "text": "pong"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 4},
            }))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let channels = vec![test_channel(
            "a",
            &format!("http://{}", addr),
            "k1",
            Dialect::Anthropic,
        )];
        let outcome = dispatch(&test_ctx(1), &channels).await;
        assert!(outcome.ok);

        match outcome.reply {
            Some(UpstreamReply::Json { status, body, usage, .. }) => {
                assert_eq!(status, 200);
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["object"], "chat.completion");
                assert_eq!(value["choices"][0]["message"]["content"], "pong");
                assert_eq!(value["usage"]["total_tokens"], 13);
                assert_eq!(usage.prompt_tokens, 9);
                assert_eq!(usage.completion_tokens, 4);
            }
            _ => panic!("非流式成功应返回 Json"),
        }
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(
            rewrite_path("/v1/chat/completions", Dialect::OpenAi, Dialect::Anthropic),
            "/v1/messages"
        );
        assert_eq!(
            rewrite_path("/v1/messages", Dialect::Anthropic, Dialect::OpenAi),
            "/v1/chat/completions"
        );
        assert_eq!(
            rewrite_path("/v1/chat/completions", Dialect::OpenAi, Dialect::OpenAi),
            "/v1/chat/completions"
        );
        // 非聊天端点跨方言也透传
        assert_eq!(
            rewrite_path("/v1/embeddings", Dialect::OpenAi, Dialect::Anthropic),
            "/v1/embeddings"
        );
    }
}
