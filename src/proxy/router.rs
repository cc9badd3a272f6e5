//! 代理路由配置

use axum::{
    Router, middleware,
    routing::{any, get},
};

use super::handlers::{models_handler, proxy_handler};
use super::middleware::{AppState, token_auth_middleware};

/// 创建代理路由
///
/// # 端点
/// - `GET /v1/models` - 聚合模型列表（含可见别名）
/// - `POST /v1/chat/completions` - OpenAI 方言入口
/// - `POST /v1/messages` - Anthropic 方言入口
/// - 其余 `/v1/*` 路径原样透传到选中渠道
///
/// # 认证
/// 调用方令牌认证，支持：
/// - `x-api-key` header
/// - `Authorization: Bearer <token>` header
pub fn create_proxy_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(models_handler))
        .route("/v1/{*path}", any(proxy_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            token_auth_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Json;
    use axum::body::Body;
    use axum::http::{Response, StatusCode, header::CONTENT_TYPE};
    use serde_json::json;

    use super::*;
    use crate::channel::types::{Channel, ChannelStatus, Dialect, ModelEntry, TokenRecord};
    use crate::channel::ChannelStore;
    use crate::common::auth;
    use crate::dedup::PendingRequests;
    use crate::dispatch::RetryPolicy;
    use crate::usage::UsageRecorder;

    const TOKEN_KEY: &str = "sk-caller-token";

    fn make_channel(id: &str, base_url: &str, dialect: Dialect, models: &[&str]) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_string(),
            base_url: base_url.to_string(),
            api_key: "sk-upstream".to_string(),
            dialect,
            weight: 1,
            status: ChannelStatus::Active,
            rate_limit: None,
            models: models
                .iter()
                .map(|m| ModelEntry {
                    id: m.to_string(),
                    input_price: None,
                    output_price: None,
                })
                .collect(),
            custom_headers: None,
            owner: None,
        }
    }

    /// 组装完整应用：内存存储 + 内存用量库，起在随机端口上
    async fn spawn_app(channels: Vec<Channel>) -> (String, AppState) {
        let store = ChannelStore::open_in_memory().unwrap();
        for channel in &channels {
            store.upsert_channel(channel).unwrap();
        }
        let token = TokenRecord {
            id: "tok-1".to_string(),
            name: "test".to_string(),
            allowed_channels: vec![],
            status: ChannelStatus::Active,
        };
        store
            .upsert_token(&token, &auth::sha256_hex(TOKEN_KEY))
            .unwrap();

        let state = AppState {
            store,
            recorder: Arc::new(UsageRecorder::new(":memory:").unwrap()),
            client: reqwest::Client::new(),
            policy: RetryPolicy {
                rounds: 1,
                delay: Duration::from_millis(1),
            },
            model_filter_fallback: true,
            max_body_bytes: 1024 * 1024,
            pending: Arc::new(PendingRequests::new(Duration::from_secs(60))),
        };

        let app = create_proxy_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    /// JSON 成功的 mock 上游（OpenAI 形态，带用量）
    async fn spawn_json_upstream() -> String {
        let app = Router::new().fallback(|| async {
            Json(json!({
                "id": "chatcmpl-up",
                "object": "chat.completion",
                "model": "test-model",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "pong"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18},
            }))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// SSE 流式 mock 上游（Anthropic 事件流）
    async fn spawn_sse_upstream() -> String {
        let app = Router::new().fallback(|| async {
            let body = concat!(
                "event: message_start\n",
                "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_s\",\"model\":\"claude-3-sonnet\",\"usage\":{\"input_tokens\":6,\"output_tokens\":0}}}\n",
                "\n",
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"A\"}}\n",
                "\n",
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"B\"}}\n",
                "\n",
                "event: message_delta\n",
                "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n",
                "\n",
                "event: message_stop\n",
                "data: {\"type\":\"message_stop\"}\n",
                "\n",
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from(body))
                .unwrap()
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// 等待后台写入任务落库，返回当前记录总数
    async fn usage_total(state: &AppState) -> u64 {
        for _ in 0..100 {
            let list = state
                .recorder
                .query(Default::default())
                .await
                .unwrap();
            if list.total > 0 {
                return list.total;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    /// 未认证请求 401
    #[tokio::test]
    async fn test_unauthenticated_rejected() {
        let (base, _state) = spawn_app(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .json(&json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth("sk-wrong")
            .json(&json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    /// 没有任何可用渠道时 503 no_available_channels
    #[tokio::test]
    async fn test_no_available_channels() {
        let (base, _state) = spawn_app(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(TOKEN_KEY)
            .json(&json!({"model": "test-model", "messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "no_available_channels");
    }

    /// 传输失败的渠道被跳过，成功渠道兜住，恰好一条用量记录归属成功渠道
    #[tokio::test]
    async fn test_partial_failure_usage_accounting() {
        let upstream = spawn_json_upstream().await;
        let (base, state) = spawn_app(vec![
            make_channel("dead", "http://127.0.0.1:9", Dialect::OpenAi, &["test-model"]),
            make_channel("ok", &upstream, Dialect::OpenAi, &["test-model"]),
        ])
        .await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(TOKEN_KEY)
            .json(&json!({"model": "test-model", "messages": [{"role": "user", "content": "ping"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "pong");

        assert_eq!(usage_total(&state).await, 1);
        let list = state.recorder.query(Default::default()).await.unwrap();
        let record = &list.records[0];
        assert_eq!(record.channel_id.as_deref(), Some("ok"));
        assert_eq!(record.status, "ok");
        assert_eq!(record.prompt_tokens, 11);
        assert_eq!(record.completion_tokens, 7);
        assert_eq!(record.total_tokens, 18);
        assert_eq!(record.token_id, "tok-1");
    }

    /// 流式端到端：Anthropic 渠道 → OpenAI 调用方，转码 + 用量随流记录
    #[tokio::test]
    async fn test_streaming_end_to_end() {
        let upstream = spawn_sse_upstream().await;
        let (base, state) = spawn_app(vec![make_channel(
            "sse",
            &upstream,
            Dialect::Anthropic,
            &["claude-3-sonnet"],
        )])
        .await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(TOKEN_KEY)
            .json(&json!({
                "model": "claude-3-sonnet",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(
            resp.headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .contains("text/event-stream")
        );

        let text = resp.text().await.unwrap();
        assert!(text.trim_end().ends_with("data: [DONE]"));
        // 增量内容按顺序出现
        let a_pos = text.find("\"content\":\"A\"").unwrap();
        let b_pos = text.find("\"content\":\"B\"").unwrap();
        assert!(a_pos < b_pos);

        // 流结束后守卫落库，用量来自流内事件
        assert_eq!(usage_total(&state).await, 1);
        let list = state.recorder.query(Default::default()).await.unwrap();
        let record = &list.records[0];
        assert_eq!(record.channel_id.as_deref(), Some("sse"));
        assert!(record.stream);
        assert_eq!(record.prompt_tokens, 6);
        assert_eq!(record.completion_tokens, 2);
    }

    /// 幂等键在途期间重复请求 409
    #[tokio::test]
    async fn test_idempotency_conflict() {
        let (base, state) = spawn_app(vec![]).await;
        // 预先占住键（模拟在途请求）
        let _held = state.pending.claim("tok-1:abc").unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(TOKEN_KEY)
            .header("idempotency-key", "abc")
            .json(&json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 409);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "duplicate_request");
    }

    /// /v1/models 聚合模型并处理别名可见性
    #[tokio::test]
    async fn test_models_listing() {
        let (base, state) = spawn_app(vec![make_channel(
            "a",
            "https://api.example.com",
            Dialect::OpenAi,
            &["model-y", "model-hidden"],
        )])
        .await;
        state
            .store
            .add_global_alias("model-y", "alias-x", true, false)
            .unwrap();
        state
            .store
            .add_global_alias("model-hidden", "pretty-name", true, true)
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{}/v1/models", base))
            .bearer_auth(TOKEN_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();

        assert!(ids.contains(&"model-y"));
        assert!(ids.contains(&"alias-x"));
        // alias_only 隐藏原名，但别名可见
        assert!(!ids.contains(&"model-hidden"));
        assert!(ids.contains(&"pretty-name"));
    }
}
