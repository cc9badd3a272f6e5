//! 渠道与调用方令牌类型定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 上游接口方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    /// 从存储中的文本解析，未知值回退到 openai
    pub fn parse(s: &str) -> Self {
        match s {
            "anthropic" => Dialect::Anthropic,
            _ => Dialect::OpenAi,
        }
    }
}

/// 渠道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Disabled,
    Pending,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ChannelStatus::Active,
            "disabled" => ChannelStatus::Disabled,
            _ => ChannelStatus::Pending,
        }
    }
}

/// 渠道声明的模型条目（可带按模型定价）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_price: Option<f64>,
}

/// 上游渠道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// 换行分隔的多个 API Key，调度时轮换
    pub api_key: String,
    pub dialect: Dialect,
    /// 权重（≥1），加权排序时生效
    pub weight: u32,
    pub status: ChannelStatus,
    /// 速率限制提示（每分钟请求数，仅供参考）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    pub models: Vec<ModelEntry>,
    /// 附加到出站请求的自定义 header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_headers: Option<HashMap<String, String>>,
    /// 渠道归属者（贡献渠道场景）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Channel {
    /// 解析换行分隔的 API Key 列表，去除空白与空行
    pub fn api_keys(&self) -> Vec<String> {
        parse_api_keys(&self.api_key)
    }

    /// 渠道是否直接声明了指定模型
    pub fn advertises_model(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }
}

/// 调用方身份（令牌记录）
///
/// 核心只消费 allowed_channels：为空表示不限制渠道。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub name: String,
    /// 允许的渠道 id 列表，为空 = 不限制
    pub allowed_channels: Vec<String>,
    pub status: ChannelStatus,
}

impl TokenRecord {
    /// 令牌是否允许使用指定渠道
    pub fn allows_channel(&self, channel_id: &str) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.iter().any(|c| c == channel_id)
    }
}

/// 解析换行分隔的 API Key 字符串
pub fn parse_api_keys(api_key: &str) -> Vec<String> {
    api_key
        .lines()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
        .collect()
}

/// 规范化上游 base URL：去除首尾空白、末尾斜杠，并去掉末尾的 /v1 段
///
/// 出站路径总是带 /v1 前缀追加，配置里带不带 /v1 都能得到一致的目标地址
pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let lower = trimmed.to_ascii_lowercase();
    if let Some(stripped) = lower.strip_suffix("/v1") {
        trimmed[..stripped.len()].to_string()
    } else {
        trimmed.to_string()
    }
}
