//! 模型解析与渠道选择
//!
//! 调度前的三步：解析候选模型 id → 过滤可用渠道 → 产生加权遍历顺序。

use super::store::AliasSnapshot;
use super::types::{Channel, TokenRecord};

/// 解析请求的模型名可以路由到的全部真实模型 id
///
/// 字面名总是排在第一位（它本身可能就是某个渠道上的真实模型）；
/// 若字面名是全局别名，规范 id 紧随其后。结果已去重。
/// 渠道内别名在渠道过滤阶段处理，同名别名在不同渠道可能指向不同模型。
pub fn resolve_model_names(name: &str, aliases: &AliasSnapshot) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if let Some(canonical) = aliases.global.get(name) {
        if canonical != name {
            names.push(canonical.clone());
        }
    }
    names
}

/// 按令牌的渠道允许列表过滤（列表为空 = 不限制）
pub fn filter_allowed(channels: Vec<Channel>, token: &TokenRecord) -> Vec<Channel> {
    if token.allowed_channels.is_empty() {
        return channels;
    }
    channels
        .into_iter()
        .filter(|ch| token.allows_channel(&ch.id))
        .collect()
}

/// 渠道是否能服务任一候选模型 id
///
/// 直接声明命中，或渠道内别名把候选 id 映射到该渠道声明的模型时命中。
pub fn channel_serves_model(
    channel: &Channel,
    candidates: &[String],
    aliases: &AliasSnapshot,
) -> bool {
    for name in candidates {
        if channel.advertises_model(name) {
            return true;
        }
        if let Some(hits) = aliases.channel_aliases.get(name) {
            let mapped = hits
                .iter()
                .any(|hit| hit.channel_id == channel.id && channel.advertises_model(&hit.model_id));
            if mapped {
                return true;
            }
        }
    }
    false
}

/// 按候选模型过滤渠道；模型名为 None 时不过滤（透传路径无法得知模型）
pub fn filter_by_model(
    channels: &[Channel],
    candidates: Option<&[String]>,
    aliases: &AliasSnapshot,
) -> Vec<Channel> {
    let Some(candidates) = candidates else {
        return channels.to_vec();
    };
    channels
        .iter()
        .filter(|ch| channel_serves_model(ch, candidates, aliases))
        .cloned()
        .collect()
}

/// 加权随机排序：不放回地按权重抽取，得到完整排列
///
/// 每一步在剩余渠道中按权重占比抽一个，高权重渠道更靠前，
/// 每个渠道在一次排序中最多出现一次。等权重之间由随机抽取自然打破平局。
pub fn weighted_order(mut channels: Vec<Channel>) -> Vec<Channel> {
    let mut ordered = Vec::with_capacity(channels.len());
    while !channels.is_empty() {
        let total: u64 = channels.iter().map(|ch| ch.weight.max(1) as u64).sum();
        let mut draw = fastrand::u64(..total);
        let mut picked = channels.len() - 1;
        for (i, ch) in channels.iter().enumerate() {
            let w = ch.weight.max(1) as u64;
            if draw < w {
                picked = i;
                break;
            }
            draw -= w;
        }
        ordered.push(channels.swap_remove(picked));
    }
    ordered
}

/// Fisher-Yates 均匀洗牌（渠道内 API Key 顺序）
pub fn shuffle_keys(keys: &mut [String]) {
    for i in (1..keys.len()).rev() {
        let j = fastrand::usize(..=i);
        keys.swap(i, j);
    }
}
