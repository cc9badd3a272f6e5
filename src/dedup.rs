//! 请求去重：按幂等键跟踪在途/近期请求
//!
//! 带 Idempotency-Key 的请求在 TTL 窗口内只放行一次，
//! 重复请求被拒绝。有界 TTL + 每次认领时显式清扫过期条目，
//! 不做无界的全局状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    inserted: Instant,
    /// 本次认领的唯一票据；过期条目被顶替后，旧守卫不会误删新条目
    ticket: u64,
}

/// 在途请求表
pub struct PendingRequests {
    ttl: Duration,
    next_ticket: AtomicU64,
    entries: Mutex<HashMap<String, Entry>>,
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_ticket: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 认领一个幂等键
    ///
    /// 键空闲（不存在或已过期）时登记并返回守卫，守卫 Drop 时释放；
    /// 键仍在窗口内时返回 None，调用方应拒绝重复请求。
    pub fn claim(self: &Arc<Self>, key: &str) -> Option<PendingGuard> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        // 清扫过期条目，表的大小受 TTL 内的请求量约束
        entries.retain(|_, entry| now.duration_since(entry.inserted) < self.ttl);

        if entries.contains_key(key) {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.to_string(),
            Entry {
                inserted: now,
                ticket,
            },
        );
        Some(PendingGuard {
            owner: self.clone(),
            key: key.to_string(),
            ticket,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// 认领守卫：请求结束（含取消）时释放键
pub struct PendingGuard {
    owner: Arc<PendingRequests>,
    key: String,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut entries = self.owner.entries.lock();
        if entries.get(&self.key).is_some_and(|e| e.ticket == self.ticket) {
            entries.remove(&self.key);
        }
    }
}
