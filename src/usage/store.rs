//! 用量记录存储和异步写入服务
//!
//! 记录路径绝不阻塞响应：record 只是 try_send 进有界 channel，
//! 后台任务攒批落 SQLite。写失败只记日志，不回传调用方。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::mpsc;

use super::model::UsageRecord;
use super::types::{
    ChannelUsageStats, ModelUsageStats, UsageListResponse, UsageQuery, UsageRecordResponse,
    UsageStatsResponse,
};

/// 底层 SQLite 存储（同步）
struct UsageStore {
    conn: std::sync::Mutex<Connection>,
}

impl UsageStore {
    fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                token_id TEXT NOT NULL,
                channel_id TEXT,
                model TEXT,
                path TEXT NOT NULL,
                stream INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ok',
                status_code INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp);
            CREATE INDEX IF NOT EXISTS idx_usage_model ON usage_records(model);
            CREATE INDEX IF NOT EXISTS idx_usage_channel ON usage_records(channel_id);
            CREATE INDEX IF NOT EXISTS idx_usage_status ON usage_records(status);",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn insert_batch(&self, records: &[UsageRecord]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO usage_records (request_id, timestamp, token_id, channel_id, model, path, stream, prompt_tokens, completion_tokens, total_tokens, latency_ms, status, status_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    record.request_id,
                    record.timestamp,
                    record.token_id,
                    record.channel_id,
                    record.model,
                    record.path,
                    record.stream as i32,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_tokens,
                    record.latency_ms,
                    record.status,
                    record.status_code.map(|c| c as i64),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn query(&self, filter: &UsageQuery) -> Result<UsageListResponse> {
        let conn = self.conn.lock().unwrap();
        let page = filter.page.unwrap_or(1).max(1);
        let page_size = filter.page_size.unwrap_or(50).clamp(1, 200);
        let offset = (page - 1) * page_size;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref model) = filter.model {
            where_clauses.push(format!("model = ?{}", params.len() + 1));
            params.push(Box::new(model.clone()));
        }
        if let Some(ref channel) = filter.channel {
            where_clauses.push(format!("channel_id = ?{}", params.len() + 1));
            params.push(Box::new(channel.clone()));
        }
        if let Some(ref status) = filter.status {
            if status == "ok" || status == "error" {
                where_clauses.push(format!("status = ?{}", params.len() + 1));
                params.push(Box::new(status.clone()));
            }
        }
        if let Some(ref start_time) = filter.start_time {
            let normalized = chrono::DateTime::parse_from_rfc3339(start_time)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| start_time.clone());
            where_clauses.push(format!("timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(normalized));
        }
        if let Some(ref end_time) = filter.end_time {
            let normalized = chrono::DateTime::parse_from_rfc3339(end_time)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| end_time.clone());
            where_clauses.push(format!("timestamp <= ?{}", params.len() + 1));
            params.push(Box::new(normalized));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM usage_records {}", where_sql);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let query_sql = format!(
            "SELECT id, request_id, timestamp, token_id, channel_id, model, path, stream, prompt_tokens, completion_tokens, total_tokens, latency_ms, status, status_code
             FROM usage_records {} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            where_sql,
            params.len() + 1,
            params.len() + 2
        );
        params.push(Box::new(page_size as i64));
        params.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&query_sql)?;
        let records = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    Ok(UsageRecordResponse {
                        id: row.get(0)?,
                        request_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        token_id: row.get(3)?,
                        channel_id: row.get(4)?,
                        model: row.get(5)?,
                        path: row.get(6)?,
                        stream: row.get::<_, i32>(7)? != 0,
                        prompt_tokens: row.get(8)?,
                        completion_tokens: row.get(9)?,
                        total_tokens: row.get(10)?,
                        latency_ms: row.get(11)?,
                        status: row.get(12)?,
                        status_code: row.get::<_, Option<i64>>(13)?.map(|c| c as u16),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(UsageListResponse {
            total,
            page,
            page_size,
            records,
        })
    }

    fn get_stats(&self) -> Result<UsageStatsResponse> {
        let conn = self.conn.lock().unwrap();

        let (total_requests, total_prompt, total_completion, avg_latency, error_count): (
            u64,
            i64,
            i64,
            f64,
            u64,
        ) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0), COALESCE(AVG(latency_ms), 0), COUNT(CASE WHEN status = 'error' THEN 1 END) FROM usage_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let error_rate = if total_requests > 0 {
            error_count as f64 / total_requests as f64
        } else {
            0.0
        };

        let mut stmt = conn.prepare(
            "SELECT model, COUNT(*), COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0), COALESCE(AVG(latency_ms), 0)
             FROM usage_records WHERE model IS NOT NULL GROUP BY model ORDER BY COUNT(*) DESC",
        )?;
        let models = stmt
            .query_map([], |row| {
                Ok(ModelUsageStats {
                    model: row.get(0)?,
                    count: row.get(1)?,
                    total_prompt_tokens: row.get(2)?,
                    total_completion_tokens: row.get(3)?,
                    avg_latency_ms: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT channel_id, COUNT(*), COALESCE(SUM(total_tokens), 0), COUNT(CASE WHEN status = 'error' THEN 1 END)
             FROM usage_records WHERE channel_id IS NOT NULL GROUP BY channel_id ORDER BY COUNT(*) DESC",
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(ChannelUsageStats {
                    channel_id: row.get(0)?,
                    count: row.get(1)?,
                    total_tokens: row.get(2)?,
                    error_count: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(UsageStatsResponse {
            total_requests,
            total_prompt_tokens: total_prompt,
            total_completion_tokens: total_completion,
            total_tokens: total_prompt + total_completion,
            avg_latency_ms: avg_latency,
            error_count,
            error_rate,
            models,
            channels,
        })
    }

    fn clear(&self, before: Option<&str>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count = if let Some(before) = before {
            let normalized = chrono::DateTime::parse_from_rfc3339(before)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| before.to_string());
            conn.execute("DELETE FROM usage_records WHERE timestamp < ?1", [&normalized])?
        } else {
            conn.execute("DELETE FROM usage_records", [])?
        };
        Ok(count as u64)
    }
}

/// 异步用量记录服务（公开 API）
pub struct UsageRecorder {
    sender: mpsc::Sender<UsageRecord>,
    store: Arc<UsageStore>,
}

impl UsageRecorder {
    /// 创建新的 UsageRecorder，启动后台写入任务
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Arc::new(UsageStore::new(db_path)?);
        let (sender, mut receiver) = mpsc::channel::<UsageRecord>(10_000);

        let write_store = store.clone();
        tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                // 把当前可取的记录攒成一批
                let mut batch = vec![first];
                while let Ok(record) = receiver.try_recv() {
                    batch.push(record);
                    if batch.len() >= 500 {
                        break;
                    }
                }
                let store = write_store.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.insert_batch(&batch) {
                        tracing::error!("批量写入用量记录失败: {}", e);
                    }
                })
                .await;
            }
        });

        Ok(Self { sender, store })
    }

    /// 非阻塞记录用量（发送到 channel，满了丢弃并告警）
    pub fn record(&self, record: UsageRecord) {
        if self.sender.try_send(record).is_err() {
            tracing::warn!("用量记录通道已满，丢弃记录");
        }
    }

    /// 查询用量记录
    pub async fn query(&self, filter: UsageQuery) -> Result<UsageListResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query(&filter)).await?
    }

    /// 获取统计信息
    pub async fn get_stats(&self) -> Result<UsageStatsResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_stats()).await?
    }

    /// 清空记录
    pub async fn clear(&self, before: Option<String>) -> Result<u64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear(before.as_deref())).await?
    }
}
