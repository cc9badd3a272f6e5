//! 渠道、模型别名、调用方令牌的 SQLite 存储
//!
//! 管理面（增删改查 UI）在网关之外维护这些表；核心只做读快照。
//! 读操作通过 spawn_blocking 走同步连接，每次调度读取一份不可变快照，
//! 请求之间不共享可变状态。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::types::{Channel, ChannelStatus, Dialect, ModelEntry, TokenRecord};

/// 别名快照：一次调度内使用的全部别名数据
#[derive(Debug, Clone, Default)]
pub struct AliasSnapshot {
    /// 全局别名 -> 规范模型 id
    pub global: HashMap<String, String>,
    /// 规范模型 id -> 主别名（展示名）
    pub primary_names: HashMap<String, String>,
    /// 仅别名可见的规范模型 id 集合（原名从列表中隐藏）
    pub alias_only: HashSet<String>,
    /// 渠道内别名 -> 命中列表（同名别名可能指向不同渠道的不同模型）
    pub channel_aliases: HashMap<String, Vec<ChannelAliasHit>>,
}

/// 渠道内别名命中
#[derive(Debug, Clone)]
pub struct ChannelAliasHit {
    pub channel_id: String,
    pub model_id: String,
}

/// 底层 SQLite 存储（同步）
struct StoreInner {
    conn: std::sync::Mutex<Connection>,
}

impl StoreInner {
    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                dialect TEXT NOT NULL DEFAULT 'openai',
                weight INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                rate_limit INTEGER,
                models_json TEXT,
                custom_headers_json TEXT,
                owner TEXT
            );
            CREATE TABLE IF NOT EXISTS model_aliases (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                alias TEXT NOT NULL UNIQUE,
                is_primary INTEGER NOT NULL DEFAULT 0,
                alias_only INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS channel_model_aliases (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                alias TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                alias_only INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                key_hash TEXT NOT NULL UNIQUE,
                allowed_channels_json TEXT,
                status TEXT NOT NULL DEFAULT 'active'
            );
            CREATE INDEX IF NOT EXISTS idx_channels_status ON channels(status);
            CREATE INDEX IF NOT EXISTS idx_channel_aliases_alias ON channel_model_aliases(alias);",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn list_active(&self) -> Result<Vec<Channel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, api_key, dialect, weight, status, rate_limit, models_json, custom_headers_json, owner
             FROM channels WHERE status = 'active'",
        )?;
        let channels = stmt
            .query_map([], |row| {
                let dialect: String = row.get(4)?;
                let status: String = row.get(6)?;
                let models_json: Option<String> = row.get(8)?;
                let headers_json: Option<String> = row.get(9)?;
                Ok(Channel {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    base_url: row.get(2)?,
                    api_key: row.get(3)?,
                    dialect: Dialect::parse(&dialect),
                    weight: row.get::<_, i64>(5)?.max(1) as u32,
                    status: ChannelStatus::parse(&status),
                    rate_limit: row.get(7)?,
                    models: parse_models_json(models_json.as_deref()),
                    custom_headers: parse_headers_json(headers_json.as_deref()),
                    owner: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    fn alias_snapshot(&self) -> Result<AliasSnapshot> {
        let conn = self.conn.lock().unwrap();
        let mut snapshot = AliasSnapshot::default();

        let mut stmt =
            conn.prepare("SELECT alias, model_id, is_primary, alias_only FROM model_aliases")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, i64>(3)? != 0,
            ))
        })?;
        for row in rows {
            let (alias, model_id, is_primary, alias_only) = row?;
            if is_primary {
                snapshot.primary_names.insert(model_id.clone(), alias.clone());
            }
            if alias_only {
                snapshot.alias_only.insert(model_id.clone());
            }
            snapshot.global.insert(alias, model_id);
        }

        let mut stmt =
            conn.prepare("SELECT alias, channel_id, model_id FROM channel_model_aliases")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (alias, channel_id, model_id) = row?;
            snapshot
                .channel_aliases
                .entry(alias)
                .or_default()
                .push(ChannelAliasHit {
                    channel_id,
                    model_id,
                });
        }

        Ok(snapshot)
    }

    fn find_token(&self, key_hash: &str) -> Result<Option<TokenRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, name, allowed_channels_json, status FROM tokens WHERE key_hash = ?1",
                params![key_hash],
                |row| {
                    let allowed_json: Option<String> = row.get(2)?;
                    let status: String = row.get(3)?;
                    Ok(TokenRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        allowed_channels: parse_allowed_json(allowed_json.as_deref()),
                        status: ChannelStatus::parse(&status),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let models_json = serde_json::to_string(&channel.models)?;
        let headers_json = channel
            .custom_headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO channels (id, name, base_url, api_key, dialect, weight, status, rate_limit, models_json, custom_headers_json, owner)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                api_key = excluded.api_key,
                dialect = excluded.dialect,
                weight = excluded.weight,
                status = excluded.status,
                rate_limit = excluded.rate_limit,
                models_json = excluded.models_json,
                custom_headers_json = excluded.custom_headers_json,
                owner = excluded.owner",
            params![
                channel.id,
                channel.name,
                channel.base_url,
                channel.api_key,
                channel.dialect.as_str(),
                channel.weight as i64,
                channel.status.as_str(),
                channel.rate_limit,
                models_json,
                headers_json,
                channel.owner,
            ],
        )?;
        Ok(())
    }

    fn add_global_alias(
        &self,
        model_id: &str,
        alias: &str,
        is_primary: bool,
        alias_only: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO model_aliases (id, model_id, alias, is_primary, alias_only)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                model_id,
                alias,
                is_primary as i64,
                alias_only as i64,
            ],
        )?;
        Ok(())
    }

    fn add_channel_alias(
        &self,
        channel_id: &str,
        model_id: &str,
        alias: &str,
        is_primary: bool,
        alias_only: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO channel_model_aliases (id, channel_id, model_id, alias, is_primary, alias_only)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                channel_id,
                model_id,
                alias,
                is_primary as i64,
                alias_only as i64,
            ],
        )?;
        Ok(())
    }

    fn upsert_token(&self, record: &TokenRecord, key_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let allowed_json = if record.allowed_channels.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.allowed_channels)?)
        };
        conn.execute(
            "INSERT INTO tokens (id, name, key_hash, allowed_channels_json, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                key_hash = excluded.key_hash,
                allowed_channels_json = excluded.allowed_channels_json,
                status = excluded.status",
            params![
                record.id,
                record.name,
                key_hash,
                allowed_json,
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }
}

/// 渠道存储（公开 API，读操作走 spawn_blocking）
#[derive(Clone)]
pub struct ChannelStore {
    inner: Arc<StoreInner>,
}

impl ChannelStore {
    /// 打开数据库文件并初始化表结构
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            inner: Arc::new(StoreInner::init(conn)?),
        })
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            inner: Arc::new(StoreInner::init(conn)?),
        })
    }

    /// 读取当前所有 active 渠道
    pub async fn list_active(&self) -> Result<Vec<Channel>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.list_active()).await?
    }

    /// 读取别名快照
    pub async fn alias_snapshot(&self) -> Result<AliasSnapshot> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.alias_snapshot()).await?
    }

    /// 按密钥摘要查找令牌记录
    pub async fn authenticate(&self, key_hash: &str) -> Result<Option<TokenRecord>> {
        let inner = self.inner.clone();
        let key_hash = key_hash.to_string();
        tokio::task::spawn_blocking(move || inner.find_token(&key_hash)).await?
    }

    /// 写入或更新渠道（外部管理面与测试使用）
    pub fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        self.inner.upsert_channel(channel)
    }

    /// 写入全局别名
    pub fn add_global_alias(
        &self,
        model_id: &str,
        alias: &str,
        is_primary: bool,
        alias_only: bool,
    ) -> Result<()> {
        self.inner.add_global_alias(model_id, alias, is_primary, alias_only)
    }

    /// 写入渠道内别名
    pub fn add_channel_alias(
        &self,
        channel_id: &str,
        model_id: &str,
        alias: &str,
        is_primary: bool,
        alias_only: bool,
    ) -> Result<()> {
        self.inner
            .add_channel_alias(channel_id, model_id, alias, is_primary, alias_only)
    }

    /// 写入或更新令牌
    pub fn upsert_token(&self, record: &TokenRecord, key_hash: &str) -> Result<()> {
        self.inner.upsert_token(record, key_hash)
    }
}

/// 解析渠道模型列表 JSON
///
/// 兼容三种历史格式：
/// - `["model-a", "model-b"]`
/// - `[{"id": "model-a", "input_price": 1.0}]`
/// - `{"data": [...]}`（上游 /v1/models 响应原样入库的情况）
fn parse_models_json(raw: Option<&str>) -> Vec<ModelEntry> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    let arr = match &value {
        serde_json::Value::Array(arr) => arr.as_slice(),
        serde_json::Value::Object(obj) => match obj.get("data").and_then(|d| d.as_array()) {
            Some(arr) => arr.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut models = Vec::new();
    for item in arr {
        match item {
            serde_json::Value::String(id) if !id.is_empty() => models.push(ModelEntry {
                id: id.clone(),
                input_price: None,
                output_price: None,
            }),
            serde_json::Value::Object(obj) => {
                if let Some(id) = obj.get("id").and_then(|v| v.as_str()) {
                    models.push(ModelEntry {
                        id: id.to_string(),
                        input_price: obj.get("input_price").and_then(|v| v.as_f64()),
                        output_price: obj.get("output_price").and_then(|v| v.as_f64()),
                    });
                }
            }
            _ => {}
        }
    }
    models
}

fn parse_headers_json(raw: Option<&str>) -> Option<HashMap<String, String>> {
    let raw = raw?;
    serde_json::from_str::<HashMap<String, String>>(raw).ok()
}

fn parse_allowed_json(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel(id: &str, models: &[&str]) -> Channel {
        Channel {
            id: id.to_string(),
            name: format!("channel {}", id),
            base_url: "https://api.example.com/v1".to_string(),
            api_key: "sk-a\nsk-b".to_string(),
            dialect: Dialect::OpenAi,
            weight: 2,
            status: ChannelStatus::Active,
            rate_limit: Some(60),
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

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let store = ChannelStore::open_in_memory().unwrap();
        store.upsert_channel(&sample_channel("ch-1", &["gpt-4o"])).unwrap();

        let mut disabled = sample_channel("ch-2", &["gpt-4o"]);
        disabled.status = ChannelStatus::Disabled;
        store.upsert_channel(&disabled).unwrap();

        // 只返回 active 渠道
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "ch-1");
        assert_eq!(active[0].weight, 2);
        assert_eq!(active[0].api_keys(), vec!["sk-a", "sk-b"]);
        assert!(active[0].advertises_model("gpt-4o"));
    }

    #[tokio::test]
    async fn test_alias_snapshot() {
        let store = ChannelStore::open_in_memory().unwrap();
        store
            .add_global_alias("model-y", "alias-x", true, false)
            .unwrap();
        store
            .add_channel_alias("ch-1", "model-z", "alias-x", false, false)
            .unwrap();

        let snapshot = store.alias_snapshot().await.unwrap();
        assert_eq!(snapshot.global.get("alias-x").unwrap(), "model-y");
        assert_eq!(snapshot.primary_names.get("model-y").unwrap(), "alias-x");
        let hits = snapshot.channel_aliases.get("alias-x").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].channel_id, "ch-1");
        assert_eq!(hits[0].model_id, "model-z");
    }

    #[tokio::test]
    async fn test_token_authenticate() {
        let store = ChannelStore::open_in_memory().unwrap();
        let token = TokenRecord {
            id: "t-1".to_string(),
            name: "dev token".to_string(),
            allowed_channels: vec!["ch-1".to_string()],
            status: ChannelStatus::Active,
        };
        store.upsert_token(&token, "hash-abc").unwrap();

        let found = store.authenticate("hash-abc").await.unwrap().unwrap();
        assert_eq!(found.id, "t-1");
        assert_eq!(found.allowed_channels, vec!["ch-1"]);

        assert!(store.authenticate("hash-miss").await.unwrap().is_none());
    }

    #[test]
    fn test_parse_models_json_shapes() {
        assert_eq!(parse_models_json(Some(r#"["a","b"]"#)).len(), 2);
        let entries = parse_models_json(Some(r#"[{"id":"a","input_price":0.5}]"#));
        assert_eq!(entries[0].id, "a");
        assert_eq!(entries[0].input_price, Some(0.5));
        assert_eq!(
            parse_models_json(Some(r#"{"data":[{"id":"x"}]}"#))[0].id,
            "x"
        );
        assert!(parse_models_json(Some("not json")).is_empty());
        assert!(parse_models_json(None).is_empty());
    }
}
