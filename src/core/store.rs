//! Durable storage for blocked connections, the whitelist and the
//! enforcement counters.
//!
//! Two backends implement [`BlockStore`]: a JSON document on disk and a
//! Redis hash layout. Both persist writes before returning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::decision_engine::{BlockLevel, ThreatCategory, TriggeredRule};
use crate::core::flow_aggregator::Protocol;

/// Errors that can occur while reading or writing the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store is corrupted: {0}")]
    Corrupted(String),
    #[error("Entry not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Fatal errors halt the pipeline instead of degrading it
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupted(_))
    }
}

/// The (process, remote endpoint) pair a block applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdentity {
    pub process_name: String,
    pub remote_address: String,
    pub remote_port: u16,
    pub protocol: Protocol,
}

impl ConnectionIdentity {
    /// Stable storage key
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.process_name, self.remote_address, self.remote_port, self.protocol
        )
    }
}

/// Everything known about one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub identity: ConnectionIdentity,
    pub level: BlockLevel,
    pub reason: String,
    pub confidence: f64,
    pub threat_category: ThreatCategory,
    #[serde(default)]
    pub triggered_rules: Vec<TriggeredRule>,
    /// Whether the OS firewall rule is believed to exist
    pub firewall_rule_exists: bool,
    #[serde(default)]
    pub rule_name: Option<String>,
    pub first_blocked: DateTime<Utc>,
    pub last_blocked: DateTime<Utc>,
    pub block_count: u32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Imported from an orphaned firewall rule during reconciliation
    #[serde(default)]
    pub recovered: bool,
}

/// A persisted block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BlockedConnection {
    Temporary(BlockRecord),
    Permanent(BlockRecord),
}

/// Derived status of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Active,
    Expired,
    NeedsRepair,
    Failed,
    Recovered,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockStatus::Active => "active",
            BlockStatus::Expired => "expired",
            BlockStatus::NeedsRepair => "needs_repair",
            BlockStatus::Failed => "failed",
            BlockStatus::Recovered => "recovered",
        };
        f.write_str(s)
    }
}

impl BlockedConnection {
    pub fn record(&self) -> &BlockRecord {
        match self {
            BlockedConnection::Temporary(r) | BlockedConnection::Permanent(r) => r,
        }
    }

    pub fn record_mut(&mut self) -> &mut BlockRecord {
        match self {
            BlockedConnection::Temporary(r) | BlockedConnection::Permanent(r) => r,
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.record().identity
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BlockedConnection::Permanent(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BlockedConnection::Temporary(_) => "temporary",
            BlockedConnection::Permanent(_) => "permanent",
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> BlockStatus {
        match self {
            BlockedConnection::Temporary(r) => match r.expires_at {
                Some(expires) if expires <= now => BlockStatus::Expired,
                _ => BlockStatus::Active,
            },
            BlockedConnection::Permanent(r) => {
                if r.firewall_rule_exists {
                    if r.recovered {
                        BlockStatus::Recovered
                    } else {
                        BlockStatus::Active
                    }
                } else if r.error_message.is_some() {
                    BlockStatus::Failed
                } else {
                    BlockStatus::NeedsRepair
                }
            }
        }
    }
}

/// Merge a new block into an existing one for the same identity.
///
/// Levels only rise, the first block time is kept and a permanent block
/// is never downgraded to a temporary one. A temporary block arriving on
/// top of a permanent one only bumps the counters; the permanent row keeps
/// its rule state and reason.
pub fn merge_blocks(existing: &BlockedConnection, incoming: BlockedConnection) -> BlockedConnection {
    let old = existing.record();
    if existing.is_permanent() && !incoming.is_permanent() {
        let new = incoming.record();
        let mut record = old.clone();
        record.level = old.level.max(new.level);
        record.last_blocked = old.last_blocked.max(new.last_blocked);
        record.block_count = old.block_count.saturating_add(1);
        return BlockedConnection::Permanent(record);
    }

    let permanent = existing.is_permanent() || incoming.is_permanent();
    let mut record = match incoming {
        BlockedConnection::Temporary(r) | BlockedConnection::Permanent(r) => r,
    };

    record.level = record.level.max(old.level);
    record.first_blocked = old.first_blocked.min(record.first_blocked);
    record.block_count = old.block_count.saturating_add(1);
    if permanent {
        record.expires_at = None;
        if existing.is_permanent() && record.rule_name.is_none() {
            record.rule_name = old.rule_name.clone();
        }
        BlockedConnection::Permanent(record)
    } else {
        BlockedConnection::Temporary(record)
    }
}

/// Filter for [`BlockStore::list_blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockFilter {
    #[default]
    All,
    Temporary,
    Permanent,
    Failed,
}

impl BlockFilter {
    fn matches(&self, block: &BlockedConnection, now: DateTime<Utc>) -> bool {
        match self {
            BlockFilter::All => true,
            BlockFilter::Temporary => !block.is_permanent(),
            BlockFilter::Permanent => block.is_permanent(),
            BlockFilter::Failed => matches!(block.status(now), BlockStatus::Failed | BlockStatus::NeedsRepair),
        }
    }
}

/// What a whitelist entry exempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WhitelistTarget {
    ProcessPath(String),
    Address(String),
}

/// An explicit exemption from blocking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistEntry {
    pub id: Uuid,
    pub target: WhitelistTarget,
    pub reason: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl WhitelistEntry {
    pub fn new(target: WhitelistTarget, reason: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            reason: reason.into(),
            added_at: Utc::now(),
            expires_at,
            is_active: true,
        }
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |e| e > now)
    }

    /// Process paths compare case-insensitively, addresses exactly
    pub fn matches(&self, process_path: Option<&str>, remote_address: &str, now: DateTime<Utc>) -> bool {
        if !self.is_effective(now) {
            return false;
        }
        match &self.target {
            WhitelistTarget::ProcessPath(path) => process_path.map_or(false, |p| p.eq_ignore_ascii_case(path)),
            WhitelistTarget::Address(address) => address == remote_address,
        }
    }

    /// Whether a stored block falls under this entry
    pub fn covers(&self, block: &BlockedConnection, now: DateTime<Utc>) -> bool {
        if !self.is_effective(now) {
            return false;
        }
        match &self.target {
            WhitelistTarget::Address(address) => &block.identity().remote_address == address,
            WhitelistTarget::ProcessPath(path) => path
                .rsplit(|c| c == '/' || c == '\\')
                .next()
                .map_or(false, |n| n.eq_ignore_ascii_case(&block.identity().process_name)),
        }
    }
}

/// Enforcement counters used for the success rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounters {
    pub attempted_decisions: u64,
    pub applied_rules: u64,
}

/// Persistence for blocks, whitelist and counters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Insert or merge a block; returns the stored value
    async fn upsert_block(&self, block: BlockedConnection) -> Result<BlockedConnection, StoreError>;

    /// Overwrite a block without merging
    async fn replace_block(&self, block: BlockedConnection) -> Result<(), StoreError>;

    async fn get_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError>;

    /// Returns the removed block, if any
    async fn remove_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError>;

    async fn list_blocks(&self, filter: BlockFilter, now: DateTime<Utc>) -> Result<Vec<BlockedConnection>, StoreError>;

    async fn add_whitelist(&self, entry: WhitelistEntry) -> Result<(), StoreError>;

    async fn remove_whitelist(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, StoreError>;

    /// Entries that are active and not expired at `now`
    async fn active_whitelist(&self, now: DateTime<Utc>) -> Result<Vec<WhitelistEntry>, StoreError> {
        Ok(self
            .list_whitelist()
            .await?
            .into_iter()
            .filter(|e| e.is_effective(now))
            .collect())
    }

    /// Count one enforcement attempt and whether it produced a rule
    async fn record_attempt(&self, applied: bool) -> Result<(), StoreError>;

    async fn counters(&self) -> Result<StoreCounters, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    blocks: BTreeMap<String, BlockedConnection>,
    #[serde(default)]
    whitelist: Vec<WhitelistEntry>,
    #[serde(default)]
    counters: StoreCounters,
}

/// JSON file backend
pub struct FileStore {
    path: PathBuf,
    document: RwLock<StoreDocument>,
}

impl FileStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => StoreDocument::default(),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| StoreError::Corrupted(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                StoreDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Opened block store {} ({} blocks, {} whitelist entries)",
            path.display(),
            document.blocks.len(),
            document.whitelist.len()
        );
        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    /// Apply `mutate` to a copy, write it to disk, then publish it
    async fn write_with<T>(&self, mutate: impl FnOnce(&mut StoreDocument) -> T) -> Result<T, StoreError> {
        let mut guard = self.document.write().await;
        let mut next = guard.clone();
        let out = mutate(&mut next);

        let json = serde_json::to_vec_pretty(&next)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl BlockStore for FileStore {
    async fn upsert_block(&self, block: BlockedConnection) -> Result<BlockedConnection, StoreError> {
        let key = block.identity().key();
        self.write_with(|doc| {
            let merged = match doc.blocks.get(&key) {
                Some(existing) => merge_blocks(existing, block),
                None => block,
            };
            doc.blocks.insert(key, merged.clone());
            merged
        })
        .await
    }

    async fn replace_block(&self, block: BlockedConnection) -> Result<(), StoreError> {
        let key = block.identity().key();
        self.write_with(|doc| {
            doc.blocks.insert(key, block);
        })
        .await
    }

    async fn get_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError> {
        Ok(self.document.read().await.blocks.get(&identity.key()).cloned())
    }

    async fn remove_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError> {
        let key = identity.key();
        if !self.document.read().await.blocks.contains_key(&key) {
            return Ok(None);
        }
        self.write_with(|doc| doc.blocks.remove(&key)).await
    }

    async fn list_blocks(&self, filter: BlockFilter, now: DateTime<Utc>) -> Result<Vec<BlockedConnection>, StoreError> {
        Ok(self
            .document
            .read()
            .await
            .blocks
            .values()
            .filter(|b| filter.matches(b, now))
            .cloned()
            .collect())
    }

    async fn add_whitelist(&self, entry: WhitelistEntry) -> Result<(), StoreError> {
        self.write_with(|doc| {
            doc.whitelist.retain(|e| e.id != entry.id);
            doc.whitelist.push(entry);
        })
        .await
    }

    async fn remove_whitelist(&self, id: Uuid) -> Result<bool, StoreError> {
        if !self.document.read().await.whitelist.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        self.write_with(|doc| {
            doc.whitelist.retain(|e| e.id != id);
            true
        })
        .await
    }

    async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, StoreError> {
        Ok(self.document.read().await.whitelist.clone())
    }

    async fn record_attempt(&self, applied: bool) -> Result<(), StoreError> {
        self.write_with(|doc| {
            doc.counters.attempted_decisions += 1;
            if applied {
                doc.counters.applied_rules += 1;
            }
        })
        .await
    }

    async fn counters(&self) -> Result<StoreCounters, StoreError> {
        Ok(self.document.read().await.counters)
    }
}

/// Redis hash backend
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    write_lock: Mutex<()>,
}

impl RedisStore {
    /// Connect to `redis_url`
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            write_lock: Mutex::new(()),
        })
    }

    fn blocks_key(&self) -> String {
        format!("{}:blocks", self.key_prefix)
    }

    fn whitelist_key(&self) -> String {
        format!("{}:whitelist", self.key_prefix)
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:counters:{}", self.key_prefix, name)
    }

    fn decode_block(key: &str, json: &str) -> Result<BlockedConnection, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Corrupted(format!("block {}: {}", key, e)))
    }
}

#[async_trait]
impl BlockStore for RedisStore {
    async fn upsert_block(&self, block: BlockedConnection) -> Result<BlockedConnection, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.connection.clone();
        let key = block.identity().key();

        let existing: Option<String> = conn.hget(self.blocks_key(), &key).await?;
        let merged = match existing {
            Some(json) => merge_blocks(&Self::decode_block(&key, &json)?, block),
            None => block,
        };
        conn.hset::<_, _, _, ()>(self.blocks_key(), &key, serde_json::to_string(&merged)?)
            .await?;
        Ok(merged)
    }

    async fn replace_block(&self, block: BlockedConnection) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(self.blocks_key(), block.identity().key(), serde_json::to_string(&block)?)
            .await?;
        Ok(())
    }

    async fn get_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError> {
        let mut conn = self.connection.clone();
        let key = identity.key();
        let json: Option<String> = conn.hget(self.blocks_key(), &key).await?;
        json.map(|j| Self::decode_block(&key, &j)).transpose()
    }

    async fn remove_block(&self, identity: &ConnectionIdentity) -> Result<Option<BlockedConnection>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.get_block(identity).await?;
        if existing.is_some() {
            let mut conn = self.connection.clone();
            conn.hdel::<_, _, ()>(self.blocks_key(), identity.key()).await?;
        }
        Ok(existing)
    }

    async fn list_blocks(&self, filter: BlockFilter, now: DateTime<Utc>) -> Result<Vec<BlockedConnection>, StoreError> {
        let mut conn = self.connection.clone();
        let all: BTreeMap<String, String> = conn.hgetall(self.blocks_key()).await?;
        let mut blocks = Vec::with_capacity(all.len());
        for (key, json) in all {
            let block = Self::decode_block(&key, &json)?;
            if filter.matches(&block, now) {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    async fn add_whitelist(&self, entry: WhitelistEntry) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(self.whitelist_key(), entry.id.to_string(), serde_json::to_string(&entry)?)
            .await?;
        Ok(())
    }

    async fn remove_whitelist(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.hdel(self.whitelist_key(), id.to_string()).await?;
        Ok(removed > 0)
    }

    async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, StoreError> {
        let mut conn = self.connection.clone();
        let all: BTreeMap<String, String> = conn.hgetall(self.whitelist_key()).await?;
        all.into_iter()
            .map(|(id, json)| {
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupted(format!("whitelist {}: {}", id, e)))
            })
            .collect()
    }

    async fn record_attempt(&self, applied: bool) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.incr::<_, _, ()>(self.counter_key("attempted"), 1).await?;
        if applied {
            conn.incr::<_, _, ()>(self.counter_key("applied"), 1).await?;
        }
        Ok(())
    }

    async fn counters(&self) -> Result<StoreCounters, StoreError> {
        let mut conn = self.connection.clone();
        let attempted: Option<u64> = conn.get(self.counter_key("attempted")).await?;
        let applied: Option<u64> = conn.get(self.counter_key("applied")).await?;
        Ok(StoreCounters {
            attempted_decisions: attempted.unwrap_or(0),
            applied_rules: applied.unwrap_or(0),
        })
    }
}

/// Open the backend named in configuration
pub async fn open_store(
    backend: &str,
    path: &Path,
    redis_url: &str,
    key_prefix: &str,
) -> Result<Arc<dyn BlockStore>, StoreError> {
    match backend {
        "redis" => Ok(Arc::new(RedisStore::connect(redis_url, key_prefix).await?)),
        "file" => Ok(Arc::new(FileStore::open(path).await?)),
        other => {
            error!("Unknown storage backend '{}'", other);
            Err(StoreError::Corrupted(format!("unknown storage backend '{}'", other)))
        }
    }
}
