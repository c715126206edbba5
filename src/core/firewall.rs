//! Firewall rule lifecycle for the network defense service.
//!
//! Temporary blocks live in memory with a TTL. Permanent blocks are OS
//! firewall rules named deterministically from the process and remote
//! address, so applying the same decision twice never creates a second
//! rule. `reconcile` aligns the durable store with the live rule set.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time;

use crate::core::decision_engine::{BlockDecision, BlockLevel, ThreatCategory};
use crate::core::flow_aggregator::Protocol;
use crate::core::store::{BlockFilter, BlockRecord, BlockStore, BlockedConnection, ConnectionIdentity, StoreError};
use crate::utils::{format_rule_name, parse_rule_name, rule_name_prefix};

/// Errors that can occur while enforcing blocks
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Firewall {operation} failed: {message}")]
    CommandFailed { operation: &'static str, message: String },
    #[error("Firewall I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Firewall {operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
    #[error("Insufficient privileges to modify the firewall: {0}")]
    PermissionDenied(String),
    #[error("Block state could not be persisted: {0}")]
    Store(#[from] StoreError),
    #[error("Decision cannot be enforced: {0}")]
    InvalidDecision(String),
    #[error("Firewall change failed ({message}) and the failure was not recorded: {store}")]
    Unrecorded { message: String, store: StoreError },
}

/// Rule direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Block,
    Allow,
}

/// A firewall rule as seen by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub remote_address: String,
    pub direction: Direction,
    pub action: RuleAction,
}

impl FirewallRule {
    /// Outbound block rule
    pub fn block(name: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_address: remote_address.into(),
            direction: Direction::Outbound,
            action: RuleAction::Block,
        }
    }
}

/// Firewall configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// `netsh` or `memory`
    pub backend: String,
    /// Prefix of every rule name owned by this service
    pub namespace: String,
    pub operation_timeout_seconds: u64,
    pub temporary_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub netsh_path: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: "netsh".to_string(),
            namespace: "NetDefense".to_string(),
            operation_timeout_seconds: 10,
            temporary_ttl_seconds: 3600,
            sweep_interval_seconds: 30,
            netsh_path: "netsh".to_string(),
        }
    }
}

/// OS firewall access
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn add_rule(&self, rule: &FirewallRule) -> Result<(), FirewallError>;

    /// Returns false when no rule with that name existed
    async fn remove_rule(&self, name: &str) -> Result<bool, FirewallError>;

    async fn list_rules(&self, prefix: &str) -> Result<Vec<FirewallRule>, FirewallError>;
}

const NO_MATCH: &str = "No rules match";

/// Windows Defender Firewall through `netsh advfirewall`
pub struct NetshFirewall {
    netsh_path: String,
}

impl NetshFirewall {
    pub fn new(netsh_path: impl Into<String>) -> Self {
        Self {
            netsh_path: netsh_path.into(),
        }
    }

    async fn run(&self, operation: &'static str, args: &[String]) -> Result<(bool, String), FirewallError> {
        let output = Command::new(&self.netsh_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let lowered = text.to_ascii_lowercase();
        if lowered.contains("requires elevation") || lowered.contains("access is denied") {
            return Err(FirewallError::PermissionDenied(text.trim().to_string()));
        }
        debug!("netsh {} exited with {}", operation, output.status);
        Ok((output.status.success(), text))
    }
}

#[async_trait]
impl FirewallBackend for NetshFirewall {
    async fn add_rule(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        let dir = match rule.direction {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        };
        let action = match rule.action {
            RuleAction::Block => "block",
            RuleAction::Allow => "allow",
        };
        let args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name={}", rule.name),
            format!("dir={}", dir),
            format!("action={}", action),
            format!("remoteip={}", rule.remote_address),
        ];
        match self.run("add", &args).await? {
            (true, _) => Ok(()),
            (false, text) => Err(FirewallError::CommandFailed {
                operation: "add",
                message: text.trim().to_string(),
            }),
        }
    }

    async fn remove_rule(&self, name: &str) -> Result<bool, FirewallError> {
        let args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "delete".to_string(),
            "rule".to_string(),
            format!("name={}", name),
        ];
        match self.run("remove", &args).await? {
            (_, text) if text.contains(NO_MATCH) => Ok(false),
            (true, _) => Ok(true),
            (false, text) => Err(FirewallError::CommandFailed {
                operation: "remove",
                message: text.trim().to_string(),
            }),
        }
    }

    async fn list_rules(&self, prefix: &str) -> Result<Vec<FirewallRule>, FirewallError> {
        let args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "show".to_string(),
            "rule".to_string(),
            "name=all".to_string(),
            "dir=out".to_string(),
        ];
        match self.run("list", &args).await? {
            (_, text) if text.contains(NO_MATCH) => Ok(Vec::new()),
            (true, text) => Ok(parse_show_rules(&text)
                .into_iter()
                .filter(|r| r.name.starts_with(prefix))
                .collect()),
            (false, text) => Err(FirewallError::CommandFailed {
                operation: "list",
                message: text.trim().to_string(),
            }),
        }
    }
}

/// Parse `netsh advfirewall firewall show rule` output
pub fn parse_show_rules(output: &str) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    let mut current: Option<FirewallRule> = None;

    for line in output.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field.trim() {
            "Rule Name" => {
                if let Some(rule) = current.take() {
                    rules.push(rule);
                }
                current = Some(FirewallRule::block(value, ""));
            }
            "Direction" => {
                if let Some(rule) = current.as_mut() {
                    rule.direction = if value.eq_ignore_ascii_case("in") {
                        Direction::Inbound
                    } else {
                        Direction::Outbound
                    };
                }
            }
            "Action" => {
                if let Some(rule) = current.as_mut() {
                    rule.action = if value.eq_ignore_ascii_case("allow") {
                        RuleAction::Allow
                    } else {
                        RuleAction::Block
                    };
                }
            }
            "RemoteIP" => {
                if let Some(rule) = current.as_mut() {
                    let address = value.strip_suffix("/32").unwrap_or(value);
                    let address = address.strip_suffix("/128").unwrap_or(address);
                    rule.remote_address = if address.eq_ignore_ascii_case("any") {
                        String::new()
                    } else {
                        address.to_string()
                    };
                }
            }
            _ => {}
        }
    }
    if let Some(rule) = current {
        rules.push(rule);
    }
    rules
}

/// In-process rule set for dry runs and tests
#[derive(Default)]
pub struct InMemoryFirewall {
    rules: RwLock<BTreeMap<String, FirewallRule>>,
}

impl InMemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.rules.read().await.contains_key(name)
    }
}

#[async_trait]
impl FirewallBackend for InMemoryFirewall {
    async fn add_rule(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        self.rules.write().await.insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    async fn remove_rule(&self, name: &str) -> Result<bool, FirewallError> {
        Ok(self.rules.write().await.remove(name).is_some())
    }

    async fn list_rules(&self, prefix: &str) -> Result<Vec<FirewallRule>, FirewallError> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Backend named in configuration
pub fn backend_from_config(config: &FirewallConfig) -> Result<Arc<dyn FirewallBackend>, FirewallError> {
    match config.backend.as_str() {
        "netsh" => Ok(Arc::new(NetshFirewall::new(config.netsh_path.clone()))),
        "memory" => Ok(Arc::new(InMemoryFirewall::new())),
        other => Err(FirewallError::CommandFailed {
            operation: "configure",
            message: format!("unknown firewall backend '{}'", other),
        }),
    }
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub checked: usize,
    pub flags_corrected: usize,
    pub marked_needs_repair: usize,
    pub recreated: usize,
    pub recovered: usize,
    pub failed: usize,
    pub restored_temporary: usize,
    pub expired_temporary: usize,
    pub cancelled: bool,
}

impl ReconciliationReport {
    /// True when the pass made no changes
    pub fn is_clean(&self) -> bool {
        self.flags_corrected == 0
            && self.marked_needs_repair == 0
            && self.recreated == 0
            && self.recovered == 0
            && self.failed == 0
            && self.restored_temporary == 0
            && self.expired_temporary == 0
    }
}

/// Applies decisions and keeps the store in line with the firewall
pub struct FirewallRuleManager {
    backend: Arc<dyn FirewallBackend>,
    store: Arc<dyn BlockStore>,
    config: FirewallConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    temporary: DashMap<ConnectionIdentity, DateTime<Utc>>,
}

impl FirewallRuleManager {
    pub fn new(backend: Arc<dyn FirewallBackend>, store: Arc<dyn BlockStore>, config: FirewallConfig) -> Self {
        Self {
            backend,
            store,
            config,
            locks: DashMap::new(),
            temporary: DashMap::new(),
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// Deterministic rule name for an identity
    pub fn rule_name(&self, identity: &ConnectionIdentity) -> String {
        format_rule_name(&self.config.namespace, &identity.process_name, &identity.remote_address)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a backend call under the operation timeout
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Result<T, FirewallError>
    where
        F: Future<Output = Result<T, FirewallError>>,
    {
        let secs = self.config.operation_timeout_seconds.max(1);
        let result = match time::timeout(StdDuration::from_secs(secs), call).await {
            Ok(result) => result,
            Err(_) => Err(FirewallError::Timeout { operation, secs }),
        };
        if let Err(e) = &result {
            metrics::increment_counter!("firewall_operations_failed_total", "operation" => operation);
            warn!("Firewall {} failed: {}", operation, e);
        }
        result
    }

    async fn rule_exists(&self, name: &str) -> Result<bool, FirewallError> {
        let rules = self.guarded("list", self.backend.list_rules(name)).await?;
        Ok(rules.iter().any(|r| r.name == name))
    }

    fn record_from(decision: &BlockDecision, now: DateTime<Utc>) -> BlockRecord {
        BlockRecord {
            identity: decision.identity.clone(),
            level: decision.level,
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            threat_category: decision.threat_category,
            triggered_rules: decision.triggered_rules.clone(),
            firewall_rule_exists: false,
            rule_name: None,
            first_blocked: now,
            last_blocked: now,
            block_count: 1,
            expires_at: None,
            error_message: None,
            recovered: false,
        }
    }

    /// Block in memory until `ttl` elapses
    pub async fn apply_temporary(&self, decision: &BlockDecision, ttl: Duration) -> Result<BlockedConnection, FirewallError> {
        if decision.level == BlockLevel::None {
            return Err(FirewallError::InvalidDecision("level None is never enforced".to_string()));
        }
        let identity = &decision.identity;
        let lock = self.lock_for(&self.rule_name(identity));
        let _guard = lock.lock().await;

        if let Ok(Some(existing @ BlockedConnection::Permanent(_))) = self.store.get_block(identity).await {
            debug!("{} already permanently blocked", identity.key());
            return Ok(existing);
        }

        let now = Utc::now();
        let expires_at = now + ttl;
        let mut record = Self::record_from(decision, now);
        record.expires_at = Some(expires_at);

        let stored = self.store.upsert_block(BlockedConnection::Temporary(record)).await;
        match &stored {
            Ok(BlockedConnection::Permanent(_)) => {
                debug!("{} already permanently blocked", identity.key());
            }
            _ => {
                self.temporary.insert(identity.clone(), expires_at);
                info!(
                    "Temporarily blocked {} -> {} until {}",
                    identity.process_name, identity.remote_address, expires_at
                );
            }
        }
        Ok(stored?)
    }

    /// Create the OS rule for a decision (once) and persist it
    pub async fn apply_permanent(&self, decision: &BlockDecision) -> Result<BlockedConnection, FirewallError> {
        if decision.level == BlockLevel::None {
            return Err(FirewallError::InvalidDecision("level None is never enforced".to_string()));
        }
        let identity = &decision.identity;
        let name = self.rule_name(identity);
        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        let applied = match self.rule_exists(&name).await {
            Ok(true) => {
                debug!("Rule {} already present", name);
                Ok(())
            }
            Ok(false) => {
                let rule = FirewallRule::block(name.clone(), identity.remote_address.clone());
                self.guarded("add", self.backend.add_rule(&rule)).await
            }
            Err(e) => Err(e),
        };

        let now = Utc::now();
        let mut record = Self::record_from(decision, now);
        record.rule_name = Some(name.clone());
        record.firewall_rule_exists = applied.is_ok();
        record.error_message = applied.as_ref().err().map(|e| e.to_string());
        self.temporary.remove(identity);

        if let Err(e) = self.store.record_attempt(applied.is_ok()).await {
            warn!("Failed to count enforcement attempt: {}", e);
        }
        let stored = self.store.upsert_block(BlockedConnection::Permanent(record)).await;

        match applied {
            Ok(()) => {
                info!(
                    "Permanently blocked {} -> {} (rule {})",
                    identity.process_name, identity.remote_address, name
                );
                Ok(stored?)
            }
            Err(e) => match stored {
                Ok(_) => Err(e),
                Err(store_err) => {
                    warn!("Failed to persist failed block {}: {}", identity.key(), store_err);
                    Err(FirewallError::Unrecorded {
                        message: e.to_string(),
                        store: store_err,
                    })
                }
            },
        }
    }

    /// Remove a block and, for permanent blocks, its firewall rule.
    ///
    /// An already-absent rule is not an error. Returns the final state of
    /// the removed record, if one existed.
    pub async fn remove(&self, identity: &ConnectionIdentity) -> Result<Option<BlockRecord>, FirewallError> {
        let lock = self.lock_for(&self.rule_name(identity));
        let _guard = lock.lock().await;

        let existing = self.store.get_block(identity).await?;
        let name = existing
            .as_ref()
            .and_then(|b| b.record().rule_name.clone())
            .unwrap_or_else(|| self.rule_name(identity));

        self.temporary.remove(identity);

        let is_temporary = matches!(existing, Some(BlockedConnection::Temporary(_)));
        if !is_temporary {
            let shared = self
                .store
                .list_blocks(BlockFilter::Permanent, Utc::now())
                .await?
                .iter()
                .any(|b| b.identity() != identity && b.record().rule_name.as_deref() == Some(name.as_str()));

            if shared {
                debug!("Rule {} still used by another block, keeping it", name);
            } else {
                match self.guarded("remove", self.backend.remove_rule(&name)).await {
                    Ok(true) => info!("Removed firewall rule {}", name),
                    Ok(false) => debug!("Firewall rule {} was already absent", name),
                    Err(e) => {
                        if let Some(mut block) = existing {
                            block.record_mut().error_message = Some(format!("unblock failed: {}", e));
                            if let Err(store_err) = self.store.replace_block(block).await {
                                warn!("Failed to persist unblock failure: {}", store_err);
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }

        let removed = self.store.remove_block(identity).await?;
        Ok(removed.map(|block| {
            let mut record = block.record().clone();
            record.firewall_rule_exists = false;
            record
        }))
    }

    /// Align stored blocks with the live firewall.
    ///
    /// Safe to re-run; stops between rules when `shutdown` is set. Rules
    /// already re-created before a stop stay in place.
    pub async fn reconcile(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<ReconciliationReport, FirewallError> {
        let mut report = ReconciliationReport::default();
        let prefix = rule_name_prefix(&self.config.namespace);
        let live = self.guarded("list", self.backend.list_rules(&prefix)).await?;
        let mut live_names: HashSet<String> = live.iter().map(|r| r.name.clone()).collect();
        let now = Utc::now();
        let blocks = self.store.list_blocks(BlockFilter::All, now).await?;

        let mut referenced: HashSet<String> = HashSet::new();
        for block in blocks {
            if shutdown.map_or(false, |rx| *rx.borrow()) {
                report.cancelled = true;
                info!("Reconciliation cancelled: {:?}", report);
                return Ok(report);
            }

            match block {
                BlockedConnection::Permanent(listed) => {
                    report.checked += 1;
                    let lock = self.lock_for(&self.rule_name(&listed.identity));
                    let _guard = lock.lock().await;
                    referenced.insert(
                        listed
                            .rule_name
                            .clone()
                            .unwrap_or_else(|| self.rule_name(&listed.identity)),
                    );

                    // the row may have been unblocked or replaced since the listing
                    let mut record = match self.store.get_block(&listed.identity).await? {
                        Some(BlockedConnection::Permanent(current)) => current,
                        _ => {
                            debug!("Block {} changed during reconciliation, skipping", listed.identity.key());
                            continue;
                        }
                    };
                    let name = record
                        .rule_name
                        .clone()
                        .unwrap_or_else(|| self.rule_name(&record.identity));
                    referenced.insert(name.clone());

                    if live_names.contains(&name) {
                        if !record.firewall_rule_exists || record.error_message.is_some() || record.rule_name.is_none() {
                            record.firewall_rule_exists = true;
                            record.error_message = None;
                            record.rule_name = Some(name);
                            self.store.replace_block(BlockedConnection::Permanent(record)).await?;
                            report.flags_corrected += 1;
                        }
                        continue;
                    }

                    if record.firewall_rule_exists {
                        report.marked_needs_repair += 1;
                        record.firewall_rule_exists = false;
                        self.store
                            .replace_block(BlockedConnection::Permanent(record.clone()))
                            .await?;
                    }

                    let rule = FirewallRule::block(name.clone(), record.identity.remote_address.clone());
                    let applied = self.guarded("add", self.backend.add_rule(&rule)).await;
                    if let Err(e) = self.store.record_attempt(applied.is_ok()).await {
                        warn!("Failed to count enforcement attempt: {}", e);
                    }
                    match applied {
                        Ok(()) => {
                            record.firewall_rule_exists = true;
                            record.error_message = None;
                            record.rule_name = Some(name.clone());
                            live_names.insert(name);
                            report.recreated += 1;
                        }
                        Err(e) => {
                            record.error_message = Some(e.to_string());
                            report.failed += 1;
                        }
                    }
                    self.store.replace_block(BlockedConnection::Permanent(record)).await?;
                }
                BlockedConnection::Temporary(record) => match record.expires_at {
                    Some(expires) if expires <= now => {
                        self.temporary.remove(&record.identity);
                        self.store.remove_block(&record.identity).await?;
                        report.expired_temporary += 1;
                    }
                    expires => {
                        let expires = expires.unwrap_or_else(|| now + Duration::seconds(self.config.temporary_ttl_seconds as i64));
                        if !self.temporary.contains_key(&record.identity) {
                            self.temporary.insert(record.identity.clone(), expires);
                            report.restored_temporary += 1;
                        }
                    }
                },
            }
        }

        for rule in live.iter().filter(|r| !referenced.contains(&r.name)) {
            if shutdown.map_or(false, |rx| *rx.borrow()) {
                report.cancelled = true;
                break;
            }
            let Some((process_name, remote_address)) = parse_rule_name(&self.config.namespace, &rule.name) else {
                warn!("Ignoring unparseable rule {}", rule.name);
                continue;
            };
            let identity = ConnectionIdentity {
                process_name,
                remote_address,
                remote_port: 0,
                protocol: Protocol::Any,
            };
            let lock = self.lock_for(&self.rule_name(&identity));
            let _guard = lock.lock().await;
            if !self.rule_exists(&rule.name).await? {
                debug!("Rule {} disappeared during reconciliation", rule.name);
                continue;
            }
            let claimed = self
                .store
                .list_blocks(BlockFilter::Permanent, now)
                .await?
                .iter()
                .any(|b| b.record().rule_name.as_deref() == Some(rule.name.as_str()));
            if claimed {
                continue;
            }
            let record = BlockRecord {
                identity,
                level: BlockLevel::Immediate,
                reason: format!("Recovered from firewall rule {}", rule.name),
                confidence: 1.0,
                threat_category: ThreatCategory::Unknown,
                triggered_rules: Vec::new(),
                firewall_rule_exists: true,
                rule_name: Some(rule.name.clone()),
                first_blocked: now,
                last_blocked: now,
                block_count: 1,
                expires_at: None,
                error_message: None,
                recovered: true,
            };
            self.store.upsert_block(BlockedConnection::Permanent(record)).await?;
            report.recovered += 1;
        }

        if report.is_clean() {
            debug!("Reconciliation found nothing to change ({} permanent blocks)", report.checked);
        } else {
            info!("Reconciliation finished: {:?}", report);
        }
        Ok(report)
    }

    /// Drop temporary blocks whose TTL has passed
    pub async fn expire_temporary(&self, now: DateTime<Utc>) -> Result<Vec<ConnectionIdentity>, FirewallError> {
        let expired: Vec<ConnectionIdentity> = self
            .temporary
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();

        for identity in &expired {
            self.temporary.remove(identity);
            if let Some(BlockedConnection::Temporary(_)) = self.store.get_block(identity).await? {
                self.store.remove_block(identity).await?;
            }
            debug!("Temporary block on {} expired", identity.key());
        }
        self.prune_locks();
        Ok(expired)
    }

    /// Forget rule locks nobody is holding
    fn prune_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn is_temporarily_blocked(&self, identity: &ConnectionIdentity, now: DateTime<Utc>) -> bool {
        self.temporary.get(identity).map_or(false, |e| *e.value() > now)
    }

    pub fn temporary_count(&self) -> usize {
        self.temporary.len()
    }

    /// Sweep expired temporary blocks until `shutdown` flips to true
    pub async fn run_expiry(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(StdDuration::from_secs(self.config.sweep_interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.expire_temporary(Utc::now()).await {
                        warn!("Temporary block sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Temporary block sweeper stopped");
    }
}
