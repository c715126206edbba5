//! Capture-to-enforcement pipeline.
//!
//! Flow observations feed the aggregator, the detector ticks over snapshots
//! of it, and every decision is checked against the whitelist before the
//! firewall manager enforces it. Store outages degrade the pipeline (decisions
//! are still computed, blocks are deferred or left unpersisted); only a
//! corrupted store halts it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::core::ddos_detector::{DdosDetector, DetectionError, DetectionResult, DetectionState};
use crate::core::decision_engine::{BlockDecision, BlockLevel, ConnectionAttempt, DecisionEngine, DetectionContext};
use crate::core::firewall::{FirewallBackend, FirewallError, FirewallRuleManager, ReconciliationReport};
use crate::core::flow_aggregator::{FlowAggregator, FlowObservation};
use crate::core::statistics::{export_csv, BlockStatistics, StatisticsError};
use crate::core::store::{
    BlockFilter, BlockRecord, BlockStore, BlockedConnection, ConnectionIdentity, StoreError, WhitelistEntry,
    WhitelistTarget,
};
use crate::core::threat_intel::ThreatIntelChain;
use crate::models::Config;

/// Errors surfaced by pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error(transparent)]
    Statistics(#[from] StatisticsError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("Pipeline halted: {0}")]
    Halted(String),
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the observation queue between capture and aggregator
    pub observation_channel_capacity: usize,
    /// Capacity of the decision broadcast channel
    pub decision_channel_capacity: usize,
    /// Block detected attack sources automatically
    pub auto_block_detections: bool,
    pub statistics_top_n: usize,
    /// Interval between sweeps of idle decision memory
    pub memory_sweep_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            observation_channel_capacity: 10_000,
            decision_channel_capacity: 256,
            auto_block_detections: true,
            statistics_top_n: 10,
            memory_sweep_seconds: 300,
        }
    }
}

/// What happened to a decision after it was made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "enforcement", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Enforcement {
    /// Level None, nothing to do
    None,
    Monitored,
    TemporaryBlock { expires_at: DateTime<Utc> },
    PermanentBlock { rule_name: String },
    /// The whitelist could not be read, so no block was applied
    Deferred,
    Failed { message: String },
}

impl Enforcement {
    pub fn is_block(&self) -> bool {
        matches!(self, Enforcement::TemporaryBlock { .. } | Enforcement::PermanentBlock { .. })
    }
}

/// Decision plus its enforcement result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub decision: BlockDecision,
    pub enforcement: Enforcement,
    /// False when the store could not record the outcome
    pub persisted: bool,
}

/// Whitelist as read for one decision
enum WhitelistRead {
    Current(Vec<WhitelistEntry>),
    Unavailable,
}

/// Wires the engines, the firewall manager and the store together
pub struct DefensePipeline {
    aggregator: Arc<FlowAggregator>,
    detector: Arc<DdosDetector>,
    engine: DecisionEngine,
    firewall: Arc<FirewallRuleManager>,
    store: Arc<dyn BlockStore>,
    threat_intel: ThreatIntelChain,
    config: PipelineConfig,
    decisions_tx: broadcast::Sender<BlockDecision>,
    halted: AtomicBool,
}

impl DefensePipeline {
    /// Build every component from `config`
    pub fn new(
        config: &Config,
        store: Arc<dyn BlockStore>,
        backend: Arc<dyn FirewallBackend>,
        threat_intel: ThreatIntelChain,
    ) -> Result<Self, PipelineError> {
        let detector = DdosDetector::new(config.detection.clone(), config.signatures.clone())?;
        let firewall = FirewallRuleManager::new(backend, store.clone(), config.firewall.clone());
        let (decisions_tx, _) = broadcast::channel(config.pipeline.decision_channel_capacity.max(1));

        Ok(Self {
            aggregator: Arc::new(FlowAggregator::new(config.aggregator.clone())),
            detector: Arc::new(detector),
            engine: DecisionEngine::new(config.decision.clone()),
            firewall: Arc::new(firewall),
            store,
            threat_intel,
            config: config.pipeline.clone(),
            decisions_tx,
            halted: AtomicBool::new(false),
        })
    }

    pub fn aggregator(&self) -> &Arc<FlowAggregator> {
        &self.aggregator
    }

    pub fn detector(&self) -> &Arc<DdosDetector> {
        &self.detector
    }

    pub fn firewall(&self) -> &Arc<FirewallRuleManager> {
        &self.firewall
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Subscribe to every decision the pipeline makes
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<BlockDecision> {
        self.decisions_tx.subscribe()
    }

    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionResult> {
        self.detector.subscribe()
    }

    pub async fn recent_detections(&self, limit: usize) -> Vec<DetectionResult> {
        self.detector.recent(limit).await
    }

    /// Drop decision memory that has gone idle
    pub fn prune_memory(&self, now: DateTime<Utc>) -> usize {
        self.engine.prune(now)
    }

    /// Record one flow observation
    pub fn ingest(&self, observation: &FlowObservation) {
        self.aggregator.observe(observation);
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.is_halted() {
            return Err(PipelineError::Halted("store corruption requires operator intervention".to_string()));
        }
        Ok(())
    }

    /// Convert a store error, halting the pipeline when it is fatal
    fn store_failure(&self, e: StoreError) -> PipelineError {
        if e.is_fatal() {
            if !self.halted.swap(true, Ordering::SeqCst) {
                error!("Halting pipeline: {}", e);
            }
            PipelineError::Halted(e.to_string())
        } else {
            PipelineError::Store(e)
        }
    }

    async fn read_whitelist(&self, now: DateTime<Utc>) -> Result<WhitelistRead, PipelineError> {
        match self.store.active_whitelist(now).await {
            Ok(entries) => Ok(WhitelistRead::Current(entries)),
            Err(e) if e.is_fatal() => Err(self.store_failure(e)),
            Err(e) => {
                metrics::increment_counter!("store_degraded_total");
                warn!("Whitelist unavailable, blocks will be deferred: {}", e);
                Ok(WhitelistRead::Unavailable)
            }
        }
    }

    /// Evaluate and enforce one outbound connection attempt
    pub async fn handle_attempt(&self, attempt: ConnectionAttempt) -> Result<PipelineOutcome, PipelineError> {
        self.ensure_running()?;

        let detection = match attempt.remote_address.parse::<IpAddr>() {
            Ok(ip) => self.detector.latest_for(&ip).await,
            Err(_) => None,
        };
        let context = DetectionContext {
            detection,
            threat_intel: self.threat_intel.lookup(&attempt.remote_address).await,
        };

        let whitelist = self.read_whitelist(attempt.observed_at).await?;
        let entries: &[WhitelistEntry] = match &whitelist {
            WhitelistRead::Current(entries) => entries.as_slice(),
            WhitelistRead::Unavailable => &[],
        };
        let decision = self.engine.evaluate(&attempt, &context, entries);
        self.finish(decision, whitelist).await
    }

    /// Block the source of a detection when it reached `AttackDetected`
    pub async fn handle_detection(&self, detection: &DetectionResult) -> Result<Option<PipelineOutcome>, PipelineError> {
        self.ensure_running()?;
        if !self.config.auto_block_detections || detection.state < DetectionState::AttackDetected {
            return Ok(None);
        }

        let whitelist = self.read_whitelist(detection.detected_at).await?;
        let decision = match &whitelist {
            WhitelistRead::Current(entries) => self.engine.evaluate_detection(detection, entries),
            WhitelistRead::Unavailable => self.engine.evaluate_detection(detection, &[]),
        };
        let outcome = self.finish(decision, whitelist).await?;
        if outcome.enforcement.is_block() {
            self.detector.mark_blocked(detection.source);
        }
        Ok(Some(outcome))
    }

    async fn finish(&self, decision: BlockDecision, whitelist: WhitelistRead) -> Result<PipelineOutcome, PipelineError> {
        let _ = self.decisions_tx.send(decision.clone());

        if matches!(whitelist, WhitelistRead::Unavailable) && decision.level >= BlockLevel::Warning {
            info!(
                "Deferring {} block on {} -> {}",
                decision.level, decision.identity.process_name, decision.identity.remote_address
            );
            return Ok(PipelineOutcome {
                decision,
                enforcement: Enforcement::Deferred,
                persisted: false,
            });
        }

        let (enforcement, persisted) = self.enforce(&decision).await?;
        Ok(PipelineOutcome {
            decision,
            enforcement,
            persisted,
        })
    }

    async fn enforce(&self, decision: &BlockDecision) -> Result<(Enforcement, bool), PipelineError> {
        let identity = &decision.identity;
        let result = match decision.level {
            BlockLevel::None => return Ok((Enforcement::None, true)),
            BlockLevel::Monitor => return Ok((Enforcement::Monitored, true)),
            BlockLevel::Warning => {
                let ttl = Duration::seconds(self.firewall.config().temporary_ttl_seconds as i64);
                let expires_at = Utc::now() + ttl;
                self.firewall
                    .apply_temporary(decision, ttl)
                    .await
                    .map(|stored| match stored {
                        BlockedConnection::Temporary(record) => Enforcement::TemporaryBlock {
                            expires_at: record.expires_at.unwrap_or(expires_at),
                        },
                        BlockedConnection::Permanent(record) => Enforcement::PermanentBlock {
                            rule_name: record.rule_name.unwrap_or_else(|| self.firewall.rule_name(identity)),
                        },
                    })
                    .map_err(|e| (e, Enforcement::TemporaryBlock { expires_at }))
            }
            BlockLevel::Immediate => self
                .firewall
                .apply_permanent(decision)
                .await
                .map(|stored| Enforcement::PermanentBlock {
                    rule_name: stored
                        .record()
                        .rule_name
                        .clone()
                        .unwrap_or_else(|| self.firewall.rule_name(identity)),
                })
                .map_err(|e| {
                    (
                        e,
                        Enforcement::PermanentBlock {
                            rule_name: self.firewall.rule_name(identity),
                        },
                    )
                }),
        };

        match result {
            Ok(enforcement) => Ok((enforcement, true)),
            // The block itself took effect; only its record is missing.
            Err((FirewallError::Store(e), applied)) => {
                if e.is_fatal() {
                    return Err(self.store_failure(e));
                }
                metrics::increment_counter!("store_degraded_total");
                warn!("Block on {} applied but not persisted: {}", identity.key(), e);
                Ok((applied, false))
            }
            Err((FirewallError::Unrecorded { message, store }, _)) => {
                if store.is_fatal() {
                    return Err(self.store_failure(store));
                }
                metrics::increment_counter!("store_degraded_total");
                warn!("Failed block on {} not persisted: {}", identity.key(), store);
                Ok((Enforcement::Failed { message }, false))
            }
            Err((e, _)) => Ok((Enforcement::Failed { message: e.to_string() }, true)),
        }
    }

    /// Explicitly unblock an identity
    pub async fn unblock(&self, identity: &ConnectionIdentity) -> Result<Option<BlockRecord>, PipelineError> {
        self.ensure_running()?;
        let removed = self.firewall.remove(identity).await.map_err(|e| match e {
            FirewallError::Store(e) => self.store_failure(e),
            other => PipelineError::Firewall(other),
        })?;
        self.engine.forget(identity);
        if let Ok(ip) = identity.remote_address.parse::<IpAddr>() {
            self.detector.reset_source(&ip);
        }
        if removed.is_some() {
            info!("Unblocked {} -> {}", identity.process_name, identity.remote_address);
        }
        Ok(removed)
    }

    /// Add a whitelist entry and lift every block it covers.
    ///
    /// Returns the identities that were unblocked.
    pub async fn whitelist(&self, entry: WhitelistEntry) -> Result<Vec<ConnectionIdentity>, PipelineError> {
        self.ensure_running()?;
        let now = Utc::now();
        self.store
            .add_whitelist(entry.clone())
            .await
            .map_err(|e| self.store_failure(e))?;

        let covered: Vec<ConnectionIdentity> = self
            .store
            .list_blocks(BlockFilter::All, now)
            .await
            .map_err(|e| self.store_failure(e))?
            .iter()
            .filter(|b| entry.covers(b, now))
            .map(|b| b.identity().clone())
            .collect();

        for identity in &covered {
            self.unblock(identity).await?;
        }
        if let WhitelistTarget::Address(address) = &entry.target {
            self.engine.forget_address(address);
            if let Ok(ip) = address.parse::<IpAddr>() {
                self.detector.reset_source(&ip);
            }
        }

        info!("Whitelisted {:?} ({}), lifted {} blocks", entry.target, entry.reason, covered.len());
        Ok(covered)
    }

    pub async fn remove_whitelist(&self, id: Uuid) -> Result<bool, PipelineError> {
        self.store.remove_whitelist(id).await.map_err(|e| self.store_failure(e))
    }

    pub async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, PipelineError> {
        self.store.list_whitelist().await.map_err(|e| self.store_failure(e))
    }

    pub async fn list_blocks(&self, filter: BlockFilter) -> Result<Vec<BlockedConnection>, PipelineError> {
        self.store
            .list_blocks(filter, Utc::now())
            .await
            .map_err(|e| self.store_failure(e))
    }

    pub async fn statistics(&self) -> Result<BlockStatistics, PipelineError> {
        let now = Utc::now();
        let blocks = self.list_blocks(BlockFilter::All).await?;
        let counters = self.store.counters().await.map_err(|e| self.store_failure(e))?;
        Ok(BlockStatistics::compute(&blocks, counters, self.config.statistics_top_n, now))
    }

    pub async fn export_csv(&self) -> Result<String, PipelineError> {
        let blocks = self.list_blocks(BlockFilter::All).await?;
        Ok(export_csv(&blocks, Utc::now())?)
    }

    pub async fn reconcile(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<ReconciliationReport, PipelineError> {
        self.ensure_running()?;
        self.firewall.reconcile(shutdown).await.map_err(|e| match e {
            FirewallError::Store(e) => self.store_failure(e),
            other => PipelineError::Firewall(other),
        })
    }

    /// Start the background tasks; they all stop when `shutdown` flips to true
    pub fn spawn(
        self: Arc<Self>,
        mut observations: mpsc::Receiver<FlowObservation>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!("Starting defense pipeline...");
        let mut handles = Vec::new();

        let pipeline = self.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            match pipeline.reconcile(Some(&rx)).await {
                Ok(report) => debug!("Startup reconciliation: {:?}", report),
                Err(e) => warn!("Startup reconciliation failed: {}", e),
            }
        }));

        let pipeline = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    observation = observations.recv() => match observation {
                        Some(observation) => pipeline.ingest(&observation),
                        None => break,
                    },
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Observation consumer stopped");
        }));

        let mut detections = self.subscribe_detections();
        handles.push(tokio::spawn(
            self.detector.clone().run(self.aggregator.clone(), shutdown.clone()),
        ));

        let pipeline = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    detection = detections.recv() => match detection {
                        Ok(detection) => {
                            if let Err(e) = pipeline.handle_detection(&detection).await {
                                warn!("Failed to act on detection {}: {}", detection.id, e);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => warn!("Detection consumer lagged, skipped {}", skipped),
                        Err(RecvError::Closed) => break,
                    },
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Detection consumer stopped");
        }));

        let pipeline = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = time::interval(StdDuration::from_secs(pipeline.config.memory_sweep_seconds.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        pipeline.prune_memory(Utc::now());
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Memory sweeper stopped");
        }));

        handles.push(tokio::spawn(self.firewall.clone().run_expiry(shutdown)));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision_engine::tests::{attempt, detection};
    use crate::core::decision_engine::SignerStatus;
    use crate::core::firewall::{InMemoryFirewall, MockFirewallBackend};
    use crate::core::flow_aggregator::tests::tcp;
    use crate::core::flow_aggregator::TcpFlags;
    use crate::core::signatures::Severity;
    use crate::core::store::{FileStore, MockBlockStore};
    use crate::core::threat_intel::{StaticIndicator, StaticThreatIntel};
    use std::time::Duration as StdDuration;
    use tokio_test::assert_ok;

    fn intel(address: &str) -> ThreatIntelChain {
        ThreatIntelChain::new(vec![Arc::new(StaticThreatIntel::new(vec![StaticIndicator {
            indicator: address.to_string(),
            confidence: 0.95,
            category: Some("botnet".to_string()),
        }]))])
    }

    async fn setup(
        threat_intel: ThreatIntelChain,
    ) -> (tempfile::TempDir, Arc<InMemoryFirewall>, Arc<DefensePipeline>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("blocks.json")).await.unwrap());
        let firewall = Arc::new(InMemoryFirewall::new());
        let pipeline = DefensePipeline::new(&Config::default(), store, firewall.clone(), threat_intel).unwrap();
        (dir, firewall, Arc::new(pipeline))
    }

    #[tokio::test]
    async fn test_threat_intel_hit_blocks_permanently() {
        let (_dir, firewall, pipeline) = setup(intel("198.51.100.9")).await;
        let mut decisions = pipeline.subscribe_decisions();

        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        assert_eq!(outcome.decision.level, BlockLevel::Immediate);
        assert!(matches!(outcome.enforcement, Enforcement::PermanentBlock { .. }));
        assert!(outcome.persisted);
        assert_eq!(firewall.rule_count().await, 1);
        assert_eq!(decisions.recv().await.unwrap().id, outcome.decision.id);

        let blocks = pipeline.list_blocks(BlockFilter::Permanent).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].record().firewall_rule_exists);
    }

    #[tokio::test]
    async fn test_whitelisted_address_is_never_blocked() {
        let (_dir, firewall, pipeline) = setup(intel("198.51.100.9")).await;
        pipeline
            .whitelist(WhitelistEntry::new(
                WhitelistTarget::Address("198.51.100.9".to_string()),
                "partner",
                None,
            ))
            .await
            .unwrap();

        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        assert!(outcome.decision.whitelisted);
        assert_eq!(outcome.enforcement, Enforcement::None);
        assert_eq!(firewall.rule_count().await, 0);
        assert!(pipeline.list_blocks(BlockFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_warning_applies_temporary_block() {
        let (_dir, firewall, pipeline) = setup(ThreatIntelChain::default()).await;
        let mut unsigned = attempt("tool.exe", "203.0.113.7", 443);
        unsigned.signer = SignerStatus::Unsigned;

        let outcome = pipeline.handle_attempt(unsigned.clone()).await.unwrap();
        assert_eq!(outcome.decision.level, BlockLevel::Warning);
        assert!(matches!(outcome.enforcement, Enforcement::TemporaryBlock { .. }));
        assert!(pipeline.firewall().is_temporarily_blocked(&unsigned.identity(), Utc::now()));
        assert_eq!(firewall.rule_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_whitelist_defers_blocks() {
        let mut store = MockBlockStore::new();
        store
            .expect_active_whitelist()
            .returning(|_| Err(StoreError::NotFound("whitelist".to_string())));
        store.expect_upsert_block().never();
        let firewall = Arc::new(InMemoryFirewall::new());
        let pipeline = DefensePipeline::new(
            &Config::default(),
            Arc::new(store),
            firewall.clone(),
            intel("198.51.100.9"),
        )
        .unwrap();

        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        assert_eq!(outcome.decision.level, BlockLevel::Immediate);
        assert_eq!(outcome.enforcement, Enforcement::Deferred);
        assert!(!outcome.persisted);
        assert_eq!(firewall.rule_count().await, 0);
        assert!(!pipeline.is_halted());
    }

    #[tokio::test]
    async fn test_corrupted_store_halts_pipeline() {
        let mut store = MockBlockStore::new();
        store
            .expect_active_whitelist()
            .returning(|_| Err(StoreError::Corrupted("bad checksum".to_string())));
        let pipeline = DefensePipeline::new(
            &Config::default(),
            Arc::new(store),
            Arc::new(InMemoryFirewall::new()),
            ThreatIntelChain::default(),
        )
        .unwrap();

        let first = pipeline.handle_attempt(attempt("app.exe", "203.0.113.7", 443)).await;
        assert!(matches!(first, Err(PipelineError::Halted(_))));
        assert!(pipeline.is_halted());

        let second = pipeline.handle_attempt(attempt("app.exe", "203.0.113.8", 443)).await;
        assert!(matches!(second, Err(PipelineError::Halted(_))));
    }

    #[tokio::test]
    async fn test_warning_after_restart_keeps_permanent_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("blocks.json")).await.unwrap());
        let firewall = Arc::new(InMemoryFirewall::new());
        let first = DefensePipeline::new(&Config::default(), store.clone(), firewall.clone(), intel("198.51.100.9")).unwrap();
        first.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();

        let restarted =
            DefensePipeline::new(&Config::default(), store.clone(), firewall.clone(), ThreatIntelChain::default()).unwrap();
        let mut unsigned = attempt("app.exe", "198.51.100.9", 443);
        unsigned.signer = SignerStatus::Unsigned;
        let outcome = restarted.handle_attempt(unsigned.clone()).await.unwrap();

        assert_eq!(outcome.decision.level, BlockLevel::Warning);
        assert!(matches!(outcome.enforcement, Enforcement::PermanentBlock { .. }));
        let row = store.get_block(&unsigned.identity()).await.unwrap().unwrap();
        assert!(row.is_permanent());
        assert!(row.record().firewall_rule_exists);
        assert_ne!(row.record().reason, "app.exe is not signed");
        assert!(restarted.list_blocks(BlockFilter::Failed).await.unwrap().is_empty());
        assert_eq!(firewall.rule_count().await, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_firewall_failure_is_not_persisted() {
        let mut store = MockBlockStore::new();
        store.expect_active_whitelist().returning(|_| Ok(Vec::new()));
        store.expect_record_attempt().returning(|_| Ok(()));
        store
            .expect_upsert_block()
            .returning(|_| Err(StoreError::NotFound("blocks".to_string())));
        let mut backend = MockFirewallBackend::new();
        backend.expect_list_rules().returning(|_| Ok(Vec::new()));
        backend
            .expect_add_rule()
            .returning(|_| Err(FirewallError::PermissionDenied("run as administrator".to_string())));
        let pipeline = DefensePipeline::new(
            &Config::default(),
            Arc::new(store),
            Arc::new(backend),
            intel("198.51.100.9"),
        )
        .unwrap();

        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        assert!(matches!(outcome.enforcement, Enforcement::Failed { ref message } if message.contains("administrator")));
        assert!(!outcome.persisted);
        assert!(!pipeline.is_halted());
    }

    #[tokio::test]
    async fn test_recorded_firewall_failure_is_persisted() {
        let mut backend = MockFirewallBackend::new();
        backend.expect_list_rules().returning(|_| Ok(Vec::new()));
        backend
            .expect_add_rule()
            .returning(|_| Err(FirewallError::PermissionDenied("run as administrator".to_string())));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("blocks.json")).await.unwrap());
        let pipeline =
            DefensePipeline::new(&Config::default(), store, Arc::new(backend), intel("198.51.100.9")).unwrap();

        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        assert!(matches!(outcome.enforcement, Enforcement::Failed { .. }));
        assert!(outcome.persisted);
        assert_eq!(pipeline.list_blocks(BlockFilter::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detection_blocks_source() {
        let (_dir, firewall, pipeline) = setup(ThreatIntelChain::default()).await;
        let result = detection("203.0.113.50", Severity::Critical);

        let outcome = pipeline.handle_detection(&result).await.unwrap().unwrap();
        assert_eq!(outcome.decision.identity.process_name, "network");
        assert!(matches!(outcome.enforcement, Enforcement::PermanentBlock { .. }));
        assert_eq!(firewall.rule_count().await, 1);

        let blocks = pipeline.list_blocks(BlockFilter::Permanent).await.unwrap();
        assert_eq!(blocks[0].identity().remote_address, "203.0.113.50");
    }

    #[tokio::test]
    async fn test_suspicious_detection_is_ignored() {
        let (_dir, firewall, pipeline) = setup(ThreatIntelChain::default()).await;
        let mut result = detection("203.0.113.50", Severity::Critical);
        result.state = DetectionState::Suspicious;

        assert!(pipeline.handle_detection(&result).await.unwrap().is_none());
        assert_eq!(firewall.rule_count().await, 0);
    }

    #[tokio::test]
    async fn test_unblock_removes_rule_and_row() {
        let (_dir, firewall, pipeline) = setup(intel("198.51.100.9")).await;
        let outcome = pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();

        let removed = pipeline.unblock(&outcome.decision.identity).await.unwrap();
        assert!(removed.is_some());
        assert_eq!(firewall.rule_count().await, 0);
        assert!(pipeline.list_blocks(BlockFilter::All).await.unwrap().is_empty());
        assert_ok!(pipeline.unblock(&outcome.decision.identity).await);
    }

    #[tokio::test]
    async fn test_whitelisting_lifts_existing_blocks() {
        let (_dir, firewall, pipeline) = setup(intel("198.51.100.9")).await;
        pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();
        pipeline.handle_attempt(attempt("other.exe", "198.51.100.9", 443)).await.unwrap();
        assert_eq!(firewall.rule_count().await, 2);

        let lifted = pipeline
            .whitelist(WhitelistEntry::new(
                WhitelistTarget::Address("198.51.100.9".to_string()),
                "false positive",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(lifted.len(), 2);
        assert_eq!(firewall.rule_count().await, 0);
        assert_eq!(pipeline.list_whitelist().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_and_export() {
        let (_dir, _firewall, pipeline) = setup(intel("198.51.100.9")).await;
        pipeline.handle_attempt(attempt("app.exe", "198.51.100.9", 443)).await.unwrap();

        let stats = pipeline.statistics().await.unwrap();
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.permanent_blocks, 1);
        assert_eq!(stats.success_rate, 1.0);

        let csv = pipeline.export_csv().await.unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.contains("app.exe,198.51.100.9,443,TCP"));
    }

    #[tokio::test]
    async fn test_spawned_tasks_ingest_and_stop() {
        let (_dir, _firewall, pipeline) = setup(ThreatIntelChain::default()).await;
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = pipeline.clone().spawn(rx, shutdown_rx);

        let now = Utc::now();
        tx.send(tcp(now, "203.0.113.9", 40000, "10.0.0.2", 80, TcpFlags::SYN, 60))
            .await
            .unwrap();
        for _ in 0..50 {
            if pipeline.aggregator().observed_count() > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(pipeline.aggregator().observed_count(), 1);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(StdDuration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
