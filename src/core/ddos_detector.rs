//! DDoS detection engine for the network defense service.
//!
//! This module runs the signature scorer over periodic flow snapshots,
//! maintains a detection state machine per source, and publishes
//! detection results with recommended defensive actions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time;
use uuid::Uuid;

use crate::core::flow_aggregator::{FlowAggregator, FlowSnapshot};
use crate::core::signatures::{
    self, AttackType, DetectionCandidate, Severity, SignatureDetails, SignatureThresholds,
};

/// Errors that can occur while setting up DDoS detection
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid detection configuration: {0}")]
    InvalidConfig(String),
}

/// Weights of the per-source risk score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub traffic_volume: f64,
    pub suspicious_ratio: f64,
    pub blocked_count: f64,
    pub recent_alerts: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            traffic_volume: 30.0,
            suspicious_ratio: 30.0,
            blocked_count: 20.0,
            recent_alerts: 20.0,
        }
    }
}

/// DDoS detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosDetectionConfig {
    /// Detection cycle length (seconds)
    pub tick_seconds: u64,
    /// Maximum number of detection results kept in history
    pub history_capacity: usize,
    /// Risk score at which a source becomes suspicious
    pub suspicious_threshold: f64,
    /// Risk score at which a matching signature becomes an attack
    pub attack_threshold: f64,
    /// Global packet rate at which every active source enters overload
    pub overload_packets_per_sec: f64,
    /// Consecutive clean ticks before a source returns to normal
    pub cooldown_ticks: u32,
    /// Per-source packet rate that saturates the volume factor
    pub volume_reference_pps: f64,
    /// Block count that saturates the blocked factor
    pub blocked_reference: u32,
    /// Alert count that saturates the alert factor
    pub alert_reference: u32,
    /// Look-back for recent alerts (seconds)
    pub alert_window_seconds: u64,
    /// TTL recommended for temporary blocks (seconds)
    pub temporary_block_seconds: u64,
    /// Capacity of the detection result broadcast channel
    pub channel_capacity: usize,
    /// How long a quiet, previously blocked source stays tracked (seconds)
    pub blocked_retention_seconds: u64,
    /// Upper bound on tracked sources; idle ones are evicted first
    pub max_tracked_sources: usize,
    pub weights: RiskWeights,
}

impl Default for DdosDetectionConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 2,
            history_capacity: 1000,
            suspicious_threshold: 30.0,
            attack_threshold: 60.0,
            overload_packets_per_sec: 50_000.0,
            cooldown_ticks: 3,
            volume_reference_pps: 500.0,
            blocked_reference: 3,
            alert_reference: 5,
            alert_window_seconds: 300,
            temporary_block_seconds: 3600,
            channel_capacity: 256,
            blocked_retention_seconds: 86_400,
            max_tracked_sources: 100_000,
            weights: RiskWeights::default(),
        }
    }
}

impl DdosDetectionConfig {
    fn validate(&self) -> Result<(), DetectionError> {
        if self.history_capacity == 0 {
            return Err(DetectionError::InvalidConfig("history_capacity must be positive".into()));
        }
        if self.max_tracked_sources == 0 {
            return Err(DetectionError::InvalidConfig("max_tracked_sources must be positive".into()));
        }
        if self.suspicious_threshold > self.attack_threshold {
            return Err(DetectionError::InvalidConfig(
                "suspicious_threshold must not exceed attack_threshold".into(),
            ));
        }
        let w = &self.weights;
        if [w.traffic_volume, w.suspicious_ratio, w.blocked_count, w.recent_alerts]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(DetectionError::InvalidConfig("risk weights must be non-negative".into()));
        }
        Ok(())
    }
}

/// Per-source detection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DetectionState {
    Normal,
    Suspicious,
    AttackDetected,
    AttackBlocked,
    SystemOverload,
}

/// Defensive action recommended with a detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DefensiveAction {
    Monitor,
    RateLimit,
    TemporaryBlock { ttl_secs: u64 },
    PermanentBlock,
    AlertOperator,
    EnableSynCookies,
}

/// Result of a detection cycle for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub source: IpAddr,
    pub target: Option<IpAddr>,
    pub attack_type: AttackType,
    pub severity: Severity,
    /// Risk score in [0, 100]
    pub attack_score: f64,
    pub state: DetectionState,
    pub matched_signatures: Vec<String>,
    pub recommended_actions: Vec<DefensiveAction>,
    pub details: Option<SignatureDetails>,
}

/// Mutable per-source state, changed only by [`DdosDetector::tick`] and
/// the explicit block/reset calls
#[derive(Debug, Clone)]
struct SourceState {
    state: DetectionState,
    risk_score: f64,
    clean_ticks: u32,
    times_blocked: u32,
    last_blocked: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl SourceState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: DetectionState::Normal,
            risk_score: 0.0,
            clean_ticks: 0,
            times_blocked: 0,
            last_blocked: None,
            last_updated: now,
        }
    }
}

/// Inputs to one state transition
#[derive(Debug, Clone, Copy)]
pub struct Assessment {
    pub risk_score: f64,
    pub top_severity: Option<Severity>,
    pub overload: bool,
}

/// Pure state transition for one source
pub fn next_state(
    current: DetectionState,
    assessment: &Assessment,
    clean_ticks: u32,
    times_blocked: u32,
    config: &DdosDetectionConfig,
) -> DetectionState {
    let active = assessment.top_severity.is_some() || assessment.risk_score >= config.suspicious_threshold;

    if assessment.overload && active {
        return DetectionState::SystemOverload;
    }

    if let Some(severity) = assessment.top_severity {
        let attack = severity >= Severity::High || assessment.risk_score >= config.attack_threshold;
        if attack {
            return match current {
                DetectionState::AttackBlocked => DetectionState::AttackBlocked,
                _ if times_blocked > 0 => DetectionState::AttackBlocked,
                _ => DetectionState::AttackDetected,
            };
        }
        return match current {
            DetectionState::AttackDetected | DetectionState::AttackBlocked => current,
            _ => DetectionState::Suspicious,
        };
    }

    if assessment.risk_score >= config.suspicious_threshold {
        return match current {
            DetectionState::Normal | DetectionState::SystemOverload => DetectionState::Suspicious,
            other => other,
        };
    }

    if clean_ticks >= config.cooldown_ticks {
        DetectionState::Normal
    } else if current == DetectionState::SystemOverload {
        DetectionState::Suspicious
    } else {
        current
    }
}

/// Weighted risk score in [0, 100]
pub fn risk_score(
    packets_per_sec: f64,
    suspicious_ratio: f64,
    times_blocked: u32,
    recent_alerts: usize,
    config: &DdosDetectionConfig,
) -> f64 {
    let w = &config.weights;
    let total = w.traffic_volume + w.suspicious_ratio + w.blocked_count + w.recent_alerts;
    if total <= 0.0 {
        return 0.0;
    }
    let volume = (packets_per_sec / config.volume_reference_pps.max(1.0)).min(1.0);
    let suspicious = suspicious_ratio.clamp(0.0, 1.0);
    let blocked = (times_blocked as f64 / config.blocked_reference.max(1) as f64).min(1.0);
    let alerts = (recent_alerts as f64 / config.alert_reference.max(1) as f64).min(1.0);

    let weighted = w.traffic_volume * volume
        + w.suspicious_ratio * suspicious
        + w.blocked_count * blocked
        + w.recent_alerts * alerts;
    (weighted / total * 100.0).clamp(0.0, 100.0)
}

/// Defensive actions for a detection
pub fn recommend_actions(
    attack_type: AttackType,
    severity: Severity,
    state: DetectionState,
    temporary_block_seconds: u64,
) -> Vec<DefensiveAction> {
    let mut actions = match severity {
        Severity::Low => vec![DefensiveAction::Monitor],
        Severity::Medium => vec![DefensiveAction::Monitor, DefensiveAction::RateLimit],
        Severity::High => vec![
            DefensiveAction::TemporaryBlock {
                ttl_secs: temporary_block_seconds,
            },
            DefensiveAction::AlertOperator,
        ],
        Severity::Critical | Severity::Emergency => {
            vec![DefensiveAction::PermanentBlock, DefensiveAction::AlertOperator]
        }
    };
    if attack_type == AttackType::SynFlood {
        actions.push(DefensiveAction::EnableSynCookies);
    }
    if state == DetectionState::SystemOverload && !actions.contains(&DefensiveAction::AlertOperator) {
        actions.push(DefensiveAction::AlertOperator);
    }
    actions
}

/// DDoS detector implementation
pub struct DdosDetector {
    config: DdosDetectionConfig,
    thresholds: SignatureThresholds,
    states: DashMap<IpAddr, SourceState>,
    history: RwLock<VecDeque<DetectionResult>>,
    tick_lock: Mutex<()>,
    results_tx: broadcast::Sender<DetectionResult>,
}

impl DdosDetector {
    /// Create a new DDoS detector instance
    pub fn new(config: DdosDetectionConfig, thresholds: SignatureThresholds) -> Result<Self, DetectionError> {
        config.validate()?;
        let (results_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Ok(Self {
            history: RwLock::new(VecDeque::with_capacity(config.history_capacity)),
            config,
            thresholds,
            states: DashMap::new(),
            tick_lock: Mutex::new(()),
            results_tx,
        })
    }

    /// Subscribe to detection results
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionResult> {
        self.results_tx.subscribe()
    }

    /// Run one detection cycle over `snapshot`.
    ///
    /// Returns the results emitted this cycle: one per source whose state
    /// advanced to `AttackDetected` or beyond.
    pub async fn tick(&self, snapshot: &FlowSnapshot) -> Vec<DetectionResult> {
        let _guard = self.tick_lock.lock().await;
        let now = snapshot.taken_at;

        let history: Vec<DetectionResult> = self.history.read().await.iter().cloned().collect();
        let alert_cutoff = now - Duration::seconds(self.config.alert_window_seconds as i64);
        let mut recent_alerts: HashMap<IpAddr, usize> = HashMap::new();
        for result in history.iter().filter(|r| r.detected_at >= alert_cutoff) {
            *recent_alerts.entry(result.source).or_default() += 1;
        }

        let mut candidates_by_source: HashMap<IpAddr, Vec<DetectionCandidate>> = HashMap::new();
        for candidate in signatures::score(snapshot, &history, &self.thresholds) {
            candidates_by_source.entry(candidate.source).or_default().push(candidate);
        }

        let by_source = snapshot.by_source();
        let overload = snapshot.total_packets_per_sec() >= self.config.overload_packets_per_sec;
        if overload {
            warn!(
                "Aggregate traffic {:.0} pkt/s crossed the overload ceiling",
                snapshot.total_packets_per_sec()
            );
        }

        let mut sources: HashSet<IpAddr> = by_source.keys().copied().collect();
        sources.extend(candidates_by_source.keys().copied());
        sources.extend(self.states.iter().map(|e| *e.key()));

        let mut emitted = Vec::new();
        for source in sources {
            let (packets_per_sec, suspicious_ratio) = match by_source.get(&source) {
                Some(flows) => {
                    let totals = snapshot.source_totals(flows);
                    let suspicious = (totals.half_open_flows + totals.reset_flows) as f64
                        / totals.flow_count.max(1) as f64;
                    (totals.packets_per_sec, suspicious)
                }
                None => (0.0, 0.0),
            };
            let candidates = candidates_by_source.remove(&source).unwrap_or_default();
            let alerts = recent_alerts.get(&source).copied().unwrap_or(0);

            let mut entry = self.states.entry(source).or_insert_with(|| SourceState::new(now));
            let state = entry.value_mut();

            let risk = risk_score(packets_per_sec, suspicious_ratio, state.times_blocked, alerts, &self.config);
            let top_severity = candidates.iter().map(|c| c.severity).max();
            let assessment = Assessment {
                risk_score: risk,
                top_severity,
                overload: overload && packets_per_sec > 0.0,
            };

            if top_severity.is_none() && risk < self.config.suspicious_threshold {
                state.clean_ticks = state.clean_ticks.saturating_add(1);
            } else {
                state.clean_ticks = 0;
            }

            let previous = state.state;
            let next = next_state(previous, &assessment, state.clean_ticks, state.times_blocked, &self.config);
            state.state = next;
            state.risk_score = risk;
            state.last_updated = now;

            if next != previous {
                debug!("Source {} moved {:?} -> {:?} (risk {:.1})", source, previous, next, risk);
            }

            let retention = Duration::seconds(self.config.blocked_retention_seconds as i64);
            let forget = next == DetectionState::Normal
                && packets_per_sec == 0.0
                && state.last_blocked.map_or(true, |at| now - at >= retention);
            drop(entry);
            if forget {
                self.states.remove(&source);
            }

            if next > previous && next >= DetectionState::AttackDetected {
                emitted.push(self.build_result(source, now, risk, next, candidates));
            }
        }

        self.evict_idle_sources();

        if !emitted.is_empty() {
            let mut history = self.history.write().await;
            for result in &emitted {
                if history.len() >= self.config.history_capacity {
                    history.pop_front();
                }
                history.push_back(result.clone());
            }
        }

        for result in &emitted {
            info!(
                "{} from {} ({:?}, score {:.1}, state {:?})",
                result.attack_type, result.source, result.severity, result.attack_score, result.state
            );
            metrics::increment_counter!("detections_total", "attack_type" => result.attack_type.to_string());
            // no subscribers is fine
            let _ = self.results_tx.send(result.clone());
        }

        emitted
    }

    fn build_result(
        &self,
        source: IpAddr,
        now: DateTime<Utc>,
        risk: f64,
        state: DetectionState,
        candidates: Vec<DetectionCandidate>,
    ) -> DetectionResult {
        let matched_signatures: Vec<String> = candidates.iter().map(|c| c.signature.clone()).collect();
        let (attack_type, severity, target, details) = match signatures::select_primary(candidates) {
            Some((primary, _)) => (primary.attack_type, primary.severity, primary.target, Some(primary.details)),
            None => (AttackType::Unknown, Severity::Emergency, None, None),
        };
        let severity = if state == DetectionState::SystemOverload {
            severity.max(Severity::Critical)
        } else {
            severity
        };

        DetectionResult {
            id: Uuid::new_v4(),
            detected_at: now,
            source,
            target,
            attack_type,
            severity,
            attack_score: risk,
            state,
            matched_signatures,
            recommended_actions: recommend_actions(attack_type, severity, state, self.config.temporary_block_seconds),
            details,
        }
    }

    /// Drop the longest-idle normal sources while over `max_tracked_sources`
    fn evict_idle_sources(&self) {
        let excess = self.states.len().saturating_sub(self.config.max_tracked_sources);
        if excess == 0 {
            return;
        }
        let mut idle: Vec<(IpAddr, DateTime<Utc>)> = self
            .states
            .iter()
            .filter(|e| e.state == DetectionState::Normal)
            .map(|e| (*e.key(), e.last_blocked.unwrap_or(e.last_updated)))
            .collect();
        idle.sort_by_key(|(_, at)| *at);
        for (source, _) in idle.into_iter().take(excess) {
            self.states.remove(&source);
        }
        debug!("Evicted idle sources, {} still tracked", self.states.len());
    }

    /// Number of sources with detection state
    pub fn tracked_sources(&self) -> usize {
        self.states.len()
    }

    /// Record that a block was applied against `source`
    pub fn mark_blocked(&self, source: IpAddr) {
        let now = Utc::now();
        let mut entry = self.states.entry(source).or_insert_with(|| SourceState::new(now));
        entry.times_blocked = entry.times_blocked.saturating_add(1);
        entry.last_blocked = Some(now);
        if entry.state == DetectionState::AttackDetected {
            entry.state = DetectionState::AttackBlocked;
        }
        entry.last_updated = now;
    }

    /// Forget all state for `source` (explicit unblock or whitelist)
    pub fn reset_source(&self, source: &IpAddr) {
        self.states.remove(source);
    }

    /// Current state of `source`
    pub fn state_of(&self, source: &IpAddr) -> DetectionState {
        self.states
            .get(source)
            .map(|s| s.state)
            .unwrap_or(DetectionState::Normal)
    }

    /// Full history, oldest first
    pub async fn history(&self) -> Vec<DetectionResult> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Most recent `limit` results, newest first
    pub async fn recent(&self, limit: usize) -> Vec<DetectionResult> {
        self.history.read().await.iter().rev().take(limit).cloned().collect()
    }

    /// Latest result whose source is `address`
    pub async fn latest_for(&self, address: &IpAddr) -> Option<DetectionResult> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|r| &r.source == address)
            .cloned()
    }

    /// Drive detection cycles until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, aggregator: Arc<FlowAggregator>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting detection loop ({}s tick)...", self.config.tick_seconds);
        let mut interval = time::interval(StdDuration::from_secs(self.config.tick_seconds.max(1)));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = aggregator.snapshot(Utc::now());
                    self.tick(&snapshot).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Detection loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_aggregator::tests::tcp;
    use crate::core::flow_aggregator::{AggregatorConfig, TcpFlags};

    fn detector(config: DdosDetectionConfig) -> DdosDetector {
        DdosDetector::new(config, SignatureThresholds::default()).unwrap()
    }

    fn syn_flood_snapshot(source: &str, count: i64) -> FlowSnapshot {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for i in 0..count {
            let at = t0 + Duration::milliseconds(i * 5000 / count);
            aggregator.observe(&tcp(at, source, 1024 + i as u16, "10.0.0.2", 80, TcpFlags::SYN, 60));
        }
        aggregator.snapshot(t0 + Duration::milliseconds(4999))
    }

    #[tokio::test]
    async fn test_syn_flood_produces_detection() {
        let detector = detector(DdosDetectionConfig::default());
        let mut rx = detector.subscribe();
        let snapshot = syn_flood_snapshot("203.0.113.7", 1000);

        let results = detector.tick(&snapshot).await;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.attack_type, AttackType::SynFlood);
        assert!(result.severity >= Severity::High);
        assert_eq!(result.state, DetectionState::AttackDetected);
        assert!(result.matched_signatures.contains(&"syn_flood".to_string()));
        assert!(result.recommended_actions.contains(&DefensiveAction::EnableSynCookies));

        let published = rx.try_recv().unwrap();
        assert_eq!(published.id, result.id);
    }

    #[tokio::test]
    async fn test_result_emitted_only_on_advance() {
        let detector = detector(DdosDetectionConfig::default());
        let snapshot = syn_flood_snapshot("203.0.113.7", 1000);

        assert_eq!(detector.tick(&snapshot).await.len(), 1);
        assert!(detector.tick(&snapshot).await.is_empty());

        let source: IpAddr = "203.0.113.7".parse().unwrap();
        detector.mark_blocked(source);
        assert_eq!(detector.state_of(&source), DetectionState::AttackBlocked);
        assert!(detector.tick(&snapshot).await.is_empty());
        assert_eq!(detector.state_of(&source), DetectionState::AttackBlocked);
    }

    #[tokio::test]
    async fn test_history_is_bounded_fifo() {
        let config = DdosDetectionConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let detector = detector(config);
        for source in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            detector.tick(&syn_flood_snapshot(source, 1000)).await;
        }

        let history = detector.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].source, "203.0.113.2".parse::<IpAddr>().unwrap());
        assert_eq!(history[1].source, "203.0.113.3".parse::<IpAddr>().unwrap());
        assert_eq!(detector.recent(1).await[0].source, history[1].source);
    }

    #[tokio::test]
    async fn test_source_cools_down_to_normal() {
        let detector = detector(DdosDetectionConfig::default());
        let source: IpAddr = "203.0.113.7".parse().unwrap();
        detector.tick(&syn_flood_snapshot("203.0.113.7", 1000)).await;
        assert_eq!(detector.state_of(&source), DetectionState::AttackDetected);

        let quiet = FlowSnapshot::empty(Utc::now(), Duration::seconds(5));
        for _ in 0..3 {
            detector.tick(&quiet).await;
        }
        assert_eq!(detector.state_of(&source), DetectionState::Normal);
    }

    #[tokio::test]
    async fn test_blocked_source_forgotten_after_retention() {
        let detector = detector(DdosDetectionConfig {
            blocked_retention_seconds: 60,
            ..Default::default()
        });
        let source: IpAddr = "203.0.113.7".parse().unwrap();
        detector.tick(&syn_flood_snapshot("203.0.113.7", 1000)).await;
        detector.mark_blocked(source);

        let quiet = FlowSnapshot::empty(Utc::now(), Duration::seconds(5));
        for _ in 0..3 {
            detector.tick(&quiet).await;
        }
        assert_eq!(detector.state_of(&source), DetectionState::Normal);
        assert_eq!(detector.tracked_sources(), 1);

        let later = FlowSnapshot::empty(Utc::now() + Duration::seconds(120), Duration::seconds(5));
        detector.tick(&later).await;
        assert_eq!(detector.tracked_sources(), 0);
    }

    #[tokio::test]
    async fn test_tracked_sources_are_capped() {
        let detector = detector(DdosDetectionConfig {
            max_tracked_sources: 2,
            ..Default::default()
        });
        for source in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            detector.tick(&syn_flood_snapshot(source, 1000)).await;
            detector.mark_blocked(source.parse().unwrap());
        }
        assert_eq!(detector.tracked_sources(), 3);

        let quiet = FlowSnapshot::empty(Utc::now(), Duration::seconds(5));
        for _ in 0..3 {
            detector.tick(&quiet).await;
        }
        assert_eq!(detector.tracked_sources(), 2);
    }

    #[tokio::test]
    async fn test_overload_tick_escalates_active_sources() {
        let detector = detector(DdosDetectionConfig {
            overload_packets_per_sec: 100.0,
            ..Default::default()
        });
        let source: IpAddr = "203.0.113.7".parse().unwrap();

        let results = detector.tick(&syn_flood_snapshot("203.0.113.7", 1000)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, DetectionState::SystemOverload);
        assert!(results[0].severity >= Severity::Critical);
        assert!(results[0].recommended_actions.contains(&DefensiveAction::AlertOperator));
        assert_eq!(detector.state_of(&source), DetectionState::SystemOverload);

        let quiet = FlowSnapshot::empty(Utc::now(), Duration::seconds(5));
        detector.tick(&quiet).await;
        assert_eq!(detector.state_of(&source), DetectionState::Suspicious);
    }

    #[test]
    fn test_overload_reachable_from_any_state() {
        let config = DdosDetectionConfig::default();
        let assessment = Assessment {
            risk_score: 40.0,
            top_severity: None,
            overload: true,
        };
        for state in [
            DetectionState::Normal,
            DetectionState::Suspicious,
            DetectionState::AttackDetected,
            DetectionState::AttackBlocked,
        ] {
            assert_eq!(next_state(state, &assessment, 0, 0, &config), DetectionState::SystemOverload);
        }
    }

    #[test]
    fn test_low_severity_candidate_is_only_suspicious() {
        let config = DdosDetectionConfig::default();
        let assessment = Assessment {
            risk_score: 10.0,
            top_severity: Some(Severity::Low),
            overload: false,
        };
        assert_eq!(
            next_state(DetectionState::Normal, &assessment, 0, 0, &config),
            DetectionState::Suspicious
        );
        let high_risk = Assessment {
            risk_score: 75.0,
            ..assessment
        };
        assert_eq!(
            next_state(DetectionState::Suspicious, &high_risk, 0, 0, &config),
            DetectionState::AttackDetected
        );
    }

    #[test]
    fn test_risk_score_weighting() {
        let config = DdosDetectionConfig::default();
        assert_eq!(risk_score(0.0, 0.0, 0, 0, &config), 0.0);
        assert!((risk_score(10_000.0, 1.0, 10, 10, &config) - 100.0).abs() < 1e-9);
        // half volume + full suspicious ratio = 15 + 30
        assert!((risk_score(250.0, 1.0, 0, 0, &config) - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DdosDetectionConfig {
            suspicious_threshold: 80.0,
            attack_threshold: 60.0,
            ..Default::default()
        };
        assert!(DdosDetector::new(config, SignatureThresholds::default()).is_err());
    }
}
