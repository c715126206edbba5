//! Auto-block decision engine for the network defense service.
//!
//! This module turns a connection attempt plus its detection and threat
//! intelligence context into a tiered block decision. Rules are grouped by
//! the level they imply; the highest tier with a triggered rule wins and
//! evaluation stops once an Immediate rule has fired.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ddos_detector::DetectionResult;
use crate::core::flow_aggregator::Protocol;
use crate::core::signatures::Severity;
use crate::core::store::{ConnectionIdentity, WhitelistEntry};
use crate::core::threat_intel::ThreatIntelHit;
use crate::utils::is_private_address;

/// Stable rule identifiers
pub mod rule_ids {
    pub const THREAT_INTEL_HIT: &str = "THREAT_INTEL_HIT";
    pub const SUSPICIOUS_PORT: &str = "SUSPICIOUS_PORT";
    pub const SYSTEM_PROCESS_SPOOF: &str = "SYSTEM_PROCESS_SPOOF";
    pub const LARGE_TRANSFER: &str = "LARGE_TRANSFER";
    pub const DDOS_ATTACK_SOURCE: &str = "DDOS_ATTACK_SOURCE";
    pub const UNSIGNED_PROCESS: &str = "UNSIGNED_PROCESS";
    pub const SYSTEM_PROCESS_UNVERIFIED: &str = "SYSTEM_PROCESS_UNVERIFIED";
    pub const NON_STANDARD_PORT: &str = "NON_STANDARD_PORT";
    pub const BEACONING: &str = "BEACONING";
    pub const FOREIGN_ENDPOINT: &str = "FOREIGN_ENDPOINT";
    pub const HIGH_DATA_RATE: &str = "HIGH_DATA_RATE";
    pub const NEW_PROCESS: &str = "NEW_PROCESS";
    pub const FIRST_TIME_PORT: &str = "FIRST_TIME_PORT";
}

/// Block level, totally ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockLevel {
    None,
    Monitor,
    Warning,
    Immediate,
}

impl fmt::Display for BlockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockLevel::None => "None",
            BlockLevel::Monitor => "Monitor",
            BlockLevel::Warning => "Warning",
            BlockLevel::Immediate => "Immediate",
        };
        f.write_str(s)
    }
}

/// Code-signing status of the process behind a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "signer")]
pub enum SignerStatus {
    Signed(String),
    Unsigned,
    #[default]
    Unknown,
}

/// One outbound connection attempt reported by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttempt {
    pub process_name: String,
    #[serde(default)]
    pub process_path: Option<String>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub signer: SignerStatus,
    #[serde(default)]
    pub is_first_seen_process: Option<bool>,
    pub remote_address: String,
    pub remote_port: u16,
    #[serde(default)]
    pub local_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl ConnectionAttempt {
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity {
            process_name: self.process_name.clone(),
            remote_address: self.remote_address.clone(),
            remote_port: self.remote_port,
            protocol: self.protocol,
        }
    }
}

/// Detection and reputation context gathered for an attempt
#[derive(Debug, Clone, Default)]
pub struct DetectionContext {
    pub detection: Option<DetectionResult>,
    pub threat_intel: Option<ThreatIntelHit>,
}

/// Threat category of a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreatCategory {
    MaliciousInfrastructure,
    CommandAndControl,
    DataExfiltration,
    ProcessSpoofing,
    DenialOfService,
    SuspiciousBehavior,
    Benign,
    Unknown,
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Action recommended for a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedAction {
    Allow,
    Monitor,
    TemporaryBlock,
    PermanentBlock,
}

impl From<BlockLevel> for RecommendedAction {
    fn from(level: BlockLevel) -> Self {
        match level {
            BlockLevel::None => RecommendedAction::Allow,
            BlockLevel::Monitor => RecommendedAction::Monitor,
            BlockLevel::Warning => RecommendedAction::TemporaryBlock,
            BlockLevel::Immediate => RecommendedAction::PermanentBlock,
        }
    }
}

/// A rule that fired during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredRule {
    pub id: String,
    pub level: BlockLevel,
    pub weight: f64,
    pub reason: String,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDecision {
    pub id: Uuid,
    pub identity: ConnectionIdentity,
    pub level: BlockLevel,
    pub reason: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub triggered_rules: Vec<TriggeredRule>,
    pub threat_category: ThreatCategory,
    pub recommended_action: RecommendedAction,
    pub decided_at: DateTime<Utc>,
    pub whitelisted: bool,
}

/// Rule weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    pub threat_intel_hit: f64,
    pub suspicious_port: f64,
    pub system_process_spoof: f64,
    pub large_transfer: f64,
    pub ddos_attack_source: f64,
    pub unsigned_process: f64,
    pub system_process_unverified: f64,
    pub non_standard_port: f64,
    pub beaconing: f64,
    pub foreign_endpoint: f64,
    pub high_data_rate: f64,
    pub new_process: f64,
    pub first_time_port: f64,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            threat_intel_hit: 0.9,
            suspicious_port: 0.3,
            system_process_spoof: 0.4,
            large_transfer: 0.25,
            ddos_attack_source: 0.35,
            unsigned_process: 0.2,
            system_process_unverified: 0.2,
            non_standard_port: 0.15,
            beaconing: 0.25,
            foreign_endpoint: 0.1,
            high_data_rate: 0.25,
            new_process: 0.05,
            first_time_port: 0.05,
        }
    }
}

/// Decision engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub suspicious_ports: Vec<u16>,
    pub standard_ports: Vec<u16>,
    pub system_processes: Vec<String>,
    /// Directory legitimate system processes run from
    pub system_directory: String,
    pub large_transfer_bytes: u64,
    pub high_data_rate_bytes: u64,
    pub threat_intel_min_confidence: f64,
    pub beacon_min_samples: usize,
    pub beacon_max_variation: f64,
    pub beacon_history: usize,
    /// Countries considered local; empty disables the foreign endpoint rule
    pub home_countries: Vec<String>,
    /// Let a remembered Monitor level lapse after this many clean seconds
    pub monitor_expiry_seconds: Option<u64>,
    /// Forget per-process, per-port, beacon and escalation memory idle this long
    pub memory_ttl_seconds: u64,
    pub weights: RuleWeights,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            suspicious_ports: vec![4444, 5555, 6666, 6667, 31337, 12345, 1337, 9001],
            standard_ports: vec![
                20, 21, 22, 25, 53, 80, 110, 123, 143, 443, 465, 587, 993, 995, 3389, 8080, 8443,
            ],
            system_processes: [
                "svchost.exe",
                "lsass.exe",
                "csrss.exe",
                "winlogon.exe",
                "services.exe",
                "smss.exe",
                "explorer.exe",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            system_directory: "C:\\Windows".to_string(),
            large_transfer_bytes: 100 * 1024 * 1024,
            high_data_rate_bytes: 10 * 1024 * 1024,
            threat_intel_min_confidence: 0.7,
            beacon_min_samples: 5,
            beacon_max_variation: 0.2,
            beacon_history: 20,
            home_countries: Vec::new(),
            monitor_expiry_seconds: None,
            memory_ttl_seconds: 86_400,
            weights: RuleWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Escalation {
    level: BlockLevel,
    confidence: f64,
    updated_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Auto-block decision engine
pub struct DecisionEngine {
    config: DecisionConfig,
    escalation: DashMap<ConnectionIdentity, Escalation>,
    known_processes: DashMap<String, DateTime<Utc>>,
    seen_ports: DashMap<(String, u16), DateTime<Utc>>,
    beacons: DashMap<(String, String), VecDeque<DateTime<Utc>>>,
}

impl DecisionEngine {
    /// Create a new decision engine instance
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            escalation: DashMap::new(),
            known_processes: DashMap::new(),
            seen_ports: DashMap::new(),
            beacons: DashMap::new(),
        }
    }

    /// Evaluate one connection attempt.
    ///
    /// Missing optional metadata is treated as a risk signal; evaluation
    /// never fails.
    pub fn evaluate(
        &self,
        attempt: &ConnectionAttempt,
        context: &DetectionContext,
        whitelist: &[WhitelistEntry],
    ) -> BlockDecision {
        let identity = attempt.identity();
        let now = attempt.observed_at;

        if let Some(entry) = whitelist
            .iter()
            .find(|e| e.matches(attempt.process_path.as_deref(), &attempt.remote_address, now))
        {
            return self.whitelisted(identity, &entry.reason, now);
        }

        let immediate = self.immediate_rules(attempt, context);
        let triggered = if immediate.is_empty() {
            let mut rules = self.warning_rules(attempt);
            rules.extend(self.monitor_rules(attempt));
            rules
        } else {
            immediate
        };
        self.track(attempt);

        self.conclude(identity, triggered, now)
    }

    /// Decision for the source address of a detected attack
    pub fn evaluate_detection(&self, detection: &DetectionResult, whitelist: &[WhitelistEntry]) -> BlockDecision {
        let remote_address = detection.source.to_string();
        let identity = ConnectionIdentity {
            process_name: "network".to_string(),
            remote_address: remote_address.clone(),
            remote_port: 0,
            protocol: Protocol::Any,
        };
        let now = detection.detected_at;

        if let Some(entry) = whitelist.iter().find(|e| e.matches(None, &remote_address, now)) {
            return self.whitelisted(identity, &entry.reason, now);
        }

        let level = match detection.severity {
            Severity::Critical | Severity::Emergency => BlockLevel::Immediate,
            Severity::High => BlockLevel::Warning,
            _ => BlockLevel::Monitor,
        };
        let rule = TriggeredRule {
            id: rule_ids::DDOS_ATTACK_SOURCE.to_string(),
            level,
            weight: (detection.attack_score / 100.0).clamp(0.0, 1.0).max(self.config.weights.ddos_attack_source),
            reason: format!(
                "{} detected from {} ({:?}, score {:.0})",
                detection.attack_type, remote_address, detection.severity, detection.attack_score
            ),
        };
        self.conclude(identity, vec![rule], now)
    }

    /// Drop escalation memory for an identity (explicit unblock)
    pub fn forget(&self, identity: &ConnectionIdentity) {
        self.escalation.remove(identity);
    }

    /// Drop escalation memory for every identity targeting `address`
    pub fn forget_address(&self, address: &str) {
        self.escalation.retain(|identity, _| identity.remote_address != address);
    }

    /// Drop memory that has been idle longer than `memory_ttl_seconds`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.memory_ttl_seconds as i64);
        let before = self.memory_size();
        self.known_processes.retain(|_, seen| *seen > cutoff);
        self.seen_ports.retain(|_, seen| *seen > cutoff);
        self.beacons
            .retain(|_, history| history.back().map_or(false, |last| *last > cutoff));
        self.escalation.retain(|_, e| e.last_seen > cutoff);
        let removed = before.saturating_sub(self.memory_size());
        if removed > 0 {
            debug!("Pruned {} idle decision engine entries", removed);
        }
        removed
    }

    /// Entries held across all per-process and per-identity maps
    pub fn memory_size(&self) -> usize {
        self.known_processes.len() + self.seen_ports.len() + self.beacons.len() + self.escalation.len()
    }

    /// Level currently remembered for an identity
    pub fn remembered_level(&self, identity: &ConnectionIdentity) -> BlockLevel {
        self.escalation
            .get(identity)
            .map(|e| e.level)
            .unwrap_or(BlockLevel::None)
    }

    fn whitelisted(&self, identity: ConnectionIdentity, reason: &str, now: DateTime<Utc>) -> BlockDecision {
        debug!("{} / {} is whitelisted", identity.process_name, identity.remote_address);
        self.escalation.remove(&identity);
        metrics::increment_counter!("block_decisions_total", "level" => BlockLevel::None.to_string());
        BlockDecision {
            id: Uuid::new_v4(),
            identity,
            level: BlockLevel::None,
            reason: format!("Whitelisted: {}", reason),
            confidence: 1.0,
            triggered_rules: Vec::new(),
            threat_category: ThreatCategory::Benign,
            recommended_action: RecommendedAction::Allow,
            decided_at: now,
            whitelisted: true,
        }
    }

    fn immediate_rules(&self, attempt: &ConnectionAttempt, context: &DetectionContext) -> Vec<TriggeredRule> {
        let weights = &self.config.weights;
        let mut rules = Vec::new();
        let remote: Option<IpAddr> = attempt.remote_address.parse().ok();

        if let Some(hit) = &context.threat_intel {
            if hit.confidence >= self.config.threat_intel_min_confidence {
                rules.push(rule(
                    rule_ids::THREAT_INTEL_HIT,
                    BlockLevel::Immediate,
                    weights.threat_intel_hit,
                    format!(
                        "{} flagged by {} threat intelligence (confidence {:.2})",
                        attempt.remote_address, hit.source, hit.confidence
                    ),
                ));
            }
        }

        if self.config.suspicious_ports.contains(&attempt.remote_port) {
            rules.push(rule(
                rule_ids::SUSPICIOUS_PORT,
                BlockLevel::Immediate,
                weights.suspicious_port,
                format!("Connection to known malicious port {}", attempt.remote_port),
            ));
        }

        if self.is_system_process(&attempt.process_name) {
            let external = remote.map_or(true, |ip| !is_private_address(&ip));
            if let Some(path) = &attempt.process_path {
                if external && !self.in_system_directory(path) {
                    rules.push(rule(
                        rule_ids::SYSTEM_PROCESS_SPOOF,
                        BlockLevel::Immediate,
                        weights.system_process_spoof,
                        format!(
                            "{} running from {} connects externally",
                            attempt.process_name, path
                        ),
                    ));
                }
            }
        }

        if attempt.bytes_transferred >= self.config.large_transfer_bytes {
            rules.push(rule(
                rule_ids::LARGE_TRANSFER,
                BlockLevel::Immediate,
                weights.large_transfer,
                format!("Single transfer of {} bytes", attempt.bytes_transferred),
            ));
        }

        if let (Some(detection), Some(ip)) = (&context.detection, remote) {
            if detection.source == ip && detection.severity >= Severity::High {
                rules.push(rule(
                    rule_ids::DDOS_ATTACK_SOURCE,
                    BlockLevel::Immediate,
                    weights.ddos_attack_source,
                    format!("{} is an active {} source", ip, detection.attack_type),
                ));
            }
        }

        rules
    }

    fn warning_rules(&self, attempt: &ConnectionAttempt) -> Vec<TriggeredRule> {
        let weights = &self.config.weights;
        let mut rules = Vec::new();

        match &attempt.signer {
            SignerStatus::Signed(_) => {}
            SignerStatus::Unsigned => rules.push(rule(
                rule_ids::UNSIGNED_PROCESS,
                BlockLevel::Warning,
                weights.unsigned_process,
                format!("{} is not signed", attempt.process_name),
            )),
            SignerStatus::Unknown => rules.push(rule(
                rule_ids::UNSIGNED_PROCESS,
                BlockLevel::Warning,
                weights.unsigned_process / 2.0,
                format!("Signature of {} could not be verified", attempt.process_name),
            )),
        }

        if attempt.process_path.is_none() && self.is_system_process(&attempt.process_name) {
            rules.push(rule(
                rule_ids::SYSTEM_PROCESS_UNVERIFIED,
                BlockLevel::Warning,
                weights.system_process_unverified,
                format!("System process name {} with unknown path", attempt.process_name),
            ));
        }

        if !self.config.standard_ports.contains(&attempt.remote_port) {
            rules.push(rule(
                rule_ids::NON_STANDARD_PORT,
                BlockLevel::Warning,
                weights.non_standard_port,
                format!("Non-standard remote port {}", attempt.remote_port),
            ));
        }

        if let Some(variation) = self.beacon_variation(attempt) {
            rules.push(rule(
                rule_ids::BEACONING,
                BlockLevel::Warning,
                weights.beaconing,
                format!(
                    "Periodic connections to {} (interval variation {:.2})",
                    attempt.remote_address, variation
                ),
            ));
        }

        if !self.config.home_countries.is_empty() {
            match &attempt.country_code {
                Some(country) if !self
                    .config
                    .home_countries
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(country)) =>
                {
                    rules.push(rule(
                        rule_ids::FOREIGN_ENDPOINT,
                        BlockLevel::Warning,
                        weights.foreign_endpoint,
                        format!("Endpoint located in {}", country),
                    ));
                }
                Some(_) => {}
                None => rules.push(rule(
                    rule_ids::FOREIGN_ENDPOINT,
                    BlockLevel::Warning,
                    weights.foreign_endpoint / 2.0,
                    "Endpoint country unknown".to_string(),
                )),
            }
        }

        if attempt.bytes_transferred >= self.config.high_data_rate_bytes {
            rules.push(rule(
                rule_ids::HIGH_DATA_RATE,
                BlockLevel::Warning,
                weights.high_data_rate,
                format!("{} bytes transferred", attempt.bytes_transferred),
            ));
        }

        rules
    }

    fn monitor_rules(&self, attempt: &ConnectionAttempt) -> Vec<TriggeredRule> {
        let weights = &self.config.weights;
        let mut rules = Vec::new();

        let first_seen = attempt
            .is_first_seen_process
            .unwrap_or_else(|| !self.known_processes.contains_key(&attempt.process_name));
        if first_seen {
            rules.push(rule(
                rule_ids::NEW_PROCESS,
                BlockLevel::Monitor,
                weights.new_process,
                format!("First network activity from {}", attempt.process_name),
            ));
        }

        let port_key = (attempt.process_name.clone(), attempt.remote_port);
        if !self.config.standard_ports.contains(&attempt.remote_port) && !self.seen_ports.contains_key(&port_key) {
            rules.push(rule(
                rule_ids::FIRST_TIME_PORT,
                BlockLevel::Monitor,
                weights.first_time_port,
                format!("{} uses port {} for the first time", attempt.process_name, attempt.remote_port),
            ));
        }

        rules
    }

    fn track(&self, attempt: &ConnectionAttempt) {
        let at = attempt.observed_at;
        self.known_processes
            .entry(attempt.process_name.clone())
            .and_modify(|seen| *seen = (*seen).max(at))
            .or_insert(at);
        self.seen_ports
            .entry((attempt.process_name.clone(), attempt.remote_port))
            .and_modify(|seen| *seen = (*seen).max(at))
            .or_insert(at);

        let key = (attempt.process_name.clone(), attempt.remote_address.clone());
        let mut history = self.beacons.entry(key).or_default();
        history.push_back(attempt.observed_at);
        while history.len() > self.config.beacon_history.max(self.config.beacon_min_samples) {
            history.pop_front();
        }
    }

    /// Coefficient of variation of inter-arrival times including this attempt
    fn beacon_variation(&self, attempt: &ConnectionAttempt) -> Option<f64> {
        let key = (attempt.process_name.clone(), attempt.remote_address.clone());
        let mut samples: Vec<DateTime<Utc>> = self
            .beacons
            .get(&key)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        samples.push(attempt.observed_at);
        if samples.len() < self.config.beacon_min_samples.max(3) {
            return None;
        }
        samples.sort();

        let intervals: Vec<f64> = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
            .collect();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        let variation = variance.sqrt() / mean;
        (variation <= self.config.beacon_max_variation).then_some(variation)
    }

    fn is_system_process(&self, name: &str) -> bool {
        self.config
            .system_processes
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
    }

    fn in_system_directory(&self, path: &str) -> bool {
        let dir = self.config.system_directory.trim_end_matches('\\').to_ascii_lowercase();
        let path = path.to_ascii_lowercase();
        path.strip_prefix(&dir)
            .map_or(false, |rest| rest.starts_with('\\') || rest.starts_with('/'))
    }

    /// Combine triggered rules with the remembered level for this identity
    fn conclude(&self, identity: ConnectionIdentity, triggered: Vec<TriggeredRule>, now: DateTime<Utc>) -> BlockDecision {
        let computed = triggered.iter().map(|r| r.level).max().unwrap_or(BlockLevel::None);
        let blend = triggered.iter().map(|r| r.weight).sum::<f64>().min(1.0);
        let mut confidence = match computed {
            BlockLevel::Immediate => blend.max(0.9),
            BlockLevel::None => 0.0,
            _ => blend,
        };

        let strongest = triggered
            .iter()
            .filter(|r| r.level == computed)
            .fold(None::<&TriggeredRule>, |best, r| match best {
                Some(b) if b.weight >= r.weight => Some(b),
                _ => Some(r),
            });
        let mut threat_category = strongest.map_or(ThreatCategory::Benign, |r| category_for(&r.id));
        let mut reason = if triggered.is_empty() {
            "No risk indicators".to_string()
        } else {
            triggered
                .iter()
                .filter(|r| r.level == computed)
                .map(|r| r.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        let mut level = computed;
        if let Some(previous) = self.escalation.get(&identity).map(|e| *e.value()) {
            let lapsed = previous.level == BlockLevel::Monitor
                && computed == BlockLevel::None
                && self
                    .config
                    .monitor_expiry_seconds
                    .map_or(false, |secs| now - previous.updated_at >= Duration::seconds(secs as i64));
            if lapsed {
                debug!("Monitor level for {} lapsed", identity.key());
                self.escalation.remove(&identity);
            } else if previous.level > computed {
                level = previous.level;
                confidence = confidence.max(previous.confidence);
                if threat_category == ThreatCategory::Benign {
                    threat_category = ThreatCategory::Unknown;
                }
                reason = format!("{} (held at {} from an earlier decision)", reason, previous.level);
            }
        }

        if level > BlockLevel::None && level >= computed {
            let updated_at = if level == computed {
                now
            } else {
                self.escalation.get(&identity).map_or(now, |e| e.updated_at)
            };
            self.escalation.insert(
                identity.clone(),
                Escalation {
                    level,
                    confidence,
                    updated_at,
                    last_seen: now,
                },
            );
        }

        if level >= BlockLevel::Warning {
            info!(
                "{} decision for {} -> {} ({:.2}): {}",
                level, identity.process_name, identity.remote_address, confidence, reason
            );
        }
        metrics::increment_counter!("block_decisions_total", "level" => level.to_string());

        BlockDecision {
            id: Uuid::new_v4(),
            identity,
            level,
            reason,
            confidence,
            triggered_rules: triggered,
            threat_category,
            recommended_action: RecommendedAction::from(level),
            decided_at: now,
            whitelisted: false,
        }
    }
}

fn rule(id: &str, level: BlockLevel, weight: f64, reason: String) -> TriggeredRule {
    TriggeredRule {
        id: id.to_string(),
        level,
        weight,
        reason,
    }
}

fn category_for(rule_id: &str) -> ThreatCategory {
    match rule_id {
        rule_ids::THREAT_INTEL_HIT => ThreatCategory::MaliciousInfrastructure,
        rule_ids::SUSPICIOUS_PORT | rule_ids::BEACONING => ThreatCategory::CommandAndControl,
        rule_ids::SYSTEM_PROCESS_SPOOF | rule_ids::SYSTEM_PROCESS_UNVERIFIED => ThreatCategory::ProcessSpoofing,
        rule_ids::LARGE_TRANSFER | rule_ids::HIGH_DATA_RATE => ThreatCategory::DataExfiltration,
        rule_ids::DDOS_ATTACK_SOURCE => ThreatCategory::DenialOfService,
        rule_ids::UNSIGNED_PROCESS
        | rule_ids::NON_STANDARD_PORT
        | rule_ids::FOREIGN_ENDPOINT
        | rule_ids::NEW_PROCESS
        | rule_ids::FIRST_TIME_PORT => ThreatCategory::SuspiciousBehavior,
        _ => ThreatCategory::Unknown,
    }
}
