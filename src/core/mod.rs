//! Core functionality for the network defense service.
//!
//! This module contains the detection and enforcement components:
//! flow aggregation, attack signatures, DDoS detection, block decisions,
//! firewall rule management, block storage and statistics.

pub mod ddos_detector;
pub mod decision_engine;
pub mod firewall;
pub mod flow_aggregator;
pub mod pipeline;
pub mod signatures;
pub mod statistics;
pub mod store;
pub mod threat_intel;

pub use ddos_detector::{DdosDetectionConfig, DdosDetector, DetectionResult, DetectionState};
pub use decision_engine::{BlockDecision, BlockLevel, ConnectionAttempt, DecisionConfig, DecisionEngine};
pub use firewall::{FirewallConfig, FirewallRuleManager};
pub use flow_aggregator::{AggregatorConfig, FlowAggregator, FlowObservation};
pub use pipeline::{DefensePipeline, PipelineConfig, PipelineError, PipelineOutcome};
pub use signatures::SignatureThresholds;
pub use statistics::BlockStatistics;
pub use store::{BlockStore, BlockedConnection, ConnectionIdentity, WhitelistEntry};
pub use threat_intel::{ThreatIntelChain, ThreatIntelConfig};
