//! Attack signatures for the detection engine.
//!
//! Each signature is an independent predicate plus scoring function over the
//! per-source features of a flow snapshot. Every threshold comparison uses
//! `>=`: a rate exactly at its threshold fires.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::ddos_detector::DetectionResult;
use crate::core::flow_aggregator::{FlowKey, FlowRecord, FlowSnapshot, Protocol};

/// Reflection protocol abused in an amplification attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmplificationKind {
    Dns,
    Ntp,
    Ssdp,
    Memcached,
}

impl AmplificationKind {
    /// Map a reflector source port to its protocol
    pub fn from_port(port: u16) -> Option<Self> {
        match port {
            53 => Some(Self::Dns),
            123 => Some(Self::Ntp),
            1900 => Some(Self::Ssdp),
            11211 => Some(Self::Memcached),
            _ => None,
        }
    }
}

/// Attack type hypothesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackType {
    SynFlood,
    UdpFlood,
    HttpFlood,
    SlowLoris,
    VolumetricAttack,
    Amplification(AmplificationKind),
    ConnectionFlood,
    IcmpFlood,
    Unknown,
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackType::SynFlood => write!(f, "SYN flood"),
            AttackType::UdpFlood => write!(f, "UDP flood"),
            AttackType::HttpFlood => write!(f, "HTTP flood"),
            AttackType::SlowLoris => write!(f, "Slowloris"),
            AttackType::VolumetricAttack => write!(f, "Volumetric attack"),
            AttackType::Amplification(kind) => write!(f, "{:?} amplification", kind),
            AttackType::ConnectionFlood => write!(f, "Connection flood"),
            AttackType::IcmpFlood => write!(f, "ICMP flood"),
            AttackType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Ordered attack severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl Severity {
    /// Severity for an observed/threshold ratio
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 10.0 {
            Severity::Emergency
        } else if ratio >= 5.0 {
            Severity::Critical
        } else if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// One step up, capped at Emergency
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical | Severity::Emergency => Severity::Emergency,
        }
    }
}

/// Signature thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureThresholds {
    /// SYN packets per second from one source
    pub syn_rate_per_sec: f64,
    /// Handshake completions / SYNs at or below which SYN flood is at least High
    pub syn_ack_ratio_max: f64,
    /// UDP packets per second from one source
    pub udp_rate_per_sec: f64,
    /// Pushed TCP segments per second towards web ports
    pub http_requests_per_sec: f64,
    /// Minimum number of slow web connections for Slowloris
    pub slowloris_min_connections: usize,
    /// Maximum average payload of a slow connection (bytes)
    pub slowloris_max_avg_payload: f64,
    /// Maximum packet rate of a slow connection (packets/sec)
    pub slowloris_max_packet_rate: f64,
    /// Bytes per second from one source
    pub volumetric_bytes_per_sec: f64,
    /// Minimum average reflector response size (bytes)
    pub amplification_min_avg_response: f64,
    /// Minimum reflector packet rate
    pub amplification_min_packets_per_sec: f64,
    /// Established connections from one source
    pub connection_flood_distinct_flows: usize,
    /// ICMP packets per second from one source
    pub icmp_rate_per_sec: f64,
    /// Destination ports treated as web traffic
    pub web_ports: Vec<u16>,
}

impl Default for SignatureThresholds {
    fn default() -> Self {
        Self {
            syn_rate_per_sec: 100.0,
            syn_ack_ratio_max: 0.1,
            udp_rate_per_sec: 500.0,
            http_requests_per_sec: 50.0,
            slowloris_min_connections: 50,
            slowloris_max_avg_payload: 100.0,
            slowloris_max_packet_rate: 5.0,
            volumetric_bytes_per_sec: 10_000_000.0,
            amplification_min_avg_response: 512.0,
            amplification_min_packets_per_sec: 50.0,
            connection_flood_distinct_flows: 200,
            icmp_rate_per_sec: 200.0,
            web_ports: vec![80, 443, 8000, 8080, 8443],
        }
    }
}

/// Evidence recorded by the signature that fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signature", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignatureDetails {
    SynFlood {
        syn_per_sec: f64,
        completion_ratio: f64,
        half_open_flows: usize,
    },
    UdpFlood {
        packets_per_sec: f64,
        distinct_ports: usize,
    },
    HttpFlood {
        requests_per_sec: f64,
    },
    SlowLoris {
        slow_connections: usize,
        average_payload: f64,
    },
    Volumetric {
        bytes_per_sec: f64,
    },
    Amplification {
        kind: AmplificationKind,
        packets_per_sec: f64,
        average_response: f64,
    },
    ConnectionFlood {
        established_flows: usize,
    },
    IcmpFlood {
        packets_per_sec: f64,
    },
}

/// A signature match for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionCandidate {
    pub source: IpAddr,
    pub target: Option<IpAddr>,
    pub attack_type: AttackType,
    pub severity: Severity,
    /// Signature score in [0, 100]
    pub score: f64,
    pub signature: String,
    pub details: SignatureDetails,
}

/// Features of one source extracted from a snapshot
#[derive(Debug, Clone, Default)]
pub struct SourceFeatures {
    pub span_seconds: f64,
    pub syn: u64,
    pub completions: u64,
    pub half_open_flows: usize,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub udp_destination_ports: usize,
    pub web_pushes: u64,
    pub slow_web_connections: usize,
    pub slow_payload_bytes: u64,
    pub slow_payload_packets: u64,
    pub established_flows: usize,
    pub bytes: u64,
    /// Per reflector protocol: (packets, bytes)
    pub reflected: HashMap<AmplificationKind, (u64, u64)>,
    pub primary_target: Option<IpAddr>,
}

impl SourceFeatures {
    fn rate(&self, count: u64) -> f64 {
        count as f64 / self.span_seconds.max(1.0)
    }
}

/// Extract scorer features for one source's flows
pub fn extract_features(
    snapshot: &FlowSnapshot,
    flows: &[(&FlowKey, &FlowRecord)],
    thresholds: &SignatureThresholds,
) -> SourceFeatures {
    let totals = snapshot.source_totals(flows);
    let mut features = SourceFeatures {
        span_seconds: totals.span_seconds,
        syn: totals.flags.syn,
        completions: totals.flags.ack,
        half_open_flows: totals.half_open_flows,
        bytes: totals.bytes,
        ..Default::default()
    };

    let mut udp_ports = HashSet::new();
    let mut per_target: HashMap<IpAddr, u64> = HashMap::new();

    for (key, record) in flows {
        *per_target.entry(key.destination_address).or_default() += record.packet_count;
        match key.protocol {
            Protocol::Tcp => {
                features.tcp_packets += record.packet_count;
                if record.flags.ack > 0 || record.flags.psh > 0 {
                    features.established_flows += 1;
                }
                if thresholds.web_ports.contains(&key.destination_port) {
                    features.web_pushes += record.flags.psh;
                    let slow = record.packet_count > 0
                        && record.average_packet_size() <= thresholds.slowloris_max_avg_payload
                        && record.packets_per_sec <= thresholds.slowloris_max_packet_rate
                        && record.flags.fin == 0
                        && record.flags.rst == 0
                        && (record.flags.ack > 0 || record.flags.psh > 0);
                    if slow {
                        features.slow_web_connections += 1;
                        features.slow_payload_bytes += record.byte_count;
                        features.slow_payload_packets += record.packet_count;
                    }
                }
            }
            Protocol::Udp => {
                features.udp_packets += record.packet_count;
                udp_ports.insert(key.destination_port);
                if let Some(kind) = AmplificationKind::from_port(key.source_port) {
                    let entry = features.reflected.entry(kind).or_default();
                    entry.0 += record.packet_count;
                    entry.1 += record.byte_count;
                }
            }
            Protocol::Icmp => features.icmp_packets += record.packet_count,
            Protocol::Other(_) | Protocol::Any => {}
        }
    }

    features.udp_destination_ports = udp_ports.len();
    features.primary_target = per_target
        .into_iter()
        .max_by_key(|(_, packets)| *packets)
        .map(|(addr, _)| addr);
    features
}

fn ratio_score(ratio: f64) -> f64 {
    (ratio * 25.0).clamp(0.0, 100.0)
}

fn candidate(
    source: IpAddr,
    features: &SourceFeatures,
    attack_type: AttackType,
    ratio: f64,
    signature: &str,
    details: SignatureDetails,
) -> DetectionCandidate {
    DetectionCandidate {
        source,
        target: features.primary_target,
        attack_type,
        severity: Severity::from_ratio(ratio),
        score: ratio_score(ratio),
        signature: signature.to_string(),
        details,
    }
}

/// Evaluate every signature against one source
pub fn evaluate_source(
    source: IpAddr,
    features: &SourceFeatures,
    thresholds: &SignatureThresholds,
) -> Vec<DetectionCandidate> {
    let mut candidates = Vec::new();

    let syn_rate = features.rate(features.syn);
    if features.syn > 0 && syn_rate >= thresholds.syn_rate_per_sec {
        let completion_ratio = (features.completions as f64 / features.syn as f64).min(1.0);
        let mut c = candidate(
            source,
            features,
            AttackType::SynFlood,
            syn_rate / thresholds.syn_rate_per_sec,
            "syn_flood",
            SignatureDetails::SynFlood {
                syn_per_sec: syn_rate,
                completion_ratio,
                half_open_flows: features.half_open_flows,
            },
        );
        if completion_ratio <= thresholds.syn_ack_ratio_max {
            c.severity = c.severity.max(Severity::High);
        }
        candidates.push(c);
    }

    let udp_rate = features.rate(features.udp_packets);
    if features.udp_packets > 0 && udp_rate >= thresholds.udp_rate_per_sec {
        candidates.push(candidate(
            source,
            features,
            AttackType::UdpFlood,
            udp_rate / thresholds.udp_rate_per_sec,
            "udp_flood",
            SignatureDetails::UdpFlood {
                packets_per_sec: udp_rate,
                distinct_ports: features.udp_destination_ports,
            },
        ));
    }

    let http_rate = features.rate(features.web_pushes);
    if features.web_pushes > 0 && http_rate >= thresholds.http_requests_per_sec {
        candidates.push(candidate(
            source,
            features,
            AttackType::HttpFlood,
            http_rate / thresholds.http_requests_per_sec,
            "http_flood",
            SignatureDetails::HttpFlood {
                requests_per_sec: http_rate,
            },
        ));
    }

    if thresholds.slowloris_min_connections > 0
        && features.slow_web_connections >= thresholds.slowloris_min_connections
    {
        let average_payload = if features.slow_payload_packets == 0 {
            0.0
        } else {
            features.slow_payload_bytes as f64 / features.slow_payload_packets as f64
        };
        candidates.push(candidate(
            source,
            features,
            AttackType::SlowLoris,
            features.slow_web_connections as f64 / thresholds.slowloris_min_connections as f64,
            "slowloris",
            SignatureDetails::SlowLoris {
                slow_connections: features.slow_web_connections,
                average_payload,
            },
        ));
    }

    let byte_rate = features.rate(features.bytes);
    if features.bytes > 0 && byte_rate >= thresholds.volumetric_bytes_per_sec {
        candidates.push(candidate(
            source,
            features,
            AttackType::VolumetricAttack,
            byte_rate / thresholds.volumetric_bytes_per_sec,
            "volumetric",
            SignatureDetails::Volumetric {
                bytes_per_sec: byte_rate,
            },
        ));
    }

    for (kind, (packets, bytes)) in &features.reflected {
        if *packets == 0 {
            continue;
        }
        let rate = features.rate(*packets);
        let average = *bytes as f64 / *packets as f64;
        if rate >= thresholds.amplification_min_packets_per_sec
            && average >= thresholds.amplification_min_avg_response
        {
            candidates.push(candidate(
                source,
                features,
                AttackType::Amplification(*kind),
                rate / thresholds.amplification_min_packets_per_sec,
                "amplification",
                SignatureDetails::Amplification {
                    kind: *kind,
                    packets_per_sec: rate,
                    average_response: average,
                },
            ));
        }
    }

    if thresholds.connection_flood_distinct_flows > 0
        && features.established_flows >= thresholds.connection_flood_distinct_flows
    {
        candidates.push(candidate(
            source,
            features,
            AttackType::ConnectionFlood,
            features.established_flows as f64 / thresholds.connection_flood_distinct_flows as f64,
            "connection_flood",
            SignatureDetails::ConnectionFlood {
                established_flows: features.established_flows,
            },
        ));
    }

    let icmp_rate = features.rate(features.icmp_packets);
    if features.icmp_packets > 0 && icmp_rate >= thresholds.icmp_rate_per_sec {
        candidates.push(candidate(
            source,
            features,
            AttackType::IcmpFlood,
            icmp_rate / thresholds.icmp_rate_per_sec,
            "icmp_flood",
            SignatureDetails::IcmpFlood {
                packets_per_sec: icmp_rate,
            },
        ));
    }

    candidates
}

/// Run every signature over a snapshot.
///
/// Sources that already appear in `history` are repeat offenders and get
/// their severity raised one step.
pub fn score(
    snapshot: &FlowSnapshot,
    history: &[DetectionResult],
    thresholds: &SignatureThresholds,
) -> Vec<DetectionCandidate> {
    let offenders: HashSet<IpAddr> = history.iter().map(|r| r.source).collect();
    let mut candidates = Vec::new();

    for (source, flows) in snapshot.by_source() {
        let features = extract_features(snapshot, &flows, thresholds);
        let repeat = offenders.contains(&source);
        for mut c in evaluate_source(source, &features, thresholds) {
            if repeat {
                c.severity = c.severity.escalate();
            }
            candidates.push(c);
        }
    }

    candidates
}

/// Highest severity candidate (ties broken by score) plus the rest
pub fn select_primary(
    mut candidates: Vec<DetectionCandidate>,
) -> Option<(DetectionCandidate, Vec<DetectionCandidate>)> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });
    let primary = candidates.remove(0);
    Some((primary, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_aggregator::tests::{tcp, udp};
    use crate::core::ddos_detector::DetectionState;
    use crate::core::flow_aggregator::{AggregatorConfig, FlowAggregator, FlowObservation, TcpFlags};
    use chrono::{Duration, Utc};

    fn syn_burst(aggregator: &FlowAggregator, source: &str, count: i64, over_ms: i64) -> chrono::DateTime<Utc> {
        let t0 = Utc::now();
        for i in 0..count {
            let at = t0 + Duration::milliseconds(i * over_ms / count);
            aggregator.observe(&tcp(at, source, 1024 + (i % 60000) as u16, "10.0.0.2", 80, TcpFlags::SYN, 60));
        }
        t0
    }

    #[test]
    fn test_syn_flood_detected() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = syn_burst(&aggregator, "203.0.113.7", 1000, 5000);
        let snapshot = aggregator.snapshot(t0 + Duration::milliseconds(4999));

        let candidates = score(&snapshot, &[], &SignatureThresholds::default());
        let (primary, _) = select_primary(candidates).unwrap();
        assert_eq!(primary.attack_type, AttackType::SynFlood);
        assert!(primary.severity >= Severity::High);
        assert_eq!(primary.target, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // 400 SYNs measured over exactly 4 seconds = 100/s, the default threshold
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = syn_burst(&aggregator, "203.0.113.8", 400, 3990);
        let snapshot = aggregator.snapshot(t0 + Duration::seconds(4));
        let candidates = score(&snapshot, &[], &SignatureThresholds::default());
        assert!(candidates.iter().any(|c| c.attack_type == AttackType::SynFlood));

        // one packet fewer stays below it
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = syn_burst(&aggregator, "203.0.113.8", 399, 3990);
        let snapshot = aggregator.snapshot(t0 + Duration::seconds(4));
        let candidates = score(&snapshot, &[], &SignatureThresholds::default());
        assert!(candidates.iter().all(|c| c.attack_type != AttackType::SynFlood));
    }

    /// `count` observations spread over just under four seconds, snapshotted at four seconds
    fn four_second_snapshot(count: i64, make: impl Fn(chrono::DateTime<Utc>, i64) -> FlowObservation) -> FlowSnapshot {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for i in 0..count {
            aggregator.observe(&make(t0 + Duration::milliseconds(i * 3990 / count), i));
        }
        aggregator.snapshot(t0 + Duration::seconds(4))
    }

    fn fires(snapshot: &FlowSnapshot, attack_type: AttackType) -> bool {
        score(snapshot, &[], &SignatureThresholds::default())
            .iter()
            .any(|c| c.attack_type == attack_type)
    }

    fn icmp(at: chrono::DateTime<Utc>, src: &str) -> FlowObservation {
        FlowObservation {
            timestamp: at,
            protocol: Protocol::Icmp,
            src_addr: src.to_string(),
            src_port: 0,
            dst_addr: "10.0.0.2".to_string(),
            dst_port: 0,
            length: 84,
            tcp_flags: TcpFlags::default(),
        }
    }

    #[test]
    fn test_udp_flood_threshold() {
        let flood = |at, i: i64| udp(at, "203.0.113.30", 40000, "10.0.0.2", 9000 + (i % 10) as u16, 100);
        // 500 packets per second over 4 seconds
        let snapshot = four_second_snapshot(2000, flood);
        assert!(fires(&snapshot, AttackType::UdpFlood));
        let c = score(&snapshot, &[], &SignatureThresholds::default())
            .into_iter()
            .find(|c| c.attack_type == AttackType::UdpFlood)
            .unwrap();
        assert_eq!(c.severity, Severity::Low);
        assert!(matches!(c.details, SignatureDetails::UdpFlood { distinct_ports: 10, .. }));

        assert!(!fires(&four_second_snapshot(1999, flood), AttackType::UdpFlood));
    }

    #[test]
    fn test_http_flood_threshold() {
        let requests = |at, _: i64| tcp(at, "203.0.113.31", 50000, "10.0.0.2", 80, TcpFlags::ACK | TcpFlags::PSH, 400);
        assert!(fires(&four_second_snapshot(200, requests), AttackType::HttpFlood));
        assert!(!fires(&four_second_snapshot(199, requests), AttackType::HttpFlood));

        // pushes to a non-web port are not requests
        let other = |at, _: i64| tcp(at, "203.0.113.31", 50000, "10.0.0.2", 5432, TcpFlags::ACK | TcpFlags::PSH, 400);
        assert!(!fires(&four_second_snapshot(400, other), AttackType::HttpFlood));
    }

    #[test]
    fn test_volumetric_threshold() {
        // 4000 x 10 kB over 4 seconds = 10 MB/s on a single flow
        let bulk = |at, _: i64| tcp(at, "203.0.113.32", 50000, "10.0.0.2", 9000, TcpFlags::ACK, 10_000);
        assert!(fires(&four_second_snapshot(4000, bulk), AttackType::VolumetricAttack));
        assert!(!fires(&four_second_snapshot(3999, bulk), AttackType::VolumetricAttack));
    }

    #[test]
    fn test_connection_flood_threshold() {
        let connections = |at, i: i64| tcp(at, "203.0.113.33", 20000 + i as u16, "10.0.0.2", 22, TcpFlags::ACK, 60);
        let snapshot = four_second_snapshot(200, connections);
        assert!(fires(&snapshot, AttackType::ConnectionFlood));
        assert!(!fires(&snapshot, AttackType::SynFlood));
        assert!(!fires(&four_second_snapshot(199, connections), AttackType::ConnectionFlood));
    }

    #[test]
    fn test_icmp_flood_threshold() {
        let pings = |at, _: i64| icmp(at, "203.0.113.34");
        // 200 echo requests per second
        assert!(fires(&four_second_snapshot(800, pings), AttackType::IcmpFlood));
        assert!(!fires(&four_second_snapshot(799, pings), AttackType::IcmpFlood));
    }

    #[test]
    fn test_repeat_offender_is_escalated() {
        let source: IpAddr = "203.0.113.30".parse().unwrap();
        let snapshot = four_second_snapshot(2000, |at, i| {
            udp(at, "203.0.113.30", 40000, "10.0.0.2", 9000 + (i % 10) as u16, 100)
        });
        let earlier = |source: IpAddr| DetectionResult {
            id: uuid::Uuid::new_v4(),
            detected_at: Utc::now() - Duration::minutes(1),
            source,
            target: None,
            attack_type: AttackType::UdpFlood,
            severity: Severity::Low,
            attack_score: 40.0,
            state: DetectionState::AttackDetected,
            matched_signatures: vec!["udp_flood".to_string()],
            recommended_actions: Vec::new(),
            details: None,
        };
        let thresholds = SignatureThresholds::default();
        let severity = |history: Vec<DetectionResult>| {
            score(&snapshot, &history, &thresholds)
                .into_iter()
                .find(|c| c.attack_type == AttackType::UdpFlood)
                .map(|c| c.severity)
        };

        assert_eq!(severity(Vec::new()), Some(Severity::Low));
        assert_eq!(severity(vec![earlier("198.51.100.1".parse().unwrap())]), Some(Severity::Low));
        assert_eq!(severity(vec![earlier(source)]), Some(Severity::Medium));
    }

    #[test]
    fn test_dns_amplification() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for i in 0..300 {
            let at = t0 + Duration::milliseconds(i * 10);
            aggregator.observe(&udp(at, "198.51.100.53", 53, "10.0.0.2", 40000 + (i % 50) as u16, 3000));
        }
        let snapshot = aggregator.snapshot(t0 + Duration::seconds(3));
        let candidates = score(&snapshot, &[], &SignatureThresholds::default());
        assert!(candidates
            .iter()
            .any(|c| c.attack_type == AttackType::Amplification(AmplificationKind::Dns)));
    }

    #[test]
    fn test_normal_traffic_is_quiet() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for i in 0..20 {
            let at = t0 + Duration::milliseconds(i * 200);
            aggregator.observe(&tcp(at, "10.0.0.5", 50000, "93.184.216.34", 443, TcpFlags::ACK | TcpFlags::PSH, 900));
        }
        let snapshot = aggregator.snapshot(t0 + Duration::seconds(4));
        assert!(score(&snapshot, &[], &SignatureThresholds::default()).is_empty());
    }

    #[test]
    fn test_slowloris_detected() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for conn in 0..60u16 {
            for i in 0..3 {
                let at = t0 + Duration::milliseconds(i * 1500 + conn as i64);
                aggregator.observe(&tcp(at, "203.0.113.20", 30000 + conn, "10.0.0.2", 80, TcpFlags::ACK | TcpFlags::PSH, 20));
            }
        }
        let snapshot = aggregator.snapshot(t0 + Duration::seconds(5));
        let candidates = score(&snapshot, &[], &SignatureThresholds::default());
        assert!(candidates.iter().any(|c| c.attack_type == AttackType::SlowLoris));
    }

    #[test]
    fn test_select_primary_prefers_severity_then_score() {
        let source: IpAddr = "203.0.113.1".parse().unwrap();
        let make = |attack_type, severity, score| DetectionCandidate {
            source,
            target: None,
            attack_type,
            severity,
            score,
            signature: "test".to_string(),
            details: SignatureDetails::Volumetric { bytes_per_sec: 0.0 },
        };
        let (primary, rest) = select_primary(vec![
            make(AttackType::UdpFlood, Severity::Medium, 90.0),
            make(AttackType::SynFlood, Severity::High, 40.0),
            make(AttackType::VolumetricAttack, Severity::High, 60.0),
        ])
        .unwrap();
        assert_eq!(primary.attack_type, AttackType::VolumetricAttack);
        assert_eq!(rest.len(), 2);
        assert!(select_primary(Vec::new()).is_none());
    }

    #[test]
    fn test_severity_from_ratio() {
        assert_eq!(Severity::from_ratio(1.0), Severity::Low);
        assert_eq!(Severity::from_ratio(1.5), Severity::Medium);
        assert_eq!(Severity::from_ratio(2.0), Severity::High);
        assert_eq!(Severity::from_ratio(5.0), Severity::Critical);
        assert_eq!(Severity::from_ratio(10.0), Severity::Emergency);
        assert_eq!(Severity::Emergency.escalate(), Severity::Emergency);
    }
}
