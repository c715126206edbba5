//! Flow aggregation for the detection pipeline.
//!
//! This module buckets decoded packet/flow observations by flow key and keeps
//! rolling counters (rates, byte volume, TCP flag distribution) per bucket.
//! Writers go through a sharded concurrent map so the capture path never
//! contends on a single lock while the detector takes snapshots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons an observation is rejected by the aggregator
#[derive(Error, Debug, PartialEq)]
pub enum FlowError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Missing destination port for {0} observation")]
    MissingPort(Protocol),
    #[error("Empty packet without flags")]
    EmptyPacket,
    #[error("Unspecified protocol")]
    UnspecifiedProtocol,
}

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
    /// Protocol-agnostic identity (firewall rules, recovered entries)
    Any,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Other(n) => write!(f, "IP/{}", n),
            Protocol::Any => write!(f, "Any"),
        }
    }
}

/// TCP flag bit set as seen on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn psh(&self) -> bool {
        self.0 & Self::PSH != 0
    }
}

/// One decoded packet/flow event delivered by the capture collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowObservation {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    /// Packet length in bytes
    pub length: u32,
    #[serde(default)]
    pub tcp_flags: TcpFlags,
}

/// Immutable identity of a monitored flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    pub protocol: Protocol,
    pub source_port: u16,
    pub destination_port: u16,
}

impl FlowKey {
    /// Validate an observation and derive its key
    pub fn from_observation(observation: &FlowObservation) -> Result<Self, FlowError> {
        let source_address: IpAddr = observation
            .src_addr
            .trim()
            .parse()
            .map_err(|_| FlowError::InvalidAddress(observation.src_addr.clone()))?;
        let destination_address: IpAddr = observation
            .dst_addr
            .trim()
            .parse()
            .map_err(|_| FlowError::InvalidAddress(observation.dst_addr.clone()))?;

        match observation.protocol {
            Protocol::Any => return Err(FlowError::UnspecifiedProtocol),
            Protocol::Tcp | Protocol::Udp => {
                if observation.dst_port == 0 {
                    return Err(FlowError::MissingPort(observation.protocol));
                }
                if observation.length == 0 && observation.tcp_flags.is_empty() {
                    return Err(FlowError::EmptyPacket);
                }
            }
            Protocol::Icmp | Protocol::Other(_) => {}
        }

        Ok(Self {
            source_address,
            destination_address,
            protocol: observation.protocol,
            source_port: observation.src_port,
            destination_port: observation.dst_port,
        })
    }
}

/// TCP flag counts for one flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagHistogram {
    /// SYN without ACK (connection attempts)
    pub syn: u64,
    pub syn_ack: u64,
    /// Pure ACK (handshake completion / keep-alive)
    pub ack: u64,
    pub fin: u64,
    pub rst: u64,
    pub psh: u64,
}

impl FlagHistogram {
    fn record(&mut self, flags: TcpFlags) {
        if flags.syn() && flags.ack() {
            self.syn_ack += 1;
        } else if flags.syn() {
            self.syn += 1;
        } else if flags.ack() && !flags.fin() && !flags.rst() && !flags.psh() {
            self.ack += 1;
        }
        if flags.fin() {
            self.fin += 1;
        }
        if flags.rst() {
            self.rst += 1;
        }
        if flags.psh() {
            self.psh += 1;
        }
    }

    pub fn merge(&mut self, other: &FlagHistogram) {
        self.syn += other.syn;
        self.syn_ack += other.syn_ack;
        self.ack += other.ack;
        self.fin += other.fin;
        self.rst += other.rst;
        self.psh += other.psh;
    }
}

/// Rolling aggregate for one flow key within the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub packet_count: u64,
    pub byte_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub flags: FlagHistogram,
    pub min_packet_size: u32,
    pub max_packet_size: u32,
    /// Packets per second, recomputed at snapshot time
    pub packets_per_sec: f64,
    /// Bytes per second, recomputed at snapshot time
    pub bytes_per_sec: f64,
}

impl FlowRecord {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            packet_count: 0,
            byte_count: 0,
            first_seen: at,
            last_seen: at,
            window_start: at,
            flags: FlagHistogram::default(),
            min_packet_size: u32::MAX,
            max_packet_size: 0,
            packets_per_sec: 0.0,
            bytes_per_sec: 0.0,
        }
    }

    fn roll_window(&mut self, at: DateTime<Utc>) {
        self.packet_count = 0;
        self.byte_count = 0;
        self.window_start = at;
        self.flags = FlagHistogram::default();
        self.min_packet_size = u32::MAX;
        self.max_packet_size = 0;
        self.packets_per_sec = 0.0;
        self.bytes_per_sec = 0.0;
    }

    fn record(&mut self, observation: &FlowObservation) {
        self.packet_count += 1;
        self.byte_count += observation.length as u64;
        self.min_packet_size = self.min_packet_size.min(observation.length);
        self.max_packet_size = self.max_packet_size.max(observation.length);
        if observation.timestamp > self.last_seen {
            self.last_seen = observation.timestamp;
        }
        if observation.protocol == Protocol::Tcp {
            self.flags.record(observation.tcp_flags);
        }
    }

    /// Average packet size in bytes
    pub fn average_packet_size(&self) -> f64 {
        if self.packet_count == 0 {
            0.0
        } else {
            self.byte_count as f64 / self.packet_count as f64
        }
    }

    fn recompute_rates(&mut self, now: DateTime<Utc>, window: Duration) {
        let secs = effective_seconds(now, self.window_start, window);
        self.packets_per_sec = self.packet_count as f64 / secs;
        self.bytes_per_sec = self.byte_count as f64 / secs;
    }
}

/// Elapsed window time clamped to `[1s, window]`
pub fn effective_seconds(now: DateTime<Utc>, window_start: DateTime<Utc>, window: Duration) -> f64 {
    let elapsed = (now - window_start).num_milliseconds() as f64 / 1000.0;
    let ceiling = (window.num_milliseconds() as f64 / 1000.0).max(1.0);
    elapsed.clamp(1.0, ceiling)
}

/// Flow aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Observation window length in seconds
    pub window_seconds: u64,
    /// Flows idle longer than this are evicted on snapshot (seconds)
    pub idle_timeout_seconds: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_seconds: 5,
            idle_timeout_seconds: 30,
        }
    }
}

/// Point-in-time copy of the active flows
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub taken_at: DateTime<Utc>,
    pub window: Duration,
    pub flows: HashMap<FlowKey, FlowRecord>,
}

impl FlowSnapshot {
    pub fn empty(taken_at: DateTime<Utc>, window: Duration) -> Self {
        Self {
            taken_at,
            window,
            flows: HashMap::new(),
        }
    }

    /// Group flows by source address
    pub fn by_source(&self) -> HashMap<IpAddr, Vec<(&FlowKey, &FlowRecord)>> {
        let mut grouped: HashMap<IpAddr, Vec<(&FlowKey, &FlowRecord)>> = HashMap::new();
        for (key, record) in &self.flows {
            grouped.entry(key.source_address).or_default().push((key, record));
        }
        grouped
    }

    /// Aggregate packet rate across every flow in the snapshot
    pub fn total_packets_per_sec(&self) -> f64 {
        self.flows.values().map(|r| r.packets_per_sec).sum()
    }

    /// Summarise one source's flows
    pub fn source_totals(&self, flows: &[(&FlowKey, &FlowRecord)]) -> SourceTotals {
        let mut totals = SourceTotals::default();
        let mut destinations = HashSet::new();
        let mut earliest: Option<DateTime<Utc>> = None;

        for (key, record) in flows {
            totals.packets += record.packet_count;
            totals.bytes += record.byte_count;
            totals.flags.merge(&record.flags);
            totals.flow_count += 1;
            destinations.insert(key.destination_address);
            if key.protocol == Protocol::Tcp && record.flags.syn > 0 && record.flags.ack == 0 {
                totals.half_open_flows += 1;
            }
            if record.flags.rst > 0 {
                totals.reset_flows += 1;
            }
            earliest = Some(match earliest {
                Some(e) if e <= record.window_start => e,
                _ => record.window_start,
            });
        }

        totals.distinct_destinations = destinations.len();
        totals.span_seconds = earliest
            .map(|start| effective_seconds(self.taken_at, start, self.window))
            .unwrap_or(1.0);
        totals.packets_per_sec = totals.packets as f64 / totals.span_seconds;
        totals.bytes_per_sec = totals.bytes as f64 / totals.span_seconds;
        totals
    }
}

/// Per-source totals derived from a snapshot
#[derive(Debug, Clone, Default)]
pub struct SourceTotals {
    pub packets: u64,
    pub bytes: u64,
    pub flags: FlagHistogram,
    pub flow_count: usize,
    pub half_open_flows: usize,
    pub reset_flows: usize,
    pub distinct_destinations: usize,
    /// Common time base used for every per-source rate
    pub span_seconds: f64,
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Concurrent flow table
pub struct FlowAggregator {
    config: AggregatorConfig,
    flows: DashMap<FlowKey, FlowRecord>,
    observed: AtomicU64,
    dropped: AtomicU64,
}

impl FlowAggregator {
    /// Create a new flow aggregator
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            flows: DashMap::new(),
            observed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_seconds.max(1) as i64)
    }

    /// Ingest one observation. Malformed observations are counted and dropped.
    pub fn observe(&self, observation: &FlowObservation) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("flow_observations_total");

        let key = match FlowKey::from_observation(observation) {
            Ok(key) => key,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("flow_observations_dropped_total");
                debug!("Dropping malformed observation: {}", e);
                return;
            }
        };

        let window = self.window();
        let mut record = self
            .flows
            .entry(key)
            .or_insert_with(|| FlowRecord::new(observation.timestamp));
        if observation.timestamp - record.window_start >= window {
            record.roll_window(observation.timestamp);
        }
        record.record(observation);
    }

    /// Take a consistent copy of the live flows.
    ///
    /// Flows idle beyond the idle timeout are evicted. Flows with no packet in
    /// the last window stay in the table but are left out of the snapshot.
    pub fn snapshot(&self, now: DateTime<Utc>) -> FlowSnapshot {
        let idle = Duration::seconds(self.config.idle_timeout_seconds as i64);
        let window = self.window();

        self.flows.retain(|_, record| now - record.last_seen <= idle);

        let flows: HashMap<FlowKey, FlowRecord> = self
            .flows
            .iter()
            .filter(|entry| now - entry.value().last_seen < window)
            .map(|entry| {
                let mut record = entry.value().clone();
                record.recompute_rates(now, window);
                (entry.key().clone(), record)
            })
            .collect();

        metrics::gauge!("tracked_flows", self.flows.len() as f64);

        FlowSnapshot {
            taken_at: now,
            window,
            flows,
        }
    }

    /// Number of flows currently held
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Observations accepted or rejected since start
    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    /// Malformed observations dropped since start
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) fn tcp(at: DateTime<Utc>, src: &str, src_port: u16, dst: &str, dst_port: u16, flags: u8, length: u32) -> FlowObservation {
        FlowObservation {
            timestamp: at,
            protocol: Protocol::Tcp,
            src_addr: src.to_string(),
            src_port,
            dst_addr: dst.to_string(),
            dst_port,
            length,
            tcp_flags: TcpFlags::from_bits(flags),
        }
    }

    pub(crate) fn udp(at: DateTime<Utc>, src: &str, src_port: u16, dst: &str, dst_port: u16, length: u32) -> FlowObservation {
        FlowObservation {
            timestamp: at,
            protocol: Protocol::Udp,
            src_addr: src.to_string(),
            src_port,
            dst_addr: dst.to_string(),
            dst_port,
            length,
            tcp_flags: TcpFlags::default(),
        }
    }

    #[test]
    fn test_observe_accumulates_per_key() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();

        for i in 0..10 {
            let at = t0 + Duration::milliseconds(i * 100);
            aggregator.observe(&tcp(at, "10.0.0.1", 40000, "10.0.0.2", 80, TcpFlags::ACK | TcpFlags::PSH, 200));
        }
        aggregator.observe(&tcp(t0, "10.0.0.1", 40001, "10.0.0.2", 80, TcpFlags::SYN, 60));

        let snapshot = aggregator.snapshot(t0 + Duration::seconds(2));
        assert_eq!(snapshot.flows.len(), 2);

        let key = FlowKey {
            source_address: "10.0.0.1".parse().unwrap(),
            destination_address: "10.0.0.2".parse().unwrap(),
            protocol: Protocol::Tcp,
            source_port: 40000,
            destination_port: 80,
        };
        let record = &snapshot.flows[&key];
        assert_eq!(record.packet_count, 10);
        assert_eq!(record.byte_count, 2000);
        assert_eq!(record.flags.psh, 10);
        assert_eq!(record.flags.ack, 0);
        assert!((record.packets_per_sec - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_observations_are_counted() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();

        aggregator.observe(&tcp(t0, "not-an-ip", 1, "10.0.0.2", 80, TcpFlags::SYN, 60));
        aggregator.observe(&tcp(t0, "10.0.0.1", 1, "10.0.0.2", 0, TcpFlags::SYN, 60));
        aggregator.observe(&tcp(t0, "10.0.0.1", 1, "10.0.0.2", 80, 0, 0));
        aggregator.observe(&tcp(t0, "10.0.0.1", 1, "10.0.0.2", 80, TcpFlags::SYN, 60));

        assert_eq!(aggregator.observed_count(), 4);
        assert_eq!(aggregator.dropped_count(), 3);
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn test_window_rollover_resets_record() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();

        aggregator.observe(&udp(t0, "10.0.0.1", 5000, "10.0.0.2", 53, 100));
        aggregator.observe(&udp(t0 + Duration::seconds(1), "10.0.0.1", 5000, "10.0.0.2", 53, 100));
        aggregator.observe(&udp(t0 + Duration::seconds(6), "10.0.0.1", 5000, "10.0.0.2", 53, 100));

        let snapshot = aggregator.snapshot(t0 + Duration::seconds(7));
        let record = snapshot.flows.values().next().unwrap();
        assert_eq!(record.packet_count, 1);
        assert_eq!(record.first_seen, t0);
        assert_eq!(record.window_start, t0 + Duration::seconds(6));
    }

    #[test]
    fn test_idle_flows_evicted_on_snapshot() {
        let aggregator = FlowAggregator::new(AggregatorConfig {
            window_seconds: 5,
            idle_timeout_seconds: 30,
        });
        let t0 = Utc::now();
        aggregator.observe(&udp(t0, "10.0.0.1", 5000, "10.0.0.2", 53, 100));
        aggregator.observe(&udp(t0 + Duration::seconds(25), "10.0.0.3", 5000, "10.0.0.2", 53, 100));

        let snapshot = aggregator.snapshot(t0 + Duration::seconds(31));
        assert_eq!(aggregator.len(), 1);
        // still tracked but quiet for more than a window
        assert!(snapshot.flows.is_empty());
    }

    #[test]
    fn test_source_totals_use_common_time_base() {
        let aggregator = FlowAggregator::new(AggregatorConfig::default());
        let t0 = Utc::now();
        for i in 0..100u16 {
            let at = t0 + Duration::milliseconds(i as i64 * 40);
            aggregator.observe(&tcp(at, "203.0.113.9", 10000 + i, "10.0.0.2", 80, TcpFlags::SYN, 60));
        }

        let snapshot = aggregator.snapshot(t0 + Duration::seconds(4));
        let grouped = snapshot.by_source();
        let flows = &grouped[&"203.0.113.9".parse::<IpAddr>().unwrap()];
        let totals = snapshot.source_totals(flows);

        assert_eq!(totals.flow_count, 100);
        assert_eq!(totals.half_open_flows, 100);
        assert_eq!(totals.flags.syn, 100);
        assert!((totals.span_seconds - 4.0).abs() < 1e-9);
        assert!((totals.packets_per_sec - 25.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let aggregator = Arc::new(FlowAggregator::new(AggregatorConfig::default()));
        let t0 = Utc::now();
        let mut handles = Vec::new();

        for worker in 0..4u16 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    let at = t0 + Duration::milliseconds(i);
                    aggregator.observe(&udp(at, "10.0.0.1", 7000 + worker, "10.0.0.2", 9999, 64));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = aggregator.snapshot(t0 + Duration::seconds(1));
        let total: u64 = snapshot.flows.values().map(|r| r.packet_count).sum();
        assert_eq!(total, 1000);
        assert_eq!(snapshot.flows.len(), 4);
    }
}
