//! Block statistics and reporting exports.
//!
//! Statistics are recomputed on demand from the stored blocks; nothing here
//! is on the decision path.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::store::{BlockStatus, BlockedConnection, StoreCounters};

/// Errors that can occur while producing reports
#[derive(Error, Debug)]
pub enum StatisticsError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV buffer error: {0}")]
    Buffer(String),
}

/// An address or process and how many blocks reference it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub key: String,
    pub count: usize,
}

/// A block whose enforcement did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBlock {
    pub process_name: String,
    pub remote_address: String,
    pub status: BlockStatus,
    pub error_message: Option<String>,
}

/// Aggregate view over the block store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatistics {
    pub total_blocks: usize,
    pub temporary_blocks: usize,
    pub permanent_blocks: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub top_addresses: Vec<RankedEntry>,
    pub top_processes: Vec<RankedEntry>,
    pub average_confidence: f64,
    pub attempted_decisions: u64,
    pub applied_rules: u64,
    /// Applied rules over attempted decisions; 1.0 when nothing was attempted
    pub success_rate: f64,
    pub needs_repair: usize,
    pub failed: Vec<FailedBlock>,
    pub generated_at: DateTime<Utc>,
}

impl BlockStatistics {
    pub fn compute(blocks: &[BlockedConnection], counters: StoreCounters, top_n: usize, now: DateTime<Utc>) -> Self {
        let mut by_level = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut addresses: HashMap<&str, usize> = HashMap::new();
        let mut processes: HashMap<&str, usize> = HashMap::new();
        let mut failed = Vec::new();
        let mut needs_repair = 0;
        let mut confidence_sum = 0.0;

        for block in blocks {
            let record = block.record();
            *by_level.entry(record.level.to_string()).or_insert(0) += 1;
            *by_category.entry(record.threat_category.to_string()).or_insert(0) += 1;
            *addresses.entry(record.identity.remote_address.as_str()).or_insert(0) += 1;
            *processes.entry(record.identity.process_name.as_str()).or_insert(0) += 1;
            confidence_sum += record.confidence;

            match block.status(now) {
                BlockStatus::NeedsRepair => needs_repair += 1,
                BlockStatus::Failed => failed.push(FailedBlock {
                    process_name: record.identity.process_name.clone(),
                    remote_address: record.identity.remote_address.clone(),
                    status: BlockStatus::Failed,
                    error_message: record.error_message.clone(),
                }),
                _ => {}
            }
        }

        let permanent_blocks = blocks.iter().filter(|b| b.is_permanent()).count();
        let success_rate = if counters.attempted_decisions == 0 {
            1.0
        } else {
            counters.applied_rules as f64 / counters.attempted_decisions as f64
        };

        Self {
            total_blocks: blocks.len(),
            temporary_blocks: blocks.len() - permanent_blocks,
            permanent_blocks,
            by_level,
            by_category,
            top_addresses: top_n_entries(addresses, top_n),
            top_processes: top_n_entries(processes, top_n),
            average_confidence: if blocks.is_empty() {
                0.0
            } else {
                confidence_sum / blocks.len() as f64
            },
            attempted_decisions: counters.attempted_decisions,
            applied_rules: counters.applied_rules,
            success_rate,
            needs_repair,
            failed,
            generated_at: now,
        }
    }
}

fn top_n_entries(counts: HashMap<&str, usize>, n: usize) -> Vec<RankedEntry> {
    let mut entries: Vec<RankedEntry> = counts
        .into_iter()
        .map(|(key, count)| RankedEntry {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(n);
    entries
}

#[derive(Serialize)]
struct CsvRow<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "processName")]
    process_name: &'a str,
    #[serde(rename = "remoteAddress")]
    remote_address: &'a str,
    #[serde(rename = "remotePort")]
    remote_port: u16,
    protocol: String,
    reason: &'a str,
    #[serde(rename = "blockedAt")]
    blocked_at: String,
    #[serde(rename = "firewallRuleStatus")]
    firewall_rule_status: String,
}

/// Render the block list as CSV
pub fn export_csv(blocks: &[BlockedConnection], now: DateTime<Utc>) -> Result<String, StatisticsError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for block in blocks {
        let record = block.record();
        let kind = if block.is_permanent() { "Permanent" } else { "Temporary" };
        writer.serialize(CsvRow {
            kind,
            process_name: &record.identity.process_name,
            remote_address: &record.identity.remote_address,
            remote_port: record.identity.remote_port,
            protocol: record.identity.protocol.to_string(),
            reason: &record.reason,
            blocked_at: record.last_blocked.to_rfc3339(),
            firewall_rule_status: block.status(now).to_string(),
        })?;
    }
    if blocks.is_empty() {
        writer.write_record([
            "type",
            "processName",
            "remoteAddress",
            "remotePort",
            "protocol",
            "reason",
            "blockedAt",
            "firewallRuleStatus",
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| StatisticsError::Buffer(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StatisticsError::Buffer(e.to_string()))
}
