use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A (source IP, source port) pair seen on the response channel, before the
/// collector decides which port it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Response {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// One confirmed open port. Serialized as a row of the intermediate store.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenPortRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Counters for a single port batch.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortReport {
    pub port: u16,
    pub probed: u64,
    pub send_failures: u64,
    pub open: u64,
    /// Responses for other ports (arrived after their window closed).
    pub late: u64,
    /// Responses from hosts outside the target set.
    pub noise: u64,
    pub elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Completed,
    Cancelled,
}

/// Result of the final merge pass.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub records_read: u64,
    pub rows_skipped: u64,
    pub hosts: u64,
}

/// Aggregate results of a whole run.
#[derive(Serialize, Debug, Clone)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub strategy: String,
    pub targets: u64,
    pub ports_total: u64,
    pub ports_done: u64,
    pub probes_sent: u64,
    pub send_failures: u64,
    pub open_findings: u64,
    pub late_responses: u64,
    pub elapsed_ms: u64,
    pub started_at: String,
    pub merge: Option<MergeSummary>,
    /// One entry per fully scanned port, in scan order.
    pub port_reports: Vec<PortReport>,
}

/// One row of the canonical output table.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HostPorts {
    pub ip: Ipv4Addr,
    pub ports: Vec<u16>,
}
