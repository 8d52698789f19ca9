use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, ScanError};
use crate::ports;

/// File name of the intermediate store when none is given explicitly.
pub const INTERMEDIATE_FILE_NAME: &str = "temp_scan_results.csv";

/// Which probe mechanism a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Half-open SYN scan over a raw socket (needs elevated privilege).
    Syn,
    /// Full handshake through the normal socket API.
    Connect,
}

impl StrategyKind {
    /// Response window used when the operator does not set one.
    pub fn default_window(self) -> Duration {
        match self {
            StrategyKind::Syn => Duration::from_secs(2),
            // connect probes report their own outcome before the batch ends
            StrategyKind::Connect => Duration::from_millis(100),
        }
    }
}

/// Settings for a scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Tab-separated target list with an `ip` column
    pub input: PathBuf,
    /// Canonical `ip,ports_set` table
    pub output: PathBuf,
    /// Append-only `ip,port` store
    pub intermediate: PathBuf,
    /// Ports to scan, in scan order
    pub ports: Vec<u16>,
    pub strategy: StrategyKind,
    /// Max probes executing at once
    pub max_in_flight: usize,
    /// Packets per second across all probe tasks; 0 disables pacing
    pub rate_pps: u64,
    pub rate_burst: u64,
    /// Drain window after each port's send batch; `None` = strategy default
    pub window: Option<Duration>,
    pub connect_timeout: Duration,
    /// Findings buffered before an append to the intermediate store
    pub batch_size: usize,
    /// Capacity of the response and sink channels
    pub channel_capacity: usize,
    /// Listener warm-up before the first probe
    pub settle: Duration,
    /// Upper bound on listener shutdown
    pub stop_grace: Duration,
    pub source_ip: Option<Ipv4Addr>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("recent_high_risk_ips.csv"),
            output: PathBuf::from("data/scan_results.csv"),
            intermediate: PathBuf::from("data").join(INTERMEDIATE_FILE_NAME),
            ports: ports::all_ports(),
            strategy: StrategyKind::Syn,
            max_in_flight: 1000,
            rate_pps: 1000,
            rate_burst: 100,
            window: None,
            connect_timeout: Duration::from_millis(1000),
            batch_size: 1000,
            channel_capacity: 4096,
            settle: Duration::from_millis(500),
            stop_grace: Duration::from_millis(500),
            source_ip: None,
        }
    }
}

impl ScanConfig {
    /// Intermediate store path next to `output`.
    pub fn intermediate_for(output: &Path) -> PathBuf {
        output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(INTERMEDIATE_FILE_NAME)
    }

    pub fn response_window(&self) -> Duration {
        self.window.unwrap_or_else(|| self.strategy.default_window())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(ScanError::Config("port list is empty".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ScanError::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ScanError::Config("batch size must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ScanError::Config("channel capacity must be at least 1".into()));
        }
        if self.intermediate == self.output {
            return Err(ScanError::Config(
                "intermediate store and output must be different files".into(),
            ));
        }
        Ok(())
    }
}
