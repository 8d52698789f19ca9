//! Loading the high-risk target list produced by the IOC pipeline.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::netdetect::expand_cidr_to_ips;

const IP_COLUMN: &str = "ip";

/// Networks with a shorter prefix than this are reduced to their network
/// address instead of being expanded host by host.
pub const MAX_EXPANDED_PREFIX: u8 = 24;

/// Deduplicated, sorted, immutable set of IPv4 targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    ips: Vec<Ipv4Addr>,
}

impl TargetSet {
    pub fn from_ips(ips: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let unique: BTreeSet<Ipv4Addr> = ips.into_iter().collect();
        Self {
            ips: unique.into_iter().collect(),
        }
    }

    /// Load targets from a tab-separated file with an `ip` column.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| ScanError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::from_reader(file).map_err(|e| match e {
            ScanError::Input { source, .. } => ScanError::Input {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        if set.is_empty() {
            return Err(ScanError::NoTargets(path.to_path_buf()));
        }
        info!(path = %path.display(), targets = set.len(), "loaded target set");
        Ok(set)
    }

    /// Parse tab-separated content. Rows with an empty `ip` field or the
    /// literal header token (repeated headers from concatenated feeds) are
    /// ignored; CIDR values expand to their host addresses.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .quoting(false)
            .from_reader(reader);

        let headers = rdr.headers().map_err(csv_input_error)?.clone();
        let Some(col) = headers.iter().position(|h| h.trim() == IP_COLUMN) else {
            return Err(ScanError::Input {
                path: Default::default(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "header has no `ip` column",
                ),
            });
        };

        let mut ips = BTreeSet::new();
        let mut skipped = 0u64;
        let mut collapsed = 0u64;
        for record in rdr.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable row");
                    skipped += 1;
                    continue;
                }
            };
            let field = record.get(col).map(str::trim).unwrap_or("");
            if field.is_empty() || field == IP_COLUMN {
                continue;
            }
            if let Ok(ip) = field.parse::<Ipv4Addr>() {
                ips.insert(ip);
            } else if let Ok(net) = field.parse::<IpNet>() {
                match net {
                    IpNet::V4(v4) if v4.prefix_len() < MAX_EXPANDED_PREFIX => {
                        debug!(network = %v4, "network too large to expand; keeping network address");
                        ips.insert(v4.network());
                        collapsed += 1;
                    }
                    IpNet::V4(_) => ips.extend(expand_cidr_to_ips(net)),
                    IpNet::V6(_) => {
                        skipped += 1;
                        debug!(value = field, "skipping non-IPv4 target");
                    }
                }
            } else {
                skipped += 1;
                debug!(value = field, "skipping non-IPv4 target");
            }
        }
        if skipped > 0 {
            warn!(skipped, "ignored malformed or non-IPv4 target rows");
        }
        if collapsed > 0 {
            warn!(
                networks = collapsed,
                max_prefix = MAX_EXPANDED_PREFIX,
                "networks wider than /{MAX_EXPANDED_PREFIX} reduced to their network address"
            );
        }
        Ok(Self {
            ips: ips.into_iter().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.ips.binary_search(ip).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ips.iter().copied()
    }

    pub fn as_slice(&self) -> &[Ipv4Addr] {
        &self.ips
    }

    pub fn first(&self) -> Option<Ipv4Addr> {
        self.ips.first().copied()
    }
}

fn csv_input_error(e: csv::Error) -> ScanError {
    ScanError::Input {
        path: Default::default(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    }
}
