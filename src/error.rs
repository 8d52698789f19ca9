use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for a scan run.
///
/// `Input`, `NoTargets` and `Privilege` abort before the first probe leaves.
/// `Send` is recovered per probe. `Persist` ends the run because a store that
/// silently stops accepting rows loses findings.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read input file {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no valid IPv4 targets found in {0}")]
    NoTargets(PathBuf),

    #[error("raw packet channel unavailable (SYN scanning requires root or CAP_NET_RAW): {0}")]
    Privilege(#[source] io::Error),

    #[error("packet encoding failed: {0}")]
    Encode(String),

    #[error("probe send failed: {0}")]
    Send(#[source] io::Error),

    #[error("result store {path} failed: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal channel closed: {0}")]
    Channel(&'static str),
}

impl ScanError {
    pub fn persist(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ScanError::Persist {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
