//! Intermediate result store and the final merge into the canonical table.
//!
//! The intermediate store is an append-only `ip,port` CSV owned by a single
//! sink task; producers reach it only through [`SinkHandle`]. The merge pass
//! groups the store by IP into descending port sets and writes `ip,ports_set`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ScanError};
use crate::types::{HostPorts, MergeSummary, OpenPortRecord};

const STORE_HEADER: [&str; 2] = ["ip", "port"];
const OUTPUT_HEADER: [&str; 2] = ["ip", "ports_set"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub received: u64,
    pub persisted: u64,
    pub flushes: u64,
}

/// Buffered appender for the intermediate store.
pub struct ResultSink {
    path: PathBuf,
    batch_size: usize,
    buffer: Vec<OpenPortRecord>,
    writer: Option<csv::Writer<File>>,
    stats: SinkStats,
}

impl ResultSink {
    /// Prepare a sink for `path`. The file is created on the first flush.
    pub fn open(path: &Path, batch_size: usize) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| ScanError::persist(path, e))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            batch_size: batch_size.max(1),
            buffer: Vec::with_capacity(batch_size.max(1)),
            writer: None,
            stats: SinkStats::default(),
        })
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer a record, appending the batch to disk once it is full.
    pub fn push(&mut self, record: OpenPortRecord) -> Result<()> {
        self.buffer.push(record);
        self.stats.received += 1;
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append every buffered record. The buffer is cleared only on success.
    pub fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let writer = ensure_writer(&mut self.writer, &self.path)?;
        for rec in &self.buffer {
            writer
                .write_record([rec.ip.to_string(), rec.port.to_string()])
                .map_err(|e| ScanError::persist(&self.path, e))?;
        }
        writer.flush().map_err(|e| ScanError::persist(&self.path, e))?;

        let n = self.buffer.len();
        self.buffer.clear();
        self.stats.persisted += n as u64;
        self.stats.flushes += 1;
        debug!(rows = n, path = %self.path.display(), "appended findings to intermediate store");
        Ok(n)
    }
}

/// Open the store for appending on first use, writing the header if the file
/// is new or empty.
fn ensure_writer<'a>(
    slot: &'a mut Option<csv::Writer<File>>,
    path: &Path,
) -> Result<&'a mut csv::Writer<File>> {
    if slot.is_none() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ScanError::persist(path, e))?;
        let fresh = file.metadata().map_err(|e| ScanError::persist(path, e))?.len() == 0;
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            w.write_record(STORE_HEADER)
                .map_err(|e| ScanError::persist(path, e))?;
        }
        *slot = Some(w);
    }
    slot.as_mut()
        .ok_or(ScanError::Channel("intermediate store writer missing"))
}

enum SinkMsg {
    Record(OpenPortRecord),
    Sync(oneshot::Sender<Result<SinkStats>>),
    Close(oneshot::Sender<Result<SinkStats>>),
}

/// Cloneable hand-off into the sink task.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkMsg>,
}

impl SinkHandle {
    /// Hand a finding to the sink; waits when the channel is full.
    pub async fn record(&self, record: OpenPortRecord) -> Result<()> {
        self.tx
            .send(SinkMsg::Record(record))
            .await
            .map_err(|_| ScanError::Channel("result sink stopped"))
    }

    /// Barrier: resolves once every record sent before it has been taken over
    /// by the sink. Reports a persistence failure seen since the last sync.
    pub async fn sync(&self) -> Result<SinkStats> {
        self.request(SinkMsg::Sync).await
    }

    /// Flush everything and stop the sink task.
    pub async fn close(&self) -> Result<SinkStats> {
        self.request(SinkMsg::Close).await
    }

    async fn request(
        &self,
        msg: impl FnOnce(oneshot::Sender<Result<SinkStats>>) -> SinkMsg,
    ) -> Result<SinkStats> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(msg(ack))
            .await
            .map_err(|_| ScanError::Channel("result sink stopped"))?;
        done.await
            .map_err(|_| ScanError::Channel("result sink stopped"))?
    }
}

/// Move `sink` into its own task. `capacity` bounds the hand-off channel.
pub fn spawn_sink(
    mut sink: ResultSink,
    capacity: usize,
) -> (SinkHandle, JoinHandle<SinkStats>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(async move {
        let mut failure: Option<ScanError> = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                SinkMsg::Record(rec) => {
                    if let Err(e) = sink.push(rec) {
                        error!(error = %e, buffered = sink.buffered(), "failed to append findings");
                        failure.get_or_insert(e);
                    }
                }
                SinkMsg::Sync(ack) => {
                    let res = match failure.take() {
                        Some(e) => Err(e),
                        None => Ok(sink.stats()),
                    };
                    let _ = ack.send(res);
                }
                SinkMsg::Close(ack) => {
                    let res = sink.flush().map(|_| sink.stats());
                    if let Err(e) = &res {
                        error!(error = %e, buffered = sink.buffered(), "final flush failed");
                    }
                    let _ = ack.send(res);
                    return sink.stats();
                }
            }
        }
        // every handle dropped without close
        if let Err(e) = sink.flush() {
            error!(error = %e, buffered = sink.buffered(), "final flush failed");
        }
        sink.stats()
    });
    (SinkHandle { tx }, task)
}

/// Read the intermediate store into per-IP port sets.
pub fn read_store(path: &Path) -> Result<(BTreeMap<Ipv4Addr, BTreeSet<u16>>, MergeSummary)> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| ScanError::persist(path, e))?;

    let mut groups: BTreeMap<Ipv4Addr, BTreeSet<u16>> = BTreeMap::new();
    let mut summary = MergeSummary::default();
    for row in rdr.deserialize::<OpenPortRecord>() {
        match row {
            Ok(rec) if rec.port != 0 => {
                groups.entry(rec.ip).or_default().insert(rec.port);
                summary.records_read += 1;
            }
            Ok(_) | Err(_) => summary.rows_skipped += 1,
        }
    }
    if summary.rows_skipped > 0 {
        warn!(path = %path.display(), skipped = summary.rows_skipped, "skipped malformed store rows");
    }
    summary.hosts = groups.len() as u64;
    Ok((groups, summary))
}

/// Ports of one host, descending.
fn ports_desc(ports: &BTreeSet<u16>) -> Vec<u16> {
    ports.iter().rev().copied().collect()
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Write the canonical `ip,ports_set` table atomically (temp file + rename).
pub fn write_canonical(path: &Path, groups: &BTreeMap<Ipv4Addr, BTreeSet<u16>>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| ScanError::persist(path, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut w = csv::Writer::from_path(&tmp).map_err(|e| ScanError::persist(&tmp, e))?;
    w.write_record(OUTPUT_HEADER)
        .map_err(|e| ScanError::persist(&tmp, e))?;
    for (ip, ports) in groups {
        w.write_record([ip.to_string(), join_ports(&ports_desc(ports))])
            .map_err(|e| ScanError::persist(&tmp, e))?;
    }
    w.flush().map_err(|e| ScanError::persist(&tmp, e))?;
    drop(w);
    fs::rename(&tmp, path).map_err(|e| ScanError::persist(path, e))?;
    Ok(())
}

/// Merge the intermediate store into the canonical output.
///
/// The store is removed only after the output is in place, and only when
/// `remove_intermediate` is set. A missing store means no findings: the output
/// is written with just its header.
pub fn merge_store(intermediate: &Path, output: &Path, remove_intermediate: bool) -> Result<MergeSummary> {
    let (groups, summary) = match read_store(intermediate) {
        Ok(read) => read,
        Err(ScanError::Persist { .. }) if !intermediate.exists() => {
            warn!(path = %intermediate.display(), "intermediate store missing; writing empty result table");
            (BTreeMap::new(), MergeSummary::default())
        }
        Err(e) => return Err(e),
    };
    write_canonical(output, &groups)?;
    info!(
        hosts = summary.hosts,
        records = summary.records_read,
        output = %output.display(),
        "merged scan results"
    );

    if remove_intermediate {
        match fs::remove_file(intermediate) {
            Ok(()) => debug!(path = %intermediate.display(), "removed intermediate store"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %intermediate.display(), error = %e, "could not remove intermediate store"),
        }
    }
    Ok(summary)
}

/// Read a canonical table back into rows.
pub fn read_canonical(path: &Path) -> Result<Vec<HostPorts>> {
    let mut rdr = csv::Reader::from_path(path).map_err(|e| ScanError::persist(path, e))?;
    let mut out = Vec::new();
    for row in rdr.records() {
        let row = row.map_err(|e| ScanError::persist(path, e))?;
        let Some(ip) = row.get(0).and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        let ports = row
            .get(1)
            .unwrap_or("")
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .collect();
        out.push(HostPorts { ip, ports });
    }
    Ok(out)
}
