//! Whole-run scans against a simulated network.

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ioc_scan_rs::config::{ScanConfig, StrategyKind};
use ioc_scan_rs::error::{Result, ScanError};
use ioc_scan_rs::packet::{self, flags, SegmentSpec};
use ioc_scan_rs::scanner::ScanOrchestrator;
use ioc_scan_rs::strategy::{ConnectStrategy, ListenerHandle, ScanStrategy, SynStrategy};
use ioc_scan_rs::targets::TargetSet;
use ioc_scan_rs::transport::{RawReceiver, RawSender};
use ioc_scan_rs::types::{Response, ScanStatus};

const SCANNER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn config(dir: &Path, ports: Vec<u16>, strategy: StrategyKind) -> ScanConfig {
    ScanConfig {
        input: dir.join("recent_high_risk_ips.csv"),
        output: dir.join("scan_results.csv"),
        intermediate: dir.join("temp_scan_results.csv"),
        ports,
        strategy,
        rate_pps: 0,
        window: Some(Duration::from_millis(100)),
        settle: Duration::ZERO,
        ..ScanConfig::default()
    }
}

/// Answer a probe the way a host would: SYN+ACK when open, RST+ACK otherwise.
fn answer(probe: &[u8], open: bool) -> Vec<u8> {
    let syn = packet::parse_tcp_reply(probe).expect("probe is a TCP datagram");
    packet::encode_segment(&SegmentSpec {
        src_ip: syn.dst_ip,
        dst_ip: syn.src_ip,
        src_port: syn.dst_port,
        dst_port: syn.src_port,
        seq: 0x1000,
        ack: 1,
        flags: if open { flags::SYN | flags::ACK } else { flags::RST | flags::ACK },
        window: 64240,
        ip_id: 0,
        ttl: 60,
    })
    .to_vec()
}

/// Simulated hosts behind the raw channel.
struct FakeNet {
    open: HashSet<(Ipv4Addr, u16)>,
    /// Open services whose SYN+ACK only arrives once the next port is probed.
    slow: HashSet<(Ipv4Addr, u16)>,
    held: Vec<(u16, Vec<u8>)>,
    wire: std_mpsc::Sender<Vec<u8>>,
}

impl RawSender for FakeNet {
    fn send_packet(&mut self, probe: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        assert!(packet::verify_ipv4_checksum(probe));
        assert!(packet::verify_tcp_checksum(probe));
        let port = u16::from_be_bytes([probe[22], probe[23]]);

        let (release, keep): (Vec<_>, Vec<_>) = self.held.drain(..).partition(|(p, _)| *p != port);
        self.held = keep;
        for (_, reply) in release {
            let _ = self.wire.send(reply);
        }

        let key = (dst, port);
        let reply = answer(probe, self.open.contains(&key) || self.slow.contains(&key));
        if self.slow.contains(&key) {
            self.held.push((port, reply));
        } else {
            let _ = self.wire.send(reply);
        }
        Ok(())
    }
}

struct FakeWire {
    rx: std_mpsc::Receiver<Vec<u8>>,
    dropped: Arc<AtomicBool>,
}

impl RawReceiver for FakeWire {
    fn recv_packet(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

impl Drop for FakeWire {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn simulated_syn(
    open: &[(Ipv4Addr, u16)],
    slow: &[(Ipv4Addr, u16)],
) -> (Arc<dyn ScanStrategy>, Arc<AtomicBool>) {
    let (wire, rx) = std_mpsc::channel();
    let dropped = Arc::new(AtomicBool::new(false));
    let net = FakeNet {
        open: open.iter().copied().collect(),
        slow: slow.iter().copied().collect(),
        held: Vec::new(),
        wire,
    };
    let receiver = FakeWire {
        rx,
        dropped: dropped.clone(),
    };
    let strategy = SynStrategy::with_transport(SCANNER, Box::new(net), Box::new(receiver)).unwrap();
    (Arc::new(strategy), dropped)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn syn_scan_finds_open_ports_and_merges() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), vec![22, 80, 443], StrategyKind::Syn);
    let (strategy, dropped) = simulated_syn(&[(ip(1), 22), (ip(2), 443)], &[]);

    let orch = ScanOrchestrator::new(cfg.clone(), strategy, TargetSet::from_ips([ip(1), ip(2)])).unwrap();
    let outcome = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, ScanStatus::Completed);
    assert_eq!(outcome.ports_done, 3);
    assert_eq!(outcome.probes_sent, 6);
    assert_eq!(outcome.open_findings, 2);
    assert_eq!(
        std::fs::read_to_string(&cfg.output).unwrap(),
        "ip,ports_set\n10.0.0.1,22\n10.0.0.2,443\n"
    );
    assert!(!cfg.intermediate.exists());
    assert!(dropped.load(Ordering::SeqCst));

    let per_port: Vec<(u16, u64, u64)> = outcome
        .port_reports
        .iter()
        .map(|r| (r.port, r.probed, r.open))
        .collect();
    assert_eq!(per_port, vec![(22, 2, 1), (80, 2, 0), (443, 2, 1)]);
    let summary = serde_json::to_value(&outcome).unwrap();
    assert_eq!(summary["port_reports"][2]["port"], 443);
    assert_eq!(summary["port_reports"][2]["open"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_answer_is_not_credited_to_the_next_port() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), vec![22, 80], StrategyKind::Syn);
    // 10.0.0.1:22 answers only while port 80 is being probed
    let (strategy, _) = simulated_syn(&[(ip(2), 80)], &[(ip(1), 22)]);

    let orch = ScanOrchestrator::new(cfg.clone(), strategy, TargetSet::from_ips([ip(1), ip(2)])).unwrap();
    let outcome = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.late_responses, 1);
    assert_eq!(outcome.port_reports[1].late, 1);
    assert_eq!(
        std::fs::read_to_string(&cfg.output).unwrap(),
        "ip,ports_set\n10.0.0.2,80\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_keeps_findings_and_releases_the_listener() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), (1..=1000).collect(), StrategyKind::Syn);
    let (strategy, dropped) = simulated_syn(&[(ip(1), 1), (ip(1), 2)], &[]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        trigger.cancel();
    });

    let orch = ScanOrchestrator::new(cfg.clone(), strategy, TargetSet::from_ips([ip(1)])).unwrap();
    let started = std::time::Instant::now();
    let outcome = orch.run(cancel).await.unwrap();

    assert_eq!(outcome.status, ScanStatus::Cancelled);
    assert!(outcome.ports_done < 1000);
    assert!(outcome.merge.is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(dropped.load(Ordering::SeqCst), "raw receiver still held after run");

    let store = std::fs::read_to_string(&cfg.intermediate).unwrap();
    assert!(store.starts_with("ip,port\n"));
    assert!(store.contains("10.0.0.1,1\n"));
    assert!(!cfg.output.exists());
}

/// Records how many probes overlap.
struct Gauge {
    now: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ScanStrategy for Gauge {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Connect
    }

    fn start_listener(
        &self,
        _tap: mpsc::Sender<Response>,
        _stop: CancellationToken,
    ) -> Result<Option<ListenerHandle>> {
        Ok(None)
    }

    async fn probe(&self, target: Ipv4Addr, port: u16) -> Result<Option<Response>> {
        let n = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.now.fetch_sub(1, Ordering::SeqCst);
        Ok((target == ip(7) && port == 8080).then_some(Response { ip: target, port }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_probes_never_exceed_the_bound() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), vec![8080, 8443], StrategyKind::Connect);
    cfg.max_in_flight = 4;
    cfg.window = Some(Duration::from_millis(10));
    let gauge = Arc::new(Gauge {
        now: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let targets = TargetSet::from_ips((1..=50).map(ip));
    let orch = ScanOrchestrator::new(cfg.clone(), gauge.clone(), targets).unwrap();
    let outcome = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.probes_sent, 100);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak in-flight {peak}");
    assert_eq!(
        std::fs::read_to_string(&cfg.output).unwrap(),
        "ip,ports_set\n10.0.0.7,8080\n"
    );
}

#[tokio::test]
async fn connect_scan_on_loopback() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), vec![closed_port, open_port], StrategyKind::Connect);
    let strategy = Arc::new(ConnectStrategy::new(cfg.connect_timeout));
    let orch = ScanOrchestrator::new(cfg.clone(), strategy, TargetSet::from_ips([Ipv4Addr::LOCALHOST])).unwrap();
    let outcome = orch.run(CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.open_findings, 1);
    assert_eq!(
        std::fs::read_to_string(&cfg.output).unwrap(),
        format!("ip,ports_set\n127.0.0.1,{open_port}\n")
    );
    drop(listener);
}

#[tokio::test]
async fn unusable_store_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), vec![80], StrategyKind::Connect);
    cfg.intermediate = dir.path().join("store-is-a-directory");
    std::fs::create_dir(&cfg.intermediate).unwrap();

    let strategy = Arc::new(ConnectStrategy::new(Duration::from_millis(100)));
    let orch = ScanOrchestrator::new(cfg, strategy, TargetSet::from_ips([Ipv4Addr::LOCALHOST])).unwrap();
    let err = orch.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ScanError::Persist { .. }), "got {err:?}");
}

#[test]
fn empty_target_set_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), vec![80], StrategyKind::Connect);
    let strategy = Arc::new(ConnectStrategy::new(Duration::from_millis(100)));
    assert!(matches!(
        ScanOrchestrator::new(cfg, strategy, TargetSet::default()),
        Err(ScanError::NoTargets(_))
    ));
}
