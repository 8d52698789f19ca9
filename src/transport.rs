//! Raw IPv4 transmit/receive capability used by the SYN strategy.
//!
//! The capability is opened once per run. The sending half is owned by one
//! transmit thread fed through a bounded queue; the receiving half is moved
//! into the single listener thread. Neither blocks a runtime worker.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::transport::{
    ipv4_packet_iter, transport_channel, TransportChannelType::Layer3, TransportReceiver,
    TransportSender,
};

use crate::error::{Result, ScanError};

const CHANNEL_BUFFER: usize = 1 << 16;

/// Writes complete IPv4 datagrams (header included) to the wire.
pub trait RawSender: Send {
    fn send_packet(&mut self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()>;
}

/// Reads complete inbound IPv4 datagrams carrying TCP.
pub trait RawReceiver: Send {
    /// Wait up to `timeout` for the next datagram. `Ok(None)` on timeout.
    fn recv_packet(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Datagrams waiting for the transmit thread.
pub const TRANSMIT_QUEUE: usize = 1024;

struct Outbound {
    packet: Vec<u8>,
    dst: Ipv4Addr,
    done: oneshot::Sender<io::Result<()>>,
}

/// Cloneable handle onto the transmit thread. Probe tasks await queue space
/// and the send result; the blocking `sendto` happens on the thread.
#[derive(Clone)]
pub struct TransmitQueue {
    tx: mpsc::Sender<Outbound>,
}

impl TransmitQueue {
    /// Move `sender` onto its own thread. The thread exits once every
    /// handle is dropped.
    pub fn spawn(mut sender: Box<dyn RawSender>, capacity: usize) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Outbound>(capacity.max(1));
        std::thread::Builder::new()
            .name("raw-transmit".into())
            .spawn(move || {
                let mut sent = 0u64;
                while let Some(job) = rx.blocking_recv() {
                    let res = sender.send_packet(&job.packet, job.dst);
                    if res.is_ok() {
                        sent += 1;
                    }
                    let _ = job.done.send(res);
                }
                debug!(sent, "transmit thread stopped");
            })?;
        Ok(Self { tx })
    }

    pub async fn send(&self, packet: Vec<u8>, dst: Ipv4Addr) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "transmit thread stopped");
        let (done, result) = oneshot::channel();
        self.tx
            .send(Outbound { packet, dst, done })
            .await
            .map_err(|_| closed())?;
        result.await.map_err(|_| closed())?
    }
}

struct PnetSender(TransportSender);

impl RawSender for PnetSender {
    fn send_packet(&mut self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        let ip = Ipv4Packet::new(packet)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "datagram shorter than IPv4 header"))?;
        let sent = self.0.send_to(ip, IpAddr::V4(dst))?;
        if sent != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {sent} of {} bytes", packet.len()),
            ));
        }
        Ok(())
    }
}

struct PnetReceiver(TransportReceiver);

impl RawReceiver for PnetReceiver {
    fn recv_packet(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut iter = ipv4_packet_iter(&mut self.0);
        Ok(iter
            .next_with_timeout(timeout)?
            .map(|(packet, _addr)| packet.packet().to_vec()))
    }
}

/// Open the raw Layer-3 TCP channel. Fails with `ScanError::Privilege` when
/// the process lacks the rights to create raw sockets.
pub fn open_raw_channel() -> Result<(Box<dyn RawSender>, Box<dyn RawReceiver>)> {
    let (tx, rx) = transport_channel(CHANNEL_BUFFER, Layer3(IpNextHeaderProtocols::Tcp))
        .map_err(ScanError::Privilege)?;
    Ok((Box::new(PnetSender(tx)), Box::new(PnetReceiver(rx))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    impl RawSender for Counting {
        fn send_packet(&mut self, _packet: &[u8], _dst: Ipv4Addr) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A wire whose `sendto` stalls, like a full socket buffer.
    struct Stalling(Duration);

    impl RawSender for Stalling {
        fn send_packet(&mut self, _packet: &[u8], _dst: Ipv4Addr) -> io::Result<()> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_tasks_share_one_transmit_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let queue = TransmitQueue::spawn(Box::new(Counting(count.clone())), 8).unwrap();
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let q = queue.clone();
            set.spawn(async move {
                for _ in 0..100 {
                    q.send(vec![0u8; 40], Ipv4Addr::LOCALHOST).await.unwrap();
                }
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 800);
    }

    #[tokio::test]
    async fn stalled_wire_does_not_block_the_runtime() {
        // single-threaded runtime: a blocking send inside a task would freeze the timer below
        let queue = TransmitQueue::spawn(Box::new(Stalling(Duration::from_millis(400))), 4).unwrap();
        let pending = tokio::spawn({
            let q = queue.clone();
            async move { q.send(vec![0u8; 40], Ipv4Addr::LOCALHOST).await }
        });
        let started = std::time::Instant::now();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300), "runtime stalled");
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_errors_come_back_to_the_caller() {
        struct Refusing;
        impl RawSender for Refusing {
            fn send_packet(&mut self, _packet: &[u8], _dst: Ipv4Addr) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "no buffer space"))
            }
        }
        let queue = TransmitQueue::spawn(Box::new(Refusing), 1).unwrap();
        assert!(queue.send(vec![0u8; 40], Ipv4Addr::LOCALHOST).await.is_err());
    }
}
