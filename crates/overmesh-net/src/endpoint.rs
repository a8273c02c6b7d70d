//! UDP endpoint: inbound datagram delivery and non-blocking outbound sends.
//!
//! Outbound sends go through a bounded queue.  When the socket would block,
//! the packet is retried with exponential delay; queue overflow and
//! exhausted retries increment the `outgoing_drop` counter instead of
//! blocking the engine.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest datagram we accept or produce.
pub const MAX_DATAGRAM: usize = 65_507;

/// Initial retry delay after a would-block send.
const RETRY_DELAY: Duration = Duration::from_millis(10);
/// Retry delay cap.
const RETRY_DELAY_MAX: Duration = Duration::from_secs(1);
/// Attempts before a would-blocked packet is dropped.
const RETRY_ATTEMPTS: u32 = 8;

/// Cumulative transfer counters.
#[derive(Debug, Default)]
pub struct EndpointStats {
    total_up: AtomicU64,
    total_down: AtomicU64,
    outgoing_drop: AtomicU64,
}

impl EndpointStats {
    pub fn total_up(&self) -> u64 {
        self.total_up.load(Ordering::Relaxed)
    }

    pub fn total_down(&self) -> u64 {
        self.total_down.load(Ordering::Relaxed)
    }

    pub fn outgoing_drop(&self) -> u64 {
        self.outgoing_drop.load(Ordering::Relaxed)
    }

    pub fn add_up(&self, bytes: u64) {
        self.total_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_down(&self, bytes: u64) {
        self.total_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_outgoing_drop(&self) {
        self.outgoing_drop.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outbound contract offered to the engine.  Sends must never block.
pub trait Endpoint: Send + Sync {
    fn send(&self, addr: SocketAddr, packet: Vec<u8>);

    fn stats(&self) -> Arc<EndpointStats>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Inbound delivery callback: `(source_address, bytes)`.
pub type InboundFn = Box<dyn Fn(SocketAddr, Vec<u8>) + Send + Sync>;

/// The production endpoint: one reader task and one writer task over a UDP
/// socket.
pub struct UdpEndpoint {
    outbound: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    stats: Arc<EndpointStats>,
    local: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl UdpEndpoint {
    /// Bind `addr` and start the I/O tasks.  Inbound datagrams are handed
    /// to `inbound` on the reader task.
    pub async fn bind(
        addr: SocketAddr,
        queue_size: usize,
        inbound: InboundFn,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let stats = Arc::new(EndpointStats::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_size);

        let reader = tokio::spawn(read_loop(socket.clone(), stats.clone(), inbound));
        let writer = tokio::spawn(write_loop(socket, stats.clone(), outbound_rx));

        Ok(Self {
            outbound: outbound_tx,
            stats,
            local,
            tasks: vec![reader, writer],
        })
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Endpoint for UdpEndpoint {
    fn send(&self, addr: SocketAddr, packet: Vec<u8>) {
        if packet.len() > MAX_DATAGRAM {
            warn!(bytes = packet.len(), "dropping oversized outbound packet");
            self.stats.add_outgoing_drop();
            return;
        }
        if self.outbound.try_send((addr, packet)).is_err() {
            // Queue full or endpoint stopped.
            self.stats.add_outgoing_drop();
        }
    }

    fn stats(&self) -> Arc<EndpointStats> {
        self.stats.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

async fn read_loop(socket: Arc<UdpSocket>, stats: Arc<EndpointStats>, inbound: InboundFn) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, source)) => {
                stats.add_down(len as u64);
                inbound(source, buf[..len].to_vec());
            }
            Err(e) => {
                warn!("udp receive error: {e}");
            }
        }
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    stats: Arc<EndpointStats>,
    mut outbound: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
) {
    while let Some((addr, packet)) = outbound.recv().await {
        let mut delay = RETRY_DELAY;
        let mut sent = false;
        for _ in 0..RETRY_ATTEMPTS {
            match socket.try_send_to(&packet, addr) {
                Ok(len) => {
                    stats.add_up(len as u64);
                    sent = true;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_DELAY_MAX);
                }
                Err(e) => {
                    debug!("udp send to {addr} failed: {e}");
                    break;
                }
            }
        }
        if !sent {
            stats.add_outgoing_drop();
        }
    }
}

/// Endpoint that records every send; used by tests.
#[derive(Default)]
pub struct RecordingEndpoint {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    stats: Arc<EndpointStats>,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Endpoint for RecordingEndpoint {
    fn send(&self, addr: SocketAddr, packet: Vec<u8>) {
        self.stats.add_up(packet.len() as u64);
        self.sent.lock().push((addr, packet));
    }

    fn stats(&self) -> Arc<EndpointStats> {
        self.stats.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Endpoint that drops everything; a placeholder until the real endpoint is
/// attached.
#[derive(Default)]
pub struct NullEndpoint {
    stats: Arc<EndpointStats>,
}

impl NullEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Endpoint for NullEndpoint {
    fn send(&self, _addr: SocketAddr, _packet: Vec<u8>) {
        self.stats.add_outgoing_drop();
    }

    fn stats(&self) -> Arc<EndpointStats> {
        self.stats.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = UdpEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            16,
            Box::new(move |source, bytes| {
                let _ = tx.send((source, bytes));
            }),
        )
        .await
        .unwrap();
        let sender = UdpEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            16,
            Box::new(|_, _| {}),
        )
        .await
        .unwrap();

        let target = receiver.local_addr().unwrap();
        sender.send(target, b"ping".to_vec());

        let (source, bytes) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"ping");
        assert_eq!(source, sender.local_addr().unwrap());
        assert_eq!(receiver.stats().total_down(), 4);
    }

    #[test]
    fn test_recording_endpoint_counts() {
        let endpoint = RecordingEndpoint::new();
        endpoint.send("10.0.0.1:1".parse().unwrap(), vec![1, 2, 3]);
        assert_eq!(endpoint.stats().total_up(), 3);
        assert_eq!(endpoint.take_sent().len(), 1);
        assert_eq!(endpoint.sent_count(), 0);
    }
}
