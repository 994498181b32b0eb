//! Default UDP probe transport.
//!
//! Wire format is a 5-byte frame: a type byte followed by a big-endian u32
//! nonce. Probes send [`PING`]; relay servers echo the nonce back under
//! [`PONG`]. Replies are correlated by source address plus nonce, so stray
//! or duplicated datagrams cannot be mistaken for an answer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probe::transport::{NO_RESPONSE_MS, ProbeError, ProbeReply, ProbeTransport};

const PING: u8 = 0x01;
const PONG: u8 = 0x02;
const FRAME_LEN: usize = 5;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Probe transport over plain UDP sockets, one per address family.
///
/// Sockets are bound lazily on the first [`ProbeTransport::bind`] call and
/// reused afterwards. An IPv6 bind failure is tolerated as long as the IPv4
/// bind succeeded; IPv6 targets then simply never answer.
pub struct UdpProbeTransport {
    timeout: Duration,
    v4: OnceCell<UdpSocket>,
    v6: OnceCell<UdpSocket>,
    nonce: AtomicU32,
}

impl UdpProbeTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            v4: OnceCell::new(),
            v6: OnceCell::new(),
            nonce: AtomicU32::new(0),
        }
    }
}

impl Default for UdpProbeTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ProbeTransport for UdpProbeTransport {
    async fn bind(&self) -> Result<(), ProbeError> {
        self.v4
            .get_or_try_init(|| UdpSocket::bind(("0.0.0.0", 0)))
            .await
            .map_err(ProbeError::Bind)?;
        if let Err(e) = self.v6.get_or_try_init(|| UdpSocket::bind(("::", 0))).await {
            debug!(error = %e, "ipv6 bind failed, probing ipv4 only");
        }
        Ok(())
    }

    async fn ping_batch(&self, targets: &[SocketAddr]) -> Result<Vec<ProbeReply>, ProbeError> {
        if self.v4.get().is_none() && self.v6.get().is_none() {
            return Err(ProbeError::NotBound);
        }

        let mut pending: HashMap<SocketAddr, (u32, Instant)> = HashMap::new();
        for &target in targets {
            let socket = match target {
                SocketAddr::V4(_) => self.v4.get(),
                SocketAddr::V6(_) => self.v6.get(),
            };
            let Some(socket) = socket else {
                continue; // no socket for this family; reply stays unanswered
            };

            let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
            let mut frame = [0u8; FRAME_LEN];
            frame[0] = PING;
            frame[1..].copy_from_slice(&nonce.to_be_bytes());

            match socket.send_to(&frame, target).await {
                Ok(_) => {
                    pending.insert(target, (nonce, Instant::now()));
                }
                Err(e) => {
                    debug!(peer = %target, error = %e, "probe send failed");
                }
            }
        }

        let mut answered: HashMap<SocketAddr, f64> = HashMap::new();
        let deadline = Instant::now() + self.timeout;
        while answered.len() < pending.len() {
            let recv = tokio::time::timeout_at(deadline, recv_frame(self.v4.get(), self.v6.get()));
            match recv.await {
                Err(_) => break, // batch deadline; leftovers stay unanswered
                Ok(Err(e)) => return Err(ProbeError::Io(e)),
                Ok(Ok((frame, from))) => {
                    if frame[0] != PONG {
                        continue;
                    }
                    let mut nonce_bytes = [0u8; 4];
                    nonce_bytes.copy_from_slice(&frame[1..]);
                    let nonce = u32::from_be_bytes(nonce_bytes);
                    if let Some(&(expected, sent_at)) = pending.get(&from) {
                        if nonce == expected && !answered.contains_key(&from) {
                            answered.insert(from, sent_at.elapsed().as_secs_f64() * 1000.0);
                        }
                    }
                }
            }
        }

        Ok(targets
            .iter()
            .map(|&target| ProbeReply {
                target,
                time_ms: answered.get(&target).copied().unwrap_or(NO_RESPONSE_MS),
            })
            .collect())
    }
}

/// Receive one well-formed frame from whichever socket answers first.
async fn recv_frame(
    v4: Option<&UdpSocket>,
    v6: Option<&UdpSocket>,
) -> io::Result<([u8; FRAME_LEN], SocketAddr)> {
    async fn recv_one(socket: &UdpSocket) -> io::Result<([u8; FRAME_LEN], SocketAddr)> {
        let mut buf = [0u8; 64];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if n >= FRAME_LEN {
                let mut frame = [0u8; FRAME_LEN];
                frame.copy_from_slice(&buf[..FRAME_LEN]);
                return Ok((frame, from));
            }
        }
    }

    match (v4, v6) {
        (Some(a), Some(b)) => tokio::select! {
            r = recv_one(a) => r,
            r = recv_one(b) => r,
        },
        (Some(a), None) => recv_one(a).await,
        (None, Some(b)) => recv_one(b).await,
        (None, None) => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "no bound socket",
        )),
    }
}

/// Answer ping frames on `socket` until cancelled. This is the loop a relay
/// server runs alongside its forwarding duties; the CLI exposes it via the
/// `serve` subcommand for manual testing.
pub async fn run_responder(socket: UdpSocket, cancel: CancellationToken) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            recv = socket.recv_from(&mut buf) => {
                let (n, from) = recv?;
                if n >= FRAME_LEN && buf[0] == PING {
                    let mut frame = [0u8; FRAME_LEN];
                    frame.copy_from_slice(&buf[..FRAME_LEN]);
                    frame[0] = PONG;
                    socket.send_to(&frame, from).await?;
                }
            }
        }
    }
}
