//! RTP transport: the PBX's ExternalMedia channel over UDP.
//!
//! Each call gets its own socket from a configured port range; the 4-tuple
//! locks to the first remote that sends us a packet (the PBX learns our
//! endpoint from channel origination, we learn theirs from the first
//! arrival). Inbound packets pass a small sequence-number reorder window;
//! outbound frames carry our own sequence/timestamp/SSRC at a 20ms cadence.
//!
//! Jitter and loss recovery beyond the reorder window is the remote's
//! problem: a missing packet becomes silence downstream, not a stall.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rtp_rs::{RtpPacketBuilder, RtpReader, Seq};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, Codec};
use crate::protocol_constants::{
    RTP_PAYLOAD_TYPE, RTP_RECV_BUFFER_BYTES, RTP_REORDER_DEPTH,
};

use super::{
    IngressBuffer, InboundFrame, Transport, TransportConnection, TransportError, TransportKind,
};

/// True when sequence `a` is older than `b` in wrapping u16 order.
#[inline]
fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

/// Small sequence-number reorder window.
///
/// Holds at most [`RTP_REORDER_DEPTH`] out-of-order packets; packets older
/// than the playout cursor are dropped and counted, and a window overflow
/// skips the gap rather than waiting forever for a lost packet.
#[derive(Debug, Default)]
struct ReorderWindow {
    next_seq: Option<u16>,
    pending: Vec<(u16, Bytes)>,
    late_dropped: u64,
    lost: u64,
}

impl ReorderWindow {
    /// Offers a packet; in-order payloads come back through `ready`.
    fn offer(&mut self, seq: u16, payload: Bytes, ready: &mut Vec<Bytes>) {
        let Some(next) = self.next_seq else {
            self.next_seq = Some(seq.wrapping_add(1));
            ready.push(payload);
            return;
        };

        if seq == next {
            ready.push(payload);
            self.advance_from(next.wrapping_add(1), ready);
        } else if seq_before(seq, next) {
            self.late_dropped += 1;
        } else {
            self.pending.push((seq, payload));
            if self.pending.len() > RTP_REORDER_DEPTH {
                // Window full: the missing packet is lost. Resume from the
                // earliest pending sequence.
                let earliest = self
                    .pending
                    .iter()
                    .map(|(s, _)| *s)
                    .min_by_key(|s| s.wrapping_sub(next))
                    .expect("pending is non-empty");
                self.lost += u64::from(earliest.wrapping_sub(next));
                let pos = self
                    .pending
                    .iter()
                    .position(|(s, _)| *s == earliest)
                    .expect("earliest is present");
                let (_, payload) = self.pending.swap_remove(pos);
                ready.push(payload);
                self.advance_from(earliest.wrapping_add(1), ready);
            }
        }
    }

    /// Drains consecutively-sequenced pending packets starting at `next`.
    fn advance_from(&mut self, mut next: u16, ready: &mut Vec<Bytes>) {
        loop {
            let Some(pos) = self.pending.iter().position(|(s, _)| *s == next) else {
                break;
            };
            let (_, payload) = self.pending.swap_remove(pos);
            ready.push(payload);
            next = next.wrapping_add(1);
        }
        self.next_seq = Some(next);
    }
}

/// UDP transport allocating one socket per call.
pub struct RtpTransport {
    bind_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    cursor: parking_lot::Mutex<u16>,
    conns: mpsc::Sender<Box<dyn TransportConnection>>,
    cancel: CancellationToken,
    /// Per-call watcher cancellation, for allocations that never connect.
    pending: Arc<DashMap<String, CancellationToken>>,
}

impl RtpTransport {
    /// Creates the transport. Sockets are bound lazily per call.
    #[must_use]
    pub fn new(
        bind_ip: IpAddr,
        port_min: u16,
        port_max: u16,
        conns: mpsc::Sender<Box<dyn TransportConnection>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bind_ip,
            port_min,
            port_max,
            cursor: parking_lot::Mutex::new(port_min),
            conns,
            cancel,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Binds a tuned UDP socket on the first free port of the range.
    fn bind_socket(&self) -> Result<UdpSocket, TransportError> {
        let span = usize::from(self.port_max - self.port_min) + 1;
        let mut cursor = self.cursor.lock();
        for _ in 0..span {
            let port = *cursor;
            *cursor = if port >= self.port_max {
                self.port_min
            } else {
                port + 1
            };

            let addr = SocketAddr::new(self.bind_ip, port);
            match bind_udp(addr) {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(TransportError::Bind(e)),
            }
        }
        Err(TransportError::EndpointExhausted)
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(RTP_RECV_BUFFER_BYTES)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[async_trait]
impl Transport for RtpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtp
    }

    async fn allocate_endpoint(&self, call_id: &str) -> Result<String, TransportError> {
        let socket = self.bind_socket()?;
        let local = socket.local_addr().map_err(TransportError::Bind)?;
        let endpoint = local.to_string();

        let watcher_cancel = self.cancel.child_token();
        self.pending
            .insert(call_id.to_string(), watcher_cancel.clone());

        let call_id = call_id.to_string();
        let conns = self.conns.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let socket = Arc::new(socket);
            let mut buf = vec![0u8; 2048];
            let first = tokio::select! {
                _ = watcher_cancel.cancelled() => {
                    log::debug!("[Rtp] {} endpoint released before first packet", call_id);
                    pending.remove(&call_id);
                    return;
                }
                received = socket.recv_from(&mut buf) => received,
            };
            pending.remove(&call_id);

            let (len, remote) = match first {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("[Rtp] {} socket failed before first packet: {}", call_id, e);
                    return;
                }
            };
            // Lock the 4-tuple to the first sender; everything else is
            // rejected by the kernel from here on.
            if let Err(e) = socket.connect(remote).await {
                log::warn!("[Rtp] {} failed to lock 4-tuple to {}: {}", call_id, remote, e);
                return;
            }
            log::info!("[Rtp] {} media locked to {} on {}", call_id, remote, local);

            let conn = RtpConnection::new(call_id.clone(), socket, &buf[..len]);
            if conns
                .send(Box::new(conn) as Box<dyn TransportConnection>)
                .await
                .is_err()
            {
                log::warn!("[Rtp] Connection channel closed, dropping call {}", call_id);
            }
        });

        Ok(endpoint)
    }

    fn release_endpoint(&self, call_id: &str) {
        if let Some((_, watcher)) = self.pending.remove(call_id) {
            watcher.cancel();
        }
    }
}

struct RecvState {
    buffer: IngressBuffer,
    reorder: ReorderWindow,
}

struct SendState {
    seq: u16,
    timestamp: u32,
}

/// One per-call RTP media connection.
pub struct RtpConnection {
    call_id: String,
    socket: Arc<UdpSocket>,
    ingress: parking_lot::RwLock<Codec>,
    recv: tokio::sync::Mutex<RecvState>,
    send: tokio::sync::Mutex<SendState>,
    ssrc: u32,
    closed: AtomicBool,
    outbound_dropped: AtomicU64,
}

impl RtpConnection {
    fn new(call_id: String, socket: Arc<UdpSocket>, first_packet: &[u8]) -> Self {
        let mut recv = RecvState {
            buffer: IngressBuffer::new(),
            reorder: ReorderWindow::default(),
        };
        ingest_packet(&call_id, first_packet, &mut recv);

        Self {
            call_id,
            socket,
            ingress: parking_lot::RwLock::new(Codec::pcm16(8000)),
            recv: tokio::sync::Mutex::new(recv),
            send: tokio::sync::Mutex::new(SendState {
                seq: rand_seed() as u16,
                timestamp: rand_seed(),
            }),
            ssrc: rand_seed(),
            closed: AtomicBool::new(false),
            outbound_dropped: AtomicU64::new(0),
        }
    }
}

/// Parses one RTP datagram into the reorder window.
///
/// A single unparseable packet is transient: logged and dropped, the
/// stream carries on.
fn ingest_packet(call_id: &str, datagram: &[u8], state: &mut RecvState) {
    match RtpReader::new(datagram) {
        Ok(reader) => {
            let seq = u16::from(reader.sequence_number());
            let payload = Bytes::copy_from_slice(reader.payload());
            let mut ready = Vec::new();
            state.reorder.offer(seq, payload, &mut ready);
            for payload in ready {
                state.buffer.push(payload);
            }
        }
        Err(e) => {
            log::debug!("[Rtp] {} dropped unparseable packet: {:?}", call_id, e);
        }
    }
}

/// Cheap process-local randomness for SSRC and sequence seeds; RTP only
/// needs these to be unlikely to collide across restarts.
fn rand_seed() -> u32 {
    use std::hash::{BuildHasher, Hasher};
    std::collections::hash_map::RandomState::new()
        .build_hasher()
        .finish() as u32
}

#[async_trait]
impl TransportConnection for RtpConnection {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn configure(&self, ingress: Codec) {
        *self.ingress.write() = ingress;
    }

    async fn read_frame(&self, gap_deadline: Duration) -> Result<InboundFrame, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let ingress = *self.ingress.read();
        let mut state = self.recv.lock().await;
        let mut buf = vec![0u8; 2048];

        loop {
            if let Some(payload) = state.buffer.pop_frame(ingress) {
                return Ok(InboundFrame::Live(AudioFrame::new(payload, ingress)));
            }

            match timeout(gap_deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return Ok(InboundFrame::Gap(AudioFrame::silence(ingress))),
                Ok(Err(e)) => {
                    return Err(match e.kind() {
                        std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused => TransportError::Closed,
                        _ => TransportError::Io(e),
                    });
                }
                Ok(Ok(len)) => ingest_packet(&self.call_id, &buf[..len], &mut state),
            }
        }
    }

    async fn write_frame(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut send = self.send.lock().await;
        let packet = RtpPacketBuilder::new()
            .payload_type(RTP_PAYLOAD_TYPE)
            .ssrc(self.ssrc)
            .sequence(Seq::from(send.seq))
            .timestamp(send.timestamp)
            .payload(&frame.payload)
            .build()
            .map_err(|e| TransportError::MalformedFrame(format!("rtp build: {e:?}")))?;

        let samples = frame.payload.len() / frame.codec.encoding.bytes_per_sample();
        send.seq = send.seq.wrapping_add(1);
        send.timestamp = send.timestamp.wrapping_add(samples as u32);
        drop(send);

        // try_send keeps the pacer non-blocking; a full socket buffer costs
        // this frame, counted.
        match self.socket.try_send(&packet) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn outbound_dropped(&self) -> u64 {
        self.outbound_dropped.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        // UDP has no farewell; dropping the socket is the close.
        self.closed.store(true, Ordering::SeqCst);
        log::debug!("[Rtp] {} closed", self.call_id);
    }
}
