//! AudioSocket transport: framed PCM over TCP.
//!
//! Wire format per the vendor spec: `{type: u8, length: u16 BE, payload}`.
//! The first frame on every connection is a 16-byte UUID that correlates
//! the TCP stream to a call; audio frames are signed 16-bit little-endian
//! mono PCM at the negotiated rate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioFrame, Codec};
use crate::protocol_constants::{
    AUDIOSOCKET_KIND_AUDIO, AUDIOSOCKET_KIND_TERMINATE, AUDIOSOCKET_KIND_UUID,
    AUDIOSOCKET_MAX_PAYLOAD, AUDIOSOCKET_UUID_LEN, FRAME_DURATION_MS,
};

use super::{
    IngressBuffer, InboundFrame, Transport, TransportConnection, TransportError, TransportKind,
};

/// How long a fresh connection may take to send its UUID frame before we
/// drop it as garbage.
const CORRELATION_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP listener accepting AudioSocket media connections.
///
/// All calls share one listener; the UUID frame correlates each connection
/// to its call. Correlated connections are delivered on the channel handed
/// to [`AudioSocketTransport::new`].
pub struct AudioSocketTransport {
    bind: SocketAddr,
    advertise: String,
    conns: mpsc::Sender<Box<dyn TransportConnection>>,
    cancel: CancellationToken,
}

impl AudioSocketTransport {
    /// Creates the transport. Call [`run`](Self::run) to start accepting.
    #[must_use]
    pub fn new(
        bind: SocketAddr,
        advertise: String,
        conns: mpsc::Sender<Box<dyn TransportConnection>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bind,
            advertise,
            conns,
            cancel,
        }
    }

    /// Accept loop. Runs until the cancellation token fires.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(TransportError::Bind)?;
        log::info!("[AudioSocket] Listening on {}", self.bind);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("[AudioSocket] Listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("[AudioSocket] Accept failed: {}", e);
                            continue;
                        }
                    };
                    let conns = self.conns.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        match correlate(stream).await {
                            Ok(conn) => {
                                log::info!(
                                    "[AudioSocket] Connection from {} correlated to call {}",
                                    peer,
                                    conn.call_id()
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    result = conns.send(Box::new(conn) as Box<dyn TransportConnection>) => {
                                        if result.is_err() {
                                            log::warn!("[AudioSocket] Connection channel closed, dropping {}", peer);
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("[AudioSocket] Dropping connection from {}: {}", peer, e);
                            }
                        }
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Transport for AudioSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::AudioSocket
    }

    async fn allocate_endpoint(&self, _call_id: &str) -> Result<String, TransportError> {
        // One shared listener; the UUID frame does the correlating.
        Ok(self.advertise.clone())
    }

    fn release_endpoint(&self, _call_id: &str) {
        // Nothing reserved per call.
    }
}

/// Reads the correlation frame and wraps the stream into a connection.
async fn correlate(stream: TcpStream) -> Result<AudioSocketConnection, TransportError> {
    let (mut read_half, write_half) = stream.into_split();

    let (kind, payload) = timeout(CORRELATION_TIMEOUT, read_raw_frame(&mut read_half))
        .await
        .map_err(|_| TransportError::NotCorrelated)??;

    if kind != AUDIOSOCKET_KIND_UUID || payload.len() != AUDIOSOCKET_UUID_LEN {
        return Err(TransportError::MalformedFrame(format!(
            "expected uuid frame, got type {kind:#04x} with {} bytes",
            payload.len()
        )));
    }
    let call_id = Uuid::from_slice(&payload)
        .map_err(|e| TransportError::MalformedFrame(format!("bad uuid payload: {e}")))?
        .to_string();

    Ok(AudioSocketConnection::new(call_id, read_half, write_half))
}

/// Reads one `{type, len, payload}` frame off the wire.
async fn read_raw_frame(half: &mut OwnedReadHalf) -> Result<(u8, Bytes), TransportError> {
    let kind = half.read_u8().await.map_err(map_io)?;
    let len = half.read_u16().await.map_err(map_io)? as usize;
    if len > AUDIOSOCKET_MAX_PAYLOAD {
        return Err(TransportError::MalformedFrame(format!(
            "payload of {len} bytes exceeds protocol maximum"
        )));
    }
    let mut payload = vec![0u8; len];
    half.read_exact(&mut payload).await.map_err(map_io)?;
    Ok((kind, Bytes::from(payload)))
}

fn map_io(e: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}

struct ReadState {
    half: OwnedReadHalf,
    buffer: IngressBuffer,
}

/// One correlated AudioSocket media connection.
pub struct AudioSocketConnection {
    call_id: String,
    ingress: parking_lot::RwLock<Codec>,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: Arc<AtomicBool>,
    outbound_dropped: AtomicU64,
}

impl AudioSocketConnection {
    fn new(call_id: String, read_half: OwnedReadHalf, write_half: OwnedWriteHalf) -> Self {
        Self {
            call_id,
            ingress: parking_lot::RwLock::new(Codec::pcm16(8000)),
            reader: tokio::sync::Mutex::new(ReadState {
                half: read_half,
                buffer: IngressBuffer::new(),
            }),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            closed: Arc::new(AtomicBool::new(false)),
            outbound_dropped: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TransportConnection for AudioSocketConnection {
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
        let mut state = self.reader.lock().await;

        loop {
            if let Some(payload) = state.buffer.pop_frame(ingress) {
                return Ok(InboundFrame::Live(AudioFrame::new(payload, ingress)));
            }

            // Gap detection only covers the wait for the type byte: a
            // single-byte read either completes or consumes nothing, so a
            // timeout here cannot desynchronize the framing.
            let kind = match timeout(gap_deadline, state.half.read_u8()).await {
                Err(_) => return Ok(InboundFrame::Gap(AudioFrame::silence(ingress))),
                Ok(result) => result.map_err(map_io)?,
            };

            let len = state.half.read_u16().await.map_err(map_io)? as usize;
            if len > AUDIOSOCKET_MAX_PAYLOAD {
                return Err(TransportError::MalformedFrame(format!(
                    "payload of {len} bytes exceeds protocol maximum"
                )));
            }
            let mut payload = vec![0u8; len];
            state.half.read_exact(&mut payload).await.map_err(map_io)?;

            match kind {
                AUDIOSOCKET_KIND_AUDIO => state.buffer.push(Bytes::from(payload)),
                AUDIOSOCKET_KIND_TERMINATE => {
                    log::info!("[AudioSocket] {} remote terminated", self.call_id);
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
                // A duplicate UUID frame is harmless chatter; skip it.
                AUDIOSOCKET_KIND_UUID => {}
                other => {
                    return Err(TransportError::MalformedFrame(format!(
                        "unknown frame type {other:#04x}"
                    )));
                }
            }
        }
    }

    async fn write_frame(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut header = [0u8; 3];
        header[0] = AUDIOSOCKET_KIND_AUDIO;
        header[1..3].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };

        // Bounded write: a peer that stops draining costs at most one frame
        // interval, then we drop and count rather than stall the pacer.
        let deadline = Duration::from_millis(u64::from(FRAME_DURATION_MS));
        let write = async {
            writer.write_all(&header).await?;
            writer.write_all(&frame.payload).await?;
            Ok::<(), std::io::Error>(())
        };
        match timeout(deadline, write).await {
            Err(_) => {
                self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("[AudioSocket] {} outbound frame dropped (slow peer)", self.call_id);
                Ok(())
            }
            Ok(result) => result.map_err(map_io),
        }
    }

    fn outbound_dropped(&self) -> u64 {
        self.outbound_dropped.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            // Best-effort terminate frame so the PBX tears its leg down
            // promptly instead of waiting on TCP timeouts.
            let terminate = [AUDIOSOCKET_KIND_TERMINATE, 0, 0];
            let _ = timeout(Duration::from_millis(100), writer.write_all(&terminate)).await;
            let _ = writer.shutdown().await;
        }
        log::debug!("[AudioSocket] {} closed", self.call_id);
    }
}
