//! Transport & Message Router: real TCP sockets, one connection
//! per peer pair, length-prefixed JSON framing, and the generic gossip/echo
//! relay discipline every message kind shares.
//!
//! Grounded in `bach-network`'s `codec.rs`/`service.rs` split: a codec that
//! knows nothing about consensus, a per-connection reader/writer pair, and a
//! handful of commands/events crossing an mpsc channel into the rest of the
//! node. The one deliberate departure is the wire payload itself — JSON
//! instead of bincode, per the self-describing `{type, content, sender}`
//! envelope this protocol calls for.

use crate::error::{EngineError, EngineResult};
use crate::message::{Envelope, Message};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
const LENGTH_PREFIX_SIZE: usize = 4;

/// Wire format: `[length: u32 BE][JSON-encoded Envelope]`.
#[derive(Debug, Default)]
pub struct MessageCodec {
    decode_state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingLength,
    ReadingPayload {
        length: usize,
    },
}

impl Decoder for MessageCodec {
    type Item = Envelope;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if length > MAX_MESSAGE_SIZE {
                        return Err(EngineError::Decode(format!(
                            "frame of {length} bytes exceeds max {MAX_MESSAGE_SIZE}"
                        )));
                    }
                    src.advance(LENGTH_PREFIX_SIZE);
                    self.decode_state = DecodeState::ReadingPayload { length };
                }
                DecodeState::ReadingPayload { length } => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    let payload = src.split_to(length);
                    self.decode_state = DecodeState::ReadingLength;
                    let envelope: Envelope = serde_json::from_slice(&payload)
                        .map_err(|e| EngineError::Decode(e.to_string()))?;
                    return Ok(Some(envelope));
                }
            }
        }
    }
}

impl Encoder<Envelope> for MessageCodec {
    type Error = EngineError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item).map_err(|e| EngineError::Decode(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(EngineError::Decode(format!(
                "frame of {} bytes exceeds max {MAX_MESSAGE_SIZE}",
                payload.len()
            )));
        }
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Bounded FIFO of recently seen message digests, for the gossip dedup rule:
/// new messages are delivered and relayed once, already-seen ones dropped.
struct SeenCache {
    set: HashSet<crate::digest::Digest>,
    order: VecDeque<crate::digest::Digest>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        SeenCache {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert_if_new(&mut self, digest: crate::digest::Digest) -> bool {
        if !self.set.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// Strips away any number of `Echo` wrappers to find the original envelope
/// (and its original sender), independent of how many hops relayed it.
fn canonical(envelope: &Envelope) -> &Envelope {
    match &envelope.message {
        Message::Echo(inner) => canonical(inner),
        _ => envelope,
    }
}

/// Wraps `envelope` for one more relay hop, flattening nested echoes to
/// depth one so a message never grows with each hop it travels.
fn as_relay(envelope: &Envelope, relayer: usize) -> Envelope {
    let inner = canonical(envelope).clone();
    Envelope::new(Message::Echo(Box::new(inner)), relayer)
}

pub struct TransportConfig {
    pub id: usize,
    pub listen_addr: SocketAddr,
    /// Every other participant in the run, known upfront.
    pub peers: HashMap<usize, SocketAddr>,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub seen_cache_capacity: usize,
}

impl TransportConfig {
    pub fn new(id: usize, listen_addr: SocketAddr, peers: HashMap<usize, SocketAddr>) -> Self {
        TransportConfig {
            id,
            listen_addr,
            peers,
            reconnect_initial_backoff: Duration::from_millis(200),
            reconnect_max_backoff: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            seen_cache_capacity: 4096,
        }
    }
}

enum Command {
    Broadcast(Envelope),
    SendTo(usize, Envelope),
    Shutdown,
}

/// The handle the rest of the node uses to talk to the transport's
/// background tasks. Cheap to clone.
#[derive(Clone)]
pub struct TransportHandle {
    id: usize,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    pub fn broadcast(&self, message: Message) {
        let envelope = Envelope::new(message, self.id);
        let _ = self.cmd_tx.send(Command::Broadcast(envelope));
    }

    pub fn reply_to(&self, peer: usize, message: Message) {
        let envelope = Envelope::new(message, self.id);
        let _ = self.cmd_tx.send(Command::SendTo(peer, envelope));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

type WriterMap = Arc<Mutex<HashMap<usize, mpsc::UnboundedSender<Envelope>>>>;

/// Starts the listener, the outbound connections to higher-id peers, and the
/// command/dispatch loop. Returns a handle for sending and a channel that
/// yields every new, deduplicated inbound message (including this node's own
/// broadcasts are *not* looped back — only genuinely remote messages appear
/// here).
pub async fn spawn(
    config: TransportConfig,
) -> EngineResult<(TransportHandle, mpsc::UnboundedReceiver<Envelope>)> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| EngineError::Bind {
            port: config.listen_addr.port(),
            source,
        })?;

    let writers: WriterMap = Arc::new(Mutex::new(HashMap::new()));
    let seen = Arc::new(Mutex::new(SeenCache::new(config.seen_cache_capacity)));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

    let self_id = config.id;

    // Accept loop: peers with a smaller id dial us.
    {
        let writers = writers.clone();
        let seen = seen.clone();
        let inbound_tx = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "accepted connection");
                        let writers = writers.clone();
                        let seen = seen.clone();
                        let inbound_tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                run_connection(stream, self_id, writers, seen, inbound_tx).await
                            {
                                tracing::warn!(error = %e, %addr, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });
    }

    // Dial loop: we connect out to every peer with a larger id, retrying
    // with bounded backoff.
    for (&peer_id, &addr) in config.peers.iter() {
        if peer_id <= self_id {
            continue;
        }
        let writers = writers.clone();
        let seen = seen.clone();
        let inbound_tx = inbound_tx.clone();
        let initial_backoff = config.reconnect_initial_backoff;
        let max_backoff = config.reconnect_max_backoff;
        let max_attempts = config.max_reconnect_attempts;
        tokio::spawn(async move {
            let mut backoff = initial_backoff;
            for attempt in 1..=max_attempts {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        if let Err(e) = run_connection(
                            stream,
                            self_id,
                            writers.clone(),
                            seen.clone(),
                            inbound_tx.clone(),
                        )
                        .await
                        {
                            tracing::warn!(error = %e, peer = peer_id, "connection to peer ended");
                        }
                        backoff = initial_backoff;
                    }
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            peer = peer_id,
                            attempt,
                            "dial failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, max_backoff);
                    }
                }
            }
            tracing::warn!(peer = peer_id, "giving up on reconnecting to peer");
        });
    }

    // Command loop: owns the outbound side. Self-originated messages are
    // marked seen immediately so a gossip loop-back never re-delivers them.
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Broadcast(envelope) => {
                    seen.lock().await.insert_if_new(envelope.digest());
                    let writers = writers.lock().await;
                    for writer in writers.values() {
                        let _ = writer.send(envelope.clone());
                    }
                }
                Command::SendTo(peer, envelope) => {
                    seen.lock().await.insert_if_new(envelope.digest());
                    if let Some(writer) = writers.lock().await.get(&peer) {
                        let _ = writer.send(envelope.clone());
                    }
                }
                Command::Shutdown => break,
            }
        }
    });

    Ok((
        TransportHandle {
            id: self_id,
            cmd_tx,
        },
        inbound_rx,
    ))
}

/// Handshake, then pump frames in both directions for one peer connection.
/// The handshake is a raw 8-byte little-endian peer id exchanged before the
/// framed codec takes over — deliberately outside the `Message` enum, since
/// it never reaches the consensus layer.
async fn run_connection(
    mut stream: TcpStream,
    self_id: usize,
    writers: WriterMap,
    seen: Arc<Mutex<SeenCache>>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
) -> EngineResult<()> {
    stream.write_all(&(self_id as u64).to_le_bytes()).await?;
    let mut peer_id_buf = [0u8; 8];
    stream.read_exact(&mut peer_id_buf).await?;
    let peer_id = u64::from_le_bytes(peer_id_buf) as usize;

    let (read_half, write_half) = stream.into_split();
    let mut framed_read = FramedRead::new(read_half, MessageCodec::default());
    let mut framed_write = FramedWrite::new(write_half, MessageCodec::default());

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Envelope>();
    writers.lock().await.insert(peer_id, writer_tx);

    let writer_task = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(envelope) = writer_rx.recv().await {
            if framed_write.send(envelope).await.is_err() {
                break;
            }
        }
    });

    use futures::StreamExt;
    while let Some(frame) = framed_read.next().await {
        let envelope = match frame {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, peer = peer_id, "decode error, dropping frame");
                continue;
            }
        };

        let digest = canonical(&envelope).digest();
        let is_new = seen.lock().await.insert_if_new(digest);
        if !is_new {
            continue;
        }

        let delivered = canonical(&envelope).clone();
        let _ = inbound_tx.send(delivered);

        let relay = as_relay(&envelope, self_id);
        let peers = writers.lock().await;
        for (&other, writer) in peers.iter() {
            if other != peer_id {
                let _ = writer.send(relay.clone());
            }
        }
    }

    writers.lock().await.remove(&peer_id);
    writer_task.abort();
    Ok(())
}
