//! Tunnel multiplexer: one socket, many logical connections.
//!
//! A tunnel owns the connection table and two tasks. The writer task
//! serially drains the outbound packet queue, wraps every packet in a
//! freshly masked binary frame and flushes it. The reader task decodes
//! frames, decodes packets with the pre-shared salt and dispatches them
//! by connection id. Logical connections never touch the socket: they
//! hold only their id, an inbound queue and a write handle to the
//! outbound queue.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::protocol::{close, packet, ConnId, Hello, Packet, PacketType};
use crate::ws::{self, Frame, FrameError};

pub mod conn;
pub mod connect;

pub use conn::{Conn, ConnReadHalf, ConnWriteHalf};
pub use connect::connect;

/// Capacity of a per-connection inbound queue, in packets. When a queue
/// fills up the reader task blocks on it, deliberately pausing the whole
/// tunnel until the consumer drains.
pub const INBOUND_QUEUE_CAPACITY: usize = 64;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Reaction to an incoming hello packet. The two endpoints differ: the
/// server dials the requested target and starts relaying, the client
/// completes the waiter of a pending open.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn on_hello(&self, tunnel: &Tunnel, cid: ConnId, data: &[u8]) -> anyhow::Result<()>;
}

pub(crate) struct OutboundPacket {
    bytes: Vec<u8>,
    /// Fired by the writer task once the packet has reached the socket.
    flushed: Option<oneshot::Sender<()>>,
}

/// Write handle shared by everything that produces outbound packets:
/// logical connections, the hello/close paths and the ping reply.
#[derive(Clone)]
pub(crate) struct PacketTx {
    out: mpsc::Sender<OutboundPacket>,
    rng: Arc<Mutex<StdRng>>,
    salt: u32,
}

impl PacketTx {
    fn encode(&self, p: &mut Packet) -> Vec<u8> {
        let mut rng = self.rng.lock();
        p.encode(&mut *rng, self.salt)
    }

    pub(crate) async fn send(&self, mut p: Packet) -> anyhow::Result<()> {
        let bytes = self.encode(&mut p);
        self.out
            .send(OutboundPacket {
                bytes,
                flushed: None,
            })
            .await
            .map_err(|_| anyhow!("tunnel is down"))
    }

    /// Enqueue a packet and return a receiver that fires once the writer
    /// has flushed it to the socket.
    pub(crate) async fn send_flushed(&self, mut p: Packet) -> anyhow::Result<oneshot::Receiver<()>> {
        let bytes = self.encode(&mut p);
        let (tx, rx) = oneshot::channel();
        self.out
            .send(OutboundPacket {
                bytes,
                flushed: Some(tx),
            })
            .await
            .map_err(|_| anyhow!("tunnel is down"))?;
        Ok(rx)
    }

    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock();
        f(&mut rng)
    }
}

struct ConnEntry {
    inbound: async_channel::Sender<Packet>,
    /// Pending open waiter, completed when the peer acknowledges the
    /// hello. Present only until the acknowledgement arrives.
    ack: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ConnTable {
    map: RwLock<HashMap<ConnId, ConnEntry>>,
}

impl ConnTable {
    fn insert(&self, cid: ConnId, entry: ConnEntry) {
        self.map.write().insert(cid, entry);
    }

    /// Dropping the entry drops the inbound sender, which ends the
    /// connection's queue: readers drain buffered packets and then
    /// observe end-of-stream.
    fn remove(&self, cid: &ConnId) -> bool {
        self.map.write().remove(cid).is_some()
    }

    fn inbound(&self, cid: &ConnId) -> Option<async_channel::Sender<Packet>> {
        self.map.read().get(cid).map(|e| e.inbound.clone())
    }

    fn contains(&self, cid: &ConnId) -> bool {
        self.map.read().contains_key(cid)
    }

    fn acknowledge(&self, cid: &ConnId) -> bool {
        let mut map = self.map.write();
        let Some(entry) = map.get_mut(cid) else {
            return false;
        };
        match entry.ack.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn clear(&self) {
        self.map.write().clear();
    }
}

/// Handle to a running tunnel. Cheap to clone; all clones share the
/// connection table, the outbound queue and the cancellation signal.
#[derive(Clone)]
pub struct Tunnel {
    conns: Arc<ConnTable>,
    tx: PacketTx,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Start serving a tunnel over an established transport socket.
    /// Spawns the reader and writer tasks and returns immediately.
    pub fn spawn<S>(socket: S, salt: u32, rng: StdRng, handler: Arc<dyn ConnectHandler>) -> Tunnel
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let tunnel = Tunnel {
            conns: Arc::new(ConnTable::default()),
            tx: PacketTx {
                out: out_tx,
                rng: Arc::new(Mutex::new(rng)),
                salt,
            },
            cancel: CancellationToken::new(),
        };

        let (rd, wr) = tokio::io::split(socket);
        tokio::spawn(write_loop(BufWriter::new(wr), out_rx, tunnel.clone()));
        tokio::spawn(read_loop(BufReader::new(rd), tunnel.clone(), handler));
        tunnel
    }

    pub fn salt(&self) -> u32 {
        self.tx.salt
    }

    /// Open a new logical connection to the given target. Sends a hello
    /// packet and returns the connection without waiting for the peer's
    /// acknowledgement; use [`Conn::acknowledged`] when it matters.
    pub async fn open(&self, hello: Hello) -> anyhow::Result<Conn> {
        let cid = self.tx.with_rng(ConnId::generate);
        let conn = self.attach(cid);
        let hello_packet = self
            .tx
            .with_rng(|rng| Packet::hello(rng, cid, &hello))
            .context("encode hello")?;
        if let Err(err) = self.tx.send(hello_packet).await {
            self.conns.remove(&cid);
            return Err(err);
        }
        debug!("opened connection (cid={cid}) to {}", hello.addr);
        Ok(conn)
    }

    /// Register a connection entry for the given id and hand out its
    /// local endpoint. Used directly by the server side, which learns
    /// the id from the wire instead of generating it.
    pub(crate) fn attach(&self, cid: ConnId) -> Conn {
        let (tx, rx) = async_channel::bounded(INBOUND_QUEUE_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.conns.insert(
            cid,
            ConnEntry {
                inbound: tx,
                ack: Some(ack_tx),
            },
        );
        Conn::new(cid, rx, ack_rx, self.tx.clone())
    }

    pub fn contains(&self, cid: &ConnId) -> bool {
        self.conns.contains(cid)
    }

    pub(crate) fn detach(&self, cid: &ConnId) {
        self.conns.remove(cid);
    }

    pub(crate) fn packet_tx(&self) -> &PacketTx {
        &self.tx
    }

    /// Request tunnel teardown: both tasks exit and every connection
    /// queue is closed so in-flight readers observe end-of-stream.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the tunnel has been torn down, by either side.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

async fn write_loop<W>(mut wr: W, mut out: mpsc::Receiver<OutboundPacket>, tunnel: Tunnel)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let mut item = tokio::select! {
            _ = tunnel.cancel.cancelled() => break,
            item = out.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mask = tunnel.tx.with_rng(|rng| {
            let mut mask = [0u8; 4];
            rng.fill_bytes(&mut mask);
            mask
        });
        let frame = Frame::binary(item.bytes, mask);

        let res = async {
            ws::write_frame(&mut wr, &frame).await?;
            wr.flush().await?;
            Ok::<_, FrameError>(())
        }
        .await;
        if let Err(err) = res {
            error!("send frame: {err}");
            break;
        }

        // A flushed close packet retires the connection entry, which in
        // turn ends its inbound queue. This happens before the flush
        // notification so the closing side observes the removal.
        if let Ok(PacketType::Close) = packet::peek_packet_type(&frame.data, tunnel.tx.salt) {
            if let Ok(cid) = packet::peek_conn_id(&frame.data, tunnel.tx.salt) {
                tunnel.detach(&cid);
                debug!("closed connection (cid={cid})");
            }
        }

        if let Some(flushed) = item.flushed.take() {
            let _ = flushed.send(());
        }
    }

    let _ = wr.shutdown().await;
    tunnel.shutdown();
}

async fn read_loop<R>(mut rd: R, tunnel: Tunnel, handler: Arc<dyn ConnectHandler>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = tunnel.cancel.cancelled() => break,
            res = ws::read_frame(&mut rd) => match res {
                Ok(frame) => frame,
                Err(FrameError::Eof) => {
                    debug!("tunnel closed by peer");
                    break;
                }
                // Framing errors mean the stream is desynchronized, no
                // way to recover except tearing the tunnel down.
                Err(err) => {
                    error!("read frame: {err}");
                    break;
                }
            },
        };

        match frame.op {
            ws::OpCode::Close => {
                debug!("tunnel close frame from peer");
                break;
            }
            ws::OpCode::Ping => continue,
            ws::OpCode::Binary | ws::OpCode::Text | ws::OpCode::Continuation => {}
        }

        // A malformed packet is logged and dropped; it does not take the
        // tunnel down with it.
        let packet = match Packet::decode(&frame.data, tunnel.tx.salt) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("drop bad packet: {err}");
                continue;
            }
        };

        dispatch(&tunnel, &handler, packet).await;
    }

    tunnel.shutdown();
    tunnel.conns.clear();
}

async fn dispatch(tunnel: &Tunnel, handler: &Arc<dyn ConnectHandler>, packet: Packet) {
    let cid = packet.cid;
    match packet.ptype {
        PacketType::Ping => {
            trace!("ping (cid={cid})");
            if let Err(err) = tunnel.tx.send(Packet::ping(cid)).await {
                warn!("ping reply: {err}");
            }
        }
        PacketType::Junk => {
            trace!("junk packet ({} bytes)", packet.data.len());
        }
        PacketType::Hello => {
            if let Err(err) = handler.on_hello(tunnel, cid, &packet.data).await {
                warn!("hello (cid={cid}): {err}");
            }
        }
        PacketType::Close => {
            let code = close::decode(&packet.data)
                .map(|c| c.to_string())
                .unwrap_or_else(|err| err.to_string());
            if tunnel.conns.remove(&cid) {
                debug!("peer closed connection (cid={cid}): {code}");
            } else {
                debug!("close for unknown connection (cid={cid}): {code}");
            }
        }
        PacketType::Data => {
            let Some(inbound) = tunnel.conns.inbound(&cid) else {
                warn!("data for unknown connection (cid={cid})");
                return;
            };
            // Blocks when the queue is full: intended backpressure, the
            // whole tunnel pauses until the consumer drains.
            if inbound.send(packet).await.is_err() {
                tunnel.conns.remove(&cid);
            }
        }
    }
}
