//! Client connection: version handshake, tag-multiplexed RPC, and flush.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::Error;
use crate::fcall::{Fcall, Msg, NOFID, NOTAG, P92000, P92000U, VERSION_UNKNOWN};
use crate::idpool::IdPool;
use crate::logger::{Direction, TraceLog};
use crate::options::Options;
use crate::serialize::{self, MessageCodec};
use std::sync::Arc;

/// Client fids aren't preallocated across the full 32-bit `NOFID` space — doing so
/// would mean parking four billion ids in a channel at connection setup. Instead the
/// pool covers a much smaller practical range; a connection that legitimately needs
/// more concurrently open fids than this can raise it via [`Options`].
pub const DEFAULT_FID_CAPACITY: u32 = 1 << 16;

type PendingReply = oneshot::Sender<std::result::Result<Fcall, Error>>;

/// A live connection to a 9P server: version-negotiated, tag-multiplexed, with a
/// background reader and writer task.
///
/// Mirrors the teacher's per-connection task-spawning pattern in `srv.rs::dispatch`
/// (one task draining a framed reader, a shared writer guarded so only one task at a
/// time touches the socket), generalized to the client side: instead of dispatching
/// into a backend, the reader here demultiplexes replies by tag back to whichever
/// caller is awaiting them.
pub struct Connection {
    msize: u32,
    dotu: bool,
    tags: IdPool,
    fids: IdPool,
    outstanding: Mutex<HashMap<u16, PendingReply>>,
    live_fids: Mutex<HashSet<u32>>,
    write_tx: mpsc::UnboundedSender<Msg>,
    terminal: Arc<AtomicBool>,
    trace: Arc<TraceLog>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("msize", &self.msize)
            .field("dotu", &self.dotu)
            .field("terminal", &self.terminal.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Perform the version handshake over `transport`, then spawn the reader/writer
    /// tasks and return a ready-to-use connection.
    ///
    /// No message besides `Tversion` may cross the wire before this returns; the
    /// handshake is done directly on `transport`, ahead of splitting it for the
    /// background tasks.
    pub async fn connect<T>(mut transport: T, options: Options) -> std::result::Result<Arc<Connection>, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let version = if options.dotu { P92000U } else { P92000 };
        let proposed = Msg {
            tag: NOTAG,
            body: Fcall::Tversion { msize: options.msize, version: version.to_owned() },
        };
        write_frame(&mut transport, &proposed, options.dotu).await?;
        let reply = read_frame(&mut transport, options.dotu).await?;

        let (negotiated_msize, negotiated_dotu) = match reply.body {
            Fcall::Rversion { msize, version } => {
                if version == VERSION_UNKNOWN {
                    return Err(Error::proto("version negotiation failed", 0));
                }
                if msize > options.msize {
                    return Err(Error::proto("server proposed a larger msize than offered", 0));
                }
                (msize, version == P92000U)
            }
            Fcall::Rerror { ename, errnum } => return Err(Error::Proto(ename, errnum)),
            _ => return Err(Error::proto("unexpected reply to Tversion", 0)),
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let codec = MessageCodec::new(negotiated_msize, negotiated_dotu);
        let framed_read = FramedRead::new(read_half, codec.clone());
        let framed_write = FramedWrite::new(write_half, codec);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let outstanding: Mutex<HashMap<u16, PendingReply>> = Mutex::new(HashMap::new());
        let terminal = Arc::new(AtomicBool::new(false));
        let trace = Arc::new(TraceLog::new(256, options.debuglevel));

        let conn = Arc::new(Connection {
            msize: negotiated_msize,
            dotu: negotiated_dotu,
            tags: IdPool::new(0, NOTAG as u32),
            fids: IdPool::new(0, DEFAULT_FID_CAPACITY.min(NOFID)),
            outstanding,
            live_fids: Mutex::new(HashSet::new()),
            write_tx,
            terminal: terminal.clone(),
            trace: trace.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = {
            let conn = conn.clone();
            tokio::spawn(async move { run_reader(framed_read, conn).await })
        };
        let writer_task = {
            let conn = conn.clone();
            tokio::spawn(async move { run_writer(framed_write, write_rx, conn).await })
        };
        conn.tasks.lock().expect("tasks mutex poisoned").extend([reader_task, writer_task]);

        Ok(conn)
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn dotu(&self) -> bool {
        self.dotu
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Send `body` as a fresh request, wait for its matching reply, and release the
    /// tag. An `Rerror` reply is turned into `Err`; everything else is returned as-is.
    pub async fn rpc(&self, body: Fcall) -> std::result::Result<Fcall, Error> {
        if self.is_terminal() {
            return Err(Error::proto("connection closed", 0));
        }
        let tag = self.tags.get().await;
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().expect("outstanding mutex poisoned").insert(tag, tx);

        let msg = Msg { tag, body };
        self.trace.trace_fcall(Direction::Sent, tag, &msg.body);
        if self.write_tx.send(msg).is_err() {
            self.outstanding.lock().expect("outstanding mutex poisoned").remove(&tag);
            self.tags.put(tag);
            return Err(Error::proto("connection closed", 0));
        }

        let result = match rx.await {
            Ok(Ok(Fcall::Rerror { ename, errnum })) => Err(Error::Proto(ename, errnum)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::proto("connection closed", 0)),
        };
        self.tags.put(tag);
        result
    }

    /// Cancel an in-flight `rpc` identified by `oldtag`.
    ///
    /// If `oldtag`'s reply has already been delivered (the race the protocol allows),
    /// this is a no-op beyond the round trip. Otherwise, once `Rflush` comes back, the
    /// original waiter is force-completed with a "request flushed" error — its own
    /// `rpc()` call releases `oldtag` back to the pool when its `rx.await` wakes with
    /// that error, so this must not also release it here, or the tag gets returned to
    /// the pool twice for one logical release.
    pub async fn flush(&self, oldtag: u16) -> std::result::Result<(), Error> {
        match self.rpc(Fcall::Tflush { oldtag }).await? {
            Fcall::Rflush => {
                let pending = self.outstanding.lock().expect("outstanding mutex poisoned").remove(&oldtag);
                if let Some(tx) = pending {
                    let _ = tx.send(Err(Error::proto("request flushed", 0)));
                }
                Ok(())
            }
            other => Err(Error::proto(format!("unexpected reply to Tflush: {:?}", other), 0)),
        }
    }

    pub(crate) async fn alloc_fid(&self) -> u32 {
        let id = self.fids.get().await;
        self.live_fids.lock().expect("live fids mutex poisoned").insert(id);
        id
    }

    pub(crate) fn free_fid(&self, fid: u32) {
        self.live_fids.lock().expect("live fids mutex poisoned").remove(&fid);
        self.fids.put(fid);
    }

    /// Clunk every fid this connection has allocated and not yet released, then shut
    /// down the reader/writer tasks.
    pub async fn close(&self) {
        let live: Vec<u32> = self.live_fids.lock().expect("live fids mutex poisoned").iter().copied().collect();
        for fid in live {
            let _ = self.rpc(Fcall::Tclunk { fid }).await;
            self.free_fid(fid);
        }
        self.terminal.store(true, Ordering::Release);
        fail_all(&self.outstanding, || Error::proto("connection closed", 0));
        for task in self.tasks.lock().expect("tasks mutex poisoned").drain(..) {
            task.abort();
        }
    }
}

fn fail_all(outstanding: &Mutex<HashMap<u16, PendingReply>>, mk_err: impl Fn() -> Error) {
    let mut map = outstanding.lock().expect("outstanding mutex poisoned");
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(mk_err()));
    }
}

async fn run_reader<R>(mut framed: FramedRead<R, MessageCodec>, conn: Arc<Connection>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(msg)) => {
                conn.trace.trace_fcall(Direction::Received, msg.tag, &msg.body);
                let waiter = conn.outstanding.lock().expect("outstanding mutex poisoned").remove(&msg.tag);
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(msg.body));
                }
            }
            Some(Err(e)) => {
                conn.terminal.store(true, Ordering::Release);
                fail_all(&conn.outstanding, || Error::from(io_error_clone(&e)));
                break;
            }
            None => {
                conn.terminal.store(true, Ordering::Release);
                fail_all(&conn.outstanding, || Error::proto("connection closed", 0));
                break;
            }
        }
    }
}

async fn run_writer<W>(
    mut framed: FramedWrite<W, MessageCodec>,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    conn: Arc<Connection>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = framed.send(msg).await {
            conn.terminal.store(true, Ordering::Release);
            fail_all(&conn.outstanding, || Error::from(io_error_clone(&e)));
            break;
        }
    }
}

fn io_error_clone(e: &std::io::Error) -> std::io::Error {
    std::io::Error::new(e.kind(), e.to_string())
}

async fn write_frame<T: AsyncWrite + Unpin>(t: &mut T, msg: &Msg, dotu: bool) -> std::result::Result<(), Error> {
    let bytes = serialize::pack(msg, dotu)?;
    t.write_all(&bytes).await?;
    Ok(())
}

async fn read_frame<T: AsyncRead + Unpin>(t: &mut T, dotu: bool) -> std::result::Result<Msg, Error> {
    let mut size_buf = [0u8; 4];
    t.read_exact(&mut size_buf).await?;
    let size = u32::from_le_bytes(size_buf) as usize;
    if size < 4 {
        return Err(Error::proto("bad message size", 0));
    }
    let mut rest = vec![0u8; size - 4];
    t.read_exact(&mut rest).await?;
    let mut framed = Vec::with_capacity(size);
    framed.extend_from_slice(&size_buf);
    framed.extend_from_slice(&rest);
    let (msg, _) = serialize::unpack(&framed, dotu)?;
    Ok(msg)
}
