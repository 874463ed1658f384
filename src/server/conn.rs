//! Server connection and listener: version handshake, the background reader/dispatch/
//! writer tasks, and the `Tflush`-ordering guarantee tying them together.
//!
//! Grounded on the teacher's `srv.rs::{dispatch, srv_async_tcp, srv_async_unix,
//! srv_async}` (`tokio::spawn` one task per inbound message, a length-delimited
//! codec, a `TcpListener`/`UnixListener` accept loop spawning one connection task per
//! peer) with the flush-tracking and fid-refcount machinery `server/req.rs` and
//! `server/fid.rs` add on top, per §4.5 and §5.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs, UnixListener};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::fcall::{Fcall, Msg, P92000, P92000U, VERSION_UNKNOWN};
use crate::logger::{Direction, TraceLog};
use crate::options::Options;
use crate::serialize::{self, HEADER_SIZE};
use crate::server::dispatch::{self, DispatchCtx};
use crate::server::fid::FidTable;
use crate::server::ops::Filesystem;
use crate::server::req::OutstandingRequests;
use crate::users::Users;

/// Ceiling on frame size before `Tversion` has negotiated a real `Msize` (§6's
/// "practical ceiling 1 MiB").
const MAX_UNNEGOTIATED_SIZE: usize = 1 << 20;

/// Per-connection state shared by the reader, writer, and every per-request dispatch
/// task spawned off of it.
pub struct ServerConn<Fs: Filesystem> {
    fs: Arc<Fs>,
    users: Arc<dyn Users>,
    fids: FidTable<Fs::FidState>,
    outstanding: OutstandingRequests,
    /// 0 until `Tversion` completes; the reader bounds incoming frames by
    /// [`MAX_UNNEGOTIATED_SIZE`] until then.
    msize: AtomicU32,
    dotu: AtomicBool,
    /// This side's own ceiling/capability, from [`Options`]; `Tversion` negotiates
    /// `msize` down to `min(client, server_msize)` and only offers `.u` if both ends
    /// want it.
    server_msize: u32,
    server_dotu: bool,
    akaros: bool,
    auth_supported: bool,
    opened: AtomicBool,
    write_tx: mpsc::UnboundedSender<Msg>,
    trace: Arc<TraceLog>,
}

impl<Fs: Filesystem> ServerConn<Fs> {
    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    fn dotu(&self) -> bool {
        self.dotu.load(Ordering::Acquire)
    }

    fn ctx(&self) -> DispatchCtx<'_, Fs> {
        DispatchCtx {
            fs: self.fs.as_ref(),
            fids: &self.fids,
            users: self.users.as_ref(),
            msize: self.msize(),
            dotu: self.dotu(),
            auth_supported: self.auth_supported,
            akaros: self.akaros,
        }
    }

    fn send(&self, msg: Msg) {
        let _ = self.write_tx.send(msg);
    }
}

/// A 9P2000(.u) server bound to one [`Filesystem`] backend.
///
/// Grounded on the teacher's `srv_async_tcp`/`srv_async_unix`/`srv_async` trio: an
/// accept loop that spawns one connection task per peer. Methods take `&Arc<Self>` so
/// the accept loop can hand each spawned connection its own clone of the backend/users
/// without requiring `Fs: Clone` the way the teacher's `Filesystem: Send + Sync +
/// Clone` bound did — here the backend is always behind an `Arc` instead.
pub struct Server<Fs: Filesystem> {
    fs: Arc<Fs>,
    users: Arc<dyn Users>,
    options: Options,
}

impl<Fs: Filesystem> Server<Fs> {
    pub fn new(fs: Fs, users: Arc<dyn Users>, options: Options) -> Arc<Server<Fs>> {
        Arc::new(Server { fs: Arc::new(fs), users, options })
    }

    /// Run the version handshake and the reader/dispatch/writer tasks over an
    /// already-accepted transport. Returns once the connection is fully torn down
    /// (both background tasks have exited), after invoking
    /// [`Filesystem::conn_closed`].
    pub async fn serve_conn<T>(self: &Arc<Self>, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let auth_supported = self.fs.supports_auth();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let trace = Arc::new(TraceLog::new(256, self.options.debuglevel));

        let conn = Arc::new(ServerConn {
            fs: self.fs.clone(),
            users: self.users.clone(),
            fids: FidTable::new(),
            outstanding: OutstandingRequests::new(),
            msize: AtomicU32::new(0),
            dotu: AtomicBool::new(false),
            server_msize: self.options.msize,
            server_dotu: self.options.dotu,
            akaros: self.options.akaros,
            auth_supported,
            opened: AtomicBool::new(false),
            write_tx,
            trace,
        });

        let (read_half, write_half) = tokio::io::split(io);
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { run_reader(read_half, conn).await })
        };
        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { run_writer(write_half, write_rx, conn).await })
        };

        let _ = reader.await;
        drop(conn);
        let _ = writer.await;
        self.fs.conn_closed().await;
    }

    /// Accept TCP connections on `addr` forever, spawning one task per peer. Mirrors
    /// the teacher's `srv_async_tcp`.
    pub async fn serve_tcp(self: &Arc<Self>, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, _peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Accept Unix-domain connections on `path` forever, spawning one task per peer.
    /// The socket file is removed on drop, mirroring the teacher's `DeleteOnDrop`.
    pub async fn serve_unix(self: &Arc<Self>, path: impl AsRef<Path>) -> io::Result<()> {
        let guard = UnixSocketGuard::bind(path)?;
        loop {
            let (stream, _peer) = guard.listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }
}

struct UnixSocketGuard {
    path: PathBuf,
    listener: UnixListener,
}

impl UnixSocketGuard {
    fn bind(path: impl AsRef<Path>) -> io::Result<UnixSocketGuard> {
        let path = path.as_ref().to_owned();
        let listener = UnixListener::bind(&path)?;
        Ok(UnixSocketGuard { path, listener })
    }
}

impl Drop for UnixSocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn run_reader<R, Fs>(mut reader: R, conn: Arc<ServerConn<Fs>>)
where
    R: AsyncRead + Unpin,
    Fs: Filesystem,
{
    loop {
        let ceiling = match conn.msize() {
            0 => MAX_UNNEGOTIATED_SIZE,
            n => n as usize,
        };
        let msg = match read_frame(&mut reader, ceiling, conn.dotu()).await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        conn.trace.trace_fcall(Direction::Received, msg.tag, &msg.body);

        match msg.body {
            Fcall::Tversion { msize, version } => {
                handle_version(&conn, msg.tag, msize, version).await;
            }
            Fcall::Tflush { oldtag } => {
                let conn = conn.clone();
                tokio::spawn(async move {
                    // `fs.flush` is the backend's chance to interrupt the flushed
                    // request's still-running operation (e.g. a blocking read); it
                    // must run before/concurrently with waiting for that operation's
                    // own reply, or there is nothing left for it to cancel by the time
                    // it fires.
                    conn.fs.flush(oldtag).await;
                    conn.outstanding.await_flush_target(oldtag).await;
                    conn.send(Msg { tag: msg.tag, body: Fcall::Rflush });
                });
            }
            tc => {
                let tag = msg.tag;
                match conn.outstanding.insert(tag, tc.clone()).await {
                    None => {
                        // §3's tag-uniqueness invariant: a tag already in flight is a
                        // protocol violation, not silently overwritten.
                        conn.send(Msg {
                            tag,
                            body: Fcall::Rerror { ename: "tag already in use".into(), errnum: 0 },
                        });
                    }
                    Some(_req) => {
                        let conn = conn.clone();
                        tokio::spawn(async move {
                            let rc = dispatch::dispatch(&conn.ctx(), &tc).await;
                            conn.send(Msg { tag, body: rc });
                            conn.outstanding.complete(tag).await;
                        });
                    }
                }
            }
        }
    }
}

async fn run_writer<W, Fs>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Msg>, conn: Arc<ServerConn<Fs>>)
where
    W: AsyncWrite + Unpin,
    Fs: Filesystem,
{
    while let Some(msg) = rx.recv().await {
        conn.trace.trace_fcall(Direction::Sent, msg.tag, &msg.body);
        if write_frame(&mut writer, &msg, conn.dotu()).await.is_err() {
            break;
        }
    }
}

/// `Tversion`'s dispatch-bypassing special case (§4.5): quiesce every outstanding
/// request and drop every fid first, negotiate `Msize`/`Dotu`, then respond — this
/// must be the first response on the connection, which holds automatically since
/// nothing else can have been dispatched before the handshake completes.
async fn handle_version<Fs: Filesystem>(conn: &Arc<ServerConn<Fs>>, tag: u16, client_msize: u32, client_version: String) {
    conn.outstanding.clear().await;
    for fid in conn.fids.clear().await {
        conn.fs.fid_destroy(&fid).await;
    }

    let (reply_version, dotu) = match client_version.as_str() {
        P92000U if conn.server_dotu => (P92000U.to_owned(), true),
        P92000 | P92000U => (P92000.to_owned(), false),
        _ => (VERSION_UNKNOWN.to_owned(), false),
    };

    if reply_version == VERSION_UNKNOWN {
        conn.send(Msg { tag, body: Fcall::Rversion { msize: client_msize.min(conn.server_msize), version: reply_version } });
        return;
    }

    let negotiated_msize = client_msize.min(conn.server_msize);
    conn.msize.store(negotiated_msize, Ordering::Release);
    conn.dotu.store(dotu, Ordering::Release);
    conn.send(Msg { tag, body: Fcall::Rversion { msize: negotiated_msize, version: reply_version } });

    if conn.opened.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
        conn.fs.conn_opened().await;
    }
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, ceiling: usize, dotu: bool) -> Result<Msg, Error> {
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).await?;
    let size = u32::from_le_bytes(size_buf) as usize;
    if size < HEADER_SIZE {
        return Err(Error::proto("bad message size", 0));
    }
    if size > ceiling {
        return Err(Error::proto("bad message size", 0));
    }
    let mut rest = vec![0u8; size - 4];
    r.read_exact(&mut rest).await?;
    let mut framed = Vec::with_capacity(size);
    framed.extend_from_slice(&size_buf);
    framed.extend_from_slice(&rest);
    let (msg, _) = serialize::unpack(&framed, dotu)?;
    Ok(msg)
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &Msg, dotu: bool) -> Result<(), Error> {
    let bytes = serialize::pack(msg, dotu)?;
    w.write_all(&bytes).await?;
    Ok(())
}
