//! `Client::mount`/`unmount`: attach a connection's root fid and tear it down cleanly.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;
use crate::options::Options;
use crate::users::User;

use super::conn::Connection;
use super::fid::Fid;

/// A mounted 9P connection: the underlying [`Connection`] plus the root fid obtained
/// by attaching.
pub struct Client {
    pub conn: Arc<Connection>,
    pub root: Fid,
}

impl Client {
    /// Perform the version handshake over `transport`, then attach as `user` to
    /// `aname` to obtain the root fid.
    pub async fn mount<T>(transport: T, options: Options, user: Arc<User>, aname: &str) -> Result<Client, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Connection::connect(transport, options).await?;
        let root = Fid::attach(conn.clone(), None, user, aname).await?;
        Ok(Client { conn, root })
    }

    /// Clunk every fid this client ever allocated and still holds, then shut down the
    /// connection's background tasks.
    pub async fn unmount(self) {
        self.conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Fcall, Msg, Qid, NOTAG, P92000};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn mount_attaches_root_and_unmount_clunks_it() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut server_io = server_io;

            let mut size_buf = [0u8; 4];
            server_io.read_exact(&mut size_buf).await.unwrap();
            let size = u32::from_le_bytes(size_buf) as usize;
            let mut rest = vec![0u8; size - 4];
            server_io.read_exact(&mut rest).await.unwrap();

            let reply = Msg { tag: NOTAG, body: Fcall::Rversion { msize: 8192, version: P92000.to_owned() } };
            let bytes = crate::serialize::pack(&reply, false).unwrap();
            server_io.write_all(&bytes).await.unwrap();

            server_io.read_exact(&mut size_buf).await.unwrap();
            let size = u32::from_le_bytes(size_buf) as usize;
            let mut rest = vec![0u8; size - 4];
            server_io.read_exact(&mut rest).await.unwrap();
            let mut framed = Vec::new();
            framed.extend_from_slice(&size_buf);
            framed.extend_from_slice(&rest);
            let (attach_req, _) = crate::serialize::unpack(&framed, false).unwrap();

            let reply = Msg {
                tag: attach_req.tag,
                body: Fcall::Rattach { qid: Qid { typ: crate::fcall::QidType::DIR, version: 0, path: 1 } },
            };
            let bytes = crate::serialize::pack(&reply, false).unwrap();
            server_io.write_all(&bytes).await.unwrap();

            server_io.read_exact(&mut size_buf).await.unwrap();
            let size = u32::from_le_bytes(size_buf) as usize;
            let mut rest = vec![0u8; size - 4];
            server_io.read_exact(&mut rest).await.unwrap();
            let mut framed = Vec::new();
            framed.extend_from_slice(&size_buf);
            framed.extend_from_slice(&rest);
            let (clunk_req, _) = crate::serialize::unpack(&framed, false).unwrap();
            let reply = Msg { tag: clunk_req.tag, body: Fcall::Rclunk };
            let bytes = crate::serialize::pack(&reply, false).unwrap();
            server_io.write_all(&bytes).await.unwrap();
        });

        let user = Arc::new(User { uid: 0, name: "root".into() });
        let client = Client::mount(client_io, Options::default(), user, "/").await.unwrap();
        assert_eq!(client.root.qid().path, 1);

        client.unmount().await;
        server.await.unwrap();
    }
}
