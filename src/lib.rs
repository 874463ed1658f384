#![forbid(unsafe_code)]
//! Asynchronous 9P2000 (and 9P2000.u) client and server core.
//!
//! This crate provides the tokio-based message codec, tag/fid lifecycle, and
//! connection machinery for the 9P file-service protocol, the same wire protocol
//! Plan 9 and Linux's v9fs module speak. It does not ship a filesystem: servers
//! plug in a backend implementing [`server::Filesystem`]; clients get a high-level
//! [`client::Fid`]/[`client::File`] wrapper over [`client::Client::mount`].
//!
//! # Overview
//!
//! 9P is a tag-multiplexed, full-duplex protocol over an ordered byte-stream
//! transport. A connection negotiates a maximum message size (`Msize`) and whether
//! `.u` (Unix) extensions are in play, then exchanges request/response pairs
//! correlated by a 16-bit tag. Clients address server-side state through 32-bit
//! fids, allocated on attach or walk and released on clunk.
//!
//! # Getting started (server)
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use ninep::error::Error;
//! use ninep::fcall::{Dir, Qid};
//! use ninep::options::Options;
//! use ninep::server::{Filesystem, Server, SrvFid};
//! use ninep::users::{OsUsers, User};
//!
//! #[derive(Clone, Default)]
//! struct MyFidState;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FidState = MyFidState;
//!
//!     async fn attach(
//!         &self,
//!         _afid: Option<&SrvFid<Self::FidState>>,
//!         _user: &User,
//!         _aname: &str,
//!     ) -> Result<(Qid, Self::FidState), Error> {
//!         unimplemented!("construct the root qid/state for this backend")
//!     }
//!     // ... the rest of the required operations (walk/open/create/read/write/
//!     // clunk/remove/stat/wstat)
//! # async fn walk(&self, _: &SrvFid<Self::FidState>, _: &str) -> Result<(Qid, Self::FidState), Error> { unimplemented!() }
//! # async fn open(&self, _: &SrvFid<Self::FidState>, _: u8) -> Result<(Qid, u32), Error> { unimplemented!() }
//! # async fn create(&self, _: &SrvFid<Self::FidState>, _: &str, _: u32, _: u8, _: &str) -> Result<(Qid, u32, Self::FidState), Error> { unimplemented!() }
//! # async fn read(&self, _: &SrvFid<Self::FidState>, _: u64, _: u32) -> Result<Vec<u8>, Error> { unimplemented!() }
//! # async fn write(&self, _: &SrvFid<Self::FidState>, _: u64, _: &[u8]) -> Result<u32, Error> { unimplemented!() }
//! # async fn remove(&self, _: &SrvFid<Self::FidState>) -> Result<(), Error> { unimplemented!() }
//! # async fn stat(&self, _: &SrvFid<Self::FidState>) -> Result<Dir, Error> { unimplemented!() }
//! # async fn wstat(&self, _: &SrvFid<Self::FidState>, _: &Dir) -> Result<(), Error> { unimplemented!() }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::new(MyFs, Arc::new(OsUsers::default()), Options::default());
//!     server.serve_tcp(("127.0.0.1", ninep::fcall::V9FS_PORT)).await
//! }
//! ```
//!
//! # Error handling
//!
//! Backend operations return [`error::Error`]; the dispatcher converts any `Err`
//! into an `Rerror` carrying the 9P2000 error string and, when `.u` is negotiated,
//! the errno. Client-side, an `Rerror` reply surfaces as that same [`error::Error`]
//! from the call that provoked it.
//!
//! # Concurrency model
//!
//! Each connection runs a reader task, a writer task, and (server-side) a
//! dispatcher; they communicate only through bounded channels and the fid/tag
//! tables, never shared mutable queues without a lock. See `DESIGN.md` for the
//! grounding of each piece.

pub mod client;
pub mod error;
pub mod fcall;
pub mod idpool;
pub mod logger;
pub mod options;
pub mod serialize;
pub mod server;
pub mod users;

pub use crate::error::Error;
pub use crate::fcall::{Dir, Fcall, Msg, Qid, QidType};
pub use crate::options::Options;

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
