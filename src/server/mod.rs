//! Server-side connection, fid table, dispatch, and the pluggable [`Filesystem`]
//! backend contract.
//!
//! Grounded on the teacher's `srv.rs`, split along the same lines §4.5 describes:
//! a fid table (`fid.rs`), an outstanding-request map (`req.rs`), the per-type
//! dispatch match (`dispatch.rs`), and the reader/writer/listener plumbing
//! (`conn.rs`). `tree.rs` is the optional in-memory name-tree helper from §4.6.

mod conn;
mod dispatch;
mod fid;
mod ops;
mod req;
mod tree;

pub use conn::{Server, ServerConn};
pub use fid::{FidTable, SrvFid};
pub use ops::Filesystem;
pub use req::{OutstandingRequests, SrvReq};
pub use tree::{Node, NodeOps, NoOps, Tree};
