//! Client-side connection, fid, and mount handling.
//!
//! The teacher crate this is grounded on is server-only; there's no client-side
//! analogue to generalize from directly, so this module is written fresh in the same
//! task-spawning, channel-driven idiom `srv.rs` uses on the server side (one reader
//! task, one writer task, per-request completion via a one-shot channel).

mod conn;
mod fid;
mod mount;

pub use conn::Connection;
pub use fid::{read_all, File, Fid};
pub use mount::Client;
