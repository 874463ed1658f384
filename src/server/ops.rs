//! The backend operations interface the dispatcher invokes.
//!
//! Grounded on the teacher's `Filesystem` trait (`rs9p-rs9p/crates/rs9p/src/srv.rs`):
//! an `async_trait` with an associated per-fid state type and default `EOPNOTSUPP`
//! bodies for everything optional. Narrowed from the teacher's 9P2000.L operation set
//! down to the plain 9P2000(.u) set this crate actually dispatches (§4.5), and
//! generalized per DESIGN NOTES §9 ("Fid Aux") to return typed values (`Qid`, `Dir`,
//! ...) rather than raw `Fcall` variants — the dispatcher in `dispatch.rs` is the only
//! place that builds response `Fcall`s, replacing the teacher's one-call-to-exactly-one-
//! Respond* discipline (`original_source/go9p/srv_respond.go`) with the type system.

use async_trait::async_trait;

use crate::error::{string, Error};
use crate::fcall::{Dir, Qid};
use crate::server::fid::SrvFid;
use crate::users::User;

/// Required and optional backend operations for one 9P2000(.u) connection.
///
/// `FidState` is the opaque per-fid backend payload (an open file descriptor, a tree
/// node handle, ...) DESIGN NOTES §9 asks for in place of a dynamically-typed `Aux`
/// escape hatch; the server's [`crate::server::fid::FidTable`] stores it directly.
/// It must be `Clone`: a zero-name `Twalk` is handled by the dispatcher alone, by
/// cloning the starting fid's state, without calling into the backend at all (most
/// backends key this off a cheaply-`Clone`able handle — `Arc<Node>`, a path buffer —
/// so the bound costs nothing in practice).
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// Per-fid backend state. Composite backends (the spec's `Procfs` case) are
    /// expected to make this a tagged enum over their sub-backends' own state types.
    type FidState: Send + Sync + Clone;

    // --- required ops (§4.5's "the set the dispatcher requires") ---

    /// `Tattach`. `afid` is the already-authenticated fid from a prior `Tauth`, if
    /// any. Returns the root qid plus the new fid's backend state.
    async fn attach(
        &self,
        afid: Option<&SrvFid<Self::FidState>>,
        user: &User,
        aname: &str,
    ) -> Result<(Qid, Self::FidState), Error>;

    /// `Twalk`, one path component at a time. The dispatcher calls this once per name
    /// in `wnames`, each time against a fresh (un-shared) fid view holding the state
    /// the previous step produced; it never calls this for a zero-name walk (see
    /// `FidState`'s `Clone` bound above).
    ///
    /// Implementations don't need to separately enforce DMEXEC on intermediate
    /// directories: the dispatcher checks that itself, via [`Filesystem::stat`],
    /// before descending past every non-final component (REDESIGN FLAGS / §9's
    /// walk-permission decision).
    async fn walk(&self, fid: &SrvFid<Self::FidState>, name: &str) -> Result<(Qid, Self::FidState), Error>;

    /// `Topen`. Returns the (possibly updated) qid and the server's preferred iounit
    /// (0 meaning "let the connection's msize decide").
    async fn open(&self, fid: &SrvFid<Self::FidState>, mode: u8) -> Result<(Qid, u32), Error>;

    /// `Tcreate`. `fid` is the (unopened, directory) parent; on success it refers to
    /// the newly created child, so a fresh backend state is returned for it.
    async fn create(
        &self,
        fid: &SrvFid<Self::FidState>,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<(Qid, u32, Self::FidState), Error>;

    /// `Tread`.
    async fn read(&self, fid: &SrvFid<Self::FidState>, offset: u64, count: u32) -> Result<Vec<u8>, Error>;

    /// `Twrite`.
    async fn write(&self, fid: &SrvFid<Self::FidState>, offset: u64, data: &[u8]) -> Result<u32, Error>;

    /// `Tclunk`'s logical half: release whatever the fid represents at the protocol
    /// level. Defaults to a no-op, since most backends have nothing to validate here
    /// (the unconditional resource teardown lives in [`Filesystem::fid_destroy`]).
    async fn clunk(&self, _fid: &SrvFid<Self::FidState>) -> Result<(), Error> {
        Ok(())
    }

    /// `Tremove`. The dispatcher clunks the fid regardless of this call's outcome.
    async fn remove(&self, fid: &SrvFid<Self::FidState>) -> Result<(), Error>;

    /// `Tstat`.
    async fn stat(&self, fid: &SrvFid<Self::FidState>) -> Result<Dir, Error>;

    /// `Twstat`. Implementations that don't honor a given field should return
    /// `permission denied` rather than silently ignoring it (§4.5).
    async fn wstat(&self, fid: &SrvFid<Self::FidState>, stat: &Dir) -> Result<(), Error>;

    // --- optional auth hooks ---

    /// Whether this backend wants to participate in `Tauth` at all. Probed once at
    /// connection setup and cached, per DESIGN NOTES §9 ("capability probes" instead
    /// of per-request dynamic queries).
    fn supports_auth(&self) -> bool {
        false
    }

    /// `Tauth`. Only called when [`Filesystem::supports_auth`] returns `true`. There
    /// is no existing fid to pass in here — `afid` is being created by this very
    /// call — so the backend is handed the raw identity instead and returns the qid
    /// and state the dispatcher should file the new afid under.
    async fn auth_init(&self, _user: &User, _aname: &str) -> Result<(Qid, Self::FidState), Error> {
        Err(Error::proto(string::EAUTHNOTREQ, 0))
    }

    /// Validate auth data already written via [`Filesystem::auth_write`]. Returning
    /// `Ok(())` authorizes the pending `Tattach`/`Tauth` that referenced this afid.
    async fn auth_check(&self, _afid: &SrvFid<Self::FidState>) -> Result<(), Error> {
        Ok(())
    }

    async fn auth_read(&self, _afid: &SrvFid<Self::FidState>, _offset: u64, _count: u32) -> Result<Vec<u8>, Error> {
        Err(Error::No(nix::errno::Errno::EOPNOTSUPP))
    }

    async fn auth_write(&self, _afid: &SrvFid<Self::FidState>, _offset: u64, _data: &[u8]) -> Result<u32, Error> {
        Err(Error::No(nix::errno::Errno::EOPNOTSUPP))
    }

    async fn auth_destroy(&self, _afid: &SrvFid<Self::FidState>) {}

    // --- optional lifecycle hooks ---

    /// Unconditional, infallible cleanup once a fid's refcount reaches zero (after a
    /// successful [`Filesystem::clunk`] or a [`Filesystem::remove`] of either
    /// outcome). The unique destruction callback per fid, per §5's refcount policy.
    async fn fid_destroy(&self, _fid: &SrvFid<Self::FidState>) {}

    /// Called once, right after a connection's version handshake completes.
    async fn conn_opened(&self) {}

    /// Called once the connection's reader/writer tasks have both exited.
    async fn conn_closed(&self) {}

    /// Notification that `tag` was flushed. The default dispatch model (§9) lets the
    /// original request run to completion regardless, so this is advisory only —
    /// useful for backends that track long-running operations and want to cancel
    /// their own side effects (e.g. stop a blocking read early).
    async fn flush(&self, _tag: u16) {}
}
