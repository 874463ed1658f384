//! Per-type dispatch: turns one decoded `Fcall` request into exactly one `Fcall`
//! response, validating fid/tag state before delegating to the connection's
//! [`Filesystem`].
//!
//! Grounded on the teacher's `dispatch_once` (`rs9p-rs9p/crates/rs9p/src/srv.rs`) and
//! `original_source/go9p/srv_respond.go`'s exhaustive `Respond*` match, generalized to
//! the plain 9P2000(.u) operation set (§4.5) and restructured around the typed
//! `Filesystem` return values `server/ops.rs` uses instead of raw `Fcall`s.

use std::sync::Arc;

use nix::errno::Errno;

use crate::error::{string, Error};
use crate::fcall::{dm, om, Dir, Fcall, Qid, QidType, IOHDRSZ, NOFID, NONUNAME};
use crate::server::fid::{FidTable, SrvFid};
use crate::server::ops::Filesystem;
use crate::users::{User, Users};

/// Everything [`dispatch`] needs beyond the request itself, borrowed from the owning
/// [`crate::server::conn::ServerConn`] for the duration of one call.
pub struct DispatchCtx<'a, Fs: Filesystem> {
    pub fs: &'a Fs,
    pub fids: &'a FidTable<Fs::FidState>,
    pub users: &'a dyn Users,
    pub msize: u32,
    pub dotu: bool,
    /// Probed once via [`Filesystem::supports_auth`] at connection setup (DESIGN
    /// NOTES §9's capability-probe guidance) rather than re-queried per `Tauth`.
    pub auth_supported: bool,
    /// Akaros-compat mode (§4.1/§6): prefix every `Rerror` string with its errno as
    /// four hex digits, so legacy decoders without `.u` can still recover the number.
    pub akaros: bool,
}

/// Dispatch one request, turning any `Err` into an `Rerror`.
///
/// Never called for `Tversion` (handled inline by the connection, ahead of the
/// outstanding-request bookkeeping — §4.5's "clears all outstanding work... must be
/// the first response") or `Tflush` (handled by the connection via
/// [`crate::server::req::OutstandingRequests::await_flush_target`], since releasing
/// it requires visibility into requests this function doesn't have).
pub async fn dispatch<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, tc: &Fcall) -> Fcall {
    match handle(ctx, tc).await {
        Ok(rc) => rc,
        Err(e) => {
            let mut ename = e.ename();
            if ctx.akaros {
                ename = format!("{:04x} {}", e.errno(), ename);
            }
            Fcall::Rerror { ename, errnum: if ctx.dotu { e.errno() } else { 0 } }
        }
    }
}

async fn handle<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, tc: &Fcall) -> Result<Fcall, Error> {
    match tc {
        Fcall::Tauth { afid, uname, aname, n_uname } => do_auth(ctx, *afid, uname, aname, *n_uname).await,
        Fcall::Tattach { fid, afid, uname, aname, n_uname } => {
            do_attach(ctx, *fid, *afid, uname, aname, *n_uname).await
        }
        Fcall::Twalk { fid, newfid, wnames } => do_walk(ctx, *fid, *newfid, wnames).await,
        Fcall::Topen { fid, mode } => do_open(ctx, *fid, *mode).await,
        Fcall::Tcreate { fid, name, perm, mode, extension } => {
            do_create(ctx, *fid, name, *perm, *mode, extension).await
        }
        Fcall::Tread { fid, offset, count } => do_read(ctx, *fid, *offset, *count).await,
        Fcall::Twrite { fid, offset, data } => do_write(ctx, *fid, *offset, data).await,
        Fcall::Tclunk { fid } => do_clunk(ctx, *fid).await,
        Fcall::Tremove { fid } => do_remove(ctx, *fid).await,
        Fcall::Tstat { fid } => do_stat(ctx, *fid).await,
        Fcall::Twstat { fid, stat } => do_wstat(ctx, *fid, stat).await,
        _ => Err(Error::proto("unexpected message type for dispatch", 0)),
    }
}

async fn get_fid<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32) -> Result<Arc<SrvFid<Fs::FidState>>, Error> {
    ctx.fids.get(fid).await.ok_or(Error::No(Errno::EBADF))
}

/// `.u` prefers the numeric `n_uname`; plain 9P2000 only ever has `uname`.
fn resolve_user(users: &dyn Users, uname: &str, n_uname: u32) -> Result<Arc<User>, Error> {
    if n_uname != NONUNAME {
        if let Some(u) = users.uid2user(n_uname) {
            return Ok(u);
        }
    }
    if !uname.is_empty() {
        if let Some(u) = users.uname2user(uname) {
            return Ok(u);
        }
    }
    Err(Error::proto("unknown user", Errno::EINVAL as i32 as u32))
}

/// Owner-or-other DMEXEC check. There's no secondary group-membership query on
/// [`Users`] (see DESIGN.md), so unlike [`crate::server::tree::Node::check_perm`] —
/// which takes group membership from its caller — this generic dispatch-level check
/// only ever grants the owner or other bits, never the group ones.
fn has_exec(dir: &Dir, user: &User) -> bool {
    let shift = if dir.n_uid != NONUNAME && dir.n_uid == user.uid { 6 } else { 0 };
    (dir.mode >> shift) & dm::EXEC != 0
}

async fn do_auth<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    afid: u32,
    uname: &str,
    aname: &str,
    n_uname: u32,
) -> Result<Fcall, Error> {
    if !ctx.auth_supported {
        return Err(Error::proto(string::EAUTHNOTREQ, 0));
    }
    let user = resolve_user(ctx.users, uname, n_uname)?;
    let (qid, state) = ctx.fs.auth_init(&user, aname).await?;
    let entry = Arc::new(SrvFid::new(afid, qid, state).with_user(user));
    if !ctx.fids.insert(afid, entry).await {
        return Err(Error::proto(string::EFIDINUSE, 0));
    }
    Ok(Fcall::Rauth { aqid: qid })
}

async fn do_attach<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    fid: u32,
    afid: u32,
    uname: &str,
    aname: &str,
    n_uname: u32,
) -> Result<Fcall, Error> {
    let user = resolve_user(ctx.users, uname, n_uname)?;
    let auth_fid = if afid == NOFID {
        None
    } else {
        let entry = get_fid(ctx, afid).await?;
        ctx.fs.auth_check(&entry).await?;
        Some(entry)
    };
    let (qid, state) = ctx.fs.attach(auth_fid.as_deref(), &user, aname).await?;
    let entry = Arc::new(SrvFid::new(fid, qid, state).with_user(user));
    if !ctx.fids.insert(fid, entry).await {
        return Err(Error::proto(string::EFIDINUSE, 0));
    }
    Ok(Fcall::Rattach { qid })
}

/// Resolve a single `Twalk` step from `(cur_qid, cur_state)`, checking DMEXEC on the
/// directory being descended through first. Used for every component, including the
/// first (against the starting fid itself).
async fn walk_one<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    fid_num: u32,
    cur_qid: Qid,
    cur_state: &Fs::FidState,
    user: &Option<Arc<User>>,
    name: &str,
) -> Result<(Qid, Fs::FidState), Error> {
    if !cur_qid.typ.contains(QidType::DIR) {
        return Err(Error::No(Errno::ENOTDIR));
    }
    let mut cursor = SrvFid::new(fid_num, cur_qid, cur_state.clone());
    if let Some(u) = user {
        cursor = cursor.with_user(u.clone());
    }
    if let Some(u) = user {
        let dir = ctx.fs.stat(&cursor).await?;
        if !has_exec(&dir, u) {
            return Err(Error::No(Errno::EACCES));
        }
    }
    ctx.fs.walk(&cursor, name).await
}

async fn do_walk<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    fid: u32,
    newfid: u32,
    wnames: &[String],
) -> Result<Fcall, Error> {
    let start = get_fid(ctx, fid).await?;
    if start.is_opened() {
        return Err(Error::proto("fid already open", 0));
    }

    if wnames.is_empty() {
        // Walk-in-place (`newfid == fid`) is still one logical reference, so the
        // refcount carries over unchanged; a genuinely new fid number is a second
        // live reference to the same backend object and bumps it (§4.5/§9).
        let clone = if newfid == fid {
            start.reclone(start.qid().await, start.state.clone())
        } else {
            start.share(newfid, start.qid().await, start.state.clone())
        };
        install_walk_result(ctx, fid, newfid, Arc::new(clone)).await?;
        return Ok(Fcall::Rwalk { wqids: Vec::new() });
    }

    let user = start.user.clone();
    let mut qids = Vec::with_capacity(wnames.len());
    let mut cur_qid = start.qid().await;
    let mut cur_state = start.state.clone();

    for (i, name) in wnames.iter().enumerate() {
        match walk_one(ctx, fid, cur_qid, &cur_state, &user, name).await {
            Ok((qid, state)) => {
                qids.push(qid);
                cur_qid = qid;
                cur_state = state;
            }
            Err(e) if i == 0 => return Err(e),
            Err(_) => break,
        }
    }

    if qids.len() == wnames.len() {
        let mut resolved = SrvFid::new(newfid, cur_qid, cur_state);
        if let Some(u) = user {
            resolved = resolved.with_user(u);
        }
        install_walk_result(ctx, fid, newfid, Arc::new(resolved)).await?;
    }

    Ok(Fcall::Rwalk { wqids: qids })
}

/// Newfid must be unused unless it equals the starting fid (walk-in-place), in which
/// case the table entry is replaced outright rather than inserted.
async fn install_walk_result<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    fid: u32,
    newfid: u32,
    entry: Arc<SrvFid<Fs::FidState>>,
) -> Result<(), Error> {
    if newfid == fid {
        ctx.fids.replace(newfid, entry).await;
    } else if !ctx.fids.insert(newfid, entry).await {
        return Err(Error::proto(string::EFIDINUSE, 0));
    }
    Ok(())
}

async fn do_open<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32, mode: u8) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    if entry.is_opened() {
        return Err(Error::proto("fid already open", 0));
    }
    let qid = entry.qid().await;
    if qid.typ.contains(QidType::DIR) && (mode & om::MASK) != om::READ {
        return Err(Error::No(Errno::EISDIR));
    }
    let (new_qid, iounit) = ctx.fs.open(&entry, mode).await?;
    entry.set_qid(new_qid).await;
    entry.set_mode(mode).await;
    entry.set_opened(true);
    Ok(Fcall::Ropen { qid: new_qid, iounit })
}

async fn do_create<Fs: Filesystem>(
    ctx: &DispatchCtx<'_, Fs>,
    fid: u32,
    name: &str,
    perm: u32,
    mode: u8,
    extension: &str,
) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    if entry.is_opened() {
        return Err(Error::proto("fid already open", 0));
    }
    let qid = entry.qid().await;
    if !qid.typ.contains(QidType::DIR) {
        return Err(Error::No(Errno::ENOTDIR));
    }
    let special = dm::SYMLINK | dm::LINK | dm::DEVICE | dm::NAMEDPIPE | dm::SOCKET;
    if !ctx.dotu && (perm & special) != 0 {
        return Err(Error::No(Errno::EINVAL));
    }
    let (new_qid, iounit, new_state) = ctx.fs.create(&entry, name, perm, mode, extension).await?;
    let mut child = SrvFid::new(fid, new_qid, new_state);
    if let Some(u) = entry.user.clone() {
        child = child.with_user(u);
    }
    child.set_mode(mode).await;
    child.set_opened(true);
    ctx.fids.replace(fid, Arc::new(child)).await;
    Ok(Fcall::Rcreate { qid: new_qid, iounit })
}

async fn do_read<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32, offset: u64, count: u32) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    let mode = entry.mode().await.ok_or_else(|| Error::proto("fid not open", 0))?;
    if (mode & om::MASK) == om::WRITE {
        return Err(Error::No(Errno::EBADF));
    }
    if count > ctx.msize.saturating_sub(IOHDRSZ) {
        return Err(Error::No(Errno::EMSGSIZE));
    }

    let qid = entry.qid().await;
    if qid.typ.contains(QidType::DIR) {
        if offset != entry.diroffset() {
            return Err(Error::proto(string::EBADOFFSET, 0));
        }
        let data = ctx.fs.read(&entry, offset, count).await?;
        entry.set_diroffset(offset + data.len() as u64);
        return Ok(Fcall::Rread { data });
    }

    let data = ctx.fs.read(&entry, offset, count).await?;
    Ok(Fcall::Rread { data })
}

async fn do_write<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32, offset: u64, data: &[u8]) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    let mode = entry.mode().await.ok_or_else(|| Error::proto("fid not open", 0))?;
    if (mode & om::MASK) == om::READ {
        return Err(Error::No(Errno::EBADF));
    }
    if data.len() as u32 > ctx.msize.saturating_sub(IOHDRSZ) {
        return Err(Error::No(Errno::EMSGSIZE));
    }
    let count = ctx.fs.write(&entry, offset, data).await?;
    Ok(Fcall::Rwrite { count })
}

/// Shared by `Tclunk`/`Tremove`: the fid number is always released, regardless of the
/// backend call's outcome; the backend object itself is destroyed only once its
/// refcount reaches zero.
async fn finish_clunk<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32, entry: &Arc<SrvFid<Fs::FidState>>) {
    ctx.fids.remove(fid).await;
    if entry.decref() == 0 {
        ctx.fs.fid_destroy(entry).await;
    }
}

async fn do_clunk<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    let result = ctx.fs.clunk(&entry).await;
    finish_clunk(ctx, fid, &entry).await;
    result?;
    Ok(Fcall::Rclunk)
}

async fn do_remove<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    let result = ctx.fs.remove(&entry).await;
    finish_clunk(ctx, fid, &entry).await;
    result?;
    Ok(Fcall::Rremove)
}

async fn do_stat<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    let stat = ctx.fs.stat(&entry).await?;
    Ok(Fcall::Rstat { stat })
}

async fn do_wstat<Fs: Filesystem>(ctx: &DispatchCtx<'_, Fs>, fid: u32, stat: &Dir) -> Result<Fcall, Error> {
    let entry = get_fid(ctx, fid).await?;
    ctx.fs.wstat(&entry, stat).await?;
    Ok(Fcall::Rwstat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::NONUNAME;
    use crate::users::Group;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Node {
        path: &'static str,
    }

    struct TestFs {
        destroy_count: AtomicUsize,
    }

    fn root_qid() -> Qid {
        Qid { typ: QidType::DIR, version: 0, path: 1 }
    }

    fn file_qid() -> Qid {
        Qid { typ: QidType::FILE, version: 0, path: 2 }
    }

    #[async_trait]
    impl Filesystem for TestFs {
        type FidState = Node;

        async fn attach(&self, _afid: Option<&SrvFid<Node>>, _user: &User, _aname: &str) -> Result<(Qid, Node), Error> {
            Ok((root_qid(), Node { path: "" }))
        }

        async fn walk(&self, fid: &SrvFid<Node>, name: &str) -> Result<(Qid, Node), Error> {
            if fid.state.path.is_empty() && name == "file.txt" {
                Ok((file_qid(), Node { path: "file.txt" }))
            } else {
                Err(Error::No(Errno::ENOENT))
            }
        }

        async fn open(&self, fid: &SrvFid<Node>, _mode: u8) -> Result<(Qid, u32), Error> {
            Ok((fid.qid().await, 0))
        }

        async fn create(&self, _fid: &SrvFid<Node>, _name: &str, _perm: u32, _mode: u8, _ext: &str) -> Result<(Qid, u32, Node), Error> {
            Err(Error::No(Errno::EOPNOTSUPP))
        }

        async fn read(&self, fid: &SrvFid<Node>, _offset: u64, _count: u32) -> Result<Vec<u8>, Error> {
            if fid.state.path == "file.txt" {
                Ok(b"hi".to_vec())
            } else {
                Ok(Vec::new())
            }
        }

        async fn write(&self, _fid: &SrvFid<Node>, _offset: u64, _data: &[u8]) -> Result<u32, Error> {
            Err(Error::No(Errno::EOPNOTSUPP))
        }

        async fn remove(&self, _fid: &SrvFid<Node>) -> Result<(), Error> {
            Err(Error::No(Errno::EOPNOTSUPP))
        }

        async fn stat(&self, fid: &SrvFid<Node>) -> Result<Dir, Error> {
            if fid.state.path.is_empty() {
                Ok(Dir { mode: 0o755, n_uid: 0, qid: root_qid(), name: "/".into(), ..Default::default() })
            } else {
                Ok(Dir { mode: 0o644, n_uid: 0, qid: file_qid(), name: "file.txt".into(), length: 2, ..Default::default() })
            }
        }

        async fn wstat(&self, _fid: &SrvFid<Node>, _stat: &Dir) -> Result<(), Error> {
            Err(Error::No(Errno::EPERM))
        }

        async fn fid_destroy(&self, _fid: &SrvFid<Node>) {
            self.destroy_count.fetch_add(1, Ordering::SeqCst);
        }

        fn supports_auth(&self) -> bool {
            true
        }

        async fn auth_init(&self, user: &User, _aname: &str) -> Result<(Qid, Node), Error> {
            if user.name == "root" {
                Ok((Qid { typ: QidType::AUTH, version: 0, path: 3 }, Node { path: "auth" }))
            } else {
                Err(Error::No(Errno::EPERM))
            }
        }
    }

    struct OneUser;
    impl Users for OneUser {
        fn uid2user(&self, uid: u32) -> Option<Arc<User>> {
            if uid == 0 {
                Some(Arc::new(User { uid: 0, name: "root".into() }))
            } else {
                None
            }
        }
        fn gid2group(&self, _gid: u32) -> Option<Arc<Group>> {
            None
        }
        fn uname2user(&self, name: &str) -> Option<Arc<User>> {
            if name == "root" {
                self.uid2user(0)
            } else {
                None
            }
        }
        fn gname2group(&self, _name: &str) -> Option<Arc<Group>> {
            None
        }
    }

    fn ctx<'a>(fs: &'a TestFs, fids: &'a FidTable<Node>, users: &'a OneUser) -> DispatchCtx<'a, TestFs> {
        DispatchCtx { fs, fids, users, msize: 8192, dotu: true, auth_supported: false, akaros: false }
    }

    async fn attach(fs: &TestFs, fids: &FidTable<Node>, users: &OneUser) {
        let reply = dispatch(
            &ctx(fs, fids, users),
            &Fcall::Tattach { fid: 0, afid: NOFID, uname: "root".into(), aname: "/".into(), n_uname: NONUNAME },
        )
        .await;
        assert!(matches!(reply, Fcall::Rattach { .. }));
    }

    #[tokio::test]
    async fn attach_then_stat_round_trips() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tstat { fid: 0 }).await;
        match reply {
            Fcall::Rstat { stat } => assert_eq!(stat.name, "/"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn walk_resolves_existing_child_and_allocates_newfid() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(
            &ctx(&fs, &fids, &users),
            &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["file.txt".into()] },
        )
        .await;
        match reply {
            Fcall::Rwalk { wqids } => assert_eq!(wqids, vec![file_qid()]),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(fids.contains(1).await);
    }

    #[tokio::test]
    async fn walk_first_component_failure_is_an_error() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(
            &ctx(&fs, &fids, &users),
            &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["missing".into()] },
        )
        .await;
        assert!(matches!(reply, Fcall::Rerror { .. }));
        assert!(!fids.contains(1).await);
    }

    #[tokio::test]
    async fn walk_later_component_failure_is_a_partial_success() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(
            &ctx(&fs, &fids, &users),
            &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["file.txt".into(), "deeper".into()] },
        )
        .await;
        match reply {
            Fcall::Rwalk { wqids } => assert_eq!(wqids, vec![file_qid()]),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(!fids.contains(1).await, "newfid must stay unallocated on partial success");
    }

    #[tokio::test]
    async fn zero_name_walk_clones_without_calling_the_backend() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec![] }).await;
        assert!(matches!(reply, Fcall::Rwalk { wqids } if wqids.is_empty()));
        assert!(fids.contains(1).await);
        assert!(fids.contains(0).await, "the original fid survives a walk to a different newfid");
    }

    #[tokio::test]
    async fn zero_name_walk_clone_shares_destroy_accounting_with_its_source() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        dispatch(&ctx(&fs, &fids, &users), &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec![] }).await;

        // clunking just the original must not destroy the shared backend object —
        // fid 1 still references it.
        dispatch(&ctx(&fs, &fids, &users), &Fcall::Tclunk { fid: 0 }).await;
        assert_eq!(fs.destroy_count.load(Ordering::SeqCst), 0);

        // clunking the clone drops the last reference.
        dispatch(&ctx(&fs, &fids, &users), &Fcall::Tclunk { fid: 1 }).await;
        assert_eq!(fs.destroy_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_name_walk_in_place_does_not_inflate_the_refcount() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        // walking fid 0 onto itself with no names replaces its table entry in
        // place; it must stay a single reference, not silently double it.
        dispatch(&ctx(&fs, &fids, &users), &Fcall::Twalk { fid: 0, newfid: 0, wnames: vec![] }).await;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tclunk { fid: 0 }).await;
        assert!(matches!(reply, Fcall::Rclunk));
        assert_eq!(fs.destroy_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn opening_a_directory_for_write_is_rejected() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Topen { fid: 0, mode: om::WRITE }).await;
        assert!(matches!(reply, Fcall::Rerror { .. }));
    }

    #[tokio::test]
    async fn directory_read_enforces_sequential_offset() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;
        dispatch(&ctx(&fs, &fids, &users), &Fcall::Topen { fid: 0, mode: om::READ }).await;

        let bad = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tread { fid: 0, offset: 4, count: 4096 }).await;
        assert!(matches!(bad, Fcall::Rerror { ename, .. } if ename == string::EBADOFFSET));

        let good = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tread { fid: 0, offset: 0, count: 4096 }).await;
        assert!(matches!(good, Fcall::Rread { .. }));
    }

    #[tokio::test]
    async fn clunk_destroys_the_backend_object_and_frees_the_fid() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        attach(&fs, &fids, &users).await;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tclunk { fid: 0 }).await;
        assert!(matches!(reply, Fcall::Rclunk));
        assert!(!fids.contains(0).await);
        assert_eq!(fs.destroy_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tauth_installs_the_afid_when_the_backend_supports_auth() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        let mut c = ctx(&fs, &fids, &users);
        c.auth_supported = true;

        let reply = dispatch(&c, &Fcall::Tauth { afid: 5, uname: "root".into(), aname: "/".into(), n_uname: NONUNAME }).await;
        match reply {
            Fcall::Rauth { aqid } => assert_eq!(aqid.typ, QidType::AUTH),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(fids.contains(5).await);

        // a duplicate afid is rejected rather than silently replacing the first.
        let dup = dispatch(&c, &Fcall::Tauth { afid: 5, uname: "root".into(), aname: "/".into(), n_uname: NONUNAME }).await;
        assert!(matches!(dup, Fcall::Rerror { ename, .. } if ename == string::EFIDINUSE));
    }

    #[tokio::test]
    async fn tauth_is_rejected_when_the_backend_does_not_support_auth() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        // the default `ctx()` helper sets `auth_supported: false`, mirroring what
        // `Server::serve_conn` would cache from `Filesystem::supports_auth`.
        let c = ctx(&fs, &fids, &users);

        let reply = dispatch(&c, &Fcall::Tauth { afid: 5, uname: "root".into(), aname: "/".into(), n_uname: NONUNAME }).await;
        assert!(matches!(reply, Fcall::Rerror { ename, .. } if ename == string::EAUTHNOTREQ));
        assert!(!fids.contains(5).await);
    }

    #[tokio::test]
    async fn stat_on_unknown_fid_is_ebadf() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;

        let reply = dispatch(&ctx(&fs, &fids, &users), &Fcall::Tstat { fid: 99 }).await;
        assert!(matches!(reply, Fcall::Rerror { ename, .. } if ename == string::EBADF));
    }

    #[tokio::test]
    async fn akaros_mode_prefixes_the_error_string_with_its_errno() {
        let fs = TestFs { destroy_count: AtomicUsize::new(0) };
        let fids = FidTable::new();
        let users = OneUser;
        let mut c = ctx(&fs, &fids, &users);
        c.akaros = true;

        let reply = dispatch(&c, &Fcall::Tstat { fid: 99 }).await;
        match reply {
            Fcall::Rerror { ename, .. } => assert!(
                ename.starts_with(&format!("{:04x} ", Error::No(Errno::EBADF).errno())),
                "expected hex-prefixed error, got {:?}",
                ename
            ),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
