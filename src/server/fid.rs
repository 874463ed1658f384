//! Server-side fid table: per-connection map from client-chosen fid numbers to the
//! backend state they reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::fcall::Qid;
use crate::users::User;

/// Server-side state for one client fid.
///
/// Grounded on the teacher's `FId<T>` wrapper (`rs9p-rs9p/crates/rs9p/src/srv.rs`),
/// generalized with an explicit atomic refcount — clunk/remove only destroy the
/// backend object once the count reaches zero, matching §4.5's "decrement; at zero,
/// invoke FidDestroy" rule, which the teacher's 9P2000.L-only dispatch didn't need
/// since `.L` clunks are always terminal.
///
/// The refcount lives behind an `Arc` so a zero-name `Twalk` can hand out a second
/// fid number that shares it with the original: both [`SrvFid::share`] (a genuinely
/// new live reference, `newfid != fid`) and [`SrvFid::reclone`] (walk-in-place,
/// `newfid == fid`, still exactly one reference) carry the same counter forward, so
/// [`FidTable::replace`]/[`FidTable::remove`] never silently drop a reference the
/// dispatcher hasn't accounted for.
///
/// `qid` and `mode` are mutable (a successful `Topen`/`Tcreate` updates both) while
/// `state` is not: the dispatcher never mutates a fid's backend state in place, it
/// replaces the whole table entry via [`FidTable::replace`] instead (see `Twalk`'s
/// walk-to-self case and `Tcreate`, both of which hand the fid a different backend
/// object under the same number).
pub struct SrvFid<S> {
    pub fid: u32,
    qid: Mutex<Qid>,
    mode: Mutex<Option<u8>>,
    pub user: Option<Arc<User>>,
    opened: AtomicBool,
    diroffset: AtomicU64,
    refcount: Arc<AtomicU32>,
    /// Opaque backend-specific state (an open file descriptor, a tree node handle,
    /// ...). The associated type lives on [`crate::server::Filesystem::FidState`].
    pub state: S,
}

impl<S> SrvFid<S> {
    pub fn new(fid: u32, qid: Qid, state: S) -> SrvFid<S> {
        SrvFid {
            fid,
            qid: Mutex::new(qid),
            mode: Mutex::new(None),
            user: None,
            opened: AtomicBool::new(false),
            diroffset: AtomicU64::new(0),
            refcount: Arc::new(AtomicU32::new(1)),
            state,
        }
    }

    pub fn with_user(mut self, user: Arc<User>) -> SrvFid<S> {
        self.user = Some(user);
        self
    }

    pub async fn qid(&self) -> Qid {
        *self.qid.lock().await
    }

    pub async fn set_qid(&self, qid: Qid) {
        *self.qid.lock().await = qid;
    }

    pub async fn mode(&self) -> Option<u8> {
        *self.mode.lock().await
    }

    pub async fn set_mode(&self, mode: u8) {
        *self.mode.lock().await = Some(mode);
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }

    pub fn diroffset(&self) -> u64 {
        self.diroffset.load(Ordering::Acquire)
    }

    pub fn set_diroffset(&self, offset: u64) {
        self.diroffset.store(offset, Ordering::Release);
    }

    /// `+1` for a new reference. Returns the refcount *after* incrementing.
    pub fn incref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `-1`. Returns the refcount *after* decrementing; the caller destroys the
    /// backend state when this reaches zero.
    pub fn decref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Build the second live fid a zero-name `Twalk` produces under `new_fid_num`
    /// (`new_fid_num != self.fid`): bumps the shared refcount so the backend object
    /// is destroyed only once both this fid and the new one have been clunked.
    /// Open state (`mode`/`opened`/`diroffset`) is never shared — the clone starts
    /// unopened regardless of whether `self` currently is.
    pub fn share(&self, new_fid_num: u32, qid: Qid, state: S) -> SrvFid<S> {
        self.incref();
        self.clone_sharing_refcount(new_fid_num, qid, state)
    }

    /// Rebuild this fid's table entry under its own number (walk-in-place): still
    /// exactly one logical reference, so the refcount is carried over unchanged
    /// rather than reset or bumped.
    pub fn reclone(&self, qid: Qid, state: S) -> SrvFid<S> {
        self.clone_sharing_refcount(self.fid, qid, state)
    }

    fn clone_sharing_refcount(&self, new_fid_num: u32, qid: Qid, state: S) -> SrvFid<S> {
        SrvFid {
            fid: new_fid_num,
            qid: Mutex::new(qid),
            mode: Mutex::new(None),
            user: self.user.clone(),
            opened: AtomicBool::new(false),
            diroffset: AtomicU64::new(0),
            refcount: self.refcount.clone(),
            state,
        }
    }
}

/// The fid table for one server connection.
///
/// Reads (dispatch looking up a fid for every T-message referencing one) dominate
/// writes (attach/walk inserting, clunk/remove removing), so a `RwLock` is the right
/// trade-off — the same one the teacher's `srv.rs` makes for its `fsfids` map.
pub struct FidTable<S> {
    fids: RwLock<HashMap<u32, Arc<SrvFid<S>>>>,
}

impl<S> Default for FidTable<S> {
    fn default() -> Self {
        FidTable { fids: RwLock::new(HashMap::new()) }
    }
}

impl<S> FidTable<S> {
    pub fn new() -> FidTable<S> {
        FidTable::default()
    }

    pub async fn get(&self, fid: u32) -> Option<Arc<SrvFid<S>>> {
        self.fids.read().await.get(&fid).cloned()
    }

    pub async fn contains(&self, fid: u32) -> bool {
        self.fids.read().await.contains_key(&fid)
    }

    /// Insert `entry` under `fid`. Returns `false` (and doesn't insert) if `fid` is
    /// already in use — the caller is expected to turn that into "fid already in use".
    pub async fn insert(&self, fid: u32, entry: Arc<SrvFid<S>>) -> bool {
        let mut fids = self.fids.write().await;
        if fids.contains_key(&fid) {
            return false;
        }
        fids.insert(fid, entry);
        true
    }

    /// Unconditionally replace whatever is at `fid` with `entry`, for the two cases
    /// where a fid keeps its number but starts referring to a different backend
    /// object: a zero-names-remaining `Twalk` onto itself ([`SrvFid::reclone`],
    /// which carries the existing refcount forward so this never drops a still-live
    /// reference), and a successful `Tcreate` (the parent fid now refers to its new
    /// child outright — there's no second reference to account for, so the
    /// superseded `Arc` is dropped without calling `fid_destroy`).
    pub async fn replace(&self, fid: u32, entry: Arc<SrvFid<S>>) {
        self.fids.write().await.insert(fid, entry);
    }

    pub async fn remove(&self, fid: u32) -> Option<Arc<SrvFid<S>>> {
        self.fids.write().await.remove(&fid)
    }

    /// Drop every fid, as `Tversion` requires.
    pub async fn clear(&self) -> Vec<Arc<SrvFid<S>>> {
        self.fids.write().await.drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::QidType;

    fn qid(typ: QidType) -> Qid {
        Qid { typ, version: 0, path: 1 }
    }

    #[tokio::test]
    async fn insert_rejects_an_in_use_fid() {
        let table: FidTable<()> = FidTable::new();
        let entry = Arc::new(SrvFid::new(1, qid(QidType::FILE), ()));
        assert!(table.insert(1, entry.clone()).await);
        assert!(!table.insert(1, entry).await);
    }

    #[tokio::test]
    async fn replace_overwrites_regardless_of_existing_entry() {
        let table: FidTable<u32> = FidTable::new();
        table.insert(1, Arc::new(SrvFid::new(1, qid(QidType::DIR), 10))).await;
        table.replace(1, Arc::new(SrvFid::new(1, qid(QidType::FILE), 20))).await;
        assert_eq!(table.get(1).await.unwrap().state, 20);
    }

    #[tokio::test]
    async fn clear_drains_every_fid() {
        let table: FidTable<()> = FidTable::new();
        table.insert(1, Arc::new(SrvFid::new(1, qid(QidType::FILE), ()))).await;
        table.insert(2, Arc::new(SrvFid::new(2, qid(QidType::DIR), ()))).await;
        let drained = table.clear().await;
        assert_eq!(drained.len(), 2);
        assert!(table.get(1).await.is_none());
    }

    #[test]
    fn refcount_reaches_zero_after_matching_decrefs() {
        let fid = SrvFid::new(1, qid(QidType::FILE), ());
        assert_eq!(fid.incref(), 2);
        assert_eq!(fid.decref(), 1);
        assert_eq!(fid.decref(), 0);
    }

    #[test]
    fn share_bumps_the_shared_refcount_and_reclone_does_not() {
        let original = SrvFid::new(1, qid(QidType::FILE), ());
        let shared = original.share(2, qid(QidType::FILE), ());
        // one clunk on either side isn't enough to destroy the backend object.
        assert_eq!(original.decref(), 1);
        assert_eq!(shared.decref(), 0);

        let original = SrvFid::new(1, qid(QidType::FILE), ());
        let in_place = original.reclone(qid(QidType::FILE), ());
        // walk-in-place is still a single reference: one decref reaches zero.
        assert_eq!(in_place.decref(), 0);
    }

    #[tokio::test]
    async fn qid_and_mode_are_mutable_after_construction() {
        let fid = SrvFid::new(1, qid(QidType::FILE), ());
        assert!(fid.mode().await.is_none());
        fid.set_mode(crate::fcall::om::READ).await;
        fid.set_qid(qid(QidType::APPEND)).await;
        assert_eq!(fid.mode().await, Some(crate::fcall::om::READ));
        assert_eq!(fid.qid().await.typ, QidType::APPEND);
    }
}
