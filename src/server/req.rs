//! Per-connection outstanding-request bookkeeping and the `Tflush`/`Rflush`-ordering
//! guarantee.
//!
//! Grounded on the teacher's `srv.rs::dispatch` (one `tokio::spawn`'d task per inbound
//! message) plus `original_source/go9p/srv_respond.go`'s `srvReq` lifecycle
//! (parsed → enqueued → processed → responded → removed). The teacher crate doesn't
//! track outstanding requests explicitly — its `TFlush` handler just acknowledges
//! unconditionally (`fs.rflush(None)` in `srv.rs`) — so this module is new code,
//! written in the same task/channel idiom, that adds the map §4.5/§9 require: finding
//! the flushed request, and holding `Rflush` back until its own reply (if any) has
//! already been written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::fcall::Fcall;

/// Bookkeeping for one in-flight client request, keyed by its tag in
/// [`OutstandingRequests`].
pub struct SrvReq {
    pub tag: u16,
    pub tc: Fcall,
    flushed: AtomicBool,
    responded_flag: AtomicBool,
    responded: Notify,
}

impl SrvReq {
    fn new(tag: u16, tc: Fcall) -> Arc<SrvReq> {
        Arc::new(SrvReq {
            tag,
            tc,
            flushed: AtomicBool::new(false),
            responded_flag: AtomicBool::new(false),
            responded: Notify::new(),
        })
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }

    /// Called by the task handling this request once its response has been handed to
    /// the writer — wakes any `Tflush` waiting on this tag.
    fn mark_responded(&self) {
        self.responded_flag.store(true, Ordering::Release);
        self.responded.notify_waiters();
    }

    /// Await this request's own response being written. A `Tflush` handler calls this
    /// after finding the request still outstanding, so its `Rflush` is guaranteed to
    /// follow the flushed request's reply on the wire (§5's ordering guarantee).
    ///
    /// `notify_waiters` only wakes listeners already registered at the time it's
    /// called, so a naive `self.responded.notified().await` can miss a response that
    /// lands between this request being looked up and the `.await` starting, hanging
    /// forever. Registering interest with `enable()` before checking the flag closes
    /// that window: any `mark_responded` after `enable()` is guaranteed to wake us, and
    /// one that already happened is caught by the flag check.
    async fn wait_for_response(&self) {
        let notified = self.responded.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.responded_flag.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// The tag→request map for one server connection.
#[derive(Default)]
pub struct OutstandingRequests {
    inner: Mutex<HashMap<u16, Arc<SrvReq>>>,
}

impl OutstandingRequests {
    pub fn new() -> OutstandingRequests {
        OutstandingRequests::default()
    }

    /// Register a freshly received request under its tag. Returns `None` if the tag
    /// is already in flight — the caller should reject it as a protocol violation
    /// rather than silently clobbering the existing entry (§3's tag-uniqueness
    /// invariant).
    pub async fn insert(&self, tag: u16, tc: Fcall) -> Option<Arc<SrvReq>> {
        let mut map = self.inner.lock().await;
        if map.contains_key(&tag) {
            return None;
        }
        let req = SrvReq::new(tag, tc);
        map.insert(tag, req.clone());
        Some(req)
    }

    pub async fn get(&self, tag: u16) -> Option<Arc<SrvReq>> {
        self.inner.lock().await.get(&tag).cloned()
    }

    pub async fn remove(&self, tag: u16) -> Option<Arc<SrvReq>> {
        self.inner.lock().await.remove(&tag)
    }

    /// Drop every outstanding request, as `Tversion` requires. Any `Tflush` currently
    /// waiting on one of the cleared requests is woken immediately rather than left
    /// hanging forever.
    pub async fn clear(&self) -> Vec<Arc<SrvReq>> {
        let drained: Vec<Arc<SrvReq>> = self.inner.lock().await.drain().map(|(_, v)| v).collect();
        for req in &drained {
            req.mark_responded();
        }
        drained
    }

    /// Mark `tag`'s response sent and release it from the outstanding set. Any
    /// `Tflush` awaiting this tag is woken immediately afterward.
    pub async fn complete(&self, tag: u16) {
        if let Some(req) = self.remove(tag).await {
            req.mark_responded();
        }
    }

    /// Implements the `Tflush` step of §4.5: look up `oldtag`, and if it's still
    /// outstanding, mark it flushed and wait for its own reply to be written before
    /// returning. Returns immediately if `oldtag` is unknown (already responded, or
    /// never existed) — in both cases `Rflush` is safely the last word on the tag.
    pub async fn await_flush_target(&self, oldtag: u16) {
        let target = self.get(oldtag).await;
        if let Some(req) = target {
            req.mark_flushed();
            req.wait_for_response().await;
        }
    }
}
