//! A pool of small integer identifiers, handed out and recycled.
//!
//! Used for both tags (client side) and fids (client side); the server never needs one
//! since fids/tags there are whatever the client sent.

use tokio::sync::mpsc;

/// A bounded pool of `u32` identifiers in `[low, high)`, preloaded at construction.
///
/// Mirrors a buffered channel preloaded with every id in range: `get` blocks (well,
/// awaits) until one is available, `put` returns one to circulation.
pub struct IdPool {
    low: u32,
    high: u32,
    tx: mpsc::Sender<u32>,
    rx: tokio::sync::Mutex<mpsc::Receiver<u32>>,
}

impl IdPool {
    /// Build a pool covering `[low, high)`.
    pub fn new(low: u32, high: u32) -> IdPool {
        assert!(low < high, "idpool range must be non-empty");
        let (tx, rx) = mpsc::channel((high - low) as usize);
        for id in low..high {
            tx.try_send(id).expect("freshly sized channel has room for every id");
        }
        IdPool { low, high, tx, rx: tokio::sync::Mutex::new(rx) }
    }

    /// Take an id out of the pool, waiting if none is free.
    pub async fn get(&self) -> u32 {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("sender half is held by self and never dropped")
    }

    /// Return an id to the pool.
    ///
    /// # Panics
    /// Panics if `id` is outside `[low, high)` — returning an id the pool never handed
    /// out is a caller bug, not a recoverable condition.
    pub fn put(&self, id: u32) {
        if id < self.low || id >= self.high {
            panic!("id {} out of range [{}, {})", id, self.low, self.high);
        }
        self.tx
            .try_send(id)
            .expect("pool can hold at most high-low outstanding ids");
    }
}
