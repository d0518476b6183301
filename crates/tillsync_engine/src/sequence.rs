//! Engine-wide write stamps.
//!
//! Every repository write is stamped from one [`WriteSequence`], so stamps
//! are strictly increasing across entity types. Reservation and commit happen
//! under a single lock: once [`WriteSequence::committed`] reports `n`, every
//! write stamped `n` or lower is visible in its repository. The change feed
//! caps its watermark there, which keeps downloads gap-free.

use crate::clock::Clock;
use crate::error::EngineResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out write stamps and tracks the highest committed one.
pub struct WriteSequence {
    clock: Arc<dyn Clock>,
    /// Last committed stamp. Held for the whole write.
    last: Mutex<u64>,
    /// Mirror of `last` for lock-free readers.
    committed: AtomicU64,
}

impl WriteSequence {
    /// Creates a sequence that starts at the clock's current time.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(0),
            committed: AtomicU64::new(0),
        }
    }

    /// Runs `write` with the next stamp and commits the stamp if it succeeds.
    ///
    /// The stamp is the clock time, bumped past the last committed stamp when
    /// the clock has not moved. A failed write consumes nothing.
    pub fn commit<T>(&self, write: impl FnOnce(u64) -> EngineResult<T>) -> EngineResult<T> {
        let mut last = self.last.lock();
        let stamp = self.clock.now_millis().max(*last + 1);
        let value = write(stamp)?;
        *last = stamp;
        self.committed.store(stamp, Ordering::SeqCst);
        Ok(value)
    }

    /// Highest committed stamp, `0` before the first write.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WriteSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSequence")
            .field("committed", &self.committed())
            .finish()
    }
}
