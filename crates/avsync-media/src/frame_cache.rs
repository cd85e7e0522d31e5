/// Ordered, seekable store of decoded frames.
///
/// Filled once by the ingest pass, then read by index. Timestamps are expected
/// to be non-decreasing in insertion order; seeks rely on that to binary
/// search. The cursor lives in `0..=len`: `len` means "past the last frame",
/// which is where a seek beyond the end of the stream lands.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

use crate::frame::Timestamped;

pub struct FrameCache<F> {
    frames: RwLock<Vec<Arc<F>>>,
    cursor: AtomicUsize,
    complete: Mutex<bool>,
    complete_cv: Condvar,
}

impl<F> Default for FrameCache<F> {
    fn default() -> Self {
        Self {
            frames: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            complete: Mutex::new(false),
            complete_cv: Condvar::new(),
        }
    }
}

impl<F: Timestamped> FrameCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Out-of-order timestamps are kept but logged, since
    /// they break seek accuracy.
    pub fn push(&self, frame: F) {
        let mut frames = self.frames.write();
        if let Some(last) = frames.last() {
            if frame.pts() < last.pts() {
                warn!(
                    pts = frame.pts(),
                    previous = last.pts(),
                    "Frame timestamp went backwards"
                );
            }
        }
        frames.push(Arc::new(frame));
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<F>> {
        self.frames.read().get(index).cloned()
    }

    /// Frame at the cursor, or None when the cursor is past the end.
    pub fn current(&self) -> Option<Arc<F>> {
        self.get(self.cursor())
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Move the cursor, clamped to `len`. Returns where it landed.
    pub fn set_cursor(&self, index: usize) -> usize {
        let index = index.min(self.len());
        self.cursor.store(index, Ordering::Release);
        index
    }

    /// Step the cursor forward by one, stopping at `len`.
    pub fn advance(&self) {
        let len = self.len();
        let _ = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < len).then_some(c + 1)
            });
    }

    /// Index of the first frame with `pts >= at_or_after`, or `len` if none.
    pub fn index_at_or_after(&self, at_or_after: f64) -> usize {
        self.frames
            .read()
            .partition_point(|frame| frame.pts() < at_or_after)
    }

    /// Move the cursor to the first frame with `pts >= at_or_after`.
    pub fn seek(&self, at_or_after: f64) -> usize {
        let index = self.index_at_or_after(at_or_after);
        self.cursor.store(index, Ordering::Release);
        index
    }

    pub fn pts_at(&self, index: usize) -> Option<f64> {
        self.frames.read().get(index).map(|f| f.pts())
    }

    /// Timestamp of the last frame; 0 when empty.
    pub fn last_pts(&self) -> f64 {
        self.frames.read().last().map_or(0.0, |f| f.pts())
    }

    // -- Ingest lifecycle --

    /// Drop all frames and start over. Only the ingest pass calls this.
    pub fn reset(&self) {
        self.frames.write().clear();
        self.cursor.store(0, Ordering::Release);
        *self.complete.lock() = false;
    }

    pub fn mark_complete(&self) {
        *self.complete.lock() = true;
        self.complete_cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.lock()
    }

    /// Block until the ingest pass marks the cache complete. Returns false on timeout.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        let mut complete = self.complete.lock();
        if *complete {
            return true;
        }
        let _ = self
            .complete_cv
            .wait_while_for(&mut complete, |done| !*done, timeout);
        *complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tick(f64);

    impl Timestamped for Tick {
        fn pts(&self) -> f64 {
            self.0
        }
    }

    fn cache_of(pts: &[f64]) -> FrameCache<Tick> {
        let cache = FrameCache::new();
        for &p in pts {
            cache.push(Tick(p));
        }
        cache
    }

    #[test]
    fn seek_finds_first_at_or_after() {
        let cache = cache_of(&[0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(cache.seek(1.0), 2);
        assert_eq!(cache.seek(1.01), 3);
        assert_eq!(cache.seek(-3.0), 0);
        assert_eq!(cache.current().map(|f| f.0), Some(0.0));
    }

    #[test]
    fn seek_past_end_exhausts() {
        let cache = cache_of(&[0.0, 0.5]);
        assert_eq!(cache.seek(10.0), 2);
        assert!(cache.current().is_none());
    }

    #[test]
    fn equal_timestamps_land_on_first() {
        let cache = cache_of(&[0.0, 1.0, 1.0, 1.0, 2.0]);
        assert_eq!(cache.seek(1.0), 1);
    }

    #[test]
    fn advance_stops_at_len() {
        let cache = cache_of(&[0.0, 1.0]);
        cache.advance();
        cache.advance();
        cache.advance();
        assert_eq!(cache.cursor(), 2);
    }

    #[test]
    fn set_cursor_clamps() {
        let cache = cache_of(&[0.0, 1.0, 2.0]);
        assert_eq!(cache.set_cursor(1), 1);
        assert_eq!(cache.set_cursor(99), 3);
    }

    #[test]
    fn wait_complete_wakes_on_mark() {
        let cache = Arc::new(cache_of(&[]));
        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.wait_complete(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        cache.mark_complete();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_complete_times_out() {
        let cache = cache_of(&[0.0]);
        assert!(!cache.wait_complete(Duration::from_millis(10)));
    }

    #[test]
    fn reset_clears_everything() {
        let cache = cache_of(&[0.0, 1.0]);
        cache.set_cursor(1);
        cache.mark_complete();
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.cursor(), 0);
        assert!(!cache.is_complete());
    }
}
