/// Background loop that moves decoded audio into the ring buffer.
///
/// Each tick handles a pending seek, backs off while the ring is above its
/// low-water mark, and otherwise copies chunks from the audio cache in order
/// until the next chunk would run more than `SYNC_THRESHOLD` ahead of the
/// reported video time or would not fit whole. A chunk bigger than the whole
/// ring is written in pieces across ticks. Audio is only ever held back;
/// catching up a lagging video path is the presenter's job.
///
/// The thread sleeps `FEED_INTERVAL` between ticks, or less when a seek or
/// stop wakes it through the condvar.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::frame::AudioChunk;
use crate::frame_cache::FrameCache;
use crate::ringbuf::RingBuffer;
use crate::{SEEK_EPSILON, SYNC_THRESHOLD};

/// Poll period of the feed loop
pub const FEED_INTERVAL: Duration = Duration::from_millis(5);

struct Shared {
    cache: Arc<FrameCache<AudioChunk>>,
    ring: Arc<RingBuffer>,
    low_water: usize,
    running: AtomicBool,
    seek_pending: AtomicBool,
    /// f64 bit patterns
    seek_target: AtomicU64,
    video_time: AtomicU64,
    /// Bytes of the current chunk already written, for chunks larger than the ring
    chunk_offset: AtomicUsize,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

pub struct AudioFeeder {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioFeeder {
    pub fn new(cache: Arc<FrameCache<AudioChunk>>, ring: Arc<RingBuffer>) -> Self {
        let low_water = ring.capacity() / 4;
        Self {
            shared: Arc::new(Shared {
                cache,
                ring,
                low_water,
                running: AtomicBool::new(false),
                seek_pending: AtomicBool::new(false),
                seek_target: AtomicU64::new(0f64.to_bits()),
                video_time: AtomicU64::new(0f64.to_bits()),
                chunk_offset: AtomicUsize::new(0),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the feed thread. Calling it while already running does nothing.
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("audio-feeder".into())
            .spawn(move || shared.run());

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                info!(low_water = self.shared.low_water, "Audio feeder started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Signal the thread and join it.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        self.shared.notify();
        let _ = handle.join();
        info!("Audio feeder stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Retarget audio to `position` seconds on the next tick.
    pub fn request_seek(&self, position: f64) {
        self.shared
            .seek_target
            .store(position.to_bits(), Ordering::Release);
        self.shared.seek_pending.store(true, Ordering::Release);
        self.shared.notify();
    }

    pub fn seek_pending(&self) -> bool {
        self.shared.seek_pending.load(Ordering::Acquire)
    }

    /// Presentation time of the frame now on screen; gates how far audio may run.
    pub fn set_video_time(&self, seconds: f64) {
        self.shared
            .video_time
            .store(seconds.to_bits(), Ordering::Release);
    }

    pub fn video_time(&self) -> f64 {
        f64::from_bits(self.shared.video_time.load(Ordering::Acquire))
    }

    /// Run one iteration of the feed loop on the calling thread. Returns the
    /// number of bytes written to the ring.
    pub fn tick(&self) -> usize {
        self.shared.tick()
    }
}

impl Drop for AudioFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            self.tick();

            let mut guard = self.wake_lock.lock();
            if self.running.load(Ordering::Acquire) && !self.seek_pending.load(Ordering::Acquire) {
                let _ = self.wake.wait_for(&mut guard, FEED_INTERVAL);
            }
        }
    }

    fn tick(&self) -> usize {
        if self.seek_pending.swap(false, Ordering::AcqRel) {
            let target = f64::from_bits(self.seek_target.load(Ordering::Acquire));
            self.ring.clear();
            self.chunk_offset.store(0, Ordering::Release);
            let index = self.cache.seek(target - SEEK_EPSILON);
            debug!(target = target, index = index, "Audio seek");
        }

        if self.ring.available_read() > self.low_water {
            return 0;
        }

        let video_time = f64::from_bits(self.video_time.load(Ordering::Acquire));
        let max_fill = self.ring.capacity() - 1;
        let mut written = 0;

        while let Some(chunk) = self.cache.current() {
            if chunk.pts > video_time + SYNC_THRESHOLD {
                break;
            }

            let offset = self.chunk_offset.load(Ordering::Acquire).min(chunk.data.len());
            let rest = &chunk.data[offset..];
            // chunks that can fit wait until they fit whole; larger ones go in pieces
            if chunk.data.len() <= max_fill && self.ring.available_write() < rest.len() {
                break;
            }

            let n = self.ring.write(rest);
            written += n;
            if n < rest.len() {
                self.chunk_offset.store(offset + n, Ordering::Release);
                break;
            }
            self.chunk_offset.store(0, Ordering::Release);
            self.cache.advance();
        }

        written
    }
}
