/// Audio + video transport for one player.
///
/// Owns both frame caches, the audio feeder and its ring buffer, the audio
/// clock and the sink-side `AudioOutput`. The presenter drives it through
/// `next_frame`; remote cues and key actions arrive through the seek/sync/
/// pause methods. All methods take `&self` so a single `Arc<Playback>` can be
/// shared between the presenter thread and the network side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::PlaybackClock;
use crate::feeder::AudioFeeder;
use crate::frame::{AudioChunk, AudioFormat, VideoFrame};
use crate::frame_cache::FrameCache;
use crate::output::AudioOutput;
use crate::ringbuf::RingBuffer;
use crate::{AUDIO_RESYNC_THRESHOLD, DEFAULT_RING_CAPACITY, SEEK_EPSILON, SYNC_FRAME_TOLERANCE};

/// Snapshot for status lines and the operator CLI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub frame: usize,
    pub total_frames: usize,
    pub video_time: f64,
    pub audio_clock: f64,
    pub buffered_bytes: usize,
    pub paused: bool,
    pub muted: bool,
}

pub struct Playback {
    video: Arc<FrameCache<VideoFrame>>,
    audio: Arc<FrameCache<AudioChunk>>,
    ring: Arc<RingBuffer>,
    clock: PlaybackClock,
    feeder: AudioFeeder,
    output: Arc<AudioOutput>,
    /// Index of the frame most recently handed to the presenter
    presented: AtomicUsize,
    /// Held while the video cursor, `presented` and the feeder's video time
    /// move together, so a seek from the network can't interleave with
    /// `next_frame`
    transport: Mutex<()>,
}

impl Playback {
    pub fn new(
        video: Arc<FrameCache<VideoFrame>>,
        audio: Arc<FrameCache<AudioChunk>>,
        format: AudioFormat,
    ) -> Self {
        Self::with_ring_capacity(video, audio, format, DEFAULT_RING_CAPACITY)
    }

    pub fn with_ring_capacity(
        video: Arc<FrameCache<VideoFrame>>,
        audio: Arc<FrameCache<AudioChunk>>,
        format: AudioFormat,
        ring_capacity: usize,
    ) -> Self {
        let ring = Arc::new(RingBuffer::new(ring_capacity));
        let feeder = AudioFeeder::new(Arc::clone(&audio), Arc::clone(&ring));
        let output = Arc::new(AudioOutput::new(Arc::clone(&ring), format));

        Self {
            video,
            audio,
            ring,
            clock: PlaybackClock::new(),
            feeder,
            output,
            presented: AtomicUsize::new(0),
            transport: Mutex::new(()),
        }
    }

    /// Start feeding audio from the beginning.
    pub fn start(&self) -> std::io::Result<()> {
        {
            let _transport = self.transport.lock();
            self.video.set_cursor(0);
            self.presented.store(0, Ordering::Release);
            self.feeder.set_video_time(0.0);
            self.sync_audio_to(0.0);
        }
        self.feeder.start()?;

        info!(
            video_frames = self.video.len(),
            audio_chunks = self.audio.len(),
            "Playback started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.feeder.stop();
    }

    /// Handle for the audio device callback.
    pub fn output(&self) -> Arc<AudioOutput> {
        Arc::clone(&self.output)
    }

    pub fn feeder(&self) -> &AudioFeeder {
        &self.feeder
    }

    // -- Presenter side --

    /// Frame to show now. Advances the cursor unless paused; at the end of the
    /// cache playback loops to the first frame and audio restarts from 0.
    pub fn next_frame(&self) -> Option<Arc<VideoFrame>> {
        let _transport = self.transport.lock();
        if self.is_paused() {
            return self.video.get(self.presented.load(Ordering::Acquire));
        }

        let frame = match self.video.current() {
            Some(frame) => frame,
            None => {
                if self.video.is_empty() {
                    return None;
                }
                debug!("End of stream, looping");
                self.video.set_cursor(0);
                self.sync_audio_to(0.0);
                self.video.current()?
            }
        };

        self.presented.store(self.video.cursor(), Ordering::Release);
        self.feeder.set_video_time(frame.pts);
        self.video.advance();
        Some(frame)
    }

    // -- Transport --

    /// Jump to the first frame at or just before `position` seconds. Returns the
    /// frame index, or None when there is no video.
    pub fn seek_to(&self, position: f64) -> Option<usize> {
        let last = self.video.len().checked_sub(1)?;
        let index = self
            .video
            .index_at_or_after(position - SEEK_EPSILON)
            .min(last);
        self.jump_to_index(index);
        info!(position = position, frame = index, "Seek");
        Some(index)
    }

    /// Seek to a fraction of the stream by frame index; `percent` is clamped to 0..=100.
    pub fn seek_to_percentage(&self, percent: f64) -> Option<usize> {
        let last = self.video.len().checked_sub(1)?;
        let percent = percent.clamp(0.0, 100.0);
        let index = ((percent / 100.0) * last as f64) as usize;
        self.jump_to_index(index);
        info!(percent = percent, frame = index, "Seek to percentage");
        Some(index)
    }

    /// Align with a remote frame number. Returns false if already within
    /// `SYNC_FRAME_TOLERANCE` frames (or there is no video).
    pub fn sync_to_frame(&self, frame: u32) -> bool {
        let Some(last) = self.video.len().checked_sub(1) else {
            return false;
        };
        let target = (frame as usize).min(last);
        let current = self.current_frame();
        if current.abs_diff(target) <= SYNC_FRAME_TOLERANCE as usize {
            return false;
        }

        self.jump_to_index(target);
        info!(from = current, to = target, "Synced to remote frame");
        true
    }

    fn jump_to_index(&self, index: usize) {
        let _transport = self.transport.lock();
        self.video.set_cursor(index);
        self.presented.store(index, Ordering::Release);
        let pts = self.video.pts_at(index).unwrap_or(0.0);
        self.feeder.set_video_time(pts);
        self.sync_audio_to(pts);
    }

    fn sync_audio_to(&self, position: f64) {
        self.feeder.request_seek(position);
        self.clock.set(position);
    }

    pub fn pause(&self) {
        self.clock.pause();
        self.output.set_paused(true);
    }

    pub fn resume(&self) {
        self.clock.resume();
        self.output.set_paused(false);
    }

    /// Returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        if self.is_paused() {
            self.resume();
            false
        } else {
            self.pause();
            true
        }
    }

    pub fn is_paused(&self) -> bool {
        self.output.is_paused()
    }

    /// Returns the new muted state. Unmuting re-seeks audio to the video
    /// position since nothing was consumed while muted.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.output.is_muted();
        self.output.set_muted(muted);
        if !muted {
            self.sync_audio_to(self.video_time());
        }
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.output.is_muted()
    }

    /// Re-seek audio when its clock has drifted more than
    /// `AUDIO_RESYNC_THRESHOLD` from the video time. Returns true if it did.
    pub fn resync_if_drifted(&self) -> bool {
        if self.is_paused() {
            return false;
        }
        let video_time = self.video_time();
        let drift = self.clock.get() - video_time;
        if drift.abs() <= AUDIO_RESYNC_THRESHOLD {
            return false;
        }

        debug!(drift = drift, video_time = video_time, "Audio drifted, resyncing");
        self.sync_audio_to(video_time);
        true
    }

    // -- Status --

    pub fn current_frame(&self) -> usize {
        self.presented.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> usize {
        self.video.len()
    }

    pub fn video_time(&self) -> f64 {
        self.feeder.video_time()
    }

    pub fn audio_clock(&self) -> f64 {
        self.clock.get()
    }

    pub fn status(&self) -> PlaybackStatus {
        let (frame, video_time) = {
            let _transport = self.transport.lock();
            (self.current_frame(), self.video_time())
        };
        PlaybackStatus {
            frame,
            total_frames: self.total_frames(),
            video_time,
            audio_clock: self.audio_clock(),
            buffered_bytes: self.ring.available_read(),
            paused: self.is_paused(),
            muted: self.is_muted(),
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.feeder.stop();
    }
}
