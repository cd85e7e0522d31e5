pub mod clock;
pub mod controls;
pub mod feeder;
pub mod frame;
pub mod frame_cache;
pub mod output;
pub mod playback;
pub mod ringbuf;
pub mod source;

/// Audio may run at most this far ahead of the presented video (seconds)
pub const SYNC_THRESHOLD: f64 = 0.040;

/// Audio is re-seeked when its clock and the video time diverge by more than this (seconds)
pub const AUDIO_RESYNC_THRESHOLD: f64 = 1.0;

/// Seeks land on the first frame with `pts >= target - SEEK_EPSILON`
pub const SEEK_EPSILON: f64 = 0.05;

/// Ring buffer size in bytes, roughly one second of 48 kHz s16 stereo
pub const DEFAULT_RING_CAPACITY: usize = 192_000;

/// Sync cues within this many frames of the local position are ignored
pub const SYNC_FRAME_TOLERANCE: u32 = 2;
