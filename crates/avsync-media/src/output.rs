use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::AudioFormat;
use crate::ringbuf::RingBuffer;

/// Body of the real-time audio sink callback.
///
/// `render` runs on the device thread: no allocation, no logging, and the
/// ring buffer's copy lock is the only lock it takes.
pub struct AudioOutput {
    ring: Arc<RingBuffer>,
    format: AudioFormat,
    paused: AtomicBool,
    muted: AtomicBool,
    played_bytes: AtomicU64,
}

impl AudioOutput {
    pub fn new(ring: Arc<RingBuffer>, format: AudioFormat) -> Self {
        Self {
            ring,
            format,
            paused: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            played_bytes: AtomicU64::new(0),
        }
    }

    /// Fill `out` with the next buffered PCM. Whatever the ring cannot supply
    /// stays silent. Returns the number of bytes taken from the ring.
    pub fn render(&self, out: &mut [u8]) -> usize {
        out.fill(0);

        if self.paused.load(Ordering::Relaxed) || self.muted.load(Ordering::Relaxed) {
            return 0;
        }

        let n = self.ring.read(out);
        self.played_bytes.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn played_bytes(&self) -> u64 {
        self.played_bytes.load(Ordering::Relaxed)
    }

    /// Audio actually delivered to the device since creation
    pub fn played_seconds(&self) -> f64 {
        self.format.seconds_for_bytes(self.played_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_with(bytes: &[u8]) -> AudioOutput {
        let ring = Arc::new(RingBuffer::new(1024));
        ring.write(bytes);
        AudioOutput::new(ring, AudioFormat::default())
    }

    #[test]
    fn short_read_leaves_silence() {
        let output = output_with(&[9u8; 6]);
        let mut out = [0xFFu8; 10];
        assert_eq!(output.render(&mut out), 6);
        assert_eq!(out, [9, 9, 9, 9, 9, 9, 0, 0, 0, 0]);
        assert_eq!(output.played_bytes(), 6);
    }

    #[test]
    fn paused_and_muted_output_silence_without_draining() {
        let output = output_with(&[9u8; 8]);
        let mut out = [0xFFu8; 8];

        output.set_paused(true);
        assert_eq!(output.render(&mut out), 0);
        assert_eq!(out, [0; 8]);

        output.set_paused(false);
        output.set_muted(true);
        assert_eq!(output.render(&mut out), 0);
        assert_eq!(output.played_bytes(), 0);

        output.set_muted(false);
        assert_eq!(output.render(&mut out), 8);
    }

    #[test]
    fn played_seconds_follows_format() {
        let output = output_with(&[1u8; 882]);
        let mut out = vec![0u8; 882];
        output.render(&mut out);
        assert!((output.played_seconds() - 0.005).abs() < 1e-9);
    }
}
