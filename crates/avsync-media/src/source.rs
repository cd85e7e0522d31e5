/// Decoder collaborator interface and the one-shot ingest pass.
///
/// A `Decoder` hands out each stream once as an ordered iterator of decoded
/// frames. `ingest` drains both into their caches, skipping frames that fail
/// to decode, then marks the caches complete so waiting consumers can start.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::frame::{AudioChunk, AudioFormat, Image, VideoFrame};
use crate::frame_cache::FrameCache;

/// Per-stream decode failures logged before going quiet
const MAX_LOGGED_ERRORS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("corrupt {stream} packet near {pts:.3}s: {reason}")]
    Corrupt {
        stream: &'static str,
        pts: f64,
        reason: String,
    },
    #[error("decoder backend error: {0}")]
    Backend(String),
}

pub type AudioFrames<'a> = Box<dyn Iterator<Item = Result<AudioChunk, DecodeError>> + Send + 'a>;
pub type VideoFrames<'a> = Box<dyn Iterator<Item = Result<VideoFrame, DecodeError>> + Send + 'a>;

/// Source of decoded audio and video, already converted to the output
/// sample format and BGR24.
pub trait Decoder: Send {
    fn audio_format(&self) -> AudioFormat;

    /// Nominal video frame rate
    fn frame_rate(&self) -> f64;

    fn decode_audio(&mut self) -> AudioFrames<'_>;

    fn decode_video(&mut self) -> VideoFrames<'_>;
}

/// What one ingest pass produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub audio_chunks: usize,
    pub audio_errors: usize,
    pub video_frames: usize,
    pub video_errors: usize,
    pub audio_seconds: f64,
    pub video_seconds: f64,
    pub elapsed: Duration,
}

/// Decode everything into the caches. Any previous contents are dropped first.
pub fn ingest(
    decoder: &mut dyn Decoder,
    audio: &FrameCache<AudioChunk>,
    video: &FrameCache<VideoFrame>,
) -> IngestReport {
    let started = Instant::now();
    let mut report = IngestReport::default();

    audio.reset();
    video.reset();

    for (i, result) in decoder.decode_audio().enumerate() {
        match result {
            Ok(chunk) => {
                audio.push(chunk);
                report.audio_chunks += 1;
            }
            Err(e) => {
                report.audio_errors += 1;
                if report.audio_errors <= MAX_LOGGED_ERRORS {
                    warn!(chunk = i, "Skipping audio chunk: {}", e);
                }
            }
        }
    }
    report.audio_seconds = audio.last_pts();
    audio.mark_complete();
    debug!(chunks = report.audio_chunks, "Audio cache complete");

    for (i, result) in decoder.decode_video().enumerate() {
        match result {
            Ok(frame) => {
                video.push(frame);
                report.video_frames += 1;
            }
            Err(e) => {
                report.video_errors += 1;
                if report.video_errors <= MAX_LOGGED_ERRORS {
                    warn!(frame = i, "Skipping video frame: {}", e);
                }
            }
        }
    }
    report.video_seconds = video.last_pts();
    video.mark_complete();

    report.elapsed = started.elapsed();
    info!(
        audio_chunks = report.audio_chunks,
        video_frames = report.video_frames,
        audio_errors = report.audio_errors,
        video_errors = report.video_errors,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Ingest complete"
    );

    report
}

/// Run `ingest` on a dedicated thread.
pub fn spawn_ingest<D: Decoder + 'static>(
    mut decoder: D,
    audio: Arc<FrameCache<AudioChunk>>,
    video: Arc<FrameCache<VideoFrame>>,
) -> std::io::Result<JoinHandle<IngestReport>> {
    std::thread::Builder::new()
        .name("frame-ingest".into())
        .spawn(move || ingest(&mut decoder, &audio, &video))
}

// -- Synthetic source --

/// Sine tone plus a sweeping test-pattern bar. Stands in for a file decoder
/// when no media backend is available, and gives tests exact timestamps.
#[derive(Debug, Clone)]
pub struct ToneDecoder {
    format: AudioFormat,
    frequency: f64,
    amplitude: f64,
    duration: f64,
    fps: f64,
    width: u32,
    height: u32,
    chunk_samples: usize,
}

impl ToneDecoder {
    pub fn new(duration: f64, fps: f64) -> Self {
        Self {
            format: AudioFormat::default(),
            frequency: 440.0,
            amplitude: 0.25,
            duration: duration.max(0.0),
            fps: if fps > 0.0 { fps } else { 30.0 },
            width: 64,
            height: 36,
            chunk_samples: 1024,
        }
    }

    pub fn with_frequency(mut self, hz: f64) -> Self {
        self.frequency = hz;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    /// Samples per channel in each emitted chunk
    pub fn with_chunk_samples(mut self, samples: usize) -> Self {
        self.chunk_samples = samples.max(1);
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.format.sample_rate = rate.max(1);
        self
    }

    fn total_samples(&self) -> usize {
        (self.duration * self.format.sample_rate as f64).round() as usize
    }

    fn total_frames(&self) -> usize {
        (self.duration * self.fps).round() as usize
    }

    fn pattern(&self, index: usize, total: usize) -> Image {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_x = if total > 0 { index * w / total } else { 0 };
        let shade = (index % 256) as u8;

        let mut data = vec![0u8; w * h * 3];
        for (y, row) in data.chunks_exact_mut(w * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                if x == bar_x {
                    px.copy_from_slice(&[255, 255, 255]);
                } else {
                    px.copy_from_slice(&[shade, (y * 255 / h.max(1)) as u8, 64]);
                }
            }
        }

        Image {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

impl Decoder for ToneDecoder {
    fn audio_format(&self) -> AudioFormat {
        self.format
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn decode_audio(&mut self) -> AudioFrames<'_> {
        let total = self.total_samples();
        let rate = self.format.sample_rate as f64;
        let channels = self.format.channels as usize;
        let step = TAU * self.frequency / rate;
        let amplitude = self.amplitude * i16::MAX as f64;
        let chunk_samples = self.chunk_samples;
        let mut emitted = 0usize;

        Box::new(std::iter::from_fn(move || {
            if emitted >= total {
                return None;
            }
            let samples = chunk_samples.min(total - emitted);
            let mut data = Vec::with_capacity(samples * channels * 2);
            for n in emitted..emitted + samples {
                let value = ((n as f64 * step).sin() * amplitude) as i16;
                for _ in 0..channels {
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }

            let chunk = AudioChunk {
                data,
                pts: emitted as f64 / rate,
                samples,
            };
            emitted += samples;
            Some(Ok(chunk))
        }))
    }

    fn decode_video(&mut self) -> VideoFrames<'_> {
        let total = self.total_frames();
        let this = &*self;
        Box::new((0..total).map(move |i| {
            Ok(VideoFrame {
                image: this.pattern(i, total),
                pts: i as f64 / this.fps,
            })
        }))
    }
}
