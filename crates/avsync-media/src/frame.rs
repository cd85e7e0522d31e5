use serde::{Deserialize, Serialize};

/// Anything stored in a `FrameCache` carries a presentation timestamp.
pub trait Timestamped {
    /// Presentation time in seconds from stream start
    fn pts(&self) -> f64;
}

// -- Audio --

/// PCM layout of every chunk produced by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample per channel (2 for s16)
    pub sample_bytes: u16,
}

impl Default for AudioFormat {
    /// 44.1 kHz interleaved s16 stereo
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            sample_bytes: 2,
        }
    }
}

impl AudioFormat {
    /// Bytes for one sample across all channels
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.sample_bytes as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.sample_rate as usize
    }

    pub fn seconds_for_bytes(&self, bytes: u64) -> f64 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return 0.0;
        }
        bytes as f64 / bps as f64
    }
}

/// Decoded interleaved PCM plus its presentation time.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub pts: f64,
    /// Samples per channel in `data`
    pub samples: usize,
}

impl Timestamped for AudioChunk {
    fn pts(&self) -> f64 {
        self.pts
    }
}

// -- Video --

/// Packed BGR24 image.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }

    /// BGR triple at (x, y), or None outside the image
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.stride() + x as usize * 3;
        let px = self.data.get(at..at + 3)?;
        Some([px[0], px[1], px[2]])
    }
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Image,
    pub pts: f64,
}

impl Timestamped for VideoFrame {
    fn pts(&self) -> f64 {
        self.pts
    }
}
