use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Sensor bit depths the normalizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Eleven,
    Twelve,
    Sixteen,
}

impl BitDepth {
    pub const fn bits(self) -> u8 {
        match self {
            Self::Eight => 8,
            Self::Eleven => 11,
            Self::Twelve => 12,
            Self::Sixteen => 16,
        }
    }

    /// Left shift that widens a sample to 16 bits
    pub const fn shift(self) -> u32 {
        16 - self.bits() as u32
    }

    /// Bytes the driver uses per sample at this depth
    pub const fn elem_bytes(self) -> usize {
        match self {
            Self::Eight => 1,
            _ => 2,
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = CaptureError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(Self::Eight),
            11 => Ok(Self::Eleven),
            12 => Ok(Self::Twelve),
            16 => Ok(Self::Sixteen),
            other => Err(CaptureError::UnsupportedDepth(other)),
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Driver frame index, monotonic within a session
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Depth the sensor delivered before widening
    pub source_depth: BitDepth,
}

/// Immutable 16-bit-per-sample image.
///
/// Samples are little-endian `u16`, interleaved by channel, rows packed with
/// no padding. Cloning shares the buffer; nothing can write to it.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    data: Bytes,
    pub meta: FrameMetadata,
    /// Host time the frame was copied out of the driver
    pub captured_at: Instant,
}

impl NormalizedFrame {
    pub(crate) fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta,
            captured_at: Instant::now(),
        }
    }

    /// Size in bytes of a packed 16-bit frame with these dimensions
    pub fn expected_len(width: u32, height: u32, channels: u8) -> usize {
        width as usize * height as usize * channels as usize * 2
    }

    pub fn index(&self) -> u64 {
        self.meta.index
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn channels(&self) -> u8 {
        self.meta.channels
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Sample at column `x`, row `y`, channel `c`
    pub fn sample(&self, x: u32, y: u32, c: u8) -> Option<u16> {
        if x >= self.meta.width || y >= self.meta.height || c >= self.meta.channels {
            return None;
        }
        let channels = self.meta.channels as usize;
        let offset = ((y as usize * self.meta.width as usize + x as usize) * channels
            + c as usize)
            * 2;
        let pair = self.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn samples(&self) -> impl Iterator<Item = u16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }
}
