//! Raw sensor buffer to canonical 16-bit conversion.
//!
//! Narrower depths are widened with a plain left shift, so a full-scale
//! 8-bit sample becomes `0xFF00` and a full-scale 12-bit sample `0xFFF0`.
//! Consumers rely on this exact mapping; it is not a rescale to `0xFFFF`.

use bytes::Bytes;

use crate::capture::frame::{BitDepth, FrameMetadata, NormalizedFrame};
use crate::error::{CaptureError, Result};
use crate::sdk::RawFrame;

/// Normalize a packed buffer (no header, rows without padding).
pub fn normalize_buffer(
    buffer: &[u8],
    width: u32,
    height: u32,
    depth: u8,
    channels: u8,
) -> Result<NormalizedFrame> {
    let depth = BitDepth::try_from(depth)?;
    let stride = row_bytes(width, channels, depth);
    let data = widen(buffer, 0, stride, width, height, channels, depth)?;
    Ok(NormalizedFrame::new(
        data,
        FrameMetadata {
            index: 0,
            width,
            height,
            channels,
            source_depth: depth,
        },
    ))
}

/// Normalize a frame copied out of the driver, honouring header and stride.
pub fn normalize(raw: &RawFrame) -> Result<NormalizedFrame> {
    let depth = BitDepth::try_from(raw.depth)?;
    if raw.elem_bytes as usize != depth.elem_bytes() {
        return Err(CaptureError::MalformedFrame(format!(
            "{} bytes per element at {}-bit depth",
            raw.elem_bytes, raw.depth
        )));
    }

    let data = widen(
        &raw.data,
        raw.header_len,
        raw.stride as usize,
        raw.width,
        raw.height,
        raw.channels,
        depth,
    )?;
    Ok(NormalizedFrame::new(
        data,
        FrameMetadata {
            index: raw.index,
            width: raw.width,
            height: raw.height,
            channels: raw.channels,
            source_depth: depth,
        },
    ))
}

fn row_bytes(width: u32, channels: u8, depth: BitDepth) -> usize {
    width as usize * channels as usize * depth.elem_bytes()
}

fn widen(
    buffer: &[u8],
    header_len: usize,
    stride: usize,
    width: u32,
    height: u32,
    channels: u8,
    depth: BitDepth,
) -> Result<Bytes> {
    let row_len = row_bytes(width, channels, depth);
    if stride < row_len {
        return Err(CaptureError::MalformedFrame(format!(
            "stride {stride} shorter than row of {row_len} bytes"
        )));
    }

    let needed = match height {
        0 => Some(header_len),
        h => stride
            .checked_mul(h as usize - 1)
            .and_then(|body| body.checked_add(row_len))
            .and_then(|body| body.checked_add(header_len)),
    }
    .ok_or_else(|| {
        CaptureError::MalformedFrame(format!(
            "header {header_len} + {height} rows of stride {stride} overflows"
        ))
    })?;
    if buffer.len() < needed {
        return Err(CaptureError::MalformedFrame(format!(
            "buffer holds {} bytes, {needed} required",
            buffer.len()
        )));
    }

    let mut out = Vec::with_capacity(NormalizedFrame::expected_len(width, height, channels));
    let shift = depth.shift();

    for y in 0..height as usize {
        let start = header_len + y * stride;
        let row = &buffer[start..start + row_len];
        match depth {
            BitDepth::Sixteen => out.extend_from_slice(row),
            BitDepth::Eight => {
                for &sample in row {
                    out.extend_from_slice(&(u16::from(sample) << shift).to_le_bytes());
                }
            }
            BitDepth::Eleven | BitDepth::Twelve => {
                for pair in row.chunks_exact(2) {
                    let sample = u16::from_le_bytes([pair[0], pair[1]]);
                    out.extend_from_slice(&(sample << shift).to_le_bytes());
                }
            }
        }
    }

    Ok(Bytes::from(out))
}
