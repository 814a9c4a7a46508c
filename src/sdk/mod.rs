//! Boundary to the vendor camera driver.
//!
//! The acquisition core only ever talks to the driver through [`NativeSdk`].
//! Every call is assumed to be slow and potentially blocking, and every
//! failure comes back as a [`NativeCode`] carrying the vendor status value.

pub mod sim;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sim::SimulatedSdk;

/// Opaque reference to an open camera connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Vendor status codes the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NativeCode {
    #[error("general failure")]
    Failure,
    #[error("not enough memory")]
    NoMemory,
    #[error("no camera")]
    NoCamera,
    #[error("driver not initialized")]
    NotInit,
    #[error("driver busy")]
    Busy,
    #[error("wait aborted")]
    Abort,
    #[error("timed out")]
    Timeout,
    #[error("frame data lost")]
    LostFrame,
    #[error("USB status error")]
    UsbStatusError,
    #[error("invalid camera handle")]
    InvalidHandle,
    #[error("not supported with current settings")]
    NotSupported,
    #[error("vendor status {0:#010x}")]
    Other(u32),
}

impl NativeCode {
    pub const SUCCESS: u32 = 0x0000_0001;

    /// Map a raw vendor status value. Returns `None` for success codes.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & 0x8000_0000 == 0 {
            return None;
        }
        Some(match raw {
            0x8000_0000 => Self::Failure,
            0x8000_0101 => Self::NoMemory,
            0x8000_0105 => Self::NoCamera,
            0x8000_0203 => Self::NotInit,
            0x8000_0202 => Self::Busy,
            0x8000_0207 => Self::Abort,
            0x8000_0208 => Self::Timeout,
            0x8000_0209 => Self::LostFrame,
            0x8000_020B => Self::UsbStatusError,
            0x8000_0302 => Self::InvalidHandle,
            0x8000_0312 => Self::NotSupported,
            other => Self::Other(other),
        })
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::Failure => 0x8000_0000,
            Self::NoMemory => 0x8000_0101,
            Self::NoCamera => 0x8000_0105,
            Self::NotInit => 0x8000_0203,
            Self::Busy => 0x8000_0202,
            Self::Abort => 0x8000_0207,
            Self::Timeout => 0x8000_0208,
            Self::LostFrame => 0x8000_0209,
            Self::UsbStatusError => 0x8000_020B,
            Self::InvalidHandle => 0x8000_0302,
            Self::NotSupported => 0x8000_0312,
            Self::Other(raw) => raw,
        }
    }

    /// Codes that mean the camera is gone rather than momentarily unhappy.
    pub const fn is_disconnect(self) -> bool {
        matches!(
            self,
            Self::UsbStatusError | Self::NoCamera | Self::InvalidHandle
        )
    }
}

/// Convert a raw vendor status into a `Result`.
pub fn check(raw: u32) -> Result<(), NativeCode> {
    match NativeCode::from_raw(raw) {
        None => Ok(()),
        Some(code) => Err(code),
    }
}

/// Capture start modes understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Sequence,
    TriggerStandard,
    TriggerSynchronous,
    TriggerGlobal,
    TriggerSoftware,
    TriggerGps,
    TriggerStandardNonOverlap,
}

impl CaptureMode {
    pub const fn raw(self) -> u32 {
        match self {
            Self::Sequence => 0x00,
            Self::TriggerStandard => 0x01,
            Self::TriggerSynchronous => 0x02,
            Self::TriggerGlobal => 0x03,
            Self::TriggerSoftware => 0x04,
            Self::TriggerGps => 0x05,
            Self::TriggerStandardNonOverlap => 0x11,
        }
    }
}

/// Trigger attributes applied before the driver starts capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerConfig {
    pub mode: CaptureMode,
    pub frames_per_trigger: u32,
    pub buffer_frames: u32,
}

impl TriggerConfig {
    /// Free-running stream: one frame per trigger, double buffered.
    pub const fn continuous() -> Self {
        Self {
            mode: CaptureMode::Sequence,
            frames_per_trigger: 1,
            buffer_frames: 2,
        }
    }

    /// One frame, one buffer.
    pub const fn single() -> Self {
        Self {
            mode: CaptureMode::Sequence,
            frames_per_trigger: 1,
            buffer_frames: 1,
        }
    }
}

/// Host bus the camera is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Usb2,
    Usb3,
}

impl Bus {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0x200 | 0x210 => Self::Usb2,
            _ => Self::Usb3,
        }
    }
}

/// Identification data reported by an open camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial_number: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub firmware_version: u32,
    pub api_version: String,
    pub channels: u8,
    pub bus: Bus,
}

/// Frame as handed over by the driver.
///
/// `data` is already copied out of the driver's recycled buffer slot, so it
/// can outlive the next wait. `header_len` bytes precede the first row.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub header_len: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub depth: u8,
    pub channels: u8,
    pub elem_bytes: u8,
    pub index: u64,
}

/// The narrow driver surface the acquisition core depends on.
///
/// Implementations synchronise internally; the core serialises capture calls
/// per handle but `abort_wait` may arrive from another thread while a
/// `wait_for_frame` is blocked and must unblock it.
pub trait NativeSdk: Send + Sync {
    /// Bring up the driver layer. Returns the number of attached cameras.
    fn initialize(&self) -> Result<u32, NativeCode>;

    fn uninitialize(&self) -> Result<(), NativeCode>;

    /// Fails with [`NativeCode::NotInit`] before [`NativeSdk::initialize`].
    fn device_count(&self) -> Result<u32, NativeCode>;

    fn open_device(&self, index: u32) -> Result<DeviceHandle, NativeCode>;

    fn close_device(&self, handle: DeviceHandle) -> Result<(), NativeCode>;

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, NativeCode>;

    fn allocate_buffer(&self, handle: DeviceHandle) -> Result<(), NativeCode>;

    fn release_buffer(&self, handle: DeviceHandle) -> Result<(), NativeCode>;

    fn start_capture(&self, handle: DeviceHandle, trigger: TriggerConfig)
        -> Result<(), NativeCode>;

    fn stop_capture(&self, handle: DeviceHandle) -> Result<(), NativeCode>;

    fn abort_wait(&self, handle: DeviceHandle) -> Result<(), NativeCode>;

    fn wait_for_frame(&self, handle: DeviceHandle, timeout: Duration)
        -> Result<RawFrame, NativeCode>;
}
