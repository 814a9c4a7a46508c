use std::sync::Arc;

use tracing::{info, warn};

use crate::capture::DeviceSession;
use crate::error::{CaptureError, Result};
use crate::sdk::{NativeCode, NativeSdk};

/// Open the first camera that accepts a connection
pub fn auto_detect_device(sdk: Arc<dyn NativeSdk>) -> Result<DeviceSession> {
    info!("Auto-detecting cameras...");

    let count = sdk.device_count().map_err(|code| match code {
        NativeCode::NotInit => CaptureError::SdkNotInitialized,
        other => CaptureError::NativeFailure(other),
    })?;

    for index in 0..count {
        match DeviceSession::open(sdk.clone(), index) {
            Ok(session) => {
                info!("Found camera at index {}", index);
                return Ok(session);
            }
            Err(e) => warn!("Camera {} not usable: {}", index, e),
        }
    }

    Err(CaptureError::DeviceUnavailable(count))
}

/// Open the configured camera, falling back to auto-detection when it is busy
/// or missing
pub fn open_device(sdk: Arc<dyn NativeSdk>, index: u32) -> Result<DeviceSession> {
    match DeviceSession::open(sdk.clone(), index) {
        Ok(session) => Ok(session),
        Err(CaptureError::DeviceUnavailable(_) | CaptureError::NativeFailure(NativeCode::Busy)) => {
            warn!("Camera {} unavailable, auto-detecting", index);
            auto_detect_device(sdk)
        }
        Err(e) => Err(e),
    }
}
