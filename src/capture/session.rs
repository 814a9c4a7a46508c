//! One open connection to a camera.
//!
//! Every capture path asks the session for its handle first; once the session
//! is closed the handle is gone and callers get `NotConnected` without the
//! driver ever being called.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, instrument, warn};

use crate::error::{CaptureError, Result};
use crate::sdk::{DeviceHandle, DeviceInfo, NativeCode, NativeSdk};

pub struct DeviceSession {
    sdk: Arc<dyn NativeSdk>,
    index: u32,
    handle: RwLock<Option<DeviceHandle>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("index", &self.index)
            .field("handle", &self.current())
            .finish()
    }
}

impl DeviceSession {
    /// Open the camera at `index`. The driver layer must already be initialized.
    #[instrument(skip(sdk))]
    pub fn open(sdk: Arc<dyn NativeSdk>, index: u32) -> Result<Self> {
        let count = sdk.device_count().map_err(|code| match code {
            NativeCode::NotInit => CaptureError::SdkNotInitialized,
            other => CaptureError::NativeFailure(other),
        })?;
        if index >= count {
            return Err(CaptureError::DeviceUnavailable(index));
        }

        let handle = sdk.open_device(index).map_err(|code| match code {
            NativeCode::NotInit => CaptureError::SdkNotInitialized,
            NativeCode::NoCamera | NativeCode::InvalidHandle => {
                CaptureError::DeviceUnavailable(index)
            }
            other => CaptureError::NativeFailure(other),
        })?;

        info!(index, handle = handle.raw(), "camera opened");
        Ok(Self {
            sdk,
            index,
            handle: RwLock::new(Some(handle)),
        })
    }

    /// Close the connection. Closing twice is a successful no-op.
    #[instrument(skip(self), fields(index = self.index))]
    pub fn close(&self) -> Result<()> {
        let taken = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match taken {
            None => Ok(()),
            Some(handle) => {
                self.sdk.close_device(handle)?;
                info!("camera closed");
                Ok(())
            }
        }
    }

    /// Whether `handle` is the live handle of this session. No driver call.
    pub fn is_valid(&self, handle: DeviceHandle) -> bool {
        self.current() == Some(handle)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// The live handle, or `NotConnected`.
    pub fn handle(&self) -> Result<DeviceHandle> {
        self.current().ok_or(CaptureError::NotConnected)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn sdk(&self) -> &Arc<dyn NativeSdk> {
        &self.sdk
    }

    pub fn info(&self) -> Result<DeviceInfo> {
        let handle = self.handle()?;
        Ok(self.sdk.device_info(handle)?)
    }

    fn current(&self) -> Option<DeviceHandle> {
        *self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close camera on drop: {err}");
        }
    }
}
