//! One-frame capture outside of streaming.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::capture::acquisition::{AcquisitionController, AcquisitionState};
use crate::capture::normalize::normalize;
use crate::capture::NormalizedFrame;
use crate::error::{CaptureError, Result};
use crate::sdk::{DeviceHandle, TriggerConfig};

impl AcquisitionController {
    /// Arm the camera for exactly one frame and wait up to `timeout` for it.
    ///
    /// Refused with `Busy` while streaming or while another single shot is
    /// in flight. The transition lock covers arming and teardown but not the
    /// wait, so stop and start calls made meanwhile return at once. Once the
    /// buffer is allocated the driver is always aborted, stopped and
    /// released, whatever happened in between.
    #[instrument(skip(self), fields(device = self.shared.session.index()))]
    pub fn capture_once(&self, timeout: Duration) -> Result<NormalizedFrame> {
        let handle = self.shared.session.handle()?;
        let sdk = self.shared.session.sdk();

        {
            let mut transition = self.lock_transition();
            if transition.state != AcquisitionState::Idle || transition.single_shot {
                return Err(CaptureError::Busy);
            }
            sdk.allocate_buffer(handle)?;
            if let Err(code) = sdk.start_capture(handle, TriggerConfig::single()) {
                self.release_single_shot(handle);
                return Err(code.into());
            }
            transition.single_shot = true;
        }

        let result = sdk.wait_for_frame(handle, timeout);

        {
            let mut transition = self.lock_transition();
            self.release_single_shot(handle);
            transition.single_shot = false;
        }

        let raw = result?;
        debug!(index = raw.index, "single frame captured");
        normalize(&raw)
    }

    /// Abort, stop and release. Called with the transition lock held.
    fn release_single_shot(&self, handle: DeviceHandle) {
        let session = &self.shared.session;
        if !session.is_valid(handle) {
            warn!("session closed during single shot, skipping driver teardown");
            return;
        }
        let sdk = session.sdk();
        if let Err(code) = sdk.abort_wait(handle) {
            warn!("single-shot abort-wait failed: {code}");
        }
        if let Err(code) = sdk.stop_capture(handle) {
            warn!("single-shot stop-capture failed: {code}");
        }
        if let Err(code) = sdk.release_buffer(handle) {
            warn!("single-shot buffer release failed: {code}");
        }
    }

    /// [`capture_once`](Self::capture_once) on the blocking pool.
    pub async fn capture_once_async(self: &Arc<Self>, timeout: Duration) -> Result<NormalizedFrame> {
        let controller = Arc::clone(self);
        tokio::task::spawn_blocking(move || controller.capture_once(timeout)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::acquisition::AcquisitionOptions;
    use crate::capture::DeviceSession;
    use crate::sdk::sim::NativeCall;
    use crate::sdk::{NativeCode, NativeSdk, SimulatedSdk};
    use std::thread;
    use std::time::Instant;

    fn controller() -> (Arc<SimulatedSdk>, AcquisitionController) {
        let sdk = Arc::new(SimulatedSdk::new(1));
        sdk.initialize().expect("initialize should succeed");
        let session = Arc::new(DeviceSession::open(sdk.clone(), 0).expect("open should succeed"));
        let options = AcquisitionOptions {
            wait_timeout: Duration::from_millis(20),
            single_shot_timeout: Duration::from_millis(50),
            ..AcquisitionOptions::default()
        };
        (sdk, AcquisitionController::new(session, options))
    }

    fn cleanup_calls(sdk: &SimulatedSdk) -> Vec<NativeCall> {
        sdk.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    NativeCall::AbortWait | NativeCall::Stop | NativeCall::Release
                )
            })
            .collect()
    }

    #[test]
    fn test_single_shot_returns_frame() {
        let (sdk, ctl) = controller();
        sdk.push_frame(SimulatedSdk::solid_frame(4, 2, 12, 1, 0x0FFF, 9));

        let frame = ctl
            .capture_once(Duration::from_millis(200))
            .expect("single frame");
        assert_eq!(frame.index(), 9);
        assert!(frame.samples().all(|s| s == 0xFFF0));
        assert_eq!(sdk.last_trigger(), Some(TriggerConfig::single()));
        assert_eq!(
            cleanup_calls(&sdk),
            vec![NativeCall::AbortWait, NativeCall::Stop, NativeCall::Release]
        );
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_timeout_still_cleans_up() {
        let (sdk, ctl) = controller();
        assert!(matches!(
            ctl.capture_once(Duration::from_millis(30)),
            Err(CaptureError::Timeout)
        ));
        assert_eq!(
            cleanup_calls(&sdk),
            vec![NativeCall::AbortWait, NativeCall::Stop, NativeCall::Release]
        );
        assert!(!sdk.capturing());
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_start_failure_still_cleans_up() {
        let (sdk, ctl) = controller();
        sdk.fail_start(Some(NativeCode::Failure));
        assert!(matches!(
            ctl.capture_once(Duration::from_millis(30)),
            Err(CaptureError::NativeFailure(NativeCode::Failure))
        ));
        assert_eq!(sdk.call_count(NativeCall::Release), 1);
        assert_eq!(sdk.call_count(NativeCall::Wait), 0);
    }

    #[test]
    fn test_refused_while_streaming() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        let allocations = sdk.call_count(NativeCall::Allocate);
        assert!(matches!(
            ctl.capture_once(Duration::from_millis(30)),
            Err(CaptureError::Busy)
        ));
        assert_eq!(sdk.call_count(NativeCall::Allocate), allocations);
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_capture_while_idle_falls_through() {
        let (sdk, ctl) = controller();
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 0xFF, 4));
        let frame = ctl.capture().expect("single shot through capture");
        assert_eq!(frame.sample(0, 0, 0), Some(0xFF00));
        assert!(!ctl.is_streaming());
    }

    #[test]
    fn test_stop_and_start_do_not_wait_for_single_shot() {
        let (sdk, ctl) = controller();
        let ctl = Arc::new(ctl);
        let shot = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.capture_once(Duration::from_millis(600)))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while sdk.call_count(NativeCall::Wait) == 0 {
            assert!(Instant::now() < deadline, "single shot never started waiting");
            thread::sleep(Duration::from_millis(2));
        }

        let asked = Instant::now();
        assert!(ctl.stop_capture().expect("stop during single shot").is_clean());
        assert!(matches!(ctl.start_capture(), Err(CaptureError::Busy)));
        assert!(matches!(
            ctl.capture_once(Duration::from_millis(10)),
            Err(CaptureError::Busy)
        ));
        assert!(asked.elapsed() < Duration::from_millis(300));

        assert!(matches!(
            shot.join().expect("single shot thread"),
            Err(CaptureError::Timeout)
        ));
        assert_eq!(sdk.call_count(NativeCall::Allocate), 1);
        assert_eq!(sdk.call_count(NativeCall::Release), 1);
        assert!(!sdk.buffer_allocated());
        assert!(!sdk.capturing());

        ctl.start_capture().expect("start after single shot");
        ctl.stop_capture().expect("stop");
    }

    #[tokio::test]
    async fn test_async_single_shot() {
        let (sdk, ctl) = controller();
        let ctl = Arc::new(ctl);
        sdk.push_frame(SimulatedSdk::solid_frame(2, 2, 16, 1, 0x1234, 1));
        let frame = ctl
            .capture_once_async(Duration::from_millis(200))
            .await
            .expect("async single frame");
        assert_eq!(frame.sample(1, 1, 0), Some(0x1234));
    }
}
