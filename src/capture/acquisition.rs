//! Continuous acquisition: start/stop state machine and the capture worker.
//!
//! State transitions are check-and-set under one mutex. The blocking parts of
//! a stop (abort, join, driver teardown) run outside it, with the controller
//! parked in `Stopping` so a racing start is refused instead of torn.
//!
//! The worker owns nothing but a handle and a cancel flag. It waits on the
//! driver with a bounded timeout, normalizes each frame, replaces the
//! latest-frame slot and then calls subscribers in registration order. It
//! never exits on driver errors, only when cancelled.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::normalize::normalize;
use crate::capture::{DeviceSession, NormalizedFrame};
use crate::error::{CaptureError, ResourceCleanupWarning, Result};
use crate::pipeline::{AcquisitionStats, LatestFrame, StatsSnapshot};
use crate::sdk::{DeviceHandle, NativeCode, TriggerConfig};
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Streaming,
    Stopping,
}

impl AcquisitionState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Streaming => 1,
            Self::Stopping => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Streaming,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// Outcome of a successful stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReport {
    Clean,
    /// Teardown went ahead but some steps misbehaved
    Degraded(Vec<ResourceCleanupWarning>),
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Health notifications from the acquisition loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionEvent {
    Started,
    Stopped {
        degraded: bool,
    },
    /// Failure streak reached the configured threshold
    Degraded {
        consecutive_failures: u64,
        last_error: NativeCode,
    },
    /// First good frame after a degraded or disconnected streak
    Recovered,
    /// The driver reported the camera gone
    Disconnected {
        code: NativeCode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type FrameCallback = Arc<dyn Fn(NormalizedFrame) + Send + Sync>;

/// Timing knobs for the acquisition loop.
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// Bound on each driver wait
    pub wait_timeout: Duration,
    /// Pause after a non-timeout driver error
    pub retry_backoff: Duration,
    /// How long a stop waits for the worker before detaching it
    pub join_timeout: Duration,
    /// Default bound for single-shot captures issued through `capture`
    pub single_shot_timeout: Duration,
    /// Failure streak that raises a `Degraded` event
    pub degraded_threshold: u64,
    /// Pin the worker to this core
    pub worker_core: Option<usize>,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(1000),
            retry_backoff: Duration::from_millis(100),
            join_timeout: Duration::from_millis(5000),
            single_shot_timeout: Duration::from_millis(10_000),
            degraded_threshold: 5,
            worker_core: None,
        }
    }
}

impl From<&CaptureConfig> for AcquisitionOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            single_shot_timeout: Duration::from_millis(config.single_shot_timeout_ms),
            degraded_threshold: config.degraded_threshold.max(1),
            worker_core: config.worker_core,
        }
    }
}

/// State shared with the worker thread.
pub(super) struct Shared {
    pub(super) session: Arc<DeviceSession>,
    latest: LatestFrame,
    subscribers: RwLock<Vec<(SubscriptionId, FrameCallback)>>,
    stats: AcquisitionStats,
    events: flume::Sender<AcquisitionEvent>,
    pub(super) options: AcquisitionOptions,
}

impl Shared {
    fn emit(&self, event: AcquisitionEvent) {
        if self.events.try_send(event).is_err() {
            trace!("event queue full, dropping event");
        }
    }

    fn publish(&self, frame: NormalizedFrame) {
        // cache first so a counted frame is always readable
        self.latest.store(frame.clone());
        self.stats.record_frame(frame.index());

        // callbacks run without the registry lock so they may (un)subscribe
        let subscribers: Vec<FrameCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in subscribers {
            let frame = frame.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                error!("frame subscriber panicked");
            }
        }
    }
}

struct Worker {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
    /// Disconnects when the worker thread finishes, even by panic
    exited: Receiver<()>,
    handle: DeviceHandle,
}

pub(super) struct Transition {
    pub(super) state: AcquisitionState,
    /// A single shot owns the driver; the state stays `Idle` meanwhile
    pub(super) single_shot: bool,
    worker: Option<Worker>,
    /// Worker being torn down while `Stopping`
    stopping_worker: Option<ThreadId>,
}

/// Drives one camera session through idle, streaming and stopping.
pub struct AcquisitionController {
    pub(super) shared: Arc<Shared>,
    transition: Mutex<Transition>,
    /// Signalled when a stop finishes its teardown
    settled: Condvar,
    /// Lock-free mirror of `transition.state` for queries
    state: AtomicU8,
    events: flume::Receiver<AcquisitionEvent>,
    next_subscription: AtomicU64,
}

impl AcquisitionController {
    pub fn new(session: Arc<DeviceSession>, options: AcquisitionOptions) -> Self {
        let (events_tx, events_rx) = flume::bounded(64);
        Self {
            shared: Arc::new(Shared {
                session,
                latest: LatestFrame::new(),
                subscribers: RwLock::new(Vec::new()),
                stats: AcquisitionStats::new(),
                events: events_tx,
                options,
            }),
            transition: Mutex::new(Transition {
                state: AcquisitionState::Idle,
                single_shot: false,
                worker: None,
                stopping_worker: None,
            }),
            settled: Condvar::new(),
            state: AtomicU8::new(AcquisitionState::Idle.to_u8()),
            events: events_rx,
            next_subscription: AtomicU64::new(1),
        }
    }

    pub(super) fn lock_transition(&self) -> MutexGuard<'_, Transition> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, transition: &mut Transition, state: AcquisitionState) {
        transition.state = state;
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == AcquisitionState::Streaming
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.shared.session
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Health event stream. Events are dropped when nobody drains it.
    pub fn events(&self) -> flume::Receiver<AcquisitionEvent> {
        self.events.clone()
    }

    /// Start continuous acquisition. A no-op when already streaming.
    #[instrument(skip(self), fields(device = self.shared.session.index()))]
    pub fn start_capture(&self) -> Result<()> {
        let handle = self.shared.session.handle()?;
        let mut transition = self.lock_transition();

        match transition.state {
            AcquisitionState::Streaming => return Ok(()),
            AcquisitionState::Stopping => return Err(CaptureError::Busy),
            AcquisitionState::Idle if transition.single_shot => return Err(CaptureError::Busy),
            AcquisitionState::Idle => {}
        }

        let sdk = self.shared.session.sdk();
        sdk.allocate_buffer(handle)?;
        if let Err(code) = sdk.start_capture(handle, TriggerConfig::continuous()) {
            error!("start-capture failed: {code}");
            if let Err(release) = sdk.release_buffer(handle) {
                warn!("buffer release during rollback failed: {release}");
            }
            return Err(code.into());
        }

        self.shared.stats.reset();
        self.shared.latest.clear();

        let cancel = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = channel::bounded::<()>(0);
        let shared = self.shared.clone();
        let worker_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name("dhyana-capture".into())
            .spawn(move || {
                let _exit = exit_tx;
                capture_loop(&shared, handle, &worker_cancel);
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                error!("failed to spawn capture worker: {err}");
                if let Err(code) = sdk.stop_capture(handle) {
                    warn!("stop-capture during rollback failed: {code}");
                }
                if let Err(code) = sdk.release_buffer(handle) {
                    warn!("buffer release during rollback failed: {code}");
                }
                return Err(CaptureError::Spawn(err));
            }
        };

        transition.worker = Some(Worker {
            cancel,
            thread_id: thread.thread().id(),
            thread,
            exited: exit_rx,
            handle,
        });
        self.set_state(&mut transition, AcquisitionState::Streaming);
        drop(transition);

        self.shared.emit(AcquisitionEvent::Started);
        info!("Continuous capture started");
        Ok(())
    }

    /// Stop continuous acquisition. A no-op when idle.
    ///
    /// Safe to call from any thread, including a frame subscriber running on
    /// the worker itself; in that case the worker is not joined and exits as
    /// soon as the callback returns.
    ///
    /// A stop that arrives while another is tearing down waits for that
    /// teardown and then returns `Clean`; the report belongs to the first
    /// caller. A single shot in flight is left alone and cleans up after
    /// itself, so stopping during one returns at once.
    #[instrument(skip(self), fields(device = self.shared.session.index()))]
    pub fn stop_capture(&self) -> Result<StopReport> {
        let worker = {
            let mut transition = self.lock_transition();
            loop {
                match transition.state {
                    AcquisitionState::Idle => {
                        if transition.single_shot {
                            debug!("single shot in flight, nothing to stop");
                        }
                        return Ok(StopReport::Clean);
                    }
                    AcquisitionState::Stopping => {
                        // the worker must not wait on the stop that is joining it
                        if transition.stopping_worker == Some(thread::current().id()) {
                            return Ok(StopReport::Clean);
                        }
                        transition = self
                            .settled
                            .wait(transition)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    AcquisitionState::Streaming => break,
                }
            }
            let worker = transition.worker.take();
            transition.stopping_worker = worker.as_ref().map(|w| w.thread_id);
            self.set_state(&mut transition, AcquisitionState::Stopping);
            worker
        };

        info!("Stopping capture...");
        let mut warnings = Vec::new();

        if let Some(worker) = worker {
            worker.cancel.store(true, Ordering::Release);
            let handle = worker.handle;
            let live = self.shared.session.is_valid(handle);
            let sdk = self.shared.session.sdk();

            if live {
                if let Err(code) = sdk.abort_wait(handle) {
                    warn!("abort-wait failed: {code}");
                    warnings.push(ResourceCleanupWarning::AbortWaitFailed(code));
                }
            }

            if thread::current().id() == worker.thread_id {
                debug!("stop requested from the capture worker, not joining");
            } else {
                match worker.exited.recv_timeout(self.shared.options.join_timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("capture worker did not stop in time, detaching");
                        warnings.push(ResourceCleanupWarning::JoinTimedOut);
                    }
                    _ => {
                        if worker.thread.join().is_err() {
                            error!("capture worker panicked");
                        }
                    }
                }
            }

            if live {
                if let Err(code) = sdk.stop_capture(handle) {
                    warn!("stop-capture failed: {code}");
                    warnings.push(ResourceCleanupWarning::StopFailed(code));
                }
                if let Err(code) = sdk.release_buffer(handle) {
                    warn!("buffer release failed: {code}");
                    warnings.push(ResourceCleanupWarning::ReleaseFailed(code));
                }
            } else {
                warn!("session closed while streaming, skipping driver teardown");
            }
        }

        self.shared.latest.clear();
        {
            let mut transition = self.lock_transition();
            transition.stopping_worker = None;
            self.set_state(&mut transition, AcquisitionState::Idle);
        }
        self.settled.notify_all();

        let degraded = !warnings.is_empty();
        self.shared.emit(AcquisitionEvent::Stopped { degraded });
        info!(
            "Capture stopped: {}",
            if degraded { "with warnings" } else { "clean" }
        );

        Ok(if degraded {
            StopReport::Degraded(warnings)
        } else {
            StopReport::Clean
        })
    }

    /// Newest frame while streaming; a single-shot capture while idle.
    pub fn capture(&self) -> Result<NormalizedFrame> {
        self.shared.session.handle()?;
        match self.state() {
            AcquisitionState::Streaming => self
                .shared
                .latest
                .load()
                .ok_or(CaptureError::FrameNotYetAvailable),
            AcquisitionState::Stopping => Err(CaptureError::Busy),
            AcquisitionState::Idle => self.capture_once(self.shared.options.single_shot_timeout),
        }
    }

    /// Register a frame listener. Listeners run on the worker thread in
    /// registration order; a slow listener delays the next frame.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(NormalizedFrame) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Listener backed by a bounded channel. Frames that do not fit are
    /// dropped for this receiver only.
    pub fn frame_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, flume::Receiver<NormalizedFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        let id = self.subscribe(move |frame| {
            if let Err(flume::TrySendError::Full(frame)) = tx.try_send(frame) {
                trace!(index = frame.index(), "frame channel full, dropping");
            }
        });
        (id, rx)
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if self.state() != AcquisitionState::Idle {
            if let Err(err) = self.stop_capture() {
                warn!("failed to stop capture on drop: {err}");
            }
        }
    }
}

fn capture_loop(shared: &Shared, handle: DeviceHandle, cancel: &AtomicBool) {
    let options = &shared.options;
    if let Some(id) = options.worker_core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!(core = id, "failed to pin capture worker");
        }
    }

    let sdk = shared.session.sdk();
    let mut degraded = false;
    let mut disconnected = false;

    debug!("capture worker running");
    while !cancel.load(Ordering::Acquire) {
        if !shared.session.is_valid(handle) {
            let streak = shared.stats.record_failure();
            if !disconnected {
                disconnected = true;
                warn!("session closed under the capture worker");
                shared.emit(AcquisitionEvent::Disconnected {
                    code: NativeCode::InvalidHandle,
                });
            }
            degraded |= check_degraded(shared, streak, NativeCode::InvalidHandle);
            thread::sleep(options.retry_backoff);
            continue;
        }

        match sdk.wait_for_frame(handle, options.wait_timeout) {
            Ok(raw) => {
                if cancel.load(Ordering::Acquire) {
                    break;
                }
                match normalize(&raw) {
                    Ok(frame) => {
                        trace!(index = frame.index(), "frame captured");
                        shared.publish(frame);
                        if degraded || disconnected {
                            degraded = false;
                            disconnected = false;
                            info!("capture recovered");
                            shared.emit(AcquisitionEvent::Recovered);
                        }
                    }
                    Err(err) => {
                        warn!(index = raw.index, "dropping frame: {err}");
                        let streak = shared.stats.record_failure();
                        degraded |= check_degraded(shared, streak, NativeCode::Failure);
                    }
                }
            }
            Err(NativeCode::Abort) => {
                debug!("wait aborted");
            }
            Err(NativeCode::Timeout) => {
                let streak = shared.stats.record_timeout();
                debug!(streak, "no frame within {:?}", options.wait_timeout);
                degraded |= check_degraded(shared, streak, NativeCode::Timeout);
            }
            Err(code) => {
                let streak = shared.stats.record_failure();
                error!(streak, "wait-for-frame failed: {code}");
                if code.is_disconnect() && !disconnected {
                    disconnected = true;
                    shared.emit(AcquisitionEvent::Disconnected { code });
                }
                degraded |= check_degraded(shared, streak, code);
                thread::sleep(options.retry_backoff);
            }
        }
    }
    debug!("capture worker exiting");
}

/// Raise `Degraded` exactly when the streak hits the threshold.
fn check_degraded(shared: &Shared, streak: u64, last_error: NativeCode) -> bool {
    if streak == shared.options.degraded_threshold {
        warn!(streak, "capture degraded: {last_error}");
        shared.emit(AcquisitionEvent::Degraded {
            consecutive_failures: streak,
            last_error,
        });
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::sim::NativeCall;
    use crate::sdk::{NativeSdk, SimulatedSdk};
    use std::time::Instant;

    fn fast_options() -> AcquisitionOptions {
        AcquisitionOptions {
            wait_timeout: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(5),
            join_timeout: Duration::from_millis(500),
            single_shot_timeout: Duration::from_millis(100),
            degraded_threshold: 3,
            worker_core: None,
        }
    }

    fn controller() -> (Arc<SimulatedSdk>, AcquisitionController) {
        controller_with(fast_options())
    }

    fn controller_with(options: AcquisitionOptions) -> (Arc<SimulatedSdk>, AcquisitionController) {
        let sdk = Arc::new(SimulatedSdk::new(1));
        sdk.initialize().expect("initialize should succeed");
        let session = Arc::new(DeviceSession::open(sdk.clone(), 0).expect("open should succeed"));
        (sdk, AcquisitionController::new(session, options))
    }

    /// Subscriber that signals when it starts and then blocks the worker.
    fn stall_worker(ctl: &AcquisitionController, stall: Duration) -> flume::Receiver<()> {
        let (entered_tx, entered_rx) = flume::bounded(1);
        ctl.subscribe(move |_| {
            let _ = entered_tx.try_send(());
            thread::sleep(stall);
        });
        entered_rx
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("first start");
        ctl.start_capture().expect("second start");
        assert!(ctl.is_streaming());
        assert_eq!(sdk.call_count(NativeCall::Allocate), 1);
        assert_eq!(sdk.call_count(NativeCall::Start), 1);
        assert_eq!(sdk.last_trigger(), Some(TriggerConfig::continuous()));
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_stop_twice_succeeds() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        assert!(ctl.stop_capture().expect("first stop").is_clean());
        assert!(ctl.stop_capture().expect("second stop").is_clean());
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert_eq!(sdk.call_count(NativeCall::Release), 1);
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_stop_while_idle_touches_nothing() {
        let (sdk, ctl) = controller();
        assert!(ctl.stop_capture().expect("stop").is_clean());
        assert_eq!(sdk.call_count(NativeCall::Stop), 0);
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let (sdk, ctl) = controller();
        sdk.fail_start(Some(NativeCode::Failure));
        assert!(ctl.start_capture().is_err());
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert!(!sdk.buffer_allocated());
        assert_eq!(sdk.call_count(NativeCall::Release), 1);
    }

    #[test]
    fn test_failed_allocate_leaves_idle() {
        let (sdk, ctl) = controller();
        sdk.fail_allocate(Some(NativeCode::NoMemory));
        assert!(matches!(
            ctl.start_capture(),
            Err(CaptureError::NativeFailure(NativeCode::NoMemory))
        ));
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert_eq!(sdk.call_count(NativeCall::Start), 0);
    }

    #[test]
    fn test_closed_session_is_not_connected() {
        let (sdk, ctl) = controller();
        ctl.session().close().expect("close");
        let before = sdk.calls().len();
        assert!(matches!(ctl.start_capture(), Err(CaptureError::NotConnected)));
        assert!(matches!(ctl.capture(), Err(CaptureError::NotConnected)));
        assert_eq!(sdk.calls().len(), before);
    }

    #[test]
    fn test_capture_before_first_frame() {
        let (_sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        assert!(matches!(
            ctl.capture(),
            Err(CaptureError::FrameNotYetAvailable)
        ));
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_frames_reach_subscribers_in_order() {
        let (sdk, ctl) = controller();
        let (_, rx) = ctl.frame_channel(16);
        ctl.start_capture().expect("start");

        for index in 1..=3 {
            sdk.push_frame(SimulatedSdk::solid_frame(2, 2, 8, 1, index as u16, index));
        }

        let indices: Vec<u64> = (0..3)
            .map(|_| {
                rx.recv_timeout(Duration::from_secs(2))
                    .expect("frame delivered")
                    .index()
            })
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);

        wait_until("cache update", || ctl.stats().last_index == 3);
        let latest = ctl.capture().expect("latest frame");
        assert_eq!(latest.index(), 3);
        assert_eq!(latest.sample(0, 0, 0), Some(3 << 8));

        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (sdk, ctl) = controller();
        let (id, rx) = ctl.frame_channel(4);
        assert!(ctl.unsubscribe(id));
        assert!(!ctl.unsubscribe(id));

        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 16, 1, 1, 1));
        wait_until("frame", || ctl.stats().frames_delivered == 1);
        assert!(rx.try_recv().is_err());
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_timeouts_do_not_stop_the_loop() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        wait_until("timeouts", || ctl.stats().timeouts >= 2);
        assert!(ctl.is_streaming());

        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 12, 1, 1, 10));
        wait_until("frame after timeouts", || ctl.stats().frames_delivered == 1);
        assert_eq!(ctl.stats().consecutive_failures, 0);
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_native_errors_raise_degraded_then_recovered() {
        let (sdk, ctl) = controller();
        let events = ctl.events();
        ctl.start_capture().expect("start");

        for _ in 0..3 {
            sdk.push_error(NativeCode::LostFrame);
        }
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        wait_until("recovery", || ctl.stats().frames_delivered == 1);
        ctl.stop_capture().expect("stop");

        let seen: Vec<AcquisitionEvent> = events.drain().collect();
        assert!(seen.contains(&AcquisitionEvent::Degraded {
            consecutive_failures: 3,
            last_error: NativeCode::LostFrame,
        }));
        assert!(seen.contains(&AcquisitionEvent::Recovered));
        assert_eq!(ctl.stats().native_failures, 3);
    }

    #[test]
    fn test_disconnect_is_reported_once() {
        let (sdk, ctl) = controller();
        let events = ctl.events();
        ctl.start_capture().expect("start");
        sdk.disconnect();
        wait_until("failures", || ctl.stats().native_failures >= 4);
        assert!(ctl.is_streaming());
        ctl.stop_capture().expect("stop");

        let disconnects = events
            .drain()
            .filter(|e| matches!(e, AcquisitionEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_stop_from_subscriber_does_not_deadlock() {
        let (sdk, ctl) = controller();
        let ctl = Arc::new(ctl);
        let results = Arc::new(Mutex::new(Vec::new()));

        {
            let weak = Arc::downgrade(&ctl);
            let results = results.clone();
            ctl.subscribe(move |_| {
                if let Some(ctl) = weak.upgrade() {
                    let report = ctl.stop_capture();
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(report.is_ok());
                }
            });
        }

        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        wait_until("stop from callback", || ctl.state() == AcquisitionState::Idle);

        assert_eq!(
            *results.lock().unwrap_or_else(PoisonError::into_inner),
            vec![true]
        );
        assert!(!sdk.capturing());
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_cleanup_failures_degrade_the_stop() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        sdk.fail_stop(Some(NativeCode::Busy));

        let report = ctl.stop_capture().expect("stop still succeeds");
        assert_eq!(
            report,
            StopReport::Degraded(vec![ResourceCleanupWarning::StopFailed(NativeCode::Busy)])
        );
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_join_timeout_degrades_but_tears_down() {
        let (sdk, ctl) = controller_with(AcquisitionOptions {
            join_timeout: Duration::from_millis(50),
            ..fast_options()
        });
        let entered = stall_worker(&ctl, Duration::from_millis(400));
        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        entered
            .recv_timeout(Duration::from_secs(2))
            .expect("subscriber running");

        let report = ctl.stop_capture().expect("stop still succeeds");
        assert_eq!(
            report,
            StopReport::Degraded(vec![ResourceCleanupWarning::JoinTimedOut])
        );
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert!(!sdk.capturing());
        assert!(!sdk.buffer_allocated());
    }

    #[test]
    fn test_second_stop_waits_for_teardown() {
        let (sdk, ctl) = controller_with(AcquisitionOptions {
            join_timeout: Duration::from_secs(2),
            ..fast_options()
        });
        let ctl = Arc::new(ctl);
        let entered = stall_worker(&ctl, Duration::from_millis(300));
        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        entered
            .recv_timeout(Duration::from_secs(2))
            .expect("subscriber running");

        let first = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.stop_capture())
        };
        wait_until("first stop", || ctl.state() == AcquisitionState::Stopping);

        assert!(ctl.stop_capture().expect("second stop").is_clean());
        assert_eq!(ctl.state(), AcquisitionState::Idle);
        assert!(!sdk.buffer_allocated());

        let report = first.join().expect("first stop thread").expect("first stop");
        assert!(report.is_clean());
    }

    #[test]
    fn test_stop_clears_cache() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        wait_until("frame", || ctl.stats().frames_delivered == 1);
        ctl.stop_capture().expect("stop");
        assert!(ctl.shared.latest.is_empty());
    }

    #[test]
    fn test_panicking_subscriber_keeps_loop_alive() {
        let (sdk, ctl) = controller();
        ctl.subscribe(|_| panic!("subscriber bug"));
        ctl.start_capture().expect("start");
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 1, 1));
        sdk.push_frame(SimulatedSdk::solid_frame(1, 1, 8, 1, 2, 2));
        wait_until("two frames", || ctl.stats().frames_delivered == 2);
        ctl.stop_capture().expect("stop");
    }

    #[test]
    fn test_drop_stops_streaming() {
        let (sdk, ctl) = controller();
        ctl.start_capture().expect("start");
        drop(ctl);
        assert!(!sdk.capturing());
        assert!(!sdk.buffer_allocated());
        assert!(sdk.device_count().is_ok());
    }
}
