//! In-process stand-in for the vendor driver.
//!
//! Behaves like the real driver where the acquisition core cares: waits block
//! up to their timeout, `abort_wait` unblocks a pending wait, capture calls
//! need an allocated buffer, and a pulled cable turns every capture call into
//! a USB status error. Frames come from a script, or from a free-running
//! test pattern when the script is empty.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{Bus, DeviceHandle, DeviceInfo, NativeCode, NativeSdk, RawFrame, TriggerConfig};

/// Most recent calls kept by [`SimulatedSdk::calls`]. Counts are unbounded.
pub const CALL_LOG_LIMIT: usize = 1024;

/// Native calls recorded by the simulator, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeCall {
    Initialize,
    Uninitialize,
    Open,
    Close,
    Info,
    Allocate,
    Release,
    Start,
    Stop,
    AbortWait,
    Wait,
}

/// Free-running frame source parameters.
#[derive(Debug, Clone, Copy)]
pub struct FramePattern {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub channels: u8,
    pub interval: Duration,
}

impl Default for FramePattern {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            depth: 12,
            channels: 1,
            interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
enum Scripted {
    Frame(RawFrame),
    Error(NativeCode),
}

#[derive(Debug, Default)]
struct DeviceState {
    index: u32,
    buffer_allocated: bool,
    capturing: bool,
    trigger: Option<TriggerConfig>,
}

#[derive(Debug, Default)]
struct SimState {
    initialized: bool,
    device_count: u32,
    next_handle: u64,
    open: HashMap<u64, DeviceState>,
    script: VecDeque<Scripted>,
    pattern: Option<FramePattern>,
    next_index: u64,
    abort_generation: u64,
    disconnected: bool,
    fail_allocate: Option<NativeCode>,
    fail_start: Option<NativeCode>,
    fail_stop: Option<NativeCode>,
    fail_release: Option<NativeCode>,
    calls: VecDeque<NativeCall>,
    call_counts: HashMap<NativeCall, usize>,
    last_trigger: Option<TriggerConfig>,
}

impl SimState {
    fn record(&mut self, call: NativeCall) {
        *self.call_counts.entry(call).or_default() += 1;
        if self.calls.len() == CALL_LOG_LIMIT {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// Simulated camera driver with scriptable frames and failures.
#[derive(Debug)]
pub struct SimulatedSdk {
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SimulatedSdk {
    /// A driver with `device_count` attached cameras. Not initialized yet.
    pub fn new(device_count: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                device_count,
                next_handle: 1,
                next_index: 1,
                ..SimState::default()
            }),
            wake: Condvar::new(),
        }
    }

    /// Generate frames on their own whenever the script runs dry.
    #[must_use]
    pub fn with_pattern(self, pattern: FramePattern) -> Self {
        self.lock().pattern = Some(pattern);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for the next wait.
    pub fn push_frame(&self, frame: RawFrame) {
        self.lock().script.push_back(Scripted::Frame(frame));
        self.wake.notify_all();
    }

    /// Queue a failure for the next wait.
    pub fn push_error(&self, code: NativeCode) {
        self.lock().script.push_back(Scripted::Error(code));
        self.wake.notify_all();
    }

    pub fn fail_allocate(&self, code: Option<NativeCode>) {
        self.lock().fail_allocate = code;
    }

    pub fn fail_start(&self, code: Option<NativeCode>) {
        self.lock().fail_start = code;
    }

    pub fn fail_stop(&self, code: Option<NativeCode>) {
        self.lock().fail_stop = code;
    }

    pub fn fail_release(&self, code: Option<NativeCode>) {
        self.lock().fail_release = code;
    }

    /// Simulate pulling the cable. Pending waits return immediately.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.wake.notify_all();
    }

    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }

    /// The last [`CALL_LOG_LIMIT`] native calls, oldest first.
    pub fn calls(&self) -> Vec<NativeCall> {
        self.lock().calls.iter().copied().collect()
    }

    /// Every call of this kind since creation, including ones aged out of
    /// the log.
    pub fn call_count(&self, call: NativeCall) -> usize {
        self.lock().call_counts.get(&call).copied().unwrap_or(0)
    }

    pub fn last_trigger(&self) -> Option<TriggerConfig> {
        self.lock().last_trigger
    }

    /// Whether any open device currently holds a driver buffer.
    pub fn buffer_allocated(&self) -> bool {
        self.lock().open.values().any(|d| d.buffer_allocated)
    }

    pub fn capturing(&self) -> bool {
        self.lock().open.values().any(|d| d.capturing)
    }

    /// Frame with every sample set to `value`.
    pub fn solid_frame(
        width: u32,
        height: u32,
        depth: u8,
        channels: u8,
        value: u16,
        index: u64,
    ) -> RawFrame {
        build_frame(width, height, depth, channels, index, |_, _| value)
    }

    fn device<'a>(
        state: &'a mut SimState,
        handle: DeviceHandle,
    ) -> Result<&'a mut DeviceState, NativeCode> {
        if !state.initialized {
            return Err(NativeCode::NotInit);
        }
        state
            .open
            .get_mut(&handle.raw())
            .ok_or(NativeCode::InvalidHandle)
    }
}

fn build_frame(
    width: u32,
    height: u32,
    depth: u8,
    channels: u8,
    index: u64,
    sample: impl Fn(u32, u32) -> u16,
) -> RawFrame {
    let elem_bytes: u8 = if depth <= 8 { 1 } else { 2 };
    let stride = width * u32::from(channels) * u32::from(elem_bytes);
    let mut data = Vec::with_capacity((stride * height) as usize);

    for y in 0..height {
        for x in 0..width {
            let value = sample(x, y);
            for _ in 0..channels {
                if elem_bytes == 1 {
                    data.push(value as u8);
                } else {
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    RawFrame {
        data: Bytes::from(data),
        header_len: 0,
        width,
        height,
        stride,
        depth,
        channels,
        elem_bytes,
        index,
    }
}

fn pattern_frame(pattern: &FramePattern, index: u64) -> RawFrame {
    let max = (1u32 << pattern.depth.min(16)) - 1;
    build_frame(
        pattern.width,
        pattern.height,
        pattern.depth,
        pattern.channels,
        index,
        |x, y| ((u64::from(x + y) + index) % (u64::from(max) + 1)) as u16,
    )
}

impl NativeSdk for SimulatedSdk {
    fn initialize(&self) -> Result<u32, NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Initialize);
        state.initialized = true;
        debug!(cameras = state.device_count, "simulated driver initialized");
        Ok(state.device_count)
    }

    fn uninitialize(&self) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Uninitialize);
        state.initialized = false;
        state.open.clear();
        self.wake.notify_all();
        Ok(())
    }

    fn device_count(&self) -> Result<u32, NativeCode> {
        let state = self.lock();
        if !state.initialized {
            return Err(NativeCode::NotInit);
        }
        Ok(state.device_count)
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle, NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Open);
        if !state.initialized {
            return Err(NativeCode::NotInit);
        }
        if index >= state.device_count {
            return Err(NativeCode::NoCamera);
        }
        if state.open.values().any(|d| d.index == index) {
            return Err(NativeCode::Busy);
        }

        let raw = state.next_handle;
        state.next_handle += 1;
        state.open.insert(
            raw,
            DeviceState {
                index,
                ..DeviceState::default()
            },
        );
        Ok(DeviceHandle::from_raw(raw))
    }

    fn close_device(&self, handle: DeviceHandle) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Close);
        state
            .open
            .remove(&handle.raw())
            .map(|_| ())
            .ok_or(NativeCode::InvalidHandle)
    }

    fn device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo, NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Info);
        let channels = state.pattern.map_or(1, |p| p.channels);
        let device = Self::device(&mut state, handle)?;
        Ok(DeviceInfo {
            model: "Dhyana 400BSI V3 (simulated)".to_owned(),
            serial_number: format!("SIM{:05}", device.index),
            vendor_id: 0x5453,
            product_id: 0xE422,
            firmware_version: 0x1F,
            api_version: "2.0.0.0-sim".to_owned(),
            channels,
            bus: Bus::from_raw(0x300),
        })
    }

    fn allocate_buffer(&self, handle: DeviceHandle) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Allocate);
        if state.disconnected {
            return Err(NativeCode::UsbStatusError);
        }
        if let Some(code) = state.fail_allocate {
            return Err(code);
        }
        let device = Self::device(&mut state, handle)?;
        if device.buffer_allocated {
            return Err(NativeCode::Busy);
        }
        device.buffer_allocated = true;
        Ok(())
    }

    fn release_buffer(&self, handle: DeviceHandle) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Release);
        let fail = state.fail_release;
        let device = Self::device(&mut state, handle)?;
        // the slot is gone even when the driver complains
        device.buffer_allocated = false;
        match fail {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn start_capture(
        &self,
        handle: DeviceHandle,
        trigger: TriggerConfig,
    ) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Start);
        state.last_trigger = Some(trigger);
        if state.disconnected {
            return Err(NativeCode::UsbStatusError);
        }
        if let Some(code) = state.fail_start {
            return Err(code);
        }
        let device = Self::device(&mut state, handle)?;
        if !device.buffer_allocated {
            return Err(NativeCode::Failure);
        }
        device.capturing = true;
        device.trigger = Some(trigger);
        Ok(())
    }

    fn stop_capture(&self, handle: DeviceHandle) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::Stop);
        let fail = state.fail_stop;
        let device = Self::device(&mut state, handle)?;
        device.capturing = false;
        device.trigger = None;
        self.wake.notify_all();
        match fail {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn abort_wait(&self, handle: DeviceHandle) -> Result<(), NativeCode> {
        let mut state = self.lock();
        state.record(NativeCall::AbortWait);
        Self::device(&mut state, handle)?;
        state.abort_generation += 1;
        self.wake.notify_all();
        Ok(())
    }

    fn wait_for_frame(
        &self,
        handle: DeviceHandle,
        timeout: Duration,
    ) -> Result<RawFrame, NativeCode> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.record(NativeCall::Wait);
        let generation = state.abort_generation;

        loop {
            if state.disconnected {
                return Err(NativeCode::UsbStatusError);
            }
            let device = Self::device(&mut state, handle)?;
            if !device.buffer_allocated || !device.capturing {
                return Err(NativeCode::Failure);
            }
            if state.abort_generation != generation {
                return Err(NativeCode::Abort);
            }

            match state.script.pop_front() {
                Some(Scripted::Frame(frame)) => {
                    trace!(index = frame.index, "simulated frame delivered");
                    return Ok(frame);
                }
                Some(Scripted::Error(code)) => return Err(code),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(NativeCode::Timeout);
            }
            let remaining = deadline - now;

            let pattern = state.pattern;
            match pattern {
                Some(pattern) if pattern.interval <= remaining => {
                    let (guard, result) = self
                        .wake
                        .wait_timeout(state, pattern.interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if result.timed_out()
                        && state.abort_generation == generation
                        && state.script.is_empty()
                        && !state.disconnected
                    {
                        let device = Self::device(&mut state, handle)?;
                        if device.capturing {
                            let index = state.next_index;
                            state.next_index += 1;
                            return Ok(pattern_frame(&pattern, index));
                        }
                    }
                }
                _ => {
                    let (guard, _) = self
                        .wake
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}
