//! Single-slot holder for the newest frame

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::NormalizedFrame;

/// Newest normalized frame, or nothing.
///
/// Not a queue: a store replaces whatever was there, and readers may skip
/// frames. The slot swaps whole `Arc`s, so a reader either sees a complete
/// frame or none at all. Lives apart from the acquisition state lock so
/// frame delivery never waits on state transitions.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: ArcSwapOption<NormalizedFrame>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer: replace the cached frame
    pub fn store(&self, frame: NormalizedFrame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    /// Consumer: copy of the cached frame, if any
    pub fn load(&self) -> Option<NormalizedFrame> {
        self.slot.load_full().map(|frame| (*frame).clone())
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }
}
