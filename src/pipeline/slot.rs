//! Latest-wins frame slot
//!
//! One writer (the camera worker), any number of readers. The mutex only
//! guards reference swaps: frames and detection lists are `Arc`-shared, so the
//! critical section never scales with frame size.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::types::{Detection, Frame};

/// A consistent snapshot of the slot
#[derive(Debug, Clone)]
pub struct LatestFrame {
    pub frame: Frame,
    pub detections: Arc<Vec<Detection>>,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Default)]
struct SlotState {
    latest: Option<LatestFrame>,
    valid: bool,
}

#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrites the slot. Returns `false` and leaves the slot untouched if
    /// `sequence` does not advance past the stored one.
    pub fn publish(
        &self,
        frame: Frame,
        detections: Arc<Vec<Detection>>,
        sequence: u64,
        captured_at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.lock();
        if let Some(prev) = &state.latest {
            if sequence <= prev.sequence {
                return false;
            }
        }
        state.latest = Some(LatestFrame {
            frame,
            detections,
            sequence,
            captured_at,
        });
        state.valid = true;
        true
    }

    /// Clones the current contents. `None` before the first publish or after
    /// `invalidate`.
    pub fn read_latest(&self) -> Option<LatestFrame> {
        let state = self.lock();
        if state.valid {
            state.latest.clone()
        } else {
            None
        }
    }

    /// Hides the stored frame from readers. A later publish revalidates.
    pub fn invalidate(&self) {
        self.lock().valid = false;
    }

    /// Sequence of the stored frame, valid or not
    pub fn sequence(&self) -> u64 {
        self.lock().latest.as_ref().map_or(0, |l| l.sequence)
    }
}
