use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Told about every frame a stream completes.
pub trait FrameObserver: Send + Sync {
    fn on_frame(&self, frame_id: u32, timestamp_us: u64);
}

struct FpsWindow {
    timestamps: VecDeque<u64>,
    frames: u64,
    last_id: u32,
}

/// Frame rate over a sliding window of frame timestamps.
pub struct FpsCalculator {
    window_us: u64,
    inner: Mutex<FpsWindow>,
}

impl FpsCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_us: window.as_micros() as u64,
            inner: Mutex::new(FpsWindow {
                timestamps: VecDeque::new(),
                frames: 0,
                last_id: 0,
            }),
        }
    }

    /// Frames per second inside the window, 0 until two frames arrived.
    pub fn fps(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match (inner.timestamps.front(), inner.timestamps.back()) {
            (Some(&first), Some(&last)) if last > first => {
                (inner.timestamps.len() - 1) as f64 * 1_000_000.0 / (last - first) as f64
            }
            _ => 0.0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).frames
    }

    pub fn last_frame_id(&self) -> u32 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).last_id
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FrameObserver for FpsCalculator {
    fn on_frame(&self, frame_id: u32, timestamp_us: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.frames += 1;
        inner.last_id = frame_id;
        // Timestamps going backwards means the clock was resynchronised
        if inner.timestamps.back().is_some_and(|&last| timestamp_us < last) {
            inner.timestamps.clear();
        }
        inner.timestamps.push_back(timestamp_us);
        while let Some(&first) = inner.timestamps.front() {
            if timestamp_us - first > self.window_us {
                inner.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
