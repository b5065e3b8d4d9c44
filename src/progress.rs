use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of recent frame timings averaged for the remaining-time estimate.
pub const ETA_WINDOW: usize = 5;

/// Represents the current phase of a video conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    /// Rendering decoded frames to ASCII
    ConvertingFrames,
    /// Re-attaching the source audio track
    MergingAudio,
    /// Conversion completed successfully
    Complete,
}

/// Progress information for a video conversion, one update per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: ProgressPhase,
    /// Frames rendered so far
    pub completed: u64,
    /// Total frames (0 if unknown)
    pub total: u64,
    /// Percentage complete (0.0 to 100.0)
    pub percentage: f64,
    /// Estimated seconds left, when the total is known
    pub eta_secs: Option<f64>,
    /// Human-readable status
    pub message: String,
}

impl Progress {
    pub fn converting_frames(completed: u64, total: u64, eta: Option<Duration>) -> Self {
        let percentage = if total > 0 { (completed as f64 / total as f64 * 100.0).min(100.0) } else { 0.0 };
        let eta_secs = eta.map(|d| d.as_secs_f64());
        let message = match eta_secs {
            Some(s) => format!("Frame {} out of {} completed. About {:.2}s to go!", completed, total, s),
            None => format!("Frame {} completed", completed),
        };
        Self { phase: ProgressPhase::ConvertingFrames, completed, total, percentage, eta_secs, message }
    }

    pub fn merging_audio(total: u64) -> Self {
        Self {
            phase: ProgressPhase::MergingAudio,
            completed: total,
            total,
            percentage: 100.0,
            eta_secs: None,
            message: "Adding original audio...".to_string(),
        }
    }

    pub fn complete(total_frames: u64) -> Self {
        Self {
            phase: ProgressPhase::Complete,
            completed: total_frames,
            total: total_frames,
            percentage: 100.0,
            eta_secs: Some(0.0),
            message: format!("Conversion complete: {} frames", total_frames),
        }
    }
}

/// Moving average of the last [`ETA_WINDOW`] frame times.
#[derive(Debug, Clone, Default)]
pub struct EtaTracker {
    samples: [Duration; ETA_WINDOW],
    recorded: usize,
}

impl EtaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.samples[self.recorded % ETA_WINDOW] = elapsed;
        self.recorded += 1;
    }

    /// Mean of the recorded window, `None` before the first sample.
    pub fn average(&self) -> Option<Duration> {
        let n = self.recorded.min(ETA_WINDOW);
        if n == 0 {
            return None;
        }
        let sum: Duration = self.samples[..n].iter().sum();
        Some(sum / n as u32)
    }

    /// Time left for `remaining` frames at the current average.
    pub fn remaining(&self, remaining: u64) -> Option<Duration> {
        self.average().map(|avg| avg.mul_f64(remaining as f64))
    }
}
