//! Audio output module
//!
//! This module contains all audio-related functionality including:
//! - The real-time render callback ([`renderer`])
//! - Output backends: cpal hardware and a simulated device ([`device`], [`simulated`])
//! - The armed/playing state machine used by the scheduler ([`engine`])
//!
//! ## Device clock
//!
//! The authoritative timing reference is the number of frames the output
//! callback has rendered since the stream opened. Onsets are reported as
//! that frame index plus the output latency the backend reports for the
//! block, so they are sample-accurate and independent of how late the
//! scheduler observes them.

pub mod device;
pub mod engine;
pub mod renderer;
pub mod simulated;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate and channel count of the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channels)
    }
}

/// A point on the device clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTimestamp {
    /// Frame index since the stream opened
    pub frame: u64,
    /// Device time in seconds
    pub seconds: f64,
}

/// Read-only view of the frame counter advanced by the output callback
#[derive(Debug, Clone)]
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl DeviceClock {
    pub(crate) fn new(frames: Arc<AtomicU64>, sample_rate: u32) -> Self {
        Self {
            frames,
            sample_rate,
        }
    }

    /// Frames rendered so far
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn now(&self) -> DeviceTimestamp {
        self.at(self.frames(), Duration::ZERO)
    }

    /// Timestamp of a frame index, shifted by the output latency
    pub fn at(&self, frame: u64, latency: Duration) -> DeviceTimestamp {
        let seconds = if self.sample_rate == 0 {
            0.0
        } else {
            frame as f64 / self.sample_rate as f64
        };
        DeviceTimestamp {
            frame,
            seconds: seconds + latency.as_secs_f64(),
        }
    }
}
