//! Stimulus buffers and their resolution
//!
//! - Decoded stimulus type ([`Stimulus`])
//! - Black-box sample decoding ([`source`])
//! - Session cache with format validation ([`store`])

pub mod source;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One decoded acoustic waveform
///
/// Samples are interleaved `f32` frames and never change after decoding.
/// The buffer is shared by `Arc` between the store, the scheduler and the
/// audio callback, so cloning a `Stimulus` handle never copies audio.
#[derive(Debug)]
pub struct Stimulus {
    id: String,
    source: PathBuf,
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl Stimulus {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<PathBuf>,
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Interleaved samples
    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}
