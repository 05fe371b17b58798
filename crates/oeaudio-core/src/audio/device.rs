//! Output backends
//!
//! Provides the [`OutputDevice`] seam and its hardware implementation:
//! - Enumerating output devices
//! - Opening an output stream that drives a [`Renderer`]
//! - Detecting underruns from stream errors and playback timestamp gaps

use super::renderer::{Renderer, UnderrunCounter};
use super::OutputFormat;
use crate::audio::engine::PlaybackError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig, StreamInstant};
use std::time::Duration;

/// An audio output the playback engine can own for a session
///
/// `open` hands the renderer to the backend, which must call
/// [`Renderer::render`] for every output block until `close`.
pub trait OutputDevice {
    /// Human-readable device name
    fn name(&self) -> &str;

    fn open(&mut self, format: OutputFormat, renderer: Renderer) -> Result<(), PlaybackError>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Output device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the host's default output
    pub is_default: bool,
    /// Supported sample rates
    pub sample_rates: Vec<u32>,
    /// Number of output channels
    pub output_channels: u16,
}

/// List output devices on the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>, PlaybackError> {
    let host = cpal::default_host();
    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    let outputs = host
        .output_devices()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;

    for device in outputs {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default = default_output.as_deref() == Some(name.as_str());

        let output_channels = device
            .default_output_config()
            .map(|c| c.channels())
            .unwrap_or(0);

        // Common sample rates to check
        let common_rates = [8000, 16000, 22050, 44100, 48000, 88200, 96000, 192000];
        let mut sample_rates = Vec::new();

        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                for &rate in &common_rates {
                    if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
        }

        sample_rates.sort();

        devices.push(DeviceInfo {
            name,
            is_default,
            sample_rates,
            output_channels,
        });
    }

    Ok(devices)
}

/// Flags blocks whose playback time jumps past where the previous block ended
///
/// A jump means the hardware ran dry and played silence we never rendered.
struct GapDetector {
    sample_rate: u32,
    expected: Option<StreamInstant>,
}

impl GapDetector {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            expected: None,
        }
    }

    /// Returns true when this block starts later than the previous one ended
    fn observe(&mut self, playback: StreamInstant, frames: usize) -> bool {
        let block = Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64);
        let gap = self
            .expected
            .and_then(|expected| playback.duration_since(&expected))
            .map(|late| late > block)
            .unwrap_or(false);
        self.expected = playback.add(block);
        gap
    }
}

/// Hardware output through cpal
pub struct CpalDevice {
    requested: Option<String>,
    buffer_frames: Option<u32>,
    name: String,
    stream: Option<Stream>,
}

impl CpalDevice {
    /// Use the named device, or the host default when `None`
    pub fn new(name: Option<String>, buffer_frames: Option<u32>) -> Self {
        let display = name.clone().unwrap_or_else(|| "default".to_string());
        Self {
            requested: name,
            buffer_frames,
            name: display,
            stream: None,
        }
    }

    fn find_device(&self) -> Result<cpal::Device, PlaybackError> {
        let host = cpal::default_host();
        match &self.requested {
            Some(wanted) => host
                .output_devices()
                .map_err(|e| PlaybackError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or_else(|| PlaybackError::Device(format!("Device not found: {}", wanted))),
            None => host
                .default_output_device()
                .ok_or_else(|| PlaybackError::Device("No default output device".to_string())),
        }
    }
}

impl OutputDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, format: OutputFormat, mut renderer: Renderer) -> Result<(), PlaybackError> {
        if self.stream.is_some() {
            return Err(PlaybackError::Device(format!(
                "{} is already open",
                self.name
            )));
        }

        let device = self.find_device()?;
        if let Ok(name) = device.name() {
            self.name = name;
        }

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: match self.buffer_frames {
                Some(n) => cpal::BufferSize::Fixed(n),
                None => cpal::BufferSize::Default,
            },
        };
        tracing::info!(device = %self.name, %format, buffer = ?config.buffer_size, "Opening output stream");

        let underruns = renderer.underrun_counter();
        let error_underruns: UnderrunCounter = underruns.clone();
        let channels = format.channels.max(1) as usize;
        let mut gaps = GapDetector::new(format.sample_rate);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let ts = info.timestamp();
                    let latency = ts
                        .playback
                        .duration_since(&ts.callback)
                        .unwrap_or_default();
                    if gaps.observe(ts.playback, data.len() / channels) {
                        underruns.report();
                    }
                    renderer.render(data, latency);
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                    error_underruns.report();
                },
                None,
            )
            .map_err(|e| PlaybackError::Device(format!("Failed to open stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlaybackError::Device(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);

        tracing::info!(device = %self.name, "Output stream running");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::warn!(device = %self.name, "Failed to pause stream: {}", e);
            }
            drop(stream);
            tracing::info!(device = %self.name, "Output stream closed");
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}
