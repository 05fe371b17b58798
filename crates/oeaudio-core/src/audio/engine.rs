//! Playback engine
//!
//! Owns the output device for the session and exposes the
//! `Idle -> Armed -> Playing -> Idle` cycle the scheduler drives:
//!
//! ```text
//! arm(stimulus)          Idle    -> Armed
//! start().await          Armed   -> Playing   (resolves at hardware onset)
//! wait_for_completion()  Playing -> Idle      (resolves after the last sample)
//! ```
//!
//! The engine never touches samples itself. `start` hands the stimulus to
//! the render callback through a lock-free channel and awaits the onset the
//! callback reports on a one-shot channel.

use super::device::OutputDevice;
use super::renderer::{Completion, Onset, PlayCommand, Renderer};
use super::{DeviceClock, DeviceTimestamp, OutputFormat};
use crate::stimulus::Stimulus;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Pending play commands the callback may hold
const COMMAND_QUEUE_SIZE: usize = 4;

/// Default time allowed for the device to confirm an onset
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Playback engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing armed or playing
    Idle,
    /// A stimulus is prepared but output has not started
    Armed,
    /// A stimulus is being emitted
    Playing,
}

/// Errors that can occur during playback
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Device busy: '{0}' has not finished")]
    DeviceBusy(String),

    #[error("Invalid state: cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlaybackState,
    },

    #[error("Buffer underrun while playing '{stimulus}' ({count} reported)")]
    Underrun {
        stimulus: String,
        count: u32,
        completion: Completion,
    },

    #[error("Stimulus '{stimulus}' ({actual}) does not fit output format ({expected})")]
    IncompatibleFormat {
        stimulus: String,
        expected: OutputFormat,
        actual: OutputFormat,
    },

    #[error("Device did not confirm {what} within {timeout:?}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    #[error("Playback stopped")]
    Stopped,

    #[error("Audio device error: {0}")]
    Device(String),
}

struct Playing {
    stimulus: Arc<Stimulus>,
    done_rx: oneshot::Receiver<Completion>,
}

/// Exclusive owner of the output device for a session
pub struct PlaybackEngine {
    device: Box<dyn OutputDevice>,
    format: OutputFormat,
    state: PlaybackState,
    commands: Sender<PlayCommand>,
    clock: DeviceClock,
    stop_epoch: Arc<AtomicU64>,
    armed: Option<Arc<Stimulus>>,
    playing: Option<Playing>,
    start_timeout: Duration,
    open: bool,
}

impl PlaybackEngine {
    /// Open the device with the given format and take ownership of it
    pub fn open(
        mut device: Box<dyn OutputDevice>,
        format: OutputFormat,
        start_timeout: Duration,
    ) -> Result<Self, PlaybackError> {
        let (commands, rx) = crossbeam_channel::bounded(COMMAND_QUEUE_SIZE);
        let renderer = Renderer::new(format, rx);
        let clock = renderer.clock();
        let stop_epoch = renderer.stop_epoch();

        device.open(format, renderer)?;
        tracing::info!(device = %device.name(), %format, "Playback engine ready");

        Ok(Self {
            device,
            format,
            state: PlaybackState::Idle,
            commands,
            clock,
            stop_epoch,
            armed: None,
            playing: None,
            start_timeout,
            open: true,
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    /// Current device time
    pub fn now(&self) -> DeviceTimestamp {
        self.clock.now()
    }

    /// Prepare a stimulus without starting output
    pub fn arm(&mut self, stimulus: Arc<Stimulus>) -> Result<(), PlaybackError> {
        match self.state {
            PlaybackState::Idle => {}
            PlaybackState::Armed => {
                let current = self.armed.as_ref().map(|s| s.id().to_string());
                return Err(PlaybackError::DeviceBusy(current.unwrap_or_default()));
            }
            PlaybackState::Playing => {
                let current = self.playing.as_ref().map(|p| p.stimulus.id().to_string());
                return Err(PlaybackError::DeviceBusy(current.unwrap_or_default()));
            }
        }
        if !self.open {
            return Err(PlaybackError::Device("engine is closed".to_string()));
        }

        if stimulus.sample_rate() != self.format.sample_rate
            || stimulus.channels() > self.format.channels
        {
            return Err(PlaybackError::IncompatibleFormat {
                stimulus: stimulus.id().to_string(),
                expected: self.format,
                actual: OutputFormat {
                    sample_rate: stimulus.sample_rate(),
                    channels: stimulus.channels(),
                },
            });
        }

        self.armed = Some(stimulus);
        self.state = PlaybackState::Armed;
        Ok(())
    }

    /// Begin output of the armed stimulus
    ///
    /// Resolves with the onset the render callback reports for the first
    /// stimulus sample.
    pub async fn start(&mut self) -> Result<Onset, PlaybackError> {
        if self.state != PlaybackState::Armed {
            return Err(PlaybackError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let Some(stimulus) = self.armed.take() else {
            self.state = PlaybackState::Idle;
            return Err(PlaybackError::InvalidState {
                operation: "start",
                state: PlaybackState::Idle,
            });
        };

        let (mut command, onset_rx, done_rx) = PlayCommand::new(Arc::clone(&stimulus));
        command.epoch = self.stop_epoch.load(Ordering::Acquire);

        if let Err(e) = self.commands.try_send(command) {
            self.state = PlaybackState::Idle;
            return Err(match e {
                TrySendError::Full(_) => PlaybackError::DeviceBusy(stimulus.id().to_string()),
                TrySendError::Disconnected(_) => {
                    PlaybackError::Device("output stream is gone".to_string())
                }
            });
        }

        self.state = PlaybackState::Playing;
        self.playing = Some(Playing { stimulus, done_rx });

        match tokio::time::timeout(self.start_timeout, onset_rx).await {
            Ok(Ok(onset)) => Ok(onset),
            Ok(Err(_)) => {
                self.reset();
                Err(PlaybackError::Stopped)
            }
            Err(_) => {
                self.stop();
                Err(PlaybackError::Timeout {
                    what: "onset",
                    timeout: self.start_timeout,
                })
            }
        }
    }

    /// Wait until the playing stimulus has been fully emitted
    ///
    /// Underruns reported during playback surface as
    /// [`PlaybackError::Underrun`], with the completion still attached.
    pub async fn wait_for_completion(&mut self) -> Result<Completion, PlaybackError> {
        if self.state != PlaybackState::Playing {
            return Err(PlaybackError::InvalidState {
                operation: "wait for completion",
                state: self.state,
            });
        }
        let Some(playing) = self.playing.as_mut() else {
            self.state = PlaybackState::Idle;
            return Err(PlaybackError::Stopped);
        };

        let timeout = playing.stimulus.duration() + self.start_timeout;
        let result = tokio::time::timeout(timeout, &mut playing.done_rx).await;
        let stimulus = playing.stimulus.id().to_string();

        match result {
            Ok(Ok(completion)) => {
                self.reset();
                if completion.stopped {
                    Err(PlaybackError::Stopped)
                } else if completion.underruns > 0 {
                    Err(PlaybackError::Underrun {
                        stimulus,
                        count: completion.underruns,
                        completion,
                    })
                } else {
                    Ok(completion)
                }
            }
            Ok(Err(_)) => {
                self.reset();
                Err(PlaybackError::Stopped)
            }
            Err(_) => {
                self.stop();
                Err(PlaybackError::Timeout {
                    what: "completion",
                    timeout,
                })
            }
        }
    }

    /// Abort any armed or playing stimulus and return to Idle
    pub fn stop(&mut self) {
        if self.state == PlaybackState::Playing {
            self.stop_epoch.fetch_add(1, Ordering::AcqRel);
            tracing::debug!("Stop requested for current playback");
        }
        self.reset();
    }

    /// Stop playback and release the device
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.stop();
        self.device.close();
        self.open = false;
        tracing::info!(device = %self.device.name(), "Playback engine closed");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn reset(&mut self) {
        self.armed = None;
        self.playing = None;
        self.state = PlaybackState::Idle;
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedDevice;

    const FORMAT: OutputFormat = OutputFormat {
        sample_rate: 8000,
        channels: 1,
    };

    fn stimulus(id: &str, frames: usize) -> Arc<Stimulus> {
        Arc::new(Stimulus::new(
            id,
            format!("{}.wav", id),
            vec![0.5; frames],
            8000,
            1,
        ))
    }

    fn engine(device: SimulatedDevice) -> PlaybackEngine {
        PlaybackEngine::open(Box::new(device), FORMAT, DEFAULT_START_TIMEOUT).unwrap()
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let mut engine = engine(SimulatedDevice::new().with_block_frames(64));
        assert_eq!(engine.state(), PlaybackState::Idle);

        engine.arm(stimulus("a", 400)).unwrap();
        assert_eq!(engine.state(), PlaybackState::Armed);

        let onset = engine.start().await.unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);

        let done = engine.wait_for_completion().await.unwrap();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(done.onset_frame, onset.timestamp.frame);
        assert_eq!(done.end_frame - done.onset_frame, 400);
    }

    #[tokio::test]
    async fn test_start_while_idle_is_invalid() {
        let mut engine = engine(SimulatedDevice::new());
        let err = engine.start().await.unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::InvalidState {
                operation: "start",
                state: PlaybackState::Idle
            }
        ));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_wait_while_armed_is_invalid() {
        let mut engine = engine(SimulatedDevice::new());
        engine.arm(stimulus("a", 100)).unwrap();
        let err = engine.wait_for_completion().await.unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidState { .. }));
        assert_eq!(engine.state(), PlaybackState::Armed);
    }

    #[tokio::test]
    async fn test_arm_while_busy() {
        let mut engine = engine(SimulatedDevice::new());
        engine.arm(stimulus("a", 800)).unwrap();
        let err = engine.arm(stimulus("b", 100)).unwrap_err();
        assert!(matches!(err, PlaybackError::DeviceBusy(ref id) if id == "a"));

        engine.start().await.unwrap();
        let err = engine.arm(stimulus("b", 100)).unwrap_err();
        assert!(matches!(err, PlaybackError::DeviceBusy(_)));
    }

    #[tokio::test]
    async fn test_incompatible_format_rejected() {
        let mut engine = engine(SimulatedDevice::new());
        let stereo = Arc::new(Stimulus::new("st", "st.wav", vec![0.0; 20], 8000, 2));
        assert!(matches!(
            engine.arm(stereo).unwrap_err(),
            PlaybackError::IncompatibleFormat { .. }
        ));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_underrun_reported_on_completion() {
        let mut engine = engine(
            SimulatedDevice::new()
                .with_block_frames(32)
                .with_underrun_on_play(1),
        );
        engine.arm(stimulus("a", 320)).unwrap();
        engine.start().await.unwrap();
        let err = engine.wait_for_completion().await.unwrap_err();
        match err {
            PlaybackError::Underrun {
                stimulus,
                count,
                completion,
            } => {
                assert_eq!(stimulus, "a");
                assert_eq!(count, 1);
                assert_eq!(completion.end_frame - completion.onset_frame, 320);
            }
            other => panic!("expected underrun, got {other}"),
        }
        assert_eq!(engine.state(), PlaybackState::Idle);

        // Next play is clean
        engine.arm(stimulus("b", 320)).unwrap();
        engine.start().await.unwrap();
        assert!(engine.wait_for_completion().await.is_ok());
    }

    #[tokio::test]
    async fn test_onset_includes_output_latency() {
        let mut engine = engine(SimulatedDevice::new().with_latency(Duration::from_millis(4)));
        engine.arm(stimulus("a", 100)).unwrap();
        let onset = engine.start().await.unwrap();
        let expected = onset.timestamp.frame as f64 / 8000.0 + 0.004;
        approx::assert_relative_eq!(onset.timestamp.seconds, expected, epsilon = 1e-9);
        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_close_releases_device() {
        let device = SimulatedDevice::new();
        let running = device.running_flag();
        let mut engine = engine(device);
        assert!(running.load(Ordering::Acquire));
        engine.close();
        assert!(!running.load(Ordering::Acquire));
        assert!(!engine.is_open());
        assert!(engine.arm(stimulus("a", 10)).is_err());
    }
}
