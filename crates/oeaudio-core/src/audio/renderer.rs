//! Real-time render callback
//!
//! The [`Renderer`] is moved into the backend's output callback. It owns
//! the currently playing stimulus and reports onset and completion through
//! one-shot channels, so the callback never takes a lock and the scheduler
//! never observes the callback directly.
//!
//! Play commands arrive through a lock-free bounded crossbeam channel and
//! are only picked up when nothing is playing: one stimulus at a time.

use super::{DeviceClock, DeviceTimestamp, OutputFormat};
use crate::stimulus::Stimulus;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Hardware-confirmed start of a presentation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Onset {
    /// Device time of the first stimulus sample, including output latency
    pub timestamp: DeviceTimestamp,
    /// Callback-to-playback delay reported for the onset block
    pub output_latency: Duration,
}

/// End of a presentation as seen by the callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub onset_frame: u64,
    /// First frame after the last stimulus sample
    pub end_frame: u64,
    /// Underruns reported by the backend while this stimulus played
    pub underruns: u32,
    /// Playback was cut short by a stop request
    pub stopped: bool,
}

/// Instruction for the callback to start a stimulus
pub struct PlayCommand {
    pub(crate) stimulus: Arc<Stimulus>,
    pub(crate) onset_tx: oneshot::Sender<Onset>,
    pub(crate) done_tx: oneshot::Sender<Completion>,
    /// Stop epoch current when the command was issued
    pub(crate) epoch: u64,
}

impl PlayCommand {
    /// Command for `stimulus`, with the receivers for its onset and completion
    pub fn new(
        stimulus: Arc<Stimulus>,
    ) -> (Self, oneshot::Receiver<Onset>, oneshot::Receiver<Completion>) {
        let (onset_tx, onset_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                stimulus,
                onset_tx,
                done_tx,
                epoch: 0,
            },
            onset_rx,
            done_rx,
        )
    }
}

/// Shared underrun counter backends increment from their callbacks
#[derive(Debug, Clone, Default)]
pub struct UnderrunCounter(Arc<AtomicU32>);

impl UnderrunCounter {
    pub fn report(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

struct Active {
    stimulus: Arc<Stimulus>,
    cursor: usize,
    onset_frame: u64,
    epoch: u64,
    underruns_at_start: u32,
    done_tx: Option<oneshot::Sender<Completion>>,
}

/// Fills output buffers from the active stimulus, silence otherwise
pub struct Renderer {
    format: OutputFormat,
    commands: Receiver<PlayCommand>,
    active: Option<Active>,
    frames: Arc<AtomicU64>,
    /// Bumped to cancel every command issued before it
    epoch: Arc<AtomicU64>,
    underruns: UnderrunCounter,
    plays_started: u64,
}

impl Renderer {
    pub(crate) fn new(format: OutputFormat, commands: Receiver<PlayCommand>) -> Self {
        Self {
            format,
            commands,
            active: None,
            frames: Arc::new(AtomicU64::new(0)),
            epoch: Arc::new(AtomicU64::new(0)),
            underruns: UnderrunCounter::default(),
            plays_started: 0,
        }
    }

    /// Renderer fed by a new bounded command queue
    pub fn with_queue(format: OutputFormat, capacity: usize) -> (Sender<PlayCommand>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (tx, Self::new(format, rx))
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn clock(&self) -> DeviceClock {
        DeviceClock::new(Arc::clone(&self.frames), self.format.sample_rate)
    }

    pub(crate) fn stop_epoch(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    pub fn underrun_counter(&self) -> UnderrunCounter {
        self.underruns.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Number of stimuli started since the stream opened
    pub fn plays_started(&self) -> u64 {
        self.plays_started
    }

    /// Render one interleaved output block
    ///
    /// `output_latency` is the delay between this callback and the moment
    /// its first frame reaches the converter, as reported by the backend.
    pub fn render(&mut self, out: &mut [f32], output_latency: Duration) {
        let channels = self.format.channels.max(1) as usize;
        let block_frames = out.len() / channels;
        let block_start = self.frames.load(Ordering::Relaxed);

        let epoch = self.epoch.load(Ordering::Acquire);
        if self.active.as_ref().is_some_and(|a| a.epoch < epoch) {
            if let Some(active) = self.active.take() {
                self.finish(active, block_start, true);
            }
        }

        let mut frame = 0usize;
        while frame < block_frames {
            if self.active.is_none() {
                match self.commands.try_recv() {
                    // Issued before a stop; dropping it closes its channels
                    Ok(cmd) if cmd.epoch < epoch => continue,
                    Ok(cmd) => self.begin(cmd, block_start + frame as u64, output_latency),
                    Err(_) => {
                        out[frame * channels..].fill(0.0);
                        break;
                    }
                }
            }

            let Some(active) = self.active.as_mut() else {
                continue;
            };
            let stim_channels = active.stimulus.channels() as usize;
            let total = active.stimulus.frames();
            let samples = active.stimulus.samples();
            let n = (total - active.cursor).min(block_frames - frame);

            for i in 0..n {
                let src = (active.cursor + i) * stim_channels;
                let dst = (frame + i) * channels;
                for ch in 0..channels {
                    out[dst + ch] = if ch < stim_channels {
                        samples[src + ch]
                    } else {
                        0.0
                    };
                }
            }
            active.cursor += n;
            frame += n;

            if active.cursor >= total {
                if let Some(active) = self.active.take() {
                    self.finish(active, block_start + frame as u64, false);
                }
            }
        }

        // Trailing samples of a partial frame
        out[block_frames * channels..].fill(0.0);

        self.frames
            .fetch_add(block_frames as u64, Ordering::Release);
    }

    fn begin(&mut self, cmd: PlayCommand, onset_frame: u64, latency: Duration) {
        let PlayCommand {
            stimulus,
            onset_tx,
            done_tx,
            epoch,
        } = cmd;
        self.plays_started += 1;
        let onset = Onset {
            timestamp: self.clock().at(onset_frame, latency),
            output_latency: latency,
        };
        let _ = onset_tx.send(onset);
        self.active = Some(Active {
            stimulus,
            cursor: 0,
            onset_frame,
            epoch,
            underruns_at_start: self.underruns.total(),
            done_tx: Some(done_tx),
        });
    }

    fn finish(&self, mut active: Active, end_frame: u64, stopped: bool) {
        if let Some(tx) = active.done_tx.take() {
            let _ = tx.send(Completion {
                onset_frame: active.onset_frame,
                end_frame,
                underruns: self.underruns.total() - active.underruns_at_start,
                stopped,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: OutputFormat = OutputFormat {
        sample_rate: 1000,
        channels: 2,
    };

    fn stimulus(frames: usize, channels: u16, value: f32) -> Arc<Stimulus> {
        Arc::new(Stimulus::new(
            "s",
            "s.wav",
            vec![value; frames * channels as usize],
            1000,
            channels,
        ))
    }

    fn command(
        stim: Arc<Stimulus>,
    ) -> (
        PlayCommand,
        oneshot::Receiver<Onset>,
        oneshot::Receiver<Completion>,
    ) {
        let (onset_tx, onset_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        (
            PlayCommand {
                stimulus: stim,
                onset_tx,
                done_tx,
                epoch: 0,
            },
            onset_rx,
            done_rx,
        )
    }

    #[test]
    fn test_silence_when_idle() {
        let (_tx, rx) = crossbeam_channel::bounded(4);
        let mut renderer = Renderer::new(FORMAT, rx);
        let mut out = vec![1.0f32; 64];
        renderer.render(&mut out, Duration::ZERO);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(renderer.clock().frames(), 32);
    }

    #[test]
    fn test_onset_frame_and_completion() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut renderer = Renderer::new(FORMAT, rx);
        let mut out = vec![0.0f32; 20];

        // Advance the clock by one idle block
        renderer.render(&mut out, Duration::ZERO);

        let (cmd, mut onset_rx, mut done_rx) = command(stimulus(15, 2, 0.5));
        tx.send(cmd).unwrap();

        renderer.render(&mut out, Duration::from_millis(3));
        let onset = onset_rx.try_recv().unwrap();
        assert_eq!(onset.timestamp.frame, 10);
        approx::assert_relative_eq!(onset.timestamp.seconds, 0.013);
        assert!(done_rx.try_recv().is_err());
        assert!(out.iter().all(|&s| s == 0.5));

        renderer.render(&mut out, Duration::ZERO);
        let done = done_rx.try_recv().unwrap();
        assert_eq!(done.onset_frame, 10);
        assert_eq!(done.end_frame, 25);
        assert_eq!(done.underruns, 0);
        assert!(!done.stopped);
        assert!(out[..10].iter().all(|&s| s == 0.5));
        assert!(out[10..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mono_stimulus_on_stereo_output() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut renderer = Renderer::new(FORMAT, rx);
        let (cmd, _onset, _done) = command(stimulus(4, 1, 0.25));
        tx.send(cmd).unwrap();

        let mut out = vec![1.0f32; 8];
        renderer.render(&mut out, Duration::ZERO);
        assert_eq!(out, vec![0.25, 0.0, 0.25, 0.0, 0.25, 0.0, 0.25, 0.0]);
    }

    #[test]
    fn test_underruns_attributed_to_active_stimulus() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut renderer = Renderer::new(FORMAT, rx);
        let counter = renderer.underrun_counter();
        counter.report(); // before playback, not counted

        let (cmd, _onset, mut done_rx) = command(stimulus(30, 2, 0.1));
        tx.send(cmd).unwrap();
        let mut out = vec![0.0f32; 40];
        renderer.render(&mut out, Duration::ZERO);
        counter.report();
        renderer.render(&mut out, Duration::ZERO);

        assert_eq!(done_rx.try_recv().unwrap().underruns, 1);
    }

    #[test]
    fn test_stop_cuts_playback() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut renderer = Renderer::new(FORMAT, rx);
        let epoch = renderer.stop_epoch();
        let (cmd, _onset, mut done_rx) = command(stimulus(100, 2, 0.1));
        tx.send(cmd).unwrap();

        let mut out = vec![0.0f32; 20];
        renderer.render(&mut out, Duration::ZERO);
        assert!(renderer.is_playing());

        epoch.fetch_add(1, Ordering::AcqRel);
        renderer.render(&mut out, Duration::ZERO);
        assert!(!renderer.is_playing());
        assert!(out.iter().all(|&s| s == 0.0));
        let done = done_rx.try_recv().unwrap();
        assert!(done.stopped);
        assert_eq!(done.end_frame, 10);
    }
}
