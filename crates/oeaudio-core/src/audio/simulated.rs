//! Simulated output device
//!
//! Drives a [`Renderer`] from a timer thread with fixed-size blocks, the
//! way a sound card driver would. Used for dry runs without hardware and
//! by the test suite, which can inject underruns into chosen plays and
//! capture everything that was rendered.

use super::device::OutputDevice;
use super::engine::PlaybackError;
use super::renderer::Renderer;
use super::OutputFormat;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default block size in frames
const DEFAULT_BLOCK_FRAMES: usize = 64;

/// Timer-driven stand-in for a sound card
pub struct SimulatedDevice {
    block_frames: usize,
    latency: Duration,
    underrun_plays: BTreeSet<u64>,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            block_frames: DEFAULT_BLOCK_FRAMES,
            latency: Duration::ZERO,
            underrun_plays: BTreeSet::new(),
            capture: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    /// Constant output latency reported with every block
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report an underrun during the n-th play (1-based)
    ///
    /// The underrun is raised on the first block after the onset block, so
    /// the stimulus must last longer than one block to be affected.
    pub fn with_underrun_on_play(mut self, play: u64) -> Self {
        self.underrun_plays.insert(play);
        self
    }

    /// Record every rendered sample into the returned buffer
    pub fn capture(&mut self) -> Arc<Mutex<Vec<f32>>> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.capture = Some(Arc::clone(&buffer));
        buffer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flag shared with the device thread, for observing teardown after
    /// the device has been handed to the engine
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, format: OutputFormat, mut renderer: Renderer) -> Result<(), PlaybackError> {
        if self.thread.is_some() {
            return Err(PlaybackError::Device("simulated device already open".to_string()));
        }

        let channels = format.channels.max(1) as usize;
        let block_frames = self.block_frames;
        let block = Duration::from_secs_f64(block_frames as f64 / format.sample_rate.max(1) as f64);
        let latency = self.latency;
        let underrun_plays = self.underrun_plays.clone();
        let capture = self.capture.clone();
        let underruns = renderer.underrun_counter();

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);

        let thread = std::thread::Builder::new()
            .name("simulated-output".into())
            .spawn(move || {
                let mut buffer = vec![0.0f32; block_frames * channels];
                let mut injected = BTreeSet::new();
                let mut next_block = Instant::now();

                while running.load(Ordering::Acquire) {
                    let play = renderer.plays_started();
                    if renderer.is_playing()
                        && underrun_plays.contains(&play)
                        && injected.insert(play)
                    {
                        underruns.report();
                    }

                    renderer.render(&mut buffer, latency);

                    if let Some(ref capture) = capture {
                        if let Ok(mut captured) = capture.lock() {
                            captured.extend_from_slice(&buffer);
                        }
                    }

                    next_block += block;
                    let now = Instant::now();
                    if next_block > now {
                        std::thread::sleep(next_block - now);
                    }
                }
                tracing::debug!("Simulated output thread exited");
            })
            .map_err(|e| PlaybackError::Device(format!("Failed to spawn device thread: {}", e)))?;

        self.thread = Some(thread);
        tracing::info!(%format, block_frames, "Simulated output running");
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            tracing::info!("Simulated output closed");
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.close();
    }
}
