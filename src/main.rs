//! oeaudio-present - present stimuli and report onsets to the recorder
//!
//! ```text
//! oeaudio-present -S -r 10 -g 1.5 tone.wav noise.wav
//! oeaudio-present --config session.json --endpoint 10.0.0.5:5557
//! oeaudio-present --list-devices
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use oeaudio::audio::device::{list_devices, CpalDevice, OutputDevice};
use oeaudio::audio::simulated::SimulatedDevice;
use oeaudio::scheduler::SessionOutcome;
use oeaudio::{Session, SessionConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "oeaudio-present", version = oeaudio::VERSION)]
#[command(about = "Present acoustic stimuli synchronized with a neural recording system")]
struct Args {
    /// Stimulus files (WAV)
    stimuli: Vec<PathBuf>,

    /// Shuffle order of presentation
    #[arg(short = 'S', long)]
    shuffle: bool,

    /// Loop endlessly
    #[arg(short, long = "loop")]
    looping: bool,

    /// Default number of repetitions
    #[arg(short, long)]
    repeats: Option<u32>,

    /// Minimum gap between stimuli (s)
    #[arg(short, long)]
    gap: Option<f64>,

    /// Shuffle seed, for reproducing an earlier order
    #[arg(long)]
    seed: Option<u64>,

    /// Output device name
    #[arg(short, long)]
    device: Option<String>,

    /// Recording system endpoint (host:port)
    #[arg(short, long, env = "OEAUDIO_ENDPOINT")]
    endpoint: Option<String>,

    /// Event log file (JSON Lines)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Render into a simulated device instead of hardware
    #[arg(long)]
    simulate: bool,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Show verbose log messages
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Apply command-line overrides on top of the config file
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("loading session config {}", path.display()))?,
            None => SessionConfig::default(),
        };

        config.protocol.add_files(self.stimuli.iter().cloned());
        if self.shuffle {
            config.protocol.shuffle = true;
        }
        if self.looping {
            config.protocol.looping = true;
        }
        if let Some(repeats) = self.repeats {
            config.protocol.repeats = repeats;
        }
        if let Some(gap) = self.gap {
            config.protocol.gap_secs = gap;
        }
        if self.seed.is_some() {
            config.protocol.seed = self.seed;
        }
        if self.device.is_some() {
            config.device.name = self.device.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.sync.endpoint = endpoint.clone();
        }
        if let Some(log) = &self.log {
            config.log.path = log.clone();
        }
        if self.simulate {
            config.device.simulate = true;
        }

        if config.protocol.stimuli.is_empty() {
            anyhow::bail!("no stimuli given; pass WAV files or a --config with a protocol");
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "oeaudio=debug" } else { "oeaudio=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    if args.list_devices {
        return print_devices();
    }

    let config = args.session_config()?;
    info!(
        version = oeaudio::VERSION,
        build = oeaudio::BUILD_DATE,
        stimuli = config.protocol.stimuli.len(),
        "oeaudio-present starting"
    );

    let device: Box<dyn OutputDevice> = if config.device.simulate {
        Box::new(SimulatedDevice::new())
    } else {
        Box::new(CpalDevice::new(
            config.device.name.clone(),
            config.device.buffer_frames,
        ))
    };

    // Ctrl+C cancels the session; teardown still emits session-end
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, aborting session");
        token.cancel();
    })
    .context("installing Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;

    let mut session = Session::new(config, device)?;
    let report = runtime.block_on(session.run(cancel))?;

    println!();
    println!("Trials presented: {}", report.trials_presented);
    if !report.degraded_trials.is_empty() {
        println!("Degraded trials:  {:?}", report.degraded_trials);
    }
    if let Some(seed) = report.seed {
        println!("Shuffle seed:     {}", seed);
    }
    println!("Event log:        {}", report.log_path.display());
    if !report.unsent_events.is_empty() {
        println!(
            "Undelivered:      {} event(s) never reached the recorder",
            report.unsent_events.len()
        );
    }

    match (report.outcome, report.error) {
        (_, Some(err)) => {
            error!(error = %err, "Session failed");
            Err(err.into())
        }
        (SessionOutcome::Aborted { reason }, None) => {
            println!("Session aborted: {}", reason);
            Ok(())
        }
        (SessionOutcome::Completed, None) => {
            println!("Session complete.");
            Ok(())
        }
    }
}

fn print_devices() -> Result<()> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }

    println!("Found {} output device(s):", devices.len());
    println!();
    for (i, device) in devices.iter().enumerate() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}. {}{}", i + 1, device.name, default_marker);
        println!("     Channels: {} out", device.output_channels);
        if !device.sample_rates.is_empty() {
            println!("     Sample rates: {:?}", device.sample_rates);
        }
    }
    Ok(())
}
