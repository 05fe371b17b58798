//! Trial scheduler
//!
//! Drives a session through its states:
//!
//! ```text
//! NotStarted -> Active(Waiting -> Arming -> Presenting -> Cooldown)* -> Complete
//! ```
//!
//! Every stimulus is resolved before the device is opened, so a bad
//! protocol never plays a sample. Each trial then emits trial-start,
//! stimulus-onset (stamped with the device-confirmed onset) and trial-end,
//! writing each event to the local log before handing it to the sync
//! channel. Cancellation is checked at every suspension point; teardown
//! always emits session-end, closes the channel and releases the device.

use crate::audio::device::OutputDevice;
use crate::audio::engine::{PlaybackEngine, PlaybackError};
use crate::audio::renderer::Onset;
use crate::audio::OutputFormat;
use crate::config::SessionConfig;
use crate::error::{ErrorKind, SessionError};
use crate::log::EventLogger;
use crate::protocol::{Protocol, ProtocolError, Trial};
use crate::stimulus::source::SampleSource;
use crate::stimulus::store::{FormatRequirement, StimulusError, StimulusStore};
use crate::sync::channel::{SyncChannel, SyncError};
use crate::sync::event::SyncEvent;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Per-trial phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    /// Trial-start emitted, stimulus not yet armed
    Waiting,
    Arming,
    Presenting,
    /// Inter-trial interval
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Active(TrialPhase),
    Complete,
}

/// How the session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Aborted { reason: String },
}

/// Summary of a session that got past validation
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub started_at: DateTime<Utc>,
    pub trials_presented: u32,
    /// Ordinals of trials that completed with problems
    pub degraded_trials: Vec<u32>,
    /// Shuffle seed, for replaying the same order
    pub seed: Option<u64>,
    /// Events the recording system never confirmed
    pub unsent_events: Vec<SyncEvent>,
    /// Connections to the recorder lost during the session
    pub disconnects: u64,
    pub log_path: PathBuf,
    /// The fatal error that aborted the session, if any
    pub error: Option<SessionError>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}

/// Why the trial loop stopped early
enum Stop {
    /// Operator or recorder abort
    Cancelled(String),
    Fatal(SessionError),
}

impl From<SessionError> for Stop {
    fn from(err: SessionError) -> Self {
        Self::Fatal(err)
    }
}

/// Suspension point interrupted by something other than its own future
enum Interrupt {
    Cancelled,
    RemoteAbort,
    SyncFailed,
}

/// One experimental session
pub struct Session {
    config: SessionConfig,
    protocol: Protocol,
    store: StimulusStore,
    device: Option<Box<dyn OutputDevice>>,
    state: SessionState,
}

impl Session {
    /// Create a session reading stimuli from WAV files
    pub fn new(config: SessionConfig, device: Box<dyn OutputDevice>) -> Result<Self, SessionError> {
        let store = StimulusStore::new(Self::requirement(&config));
        Self::with_store(config, device, store)
    }

    /// Create a session with a custom stimulus decoder
    pub fn with_source(
        config: SessionConfig,
        device: Box<dyn OutputDevice>,
        source: Box<dyn SampleSource>,
    ) -> Result<Self, SessionError> {
        let store = StimulusStore::with_source(source, Self::requirement(&config));
        Self::with_store(config, device, store)
    }

    fn requirement(config: &SessionConfig) -> FormatRequirement {
        FormatRequirement {
            sample_rate: config.device.sample_rate,
            max_channels: config.device.channels,
        }
    }

    fn with_store(
        config: SessionConfig,
        device: Box<dyn OutputDevice>,
        mut store: StimulusStore,
    ) -> Result<Self, SessionError> {
        let protocol = Protocol::from_config(&config.protocol).map_err(SessionError::session)?;
        for entry in &config.protocol.stimuli {
            store.register(entry.id.clone(), entry.path.clone());
        }
        Ok(Self {
            config,
            protocol,
            store,
            device: Some(device),
            state: SessionState::NotStarted,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn store(&self) -> &StimulusStore {
        &self.store
    }

    /// Resolve every stimulus the protocol references
    ///
    /// Collects all failures rather than stopping at the first, and
    /// returns the output format the device must be opened with.
    pub fn validate(&mut self) -> Result<OutputFormat, SessionError> {
        let ids: Vec<String> = self
            .protocol
            .stimulus_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        let failures: Vec<StimulusError> = ids
            .iter()
            .filter_map(|id| self.store.resolve(id).err())
            .collect();
        if !failures.is_empty() {
            for failure in &failures {
                tracing::error!(stimulus = %failure.id(), error = %failure, "Stimulus failed validation");
            }
            return Err(SessionError::session(ErrorKind::ProtocolValidation(failures)));
        }

        self.store
            .output_format()
            .ok_or_else(|| SessionError::session(ProtocolError::Empty))
    }

    /// Run the session to completion, abort or fatal error
    ///
    /// Returns `Err` only when the session never started (validation,
    /// log or device failure). Once session-start has been emitted, the
    /// outcome is always a report; a fatal error is carried in
    /// [`SessionReport::error`].
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionReport, SessionError> {
        if self.state != SessionState::NotStarted {
            return Err(SessionError::session(ErrorKind::AlreadyRun));
        }

        let format = self.validate()?;
        let started_at = Utc::now();

        let logger = EventLogger::open(&self.config.log.path).map_err(SessionError::session)?;
        let device = self.device.take().ok_or_else(|| {
            SessionError::session(PlaybackError::Device("device already released".to_string()))
        })?;
        let engine = PlaybackEngine::open(device, format, self.config.device.start_timeout())
            .map_err(SessionError::session)?;
        let channel = SyncChannel::new(self.config.sync.retry, self.config.sync.require_ack);

        tracing::info!(
            trials = self.protocol.len(),
            looping = self.protocol.is_looping(),
            seed = ?self.protocol.seed(),
            %format,
            endpoint = %self.config.sync.endpoint,
            "Session starting"
        );

        let mut presenter = Presenter {
            config: &self.config,
            protocol: &self.protocol,
            store: &self.store,
            state: &mut self.state,
            engine,
            logger,
            channel,
            cancel,
            current: None,
            trials_presented: 0,
            degraded: Vec::new(),
            disconnects_seen: 0,
        };

        let result = presenter.present().await;
        Ok(presenter.teardown(result, started_at).await)
    }
}

/// Mutable state of a running session
struct Presenter<'a> {
    config: &'a SessionConfig,
    protocol: &'a Protocol,
    store: &'a StimulusStore,
    state: &'a mut SessionState,
    engine: PlaybackEngine,
    logger: EventLogger,
    channel: SyncChannel,
    cancel: CancellationToken,
    /// Trial between its trial-start and trial-end events
    current: Option<(u32, String)>,
    trials_presented: u32,
    degraded: Vec<u32>,
    /// Disconnects already charged to a trial; later ones, including any
    /// during the previous cooldown, degrade the trial in progress
    disconnects_seen: u64,
}

impl Presenter<'_> {
    fn set_phase(&mut self, phase: TrialPhase) {
        *self.state = SessionState::Active(phase);
    }

    /// Log an event, then queue it for the recorder
    fn emit(&mut self, scope: Option<u32>, event: SyncEvent) -> Result<(), SessionError> {
        let attach = |kind: ErrorKind| match scope {
            Some(ordinal) => SessionError::trial(ordinal, kind),
            None => SessionError::session(kind),
        };
        self.logger.append(&event).map_err(|e| attach(e.into()))?;
        tracing::debug!(event = %event, "Emitted");
        self.channel.publish(event).map_err(|e| attach(e.into()))
    }

    async fn present(&mut self) -> Result<(), Stop> {
        self.set_phase(TrialPhase::Waiting);

        let mut notes = vec![
            format!("device={}", self.engine.device_name()),
            format!("format={}", self.engine.format()),
            format!("trials_per_pass={}", self.protocol.len()),
        ];
        if let Some(seed) = self.protocol.seed() {
            notes.push(format!("seed={}", seed));
        }
        if self.protocol.is_looping() {
            notes.push("loop".to_string());
        }
        let start = SyncEvent::session_start(self.engine.now(), notes);
        self.emit(None, start)?;

        tokio::select! {
            result = self.channel.connect(&self.config.sync.endpoint) => {
                result.map_err(SessionError::session)?;
            }
            _ = self.cancel.cancelled() => {
                return Err(Stop::Cancelled("cancelled by operator".to_string()));
            }
        }

        let protocol = self.protocol;
        for trial in protocol.trials() {
            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled("cancelled by operator".to_string()));
            }
            self.present_trial(&trial).await?;
            self.cooldown(&trial).await?;
        }
        Ok(())
    }

    async fn present_trial(&mut self, trial: &Trial) -> Result<(), Stop> {
        let ordinal = trial.ordinal;
        let id = trial.stimulus_id.as_str();
        let stimulus = self.store.get(id).ok_or_else(|| {
            SessionError::trial(
                ordinal,
                StimulusError::NotFound {
                    id: id.to_string(),
                    path: None,
                },
            )
        })?;

        self.set_phase(TrialPhase::Waiting);
        self.emit(Some(ordinal), SyncEvent::trial_start(ordinal, id, self.engine.now()))?;
        self.current = Some((ordinal, id.to_string()));
        tracing::info!(
            trial = ordinal,
            stimulus = %id,
            repetition = trial.repetition,
            repeats = trial.repeats,
            "Trial start"
        );

        self.set_phase(TrialPhase::Arming);
        self.engine
            .arm(stimulus)
            .map_err(|e| SessionError::trial(ordinal, e))?;

        self.set_phase(TrialPhase::Presenting);
        let onset: Onset = match guarded(
            self.engine.start(),
            &self.cancel,
            &self.channel,
        )
        .await
        {
            Ok(result) => result.map_err(|e| SessionError::trial(ordinal, e))?,
            Err(interrupt) => {
                self.engine.stop();
                return Err(self.interrupted(ordinal, interrupt));
            }
        };
        self.emit(Some(ordinal), SyncEvent::stimulus_onset(ordinal, id, &onset))?;
        tracing::info!(
            trial = ordinal,
            stimulus = %id,
            device_time = onset.timestamp.seconds,
            frame = onset.timestamp.frame,
            "Stimulus onset"
        );

        let completion = match guarded(
            self.engine.wait_for_completion(),
            &self.cancel,
            &self.channel,
        )
        .await
        {
            Ok(result) => result,
            Err(interrupt) => {
                self.engine.stop();
                return Err(self.interrupted(ordinal, interrupt));
            }
        };

        let mut problems = Vec::new();
        let end_frame = match completion {
            Ok(completion) => completion.end_frame,
            Err(PlaybackError::Underrun {
                stimulus,
                count,
                completion,
            }) => {
                let err = SessionError::trial(
                    ordinal,
                    PlaybackError::Underrun {
                        stimulus,
                        count,
                        completion,
                    },
                );
                tracing::warn!(trial = ordinal, error = %err, "Trial degraded");
                problems.push(err.kind.to_string());
                completion.end_frame
            }
            Err(e) => return Err(SessionError::trial(ordinal, e).into()),
        };

        let total = self.channel.health().disconnects;
        let disconnects = total.saturating_sub(self.disconnects_seen);
        self.disconnects_seen = total;
        if disconnects > 0 {
            let err = SessionError::trial(ordinal, SyncError::Interrupted { disconnects });
            tracing::warn!(trial = ordinal, error = %err, "Trial degraded");
            problems.push(err.kind.to_string());
        }

        let degraded = !problems.is_empty();
        let end = self.engine.clock().at(end_frame, onset.output_latency);
        self.emit(Some(ordinal), SyncEvent::trial_end(ordinal, id, end, problems))?;
        self.current = None;
        self.trials_presented += 1;
        tracing::info!(trial = ordinal, stimulus = %id, degraded, "Trial end");

        if degraded {
            self.degraded.push(ordinal);
            if let Some(limit) = self.config.max_degraded_trials {
                let count = self.degraded.len() as u32;
                if count > limit {
                    return Err(
                        SessionError::trial(ordinal, ErrorKind::TooManyDegraded { count, limit })
                            .into(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn cooldown(&mut self, trial: &Trial) -> Result<(), Stop> {
        self.set_phase(TrialPhase::Cooldown);
        let sleep = tokio::time::sleep(trial.inter_trial_interval);
        guarded(sleep, &self.cancel, &self.channel)
            .await
            .map_err(|interrupt| self.interrupted(trial.ordinal, interrupt))
    }

    fn interrupted(&self, ordinal: u32, interrupt: Interrupt) -> Stop {
        match interrupt {
            Interrupt::Cancelled => Stop::Cancelled("cancelled by operator".to_string()),
            Interrupt::RemoteAbort => {
                Stop::Cancelled("abort requested by recording system".to_string())
            }
            Interrupt::SyncFailed => {
                let err = self.channel.failure().unwrap_or(SyncError::Closed);
                Stop::Fatal(SessionError::trial(ordinal, err))
            }
        }
    }

    /// Emit the closing events and release everything
    async fn teardown(mut self, result: Result<(), Stop>, started_at: DateTime<Utc>) -> SessionReport {
        self.engine.stop();

        let (outcome, error) = match result {
            Ok(()) => (SessionOutcome::Completed, None),
            Err(Stop::Cancelled(reason)) => {
                tracing::warn!(%reason, "Session aborted");
                (SessionOutcome::Aborted { reason }, None)
            }
            Err(Stop::Fatal(err)) => {
                tracing::error!(error = %err, "Session aborted on fatal error");
                (
                    SessionOutcome::Aborted {
                        reason: err.to_string(),
                    },
                    Some(err),
                )
            }
        };
        let reason = match &outcome {
            SessionOutcome::Completed => None,
            SessionOutcome::Aborted { reason } => Some(reason.clone()),
        };

        if let Some((ordinal, id)) = self.current.take() {
            let event = SyncEvent::trial_aborted(
                ordinal,
                &id,
                self.engine.now(),
                reason.clone().unwrap_or_default(),
            );
            if let Err(e) = self.emit(Some(ordinal), event) {
                tracing::error!(error = %e, "Could not record aborted trial");
            }
        }
        let end = SyncEvent::session_end(self.engine.now(), reason);
        if let Err(e) = self.emit(None, end) {
            tracing::error!(error = %e, "Could not record session end");
        }

        let unsent = self.channel.close(self.config.sync.close_timeout()).await;
        for event in &unsent {
            tracing::error!(event = %event, "Sync event not delivered to recording system");
        }
        let disconnects = self.channel.health().disconnects;

        self.engine.close();
        *self.state = SessionState::Complete;

        tracing::info!(
            trials = self.trials_presented,
            degraded = self.degraded.len(),
            unsent = unsent.len(),
            outcome = ?outcome,
            "Session finished"
        );

        SessionReport {
            outcome,
            started_at,
            trials_presented: self.trials_presented,
            degraded_trials: self.degraded,
            seed: self.protocol.seed(),
            unsent_events: unsent,
            disconnects,
            log_path: self.logger.path().to_path_buf(),
            error,
        }
    }
}

/// Await `fut` unless the session is cancelled or loses its channel first
async fn guarded<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    channel: &SyncChannel,
) -> Result<F::Output, Interrupt> {
    let remote = channel.remote_abort();
    tokio::select! {
        out = fut => Ok(out),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = remote.cancelled() => Err(Interrupt::RemoteAbort),
        _ = channel.failed() => Err(Interrupt::SyncFailed),
    }
}
