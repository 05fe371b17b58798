//! Session errors
//!
//! Component errors are wrapped in a [`SessionError`] carrying the trial
//! (or session) they occurred in, and classified by [`Severity`].

use crate::audio::engine::PlaybackError;
use crate::config::ConfigError;
use crate::log::LogError;
use crate::protocol::ProtocolError;
use crate::stimulus::store::StimulusError;
use crate::sync::channel::SyncError;
use std::fmt;
use thiserror::Error;

/// How an error affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Session aborts; teardown runs
    Fatal,
    /// Trial is flagged; session continues
    Degraded,
    /// Raised before playback; the session never starts
    Validation,
}

/// Where an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Trial(u32),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Trial(n) => write!(f, "trial {}", n),
        }
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("Protocol validation failed: {}", describe(.0))]
    ProtocolValidation(Vec<StimulusError>),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Stimulus(#[from] StimulusError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{count} degraded trial(s) exceed the limit of {limit}")]
    TooManyDegraded { count: u32, limit: u32 },

    #[error("Session has already run")]
    AlreadyRun,
}

fn describe(errors: &[StimulusError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// An error attached to the trial or session it occurred in
#[derive(Error, Debug)]
#[error("{scope}: {kind}")]
pub struct SessionError {
    pub scope: Scope,
    #[source]
    pub kind: ErrorKind,
}

impl SessionError {
    pub fn session(kind: impl Into<ErrorKind>) -> Self {
        Self {
            scope: Scope::Session,
            kind: kind.into(),
        }
    }

    pub fn trial(ordinal: u32, kind: impl Into<ErrorKind>) -> Self {
        Self {
            scope: Scope::Trial(ordinal),
            kind: kind.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match &self.kind {
            ErrorKind::Stimulus(_) => Severity::Validation,
            ErrorKind::Playback(PlaybackError::Underrun { .. }) => Severity::Degraded,
            ErrorKind::Sync(SyncError::Interrupted { .. }) => Severity::Degraded,
            ErrorKind::ProtocolValidation(_)
            | ErrorKind::Protocol(_)
            | ErrorKind::Playback(_)
            | ErrorKind::Sync(_)
            | ErrorKind::Log(_)
            | ErrorKind::Config(_)
            | ErrorKind::TooManyDegraded { .. }
            | ErrorKind::AlreadyRun => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
