//! oeaudio - acoustic stimulus presentation for neural recording sessions
//!
//! This library re-exports the scheduling, playback and synchronization
//! engine from `oeaudio-core`.

pub use oeaudio_core::{audio, config, error, log, protocol, scheduler, stimulus, sync};

pub use oeaudio_core::{EventKind, EventLogger, PlaybackEngine, Protocol, SyncChannel, SyncEvent};
pub use oeaudio_core::{Session, SessionConfig, SessionError, SessionReport, Severity};
pub use oeaudio_core::{BUILD_DATE, DEFAULT_ENDPOINT, DEFAULT_GAP_SECS, VERSION};
