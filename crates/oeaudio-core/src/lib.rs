//! oeaudio Core - Trial scheduling, playback and synchronization engine
//!
//! This library presents pre-recorded acoustic stimuli in a controlled
//! sequence and reports every presentation milestone to an external neural
//! recording system, so that each stimulus onset can be located in the
//! recorder's timebase after the fact.
//!
//! Components, leaves first:
//! - [`stimulus`]: decoded sample buffers, cached per session
//! - [`audio`]: the playback engine and its output backends
//! - [`sync`]: sync events and the network channel to the recorder
//! - [`log`]: the durable local event log
//! - [`scheduler`]: the session state machine driving everything else

pub mod audio;
pub mod config;
pub mod error;
pub mod log;
pub mod protocol;
pub mod scheduler;
pub mod stimulus;
pub mod sync;

pub use audio::engine::PlaybackEngine;
pub use config::SessionConfig;
pub use error::{SessionError, Severity};
pub use log::EventLogger;
pub use protocol::{Protocol, Trial};
pub use scheduler::{Session, SessionReport};
pub use stimulus::store::StimulusStore;
pub use sync::channel::SyncChannel;
pub use sync::event::{EventKind, SyncEvent};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default inter-trial gap in seconds
pub const DEFAULT_GAP_SECS: f64 = 2.0;

/// Default recording-system endpoint
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:5557";
