//! Session-wide stimulus cache
//!
//! The store maps identifiers to source files and decodes each file at
//! most once. Decoding happens during protocol validation, before the
//! output device is opened, so nothing in the playback path touches disk.
//! After validation the cache is only read, through `&self`.

use super::source::{SampleSource, SourceError, WavSource};
use super::Stimulus;
use crate::audio::OutputFormat;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while resolving a stimulus
#[derive(Error, Debug)]
pub enum StimulusError {
    #[error("Stimulus '{id}' not found{}", .path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    NotFound { id: String, path: Option<PathBuf> },

    #[error("Stimulus '{id}' could not be decoded: {reason}")]
    Decode { id: String, reason: String },

    #[error("Stimulus '{id}' {property} mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        id: String,
        property: &'static str,
        expected: u32,
        actual: u32,
    },
}

impl StimulusError {
    /// Identifier of the stimulus that failed
    pub fn id(&self) -> &str {
        match self {
            Self::NotFound { id, .. } | Self::Decode { id, .. } | Self::FormatMismatch { id, .. } => {
                id
            }
        }
    }
}

/// Output constraints stimuli must satisfy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatRequirement {
    /// Required sample rate. `None` lets the first resolved stimulus fix it.
    pub sample_rate: Option<u32>,
    /// Device channel count. Stimuli may use fewer channels, never more.
    pub max_channels: Option<u16>,
}

/// Resolves stimulus identifiers to cached, decoded buffers
pub struct StimulusStore {
    source: Box<dyn SampleSource>,
    registry: HashMap<String, PathBuf>,
    cache: HashMap<String, Arc<Stimulus>>,
    requirement: FormatRequirement,
    /// Rate adopted from the first stimulus when none was configured
    locked_rate: Option<u32>,
    /// Number of decodes performed (one per distinct stimulus)
    decodes: usize,
}

impl StimulusStore {
    /// Create a store backed by the WAV decoder
    pub fn new(requirement: FormatRequirement) -> Self {
        Self::with_source(Box::new(WavSource), requirement)
    }

    /// Create a store backed by a custom decoder
    pub fn with_source(source: Box<dyn SampleSource>, requirement: FormatRequirement) -> Self {
        Self {
            source,
            registry: HashMap::new(),
            cache: HashMap::new(),
            requirement,
            locked_rate: requirement.sample_rate,
            decodes: 0,
        }
    }

    /// Register the source file for an identifier
    ///
    /// Re-registering an identifier replaces its path unless the stimulus
    /// has already been decoded, in which case the cached buffer wins.
    pub fn register(&mut self, id: impl Into<String>, path: impl Into<PathBuf>) {
        let id = id.into();
        if self.cache.contains_key(&id) {
            tracing::warn!(stimulus = %id, "Stimulus already resolved, keeping cached buffer");
            return;
        }
        self.registry.insert(id, path.into());
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.contains_key(id)
    }

    /// Resolve an identifier to its decoded stimulus
    ///
    /// The first call decodes the source; later calls return the same
    /// `Arc` without touching the file again.
    pub fn resolve(&mut self, id: &str) -> Result<Arc<Stimulus>, StimulusError> {
        if let Some(stimulus) = self.cache.get(id) {
            return Ok(Arc::clone(stimulus));
        }

        let path = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| StimulusError::NotFound {
                id: id.to_string(),
                path: None,
            })?;

        let audio = self.source.read_samples(&path).map_err(|e| match e {
            SourceError::NotFound(p) => StimulusError::NotFound {
                id: id.to_string(),
                path: Some(p),
            },
            SourceError::Decode(reason) => StimulusError::Decode {
                id: id.to_string(),
                reason,
            },
        })?;
        self.decodes += 1;

        if audio.samples.is_empty() {
            return Err(StimulusError::Decode {
                id: id.to_string(),
                reason: "no audio frames".to_string(),
            });
        }

        let expected_rate = self.locked_rate.unwrap_or(audio.sample_rate);
        if audio.sample_rate != expected_rate {
            return Err(StimulusError::FormatMismatch {
                id: id.to_string(),
                property: "sample rate",
                expected: expected_rate,
                actual: audio.sample_rate,
            });
        }
        if let Some(max) = self.requirement.max_channels {
            if audio.channels > max {
                return Err(StimulusError::FormatMismatch {
                    id: id.to_string(),
                    property: "channel count",
                    expected: max as u32,
                    actual: audio.channels as u32,
                });
            }
        }
        self.locked_rate = Some(expected_rate);

        let stimulus = Arc::new(Stimulus::new(
            id,
            path,
            audio.samples,
            audio.sample_rate,
            audio.channels,
        ));
        tracing::info!(
            stimulus = %stimulus.id(),
            path = %stimulus.source().display(),
            channels = stimulus.channels(),
            sample_rate = stimulus.sample_rate(),
            "Loaded stimulus: {:.2} s",
            stimulus.duration().as_secs_f64()
        );
        self.cache.insert(id.to_string(), Arc::clone(&stimulus));
        Ok(stimulus)
    }

    /// Cached stimulus, if already resolved
    pub fn get(&self, id: &str) -> Option<Arc<Stimulus>> {
        self.cache.get(id).cloned()
    }

    /// Output format satisfying every resolved stimulus
    ///
    /// Uses the required channel count when configured, otherwise the
    /// widest resolved stimulus. `None` until a rate is known.
    pub fn output_format(&self) -> Option<OutputFormat> {
        let sample_rate = self.locked_rate?;
        let widest = self.cache.values().map(|s| s.channels()).max();
        let channels = self.requirement.max_channels.or(widest)?;
        Some(OutputFormat {
            sample_rate,
            channels,
        })
    }

    /// Number of distinct stimuli decoded so far
    pub fn decode_count(&self) -> usize {
        self.decodes
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
