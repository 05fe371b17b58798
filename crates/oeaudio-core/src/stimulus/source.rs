//! Sample decoding behind the [`SampleSource`] trait
//!
//! The store only needs `(samples, sample_rate, channels)` for a file
//! reference. [`WavSource`] provides that for WAV files via `hound`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from decoding a stimulus source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Malformed audio data: {0}")]
    Decode(String),
}

/// Decoded audio as handed over by a [`SampleSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in the range -1.0..=1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Reads decoded samples for a file reference
pub trait SampleSource: Send + Sync {
    fn read_samples(&self, path: &Path) -> Result<DecodedAudio, SourceError>;
}

/// WAV decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct WavSource;

impl SampleSource for WavSource {
    fn read_samples(&self, path: &Path) -> Result<DecodedAudio, SourceError> {
        let reader = match hound::WavReader::open(path) {
            Ok(r) => r,
            Err(hound::Error::IoError(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        };

        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| SourceError::Decode(e.to_string()))?,
            hound::SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(SourceError::Decode(format!(
                        "unsupported bit depth {}",
                        spec.bits_per_sample
                    )));
                }
                let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| SourceError::Decode(e.to_string()))?
            }
        };

        if spec.channels == 0 {
            return Err(SourceError::Decode("zero channels".to_string()));
        }
        if samples.len() % spec.channels as usize != 0 {
            return Err(SourceError::Decode(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                spec.channels
            )));
        }

        Ok(DecodedAudio {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}
