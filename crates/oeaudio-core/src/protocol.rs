//! Trial protocol
//!
//! Each stimulus is presented `repeats` times. In shuffled order the full
//! list of presentations is permuted with a seeded `StdRng`, so the same
//! seed always yields the same sequence. When looping, every pass after
//! the first is reshuffled with a seed derived from the base seed and the
//! pass number; ordinals keep counting across passes.

use crate::config::{ProtocolConfig, StimulusEntry};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Duration;
use thiserror::Error;

/// Mixes the pass number into the base seed
const PASS_SEED_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Protocol has no stimuli")]
    Empty,

    #[error("Stimulus '{0}' has a repeat count of zero")]
    ZeroRepeats(String),

    #[error("Invalid inter-trial gap: {0} s")]
    InvalidGap(f64),
}

/// Presentation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Sequential,
    Shuffled { seed: u64 },
}

/// One scheduled presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    /// 1-based position in the session
    pub ordinal: u32,
    pub stimulus_id: String,
    /// Gap after this trial's stimulus ends
    pub inter_trial_interval: Duration,
    /// 1-based presentation index for this stimulus within a pass
    pub repetition: u32,
    pub repeats: u32,
    /// 0-based protocol pass
    pub pass: u32,
}

#[derive(Debug, Clone)]
struct Presentation {
    stimulus_id: String,
    repetition: u32,
    repeats: u32,
}

/// Immutable plan of trials
#[derive(Debug, Clone)]
pub struct Protocol {
    presentations: Vec<Presentation>,
    order: Order,
    gap: Duration,
    looping: bool,
}

impl Protocol {
    pub fn build(
        entries: &[StimulusEntry],
        default_repeats: u32,
        order: Order,
        gap: Duration,
        looping: bool,
    ) -> Result<Self, ProtocolError> {
        if entries.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut presentations = Vec::new();
        for entry in entries {
            let repeats = entry.repeats.unwrap_or(default_repeats);
            if repeats == 0 {
                return Err(ProtocolError::ZeroRepeats(entry.id.clone()));
            }
            presentations.extend((1..=repeats).map(|repetition| Presentation {
                stimulus_id: entry.id.clone(),
                repetition,
                repeats,
            }));
        }

        Ok(Self {
            presentations,
            order,
            gap,
            looping,
        })
    }

    /// Build from configuration, drawing a seed if shuffling without one
    pub fn from_config(config: &ProtocolConfig) -> Result<Self, ProtocolError> {
        let gap = Duration::try_from_secs_f64(config.gap_secs)
            .map_err(|_| ProtocolError::InvalidGap(config.gap_secs))?;
        let order = if config.shuffle {
            Order::Shuffled {
                seed: config.seed.unwrap_or_else(rand::random),
            }
        } else {
            Order::Sequential
        };
        Self::build(&config.stimuli, config.repeats, order, gap, config.looping)
    }

    /// Trials of one pass, in presentation order
    pub fn pass(&self, pass: u32) -> Vec<Trial> {
        let mut presentations: Vec<&Presentation> = self.presentations.iter().collect();
        if let Order::Shuffled { seed } = self.order {
            let mut rng = StdRng::seed_from_u64(pass_seed(seed, pass));
            presentations.shuffle(&mut rng);
        }

        let base = pass.saturating_mul(self.len() as u32);
        presentations
            .into_iter()
            .enumerate()
            .map(|(i, p)| Trial {
                ordinal: base.saturating_add(i as u32 + 1),
                stimulus_id: p.stimulus_id.clone(),
                inter_trial_interval: self.gap,
                repetition: p.repetition,
                repeats: p.repeats,
                pass,
            })
            .collect()
    }

    /// All trials of the session; endless when looping
    pub fn trials(&self) -> impl Iterator<Item = Trial> + '_ {
        let passes = if self.looping { u32::MAX } else { 1 };
        (0..passes).flat_map(move |pass| self.pass(pass))
    }

    /// Distinct stimulus ids in first-appearance order
    pub fn stimulus_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for p in &self.presentations {
            if !ids.contains(&p.stimulus_id.as_str()) {
                ids.push(&p.stimulus_id);
            }
        }
        ids
    }

    /// Trials per pass
    pub fn len(&self) -> usize {
        self.presentations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presentations.is_empty()
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn seed(&self) -> Option<u64> {
        match self.order {
            Order::Shuffled { seed } => Some(seed),
            Order::Sequential => None,
        }
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }
}

fn pass_seed(seed: u64, pass: u32) -> u64 {
    seed ^ (pass as u64).wrapping_mul(PASS_SEED_MULTIPLIER)
}
