//! Sync events
//!
//! A [`SyncEvent`] marks one scheduling milestone. The same record is
//! appended to the local log and transmitted to the recording system, so
//! both sides can be aligned offline on the device timestamp.

use crate::audio::renderer::Onset;
use crate::audio::DeviceTimestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milestone kinds, in the order they occur within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    TrialStart,
    StimulusOnset,
    TrialEnd,
    SessionEnd,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SessionStart => "session-start",
            Self::TrialStart => "trial-start",
            Self::StimulusOnset => "stimulus-onset",
            Self::TrialEnd => "trial-end",
            Self::SessionEnd => "session-end",
        };
        f.write_str(s)
    }
}

/// Outcome tag carried by trial-end and session-end events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Completed,
    Degraded,
    Aborted,
}

/// One timestamped milestone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: EventKind,
    /// 1-based trial ordinal; `None` for session events
    pub trial_ordinal: Option<u32>,
    pub stimulus_id: Option<String>,
    /// Device clock in seconds
    pub device_timestamp: f64,
    /// Device clock in frames
    pub device_frame: u64,
    pub wall_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl SyncEvent {
    fn new(kind: EventKind, device: DeviceTimestamp) -> Self {
        Self {
            kind,
            trial_ordinal: None,
            stimulus_id: None,
            device_timestamp: device.seconds,
            device_frame: device.frame,
            wall_timestamp: Utc::now(),
            status: None,
            notes: Vec::new(),
        }
    }

    fn for_trial(mut self, ordinal: u32, stimulus: &str) -> Self {
        self.trial_ordinal = Some(ordinal);
        self.stimulus_id = Some(stimulus.to_string());
        self
    }

    pub fn session_start(device: DeviceTimestamp, notes: Vec<String>) -> Self {
        let mut event = Self::new(EventKind::SessionStart, device);
        event.notes = notes;
        event
    }

    pub fn trial_start(ordinal: u32, stimulus: &str, device: DeviceTimestamp) -> Self {
        Self::new(EventKind::TrialStart, device).for_trial(ordinal, stimulus)
    }

    /// Onset event stamped with the hardware-confirmed time
    pub fn stimulus_onset(ordinal: u32, stimulus: &str, onset: &Onset) -> Self {
        Self::new(EventKind::StimulusOnset, onset.timestamp).for_trial(ordinal, stimulus)
    }

    /// Trial end; non-empty `problems` marks the trial degraded
    pub fn trial_end(
        ordinal: u32,
        stimulus: &str,
        device: DeviceTimestamp,
        problems: Vec<String>,
    ) -> Self {
        let mut event = Self::new(EventKind::TrialEnd, device).for_trial(ordinal, stimulus);
        event.status = Some(if problems.is_empty() {
            EventStatus::Completed
        } else {
            EventStatus::Degraded
        });
        event.notes = problems;
        event
    }

    /// Trial cut short by a session abort
    pub fn trial_aborted(ordinal: u32, stimulus: &str, device: DeviceTimestamp, reason: String) -> Self {
        let mut event = Self::new(EventKind::TrialEnd, device).for_trial(ordinal, stimulus);
        event.status = Some(EventStatus::Aborted);
        event.notes = vec![reason];
        event
    }

    pub fn session_end(device: DeviceTimestamp, aborted: Option<String>) -> Self {
        let mut event = Self::new(EventKind::SessionEnd, device);
        match aborted {
            Some(reason) => {
                event.status = Some(EventStatus::Aborted);
                event.notes = vec![reason];
            }
            None => event.status = Some(EventStatus::Completed),
        }
        event
    }

    pub fn is_degraded(&self) -> bool {
        self.status == Some(EventStatus::Degraded)
    }

    pub fn is_aborted(&self) -> bool {
        self.status == Some(EventStatus::Aborted)
    }

    /// Position of this event in the session's total order
    ///
    /// Session start sorts first and session end last; trial events sort
    /// by ordinal, then by kind.
    pub fn order_key(&self) -> (u32, EventKind) {
        match self.kind {
            EventKind::SessionStart => (0, self.kind),
            EventKind::SessionEnd => (u32::MAX, self.kind),
            _ => (self.trial_ordinal.unwrap_or(0), self.kind),
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(n) = self.trial_ordinal {
            write!(f, " #{}", n)?;
        }
        if let Some(ref id) = self.stimulus_id {
            write!(f, " ({})", id)?;
        }
        write!(f, " @ {:.6} s", self.device_timestamp)
    }
}

/// Rejects events that would break the session's total order
#[derive(Debug, Default, Clone)]
pub struct SequenceCheck {
    last: Option<(u32, EventKind)>,
}

impl SequenceCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `event` if it sorts strictly after everything seen so far
    pub fn accept(&mut self, event: &SyncEvent) -> Result<(), String> {
        if event.kind != EventKind::SessionStart
            && event.kind != EventKind::SessionEnd
            && event.trial_ordinal.is_none()
        {
            return Err(format!("{} without a trial ordinal", event.kind));
        }
        let key = event.order_key();
        match self.last {
            None if event.kind != EventKind::SessionStart => {
                Err(format!("{} before session-start", event.kind))
            }
            Some(last) if key <= last => Err(format!(
                "{} (trial {:?}) after {} (trial {})",
                event.kind, event.trial_ordinal, last.1, last.0
            )),
            _ => {
                self.last = Some(key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(frame: u64) -> DeviceTimestamp {
        DeviceTimestamp {
            frame,
            seconds: frame as f64 / 1000.0,
        }
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::StimulusOnset).unwrap();
        assert_eq!(json, "\"stimulus_onset\"");
    }

    #[test]
    fn test_trial_end_status() {
        let clean = SyncEvent::trial_end(1, "A", ts(10), vec![]);
        assert_eq!(clean.status, Some(EventStatus::Completed));
        let degraded = SyncEvent::trial_end(1, "A", ts(10), vec!["underrun".into()]);
        assert!(degraded.is_degraded());
    }

    #[test]
    fn test_schema_fields_present() {
        let event = SyncEvent::trial_start(3, "B", ts(1500));
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "trial_start");
        assert_eq!(value["trial_ordinal"], 3);
        assert_eq!(value["stimulus_id"], "B");
        assert_eq!(value["device_timestamp"], 1.5);
        assert_eq!(value["device_frame"], 1500);
        assert!(value["wall_timestamp"].is_string());
        assert!(value.get("status").is_none());
        assert!(value.get("notes").is_none());
    }

    #[test]
    fn test_sequence_accepts_session_order() {
        let mut check = SequenceCheck::new();
        let events = [
            SyncEvent::session_start(ts(0), vec![]),
            SyncEvent::trial_start(1, "A", ts(1)),
            SyncEvent::trial_start(1, "A", ts(1)),
        ];
        check.accept(&events[0]).unwrap();
        check.accept(&events[1]).unwrap();
        assert!(check.accept(&events[2]).is_err());

        let mut check = SequenceCheck::new();
        for event in [
            SyncEvent::session_start(ts(0), vec![]),
            SyncEvent::trial_start(1, "A", ts(1)),
            SyncEvent::trial_end(1, "A", ts(2), vec![]),
            SyncEvent::trial_start(2, "B", ts(3)),
            SyncEvent::session_end(ts(4), Some("cancelled".into())),
        ] {
            check.accept(&event).unwrap();
        }
    }

    #[test]
    fn test_sequence_rejects_out_of_order() {
        let mut check = SequenceCheck::new();
        assert!(check.accept(&SyncEvent::trial_start(1, "A", ts(0))).is_err());

        check.accept(&SyncEvent::session_start(ts(0), vec![])).unwrap();
        check.accept(&SyncEvent::trial_start(2, "A", ts(1))).unwrap();
        assert!(check.accept(&SyncEvent::trial_start(1, "A", ts(2))).is_err());

        check.accept(&SyncEvent::session_end(ts(3), None)).unwrap();
        assert!(check.accept(&SyncEvent::trial_start(3, "A", ts(4))).is_err());
    }
}
