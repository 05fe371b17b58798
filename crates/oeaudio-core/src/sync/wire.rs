//! Wire format
//!
//! One JSON object per line in each direction.
//!
//! Outbound (one per [`SyncEvent`], `seq` starts at 1):
//! ```text
//! {"seq":4,"kind":"stimulus_onset","trial_ordinal":1,"stimulus_id":"A",
//!  "device_timestamp":2.0135,"device_frame":96648,"wall_timestamp":"..."}
//! ```
//!
//! Inbound:
//! ```text
//! {"type":"ack","seq":4}
//! {"type":"command","command":"abort"}
//! ```

use super::event::SyncEvent;
use serde::{Deserialize, Serialize};

/// Outbound message: a sync event with its sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// Messages the recording system may send back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Ack { seq: u64 },
    Command { command: String },
}

/// Control commands recognized from the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Abort,
}

impl Inbound {
    pub fn as_command(&self) -> Option<RemoteCommand> {
        match self {
            Self::Command { command } if command.eq_ignore_ascii_case("abort") => {
                Some(RemoteCommand::Abort)
            }
            _ => None,
        }
    }
}

/// Encode an event as one newline-terminated line
pub fn encode_event(seq: u64, event: &SyncEvent) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(&WireEvent {
        seq,
        event: event.clone(),
    })?;
    line.push('\n');
    Ok(line)
}

/// Parse an inbound line; `None` for anything unrecognized
pub fn parse_inbound(line: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}
