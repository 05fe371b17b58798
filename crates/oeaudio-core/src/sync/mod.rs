//! Synchronization with the recording system
//!
//! - Event records shared with the recorder and the local log ([`event`])
//! - Line-delimited JSON wire format ([`wire`])
//! - Reconnection schedule ([`backoff`])
//! - The at-least-once transmission channel ([`channel`])

pub mod backoff;
pub mod channel;
pub mod event;
pub mod wire;
