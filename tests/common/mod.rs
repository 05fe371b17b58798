//! Shared fixtures: WAV stimuli and a fake recording system

#![allow(dead_code)]

use oeaudio::config::{SessionConfig, StimulusEntry};
use oeaudio::sync::backoff::RetryPolicy;
use oeaudio::sync::wire::WireEvent;
use oeaudio::{EventKind, SyncEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const RATE: u32 = 48000;

/// Write a 16-bit sine tone
pub fn write_tone(dir: &Path, name: &str, sample_rate: u32, channels: u16, secs: f64) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (secs * sample_rate as f64).round() as usize;
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..frames * channels as usize {
        let sample = ((i as f32 * 0.05).sin() * 10000.0) as i16;
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Session config with fast retries, a short gap and a log in `dir`
pub fn session_config<P: AsRef<Path>>(
    dir: &Path,
    stimuli: &[(&str, P)],
    endpoint: &str,
) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.protocol.stimuli = stimuli
        .iter()
        .map(|(id, path)| StimulusEntry {
            id: id.to_string(),
            path: path.as_ref().to_path_buf(),
            repeats: None,
        })
        .collect();
    config.protocol.gap_secs = 0.02;
    config.device.simulate = true;
    config.sync.endpoint = endpoint.to_string();
    config.sync.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        connect_timeout_ms: 500,
    };
    config.sync.close_timeout_ms = 1000;
    config.log.path = dir.join("events.jsonl");
    config
}

pub fn kinds(events: &[SyncEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// How the fake recorder treats its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Acknowledge every event
    AckAll,
    /// Drop the first connection on the n-th event without acknowledging it
    DropAfter(usize),
    /// Shut down entirely on the n-th event
    DieAfter(usize),
    /// Send an abort command after acknowledging the n-th event
    AbortAfter(usize),
}

pub struct Recorder {
    pub addr: String,
    pub received: Arc<Mutex<Vec<WireEvent>>>,
    task: JoinHandle<()>,
}

impl Recorder {
    pub fn events(&self) -> Vec<WireEvent> {
        self.received.lock().unwrap().clone()
    }

    /// Received events with retransmissions removed
    pub fn unique_events(&self) -> Vec<WireEvent> {
        let mut seen = std::collections::BTreeSet::new();
        self.events()
            .into_iter()
            .filter(|e| seen.insert(e.seq))
            .collect()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_recorder(behavior: Behavior) -> Recorder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let received = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&received);

    let task = tokio::spawn(async move {
        let mut connection = 0;
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            connection += 1;
            let (read, mut write) = conn.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut count = 0;

            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(event) = serde_json::from_str::<WireEvent>(&line) else {
                    continue;
                };
                let seq = event.seq;
                store.lock().unwrap().push(event);
                count += 1;

                match behavior {
                    Behavior::DropAfter(n) if connection == 1 && count == n => break,
                    Behavior::DieAfter(n) if count == n => return,
                    _ => {}
                }

                let ack = format!("{{\"type\":\"ack\",\"seq\":{}}}\n", seq);
                if write.write_all(ack.as_bytes()).await.is_err() {
                    break;
                }
                if behavior == Behavior::AbortAfter(count) {
                    let _ = write
                        .write_all(b"{\"type\":\"command\",\"command\":\"abort\"}\n")
                        .await;
                }
            }
        }
    });

    Recorder {
        addr,
        received,
        task,
    }
}
