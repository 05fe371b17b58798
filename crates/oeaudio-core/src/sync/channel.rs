//! At-least-once channel to the recording system
//!
//! [`SyncChannel::publish`] never blocks: events go into an unbounded
//! queue drained by a background task that owns the TCP connection. The
//! task keeps every event pending until the recorder acknowledges it (or,
//! without acknowledgments, until it has been written), and on a broken
//! connection reconnects with backoff and retransmits the pending events
//! in their original order. Duplicates are possible; reordering is not.
//!
//! When the reconnection budget runs out the channel enters
//! [`ChannelState::Failed`]. It still accepts events so that
//! [`SyncChannel::close`] can report every event that never got through.

use super::backoff::RetryPolicy;
use super::event::SyncEvent;
use super::wire::{encode_event, parse_inbound, Inbound, RemoteCommand};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra time granted to the transport to answer a close request
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Errors from the synchronization channel
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Could not connect to {endpoint} after {attempts} attempt(s): {reason}")]
    Connection {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("Lost connection to {endpoint}: reconnection budget of {attempts} attempt(s) exhausted")]
    Exhausted { endpoint: String, attempts: u32 },

    #[error("Connection to recording system interrupted ({disconnects} disconnect(s)); events resent")]
    Interrupted { disconnects: u64 },

    #[error("Synchronization channel is closed")]
    Closed,
}

/// Connection state for reconnection tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected yet
    Disconnected,
    /// Initial connection in progress
    Connecting {
        /// Current attempt number (1-based)
        attempt: u32,
    },
    /// Connected and operating normally
    Connected,
    /// Connection lost, attempting to reconnect
    Reconnecting {
        /// Current reconnect attempt number (1-based)
        attempt: u32,
    },
    /// Retry budget exhausted
    Failed,
    /// Closed by the session
    Closed,
}

/// Snapshot of channel health published by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub state: ChannelState,
    /// Connections lost since the session started
    pub disconnects: u64,
    /// Lines written, including retransmissions
    pub sent: u64,
    /// Events confirmed delivered
    pub delivered: u64,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            state: ChannelState::Disconnected,
            disconnects: 0,
            sent: 0,
            delivered: 0,
        }
    }
}

enum Outgoing {
    Event(SyncEvent),
    Close {
        deadline: Instant,
        reply: oneshot::Sender<Vec<SyncEvent>>,
    },
}

/// Handle to the synchronization channel
pub struct SyncChannel {
    policy: RetryPolicy,
    require_ack: bool,
    endpoint: Option<String>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    /// Events queued before `connect`, handed to the transport on success
    backlog: Option<mpsc::UnboundedReceiver<Outgoing>>,
    health_tx: Option<watch::Sender<ChannelHealth>>,
    health: watch::Receiver<ChannelHealth>,
    remote_abort: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncChannel {
    pub fn new(policy: RetryPolicy, require_ack: bool) -> Self {
        let (outbox, backlog) = mpsc::unbounded_channel();
        let (health_tx, health) = watch::channel(ChannelHealth::default());
        Self {
            policy,
            require_ack,
            endpoint: None,
            outbox,
            backlog: Some(backlog),
            health_tx: Some(health_tx),
            health,
            remote_abort: CancellationToken::new(),
            task: None,
        }
    }

    /// Connect to the recorder, retrying per the backoff policy
    ///
    /// Events published before this call are transmitted first, in order.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), SyncError> {
        if self.task.is_some() {
            return Ok(());
        }
        // The backlog stays in place until a connection exists, so a
        // cancelled connect loses nothing
        let Some(health) = self.health_tx.as_ref() else {
            return Err(SyncError::Closed);
        };
        self.endpoint = Some(endpoint.to_string());

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        let mut stream = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay_for(attempt - 1)).await;
            }
            health.send_modify(|h| h.state = ChannelState::Connecting { attempt });
            match connect_once(endpoint, &self.policy).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::warn!(endpoint, attempt, max_attempts, error = %e, "Sync connection attempt failed");
                    last_error = e;
                }
            }
        }

        let Some(stream) = stream else {
            health.send_modify(|h| h.state = ChannelState::Failed);
            return Err(SyncError::Connection {
                endpoint: endpoint.to_string(),
                attempts: max_attempts,
                reason: last_error,
            });
        };
        let (Some(backlog), Some(health)) = (self.backlog.take(), self.health_tx.take()) else {
            return Err(SyncError::Closed);
        };

        tracing::info!(endpoint, "Connected to recording system");
        let transport = Transport {
            endpoint: endpoint.to_string(),
            policy: self.policy,
            require_ack: self.require_ack,
            outbox: backlog,
            health,
            remote_abort: self.remote_abort.clone(),
            pending: VecDeque::new(),
            next_seq: 1,
            closing: None,
        };
        self.task = Some(tokio::spawn(transport.run(stream)));
        Ok(())
    }

    /// Queue an event for transmission without waiting on the network
    pub fn publish(&self, event: SyncEvent) -> Result<(), SyncError> {
        self.outbox
            .send(Outgoing::Event(event))
            .map_err(|_| SyncError::Closed)
    }

    /// Flush pending events for at most `timeout`, then drop the connection
    ///
    /// Returns the events that were not confirmed delivered.
    pub async fn close(&mut self, timeout: Duration) -> Vec<SyncEvent> {
        if let Some(task) = self.task.take() {
            let (reply, rx) = oneshot::channel();
            let deadline = Instant::now() + timeout;
            if self.outbox.send(Outgoing::Close { deadline, reply }).is_err() {
                tracing::error!("Sync transport exited before close");
                return Vec::new();
            }
            let unsent = match tokio::time::timeout(timeout + CLOSE_GRACE, rx).await {
                Ok(Ok(unsent)) => unsent,
                _ => {
                    tracing::error!("Sync transport did not report unsent events");
                    task.abort();
                    Vec::new()
                }
            };
            let _ = task.await;
            return unsent;
        }

        let mut unsent = Vec::new();
        if let Some(mut backlog) = self.backlog.take() {
            while let Ok(msg) = backlog.try_recv() {
                if let Outgoing::Event(event) = msg {
                    unsent.push(event);
                }
            }
        }
        if let Some(health) = self.health_tx.take() {
            health.send_modify(|h| h.state = ChannelState::Closed);
        }
        unsent
    }

    pub fn health(&self) -> ChannelHealth {
        self.health.borrow().clone()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Resolves once the reconnection budget is exhausted
    pub async fn failed(&self) {
        let mut rx = self.health.clone();
        if rx
            .wait_for(|h| h.state == ChannelState::Failed)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }

    /// Cancelled when the recorder sends an abort command
    pub fn remote_abort(&self) -> CancellationToken {
        self.remote_abort.clone()
    }

    /// Error describing a failed channel, for the session report
    pub fn failure(&self) -> Option<SyncError> {
        if self.health().state != ChannelState::Failed {
            return None;
        }
        Some(SyncError::Exhausted {
            endpoint: self.endpoint.clone().unwrap_or_default(),
            attempts: self.policy.max_attempts,
        })
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connect_once(endpoint: &str, policy: &RetryPolicy) -> Result<TcpStream, String> {
    match tokio::time::timeout(policy.connect_timeout(), TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {:?}", policy.connect_timeout())),
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }
}

struct Pending {
    seq: u64,
    event: SyncEvent,
    /// Written on the current connection
    written: bool,
}

enum Step {
    Outgoing(Option<Outgoing>),
    Inbound(std::io::Result<Option<String>>),
}

/// Close request taken from the outbox
struct Closing {
    deadline: Instant,
    reply: oneshot::Sender<Vec<SyncEvent>>,
}

/// Background task owning the TCP connection
struct Transport {
    endpoint: String,
    policy: RetryPolicy,
    require_ack: bool,
    outbox: mpsc::UnboundedReceiver<Outgoing>,
    health: watch::Sender<ChannelHealth>,
    remote_abort: CancellationToken,
    pending: VecDeque<Pending>,
    next_seq: u64,
    /// Close received while reconnecting, handled once reconnect returns
    closing: Option<Closing>,
}

impl Transport {
    async fn run(mut self, stream: TcpStream) {
        let mut conn = Some(Connection::new(stream));
        self.health
            .send_modify(|h| h.state = ChannelState::Connected);

        loop {
            if let Some(closing) = self.closing.take() {
                self.finish(conn, closing).await;
                return;
            }

            let step = match conn.as_mut() {
                Some(c) => tokio::select! {
                    msg = self.outbox.recv() => Step::Outgoing(msg),
                    line = c.lines.next_line() => Step::Inbound(line),
                },
                None => Step::Outgoing(self.outbox.recv().await),
            };

            match step {
                Step::Outgoing(None) => return,
                Step::Outgoing(Some(Outgoing::Event(event))) => {
                    self.enqueue(event);
                    if let Some(c) = conn.as_mut() {
                        if let Err(e) = self.transmit_pending(c).await {
                            tracing::warn!(error = %e, "Sync write failed");
                            conn = self.reconnect().await;
                        }
                    }
                }
                Step::Outgoing(Some(Outgoing::Close { deadline, reply })) => {
                    self.closing = Some(Closing { deadline, reply });
                }
                Step::Inbound(Ok(Some(line))) => self.handle_inbound(&line),
                Step::Inbound(Ok(None)) => {
                    tracing::warn!(endpoint = %self.endpoint, "Recording system closed the connection");
                    conn = self.reconnect().await;
                }
                Step::Inbound(Err(e)) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "Sync read failed");
                    conn = self.reconnect().await;
                }
            }
        }
    }

    /// Flush until the close deadline, then report everything undelivered
    async fn finish(&mut self, mut conn: Option<Connection>, closing: Closing) {
        self.flush(&mut conn, closing.deadline).await;
        if let Some(mut c) = conn.take() {
            let _ = c.writer.shutdown().await;
        }
        let unsent = self.take_unsent();
        if !unsent.is_empty() {
            tracing::warn!(count = unsent.len(), "Closing with undelivered sync events");
        }
        let _ = closing.reply.send(unsent);
        self.health.send_modify(|h| h.state = ChannelState::Closed);
        tracing::info!(endpoint = %self.endpoint, "Sync channel closed");
    }

    fn enqueue(&mut self, event: SyncEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(Pending {
            seq,
            event,
            written: false,
        });
    }

    /// Write every pending event not yet carried by the current connection
    async fn transmit_pending(&mut self, conn: &mut Connection) -> std::io::Result<()> {
        while let Some(index) = self.pending.iter().position(|p| !p.written) {
            let line = {
                let p = &self.pending[index];
                encode_event(p.seq, &p.event)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            };
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await?;
            self.health.send_modify(|h| h.sent += 1);

            if self.require_ack {
                self.pending[index].written = true;
            } else {
                self.pending.remove(index);
                self.health.send_modify(|h| h.delivered += 1);
            }
        }
        Ok(())
    }

    /// Re-establish the connection and retransmit everything pending
    ///
    /// Events published meanwhile join the pending queue. A close request
    /// stops the attempts at its deadline. Returns `None` once the retry
    /// budget is exhausted, the close deadline passes, or the handle is gone.
    async fn reconnect(&mut self) -> Option<Connection> {
        self.health.send_modify(|h| h.disconnects += 1);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let endpoint = self.endpoint.clone();
            let policy = self.policy;
            let delay = policy.delay_for(attempt);
            let dial = async move {
                tokio::time::sleep(delay).await;
                tracing::info!(endpoint = %endpoint, attempt, max_attempts, "Reconnecting to recording system");
                connect_once(&endpoint, &policy).await
            };
            tokio::pin!(dial);
            self.health
                .send_modify(|h| h.state = ChannelState::Reconnecting { attempt });

            let result = loop {
                let close_at = self.closing.as_ref().map(|c| c.deadline);
                tokio::select! {
                    result = &mut dial => break Some(result),
                    msg = self.outbox.recv(), if close_at.is_none() => match msg {
                        Some(Outgoing::Event(event)) => self.enqueue(event),
                        Some(Outgoing::Close { deadline, reply }) => {
                            self.closing = Some(Closing { deadline, reply });
                        }
                        None => break None,
                    },
                    _ = tokio::time::sleep_until(close_at.unwrap_or_else(Instant::now)), if close_at.is_some() => {
                        tracing::warn!(
                            endpoint = %self.endpoint,
                            attempt,
                            pending = self.pending.len(),
                            "Close deadline reached while reconnecting"
                        );
                        break None;
                    }
                }
            };

            let stream = match result {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    last_error = e;
                    continue;
                }
                None => return None,
            };
            let mut conn = Connection::new(stream);
            for p in self.pending.iter_mut() {
                p.written = false;
            }
            match self.transmit_pending(&mut conn).await {
                Ok(()) => {
                    self.health
                        .send_modify(|h| h.state = ChannelState::Connected);
                    tracing::info!(
                        endpoint = %self.endpoint,
                        resent = self.pending.len(),
                        "Reconnected to recording system"
                    );
                    return Some(conn);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        self.health.send_modify(|h| h.state = ChannelState::Failed);
        tracing::error!(
            endpoint = %self.endpoint,
            attempts = max_attempts,
            error = %last_error,
            pending = self.pending.len(),
            "Reconnection budget exhausted"
        );
        None
    }

    /// Wait for outstanding acknowledgments until `deadline`
    async fn flush(&mut self, conn: &mut Option<Connection>, deadline: Instant) {
        while self.require_ack && !self.pending.is_empty() {
            let Some(c) = conn.as_mut() else {
                return;
            };
            let line = tokio::select! {
                line = c.lines.next_line() => line,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(pending = self.pending.len(), "Timed out waiting for acknowledgments");
                    return;
                }
            };
            match line {
                Ok(Some(line)) => self.handle_inbound(&line),
                Ok(None) | Err(_) => {
                    *conn = tokio::time::timeout_at(deadline, self.reconnect())
                        .await
                        .ok()
                        .flatten();
                }
            }
        }
    }

    fn handle_inbound(&mut self, line: &str) {
        match parse_inbound(line) {
            Some(Inbound::Ack { seq }) => {
                if let Some(index) = self.pending.iter().position(|p| p.seq == seq) {
                    self.pending.remove(index);
                    self.health.send_modify(|h| h.delivered += 1);
                } else {
                    tracing::debug!(seq, "Duplicate or unknown acknowledgment");
                }
            }
            Some(inbound) => match inbound.as_command() {
                Some(RemoteCommand::Abort) => {
                    tracing::warn!(endpoint = %self.endpoint, "Recording system requested abort");
                    self.remote_abort.cancel();
                }
                None => tracing::debug!(?inbound, "Ignoring unknown command"),
            },
            None => tracing::debug!(line, "Ignoring unrecognized message"),
        }
    }

    fn take_unsent(&mut self) -> Vec<SyncEvent> {
        let mut unsent: Vec<SyncEvent> = self.pending.drain(..).map(|p| p.event).collect();
        while let Ok(msg) = self.outbox.try_recv() {
            if let Outgoing::Event(event) = msg {
                unsent.push(event);
            }
        }
        unsent
    }
}
