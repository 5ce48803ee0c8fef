//! Per-job console fan-out with bounded replay.
//!
//! Each job gets a ring buffer of its most recent lines plus a broadcast
//! channel for live delivery. Lines carry a per-job sequence number; a
//! subscriber takes its backlog snapshot and its live receiver under the same
//! lock as publishers, so it sees every line exactly once and in order.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{models::JobId, runner::OutputStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
    /// Lifecycle events emitted by the orchestrator.
    Control,
}

impl From<OutputStream> for ConsoleStream {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => ConsoleStream::Stdout,
            OutputStream::Stderr => ConsoleStream::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub job_id: JobId,
    pub seq: u64,
    pub stream: ConsoleStream,
    pub text: String,
    pub at: DateTime<Utc>,
}

struct Channel {
    history: VecDeque<ConsoleLine>,
    next_seq: u64,
    /// `None` once the job's output is complete.
    live: Option<broadcast::Sender<ConsoleLine>>,
}

struct State {
    channels: HashMap<JobId, Channel>,
    /// Closed channels, oldest first, kept for replay until evicted.
    closed: VecDeque<JobId>,
}

/// Cheap to clone; all clones share the same channels.
#[derive(Clone)]
pub struct ConsoleBroadcaster {
    state: Arc<Mutex<State>>,
    history_lines: usize,
    retained_closed: usize,
}

impl fmt::Debug for ConsoleBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConsoleBroadcaster")
            .field("channels", &state.channels.len())
            .field("closed", &state.closed.len())
            .field("history_lines", &self.history_lines)
            .finish()
    }
}

impl ConsoleBroadcaster {
    pub fn new(history_lines: usize, retained_closed: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                channels: HashMap::new(),
                closed: VecDeque::new(),
            })),
            history_lines: history_lines.max(1),
            retained_closed,
        }
    }

    /// Registers a console so viewers can attach before the job produces
    /// output. Opening an existing console is a no-op.
    pub fn open(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.channels.entry(job_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.history_lines);
            Channel {
                history: VecDeque::with_capacity(self.history_lines.min(256)),
                next_seq: 0,
                live: Some(tx),
            }
        });
    }

    /// Appends a line; returns its sequence number, or `None` when the console
    /// is unknown or already closed.
    pub fn publish(&self, job_id: JobId, stream: ConsoleStream, text: impl Into<String>) -> Option<u64> {
        let mut state = self.state.lock();
        let channel = state.channels.get_mut(&job_id)?;
        let live = channel.live.as_ref()?;

        let line = ConsoleLine {
            job_id,
            seq: channel.next_seq,
            stream,
            text: text.into(),
            at: Utc::now(),
        };
        channel.next_seq += 1;
        // No receivers is fine; history still records the line.
        let _ = live.send(line.clone());
        if channel.history.len() == self.history_lines {
            channel.history.pop_front();
        }
        channel.history.push_back(line);
        Some(channel.next_seq - 1)
    }

    pub fn publish_control(&self, job_id: JobId, text: impl Into<String>) -> Option<u64> {
        self.publish(job_id, ConsoleStream::Control, text)
    }

    /// Ends live delivery. Subscribers drain what they have and finish; new
    /// subscribers get the retained history only.
    pub fn close(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let Some(channel) = state.channels.get_mut(&job_id) else {
            return;
        };
        if channel.live.take().is_none() {
            return;
        }
        state.closed.push_back(job_id);
        while state.closed.len() > self.retained_closed {
            if let Some(evicted) = state.closed.pop_front() {
                state.channels.remove(&evicted);
            }
        }
    }

    pub fn is_open(&self, job_id: JobId) -> bool {
        self.state
            .lock()
            .channels
            .get(&job_id)
            .is_some_and(|c| c.live.is_some())
    }

    pub fn subscribe(&self, job_id: JobId) -> Option<ConsoleSubscription> {
        let state = self.state.lock();
        let channel = state.channels.get(&job_id)?;
        Some(ConsoleSubscription {
            job_id,
            backlog: channel.history.iter().cloned().collect(),
            live: channel.live.as_ref().map(broadcast::Sender::subscribe),
            last_seq: None,
            broadcaster: self.clone(),
        })
    }

    fn history_after(&self, job_id: JobId, after: Option<u64>) -> Vec<ConsoleLine> {
        let state = self.state.lock();
        state
            .channels
            .get(&job_id)
            .map(|c| {
                c.history
                    .iter()
                    .filter(|l| after.map_or(true, |seq| l.seq > seq))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One viewer's position in a job console. Dropping it affects nobody else.
pub struct ConsoleSubscription {
    job_id: JobId,
    backlog: VecDeque<ConsoleLine>,
    live: Option<broadcast::Receiver<ConsoleLine>>,
    last_seq: Option<u64>,
    broadcaster: ConsoleBroadcaster,
}

impl fmt::Debug for ConsoleSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSubscription")
            .field("job_id", &self.job_id)
            .field("backlog", &self.backlog.len())
            .field("live", &self.live.is_some())
            .field("last_seq", &self.last_seq)
            .finish()
    }
}

impl ConsoleSubscription {
    /// Next line: backlog first, then live lines. `None` after the console
    /// closes and everything has been delivered.
    pub async fn recv(&mut self) -> Option<ConsoleLine> {
        loop {
            if let Some(line) = self.backlog.pop_front() {
                if self.is_new(&line) {
                    self.last_seq = Some(line.seq);
                    return Some(line);
                }
                continue;
            }

            let live = self.live.as_mut()?;
            match live.recv().await {
                Ok(line) => {
                    if self.is_new(&line) {
                        self.last_seq = Some(line.seq);
                        return Some(line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "console subscriber lagged, replaying");
                    self.backlog = self
                        .broadcaster
                        .history_after(self.job_id, self.last_seq)
                        .into();
                }
                Err(RecvError::Closed) => {
                    self.live = None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ConsoleLine> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|line| (line, sub))
        })
    }

    fn is_new(&self, line: &ConsoleLine) -> bool {
        self.last_seq.map_or(true, |seq| line.seq > seq)
    }
}
