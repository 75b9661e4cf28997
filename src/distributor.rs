//! Output fan-out for the live session.
//!
//! The PTY reader thread calls [`OutputDistributor::publish`] for every chunk.
//! Each subscriber owns a bounded queue that drains independently; when a
//! queue is full the chunk is dropped for that subscriber only, so a slow
//! consumer never stalls the reader. A single rolling tail buffer backs
//! [`OutputDistributor::read_tail`].

use crate::redact::Redact;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// One read from the session output. Never mutated after publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub session_id: String,
    pub seq: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// Incremental UTF-8 decoding across chunk boundaries.
///
/// A character split between two reads is held back until the rest of it
/// arrives. Bytes that can never form a character decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let complete = self.pending.len() - incomplete_suffix(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Length of a trailing multibyte sequence still waiting for continuation bytes
fn incomplete_suffix(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(4) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

struct Subscriber {
    tx: mpsc::Sender<OutputChunk>,
    dropped: u64,
}

#[derive(Default)]
struct Tail {
    session_id: Option<String>,
    text: String,
    last_seq: u64,
    decoder: Utf8Stream,
}

pub struct OutputDistributor {
    subscribers: Mutex<HashMap<ChannelId, Subscriber>>,
    next_id: AtomicU64,
    queue_depth: usize,
    tail: Mutex<Tail>,
    tail_chars: usize,
    redactor: Arc<dyn Redact>,
}

impl OutputDistributor {
    pub fn new(tail_chars: usize, queue_depth: usize, redactor: Arc<dyn Redact>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            tail: Mutex::new(Tail::default()),
            tail_chars: tail_chars.max(1),
            redactor,
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<ChannelId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a consumer. Chunks arrive in publish order.
    pub fn subscribe(&self) -> (ChannelId, mpsc::Receiver<OutputChunk>) {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers().insert(id, Subscriber { tx, dropped: 0 });
        debug!("Output subscriber {:?} registered", id);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ChannelId) {
        if let Some(sub) = self.subscribers().remove(&id) {
            debug!(
                "Output subscriber {:?} removed ({} chunks dropped)",
                id, sub.dropped
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Start a fresh tail for a new session; chunks from other sessions are ignored
    pub fn reset(&self, session_id: &str) {
        let mut tail = self.tail();
        tail.session_id = Some(session_id.to_string());
        tail.text.clear();
        tail.last_seq = 0;
        tail.decoder.reset();
    }

    /// Append to the tail and hand the chunk to every subscriber without waiting
    pub fn publish(&self, chunk: OutputChunk) {
        {
            let mut tail = self.tail();
            if tail.session_id.as_deref() != Some(chunk.session_id.as_str()) {
                debug!("Ignoring chunk from stale session {}", chunk.session_id);
                return;
            }
            if chunk.seq <= tail.last_seq {
                warn!(
                    "Out-of-order chunk {} after {}, ignoring",
                    chunk.seq, tail.last_seq
                );
                return;
            }
            tail.last_seq = chunk.seq;
            let text = tail.decoder.decode(&chunk.data);
            tail.text.push_str(&text);
            truncate_to_chars(&mut tail.text, self.tail_chars);
        }

        let mut subscribers = self.subscribers();
        subscribers.retain(|id, sub| match sub.tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.dropped += 1;
                if sub.dropped == 1 || sub.dropped % 100 == 0 {
                    warn!(
                        "Subscriber {:?} is lagging, {} chunks dropped",
                        id, sub.dropped
                    );
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {:?} closed", id);
                false
            }
        });
    }

    /// Most recent `max_chars` of output, redacted unless `redact` is false.
    ///
    /// Redaction sees the whole buffer before the cut, so a secret straddling
    /// the `max_chars` boundary is never returned half-masked.
    pub fn read_tail(&self, max_chars: usize, redact: bool) -> String {
        let text = self.tail().text.clone();
        let text = if redact {
            self.redactor.redact(&text)
        } else {
            text
        };
        last_chars(&text, max_chars).to_string()
    }
}

/// Suffix of `text` holding at most `max_chars` characters
fn last_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) if max_chars > 0 => &text[idx..],
        _ if max_chars == 0 => "",
        _ => text,
    }
}

/// Evict the oldest characters until `text` holds at most `max_chars`.
///
/// When the cut lands inside a line and a later line exists, the partial
/// line goes too: a fragment like `_KEY=value` no longer looks like a secret.
fn truncate_to_chars(text: &mut String, max_chars: usize) {
    if text.len() <= max_chars {
        return;
    }
    let keep = last_chars(text, max_chars).len();
    let mut start = text.len() - keep;
    if start > 0 && !text[..start].ends_with('\n') {
        if let Some(newline) = text[start..].find('\n') {
            start += newline + 1;
        }
    }
    text.drain(..start);
}
