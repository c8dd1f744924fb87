//! Per-kind notification channels with explicit replay policy.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use super::event::{Event, EventKind};

/// What a late subscriber receives before live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "capacity", rename_all = "snake_case")]
pub enum Retention {
    /// Replay the most recent event (state-like signals).
    Latest,
    /// Replay up to N most recent events (output streams).
    History(usize),
    /// Fire-only.
    None,
}

impl Retention {
    fn capacity(&self) -> usize {
        match self {
            Retention::Latest => 1,
            Retention::History(n) => *n,
            Retention::None => 0,
        }
    }
}

/// One channel: a broadcast sender plus the retained replay buffer.
///
/// Publishing and subscribing both hold the replay lock, so a subscriber
/// sees every event exactly once: either in its replay or live.
#[derive(Debug)]
pub struct EventChannel {
    kind: EventKind,
    retention: Retention,
    sender: broadcast::Sender<Event>,
    replay: Mutex<VecDeque<Event>>,
}

impl EventChannel {
    pub fn new(kind: EventKind, retention: Retention, broadcast_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            kind,
            retention,
            sender,
            replay: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    fn replay(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // The buffer holds plain values; a poisoned guard is still consistent.
        self.replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish to live subscribers and retain per policy. Returns the number
    /// of live subscribers reached.
    pub fn publish(&self, event: Event) -> usize {
        let mut replay = self.replay();
        let capacity = self.retention.capacity();
        if capacity > 0 {
            replay.push_back(event.clone());
            while replay.len() > capacity {
                replay.pop_front();
            }
        }
        // No receivers is not an error for a notification bus.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        let replay = self.replay();
        Subscription {
            replay: replay.clone(),
            live: self.sender.subscribe(),
        }
    }

    /// Currently retained events, oldest first.
    pub fn retained(&self) -> Vec<Event> {
        self.replay().iter().cloned().collect()
    }
}

/// Receives a channel's replay, then its live events.
#[derive(Debug)]
pub struct Subscription {
    replay: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "subscriber lagged; events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Every event ready right now.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
