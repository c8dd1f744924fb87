//! Kind-to-channel routing.

use std::collections::HashMap;

use tracing::trace;

use super::channel::{EventChannel, Retention, Subscription};
use super::event::{Event, EventKind};
use crate::config::EventsConfig;
use crate::metrics::METRICS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no channel registered for event kind {kind}")]
    UnregisteredKind { kind: EventKind },

    #[error("a channel is already registered for event kind {kind}")]
    DuplicateChannel { kind: EventKind },
}

/// Routes each event to the one channel registered for its kind.
///
/// The mapping is fixed once built. Retention lives in the channels.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    channels: HashMap<EventKind, EventChannel>,
    broadcast_capacity: usize,
}

impl EventDispatcher {
    /// A dispatcher with no channels; every dispatch is rejected until kinds
    /// are registered.
    pub fn empty(broadcast_capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            broadcast_capacity,
        }
    }

    /// Every event kind, with its standard retention.
    pub fn standard(config: &EventsConfig) -> Self {
        let mut dispatcher = Self::empty(config.broadcast_capacity);
        for kind in EventKind::ALL {
            let retention = standard_retention(kind, config.history_capacity);
            dispatcher.channels.insert(
                kind,
                EventChannel::new(kind, retention, config.broadcast_capacity),
            );
        }
        dispatcher
    }

    pub fn register(&mut self, kind: EventKind, retention: Retention) -> Result<(), DispatchError> {
        if self.channels.contains_key(&kind) {
            return Err(DispatchError::DuplicateChannel { kind });
        }
        self.channels.insert(
            kind,
            EventChannel::new(kind, retention, self.broadcast_capacity),
        );
        Ok(())
    }

    /// Fail unless `kind` has a channel. Lets callers check before doing
    /// work whose outcome they must announce.
    pub fn ensure_registered(&self, kind: EventKind) -> Result<(), DispatchError> {
        if self.channels.contains_key(&kind) {
            Ok(())
        } else {
            Err(DispatchError::UnregisteredKind { kind })
        }
    }

    /// Publish `event` on its kind's channel. Returns the number of live
    /// subscribers reached.
    pub fn dispatch(&self, event: Event) -> Result<usize, DispatchError> {
        let kind = event.kind();
        let channel = self
            .channels
            .get(&kind)
            .ok_or(DispatchError::UnregisteredKind { kind })?;
        METRICS.inc_events_dispatched();
        let reached = channel.publish(event);
        trace!(kind = %kind, reached = reached, "event dispatched");
        Ok(reached)
    }

    pub fn subscribe(&self, kind: EventKind) -> Result<Subscription, DispatchError> {
        self.channels
            .get(&kind)
            .map(EventChannel::subscribe)
            .ok_or(DispatchError::UnregisteredKind { kind })
    }

    pub fn channel(&self, kind: EventKind) -> Option<&EventChannel> {
        self.channels.get(&kind)
    }
}

/// Replay policy per kind: state-like signals replay the latest value,
/// command output replays a bounded history, outcomes are fire-only.
pub fn standard_retention(kind: EventKind, history_capacity: usize) -> Retention {
    match kind {
        EventKind::ChangeSetWritten | EventKind::ResourceRefreshed => Retention::Latest,
        EventKind::CommandOutput => Retention::History(history_capacity),
        EventKind::ChangeSetCreated
        | EventKind::ChangeSetApplied
        | EventKind::ChangeSetCanceled
        | EventKind::QualificationChecked
        | EventKind::CodeGenerated
        | EventKind::DependentValuesUpdated
        | EventKind::SecretCreated
        | EventKind::CommandReturn
        | EventKind::FixReturn
        | EventKind::FixBatchReturn => Retention::None,
    }
}
