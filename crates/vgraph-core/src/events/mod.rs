//! Typed event bus: one channel per event kind.
//!
//! - [`event`]: `EventKind`, `EventPayload`, `Event`
//! - [`channel`]: `EventChannel`, `Retention`, `Subscription`
//! - [`dispatcher`]: `EventDispatcher` (kind → channel routing)

pub mod channel;
pub mod dispatcher;
pub mod event;

pub use channel::{EventChannel, Retention, Subscription};
pub use dispatcher::{standard_retention, DispatchError, EventDispatcher};
pub use event::{Event, EventKind, EventPayload, OutputStream};
