//! Topology Monitoring
//!
//! The APM module lets an embedder observe what the topology layer is doing.
//! Instance and proxy state transitions, ping time changes and pool clears
//! are reported as `ServerEvent`s to every hook registered on the `Listener`
//! held by the server context. Hooks run on whichever thread caused the event
//! and never while an internal lock is held.
mod event;
mod listener;

pub use self::event::ServerEvent;
pub use self::listener::{EventHook, Listener};
