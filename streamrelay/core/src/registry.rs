//! Handler Registry - Per-Stream Callback Bookkeeping
//!
//! Each stream owns one `HandlerRegistry`. It maps an [`EventType`] to the
//! handlers registered for it, keyed by [`HandlerId`].
//!
//! # Architecture
//!
//! ```text
//!                     HandlerRegistry
//!          ┌──────────────────────────────────────────┐
//!          │ HashMap<EventType, Vec<(HandlerId, Fn)>> │
//!          └──────────────────┬───────────────────────┘
//!                             │ snapshot(event)
//!                             ▼
//!                     DispatchSnapshot ──run()──▶ handler, handler, ...
//! ```
//!
//! # Dispatch Discipline
//!
//! Dispatch works on a snapshot taken when dispatch starts. Handlers that
//! register or deregister (themselves or others) while running only affect
//! later dispatches. Handlers run in registration order. A panicking handler
//! is logged and skipped; the rest of the snapshot still runs.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventFlags, EventType};

/// A registered callback. Takes nothing, returns nothing.
pub type Handler = Rc<dyn Fn()>;

/// Unique identifier for a registered handler
///
/// Random 128-bit value. Callers may supply their own to replace a handler
/// in place or to deregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(Uuid);

impl HandlerId {
    /// Create a new random handler ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for HandlerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked (including those that panicked)
    pub invoked: usize,
    /// Handlers that panicked
    pub faulted: usize,
}

impl DispatchReport {
    /// Check if every invoked handler returned normally
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.faulted == 0
    }
}

/// Handlers captured for one event at the moment dispatch began
pub struct DispatchSnapshot {
    event: EventType,
    entries: Vec<(HandlerId, Handler)>,
}

impl DispatchSnapshot {
    /// Number of handlers captured
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every captured handler in order
    pub fn run(self) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (id, handler) in self.entries {
            report.invoked += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler())) {
                report.faulted += 1;
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "non-string panic payload".to_string()
                };
                tracing::error!(
                    handler_id = %id,
                    event = %self.event,
                    panic = %message,
                    "Handler panicked during dispatch"
                );
            }
        }

        report
    }
}

/// Registry of handlers for one stream
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<(HandlerId, Handler)>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in EventType::ALL {
            if let Some(entries) = self.handlers.get(&event) {
                let ids: Vec<_> = entries.iter().map(|(id, _)| id.to_string()).collect();
                map.entry(&event, &ids);
            }
        }
        map.finish()
    }
}

impl HandlerRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event
    ///
    /// Uses `id` when given, otherwise a fresh one. An existing entry with
    /// the same id for the same event is replaced in place, keeping its
    /// position in the dispatch order. Returns the id used.
    pub fn register(
        &mut self,
        event: EventType,
        id: Option<HandlerId>,
        handler: Handler,
    ) -> HandlerId {
        let id = id.unwrap_or_default();
        self.insert(event, id, handler);
        id
    }

    /// Remove a handler
    ///
    /// Removing an unknown id is a no-op. Returns true when no handler is
    /// left for `event` afterwards.
    pub fn deregister(&mut self, event: EventType, id: &HandlerId) -> bool {
        self.remove(event, id).1
    }

    /// Insert or replace, handing back the replaced handler
    pub(crate) fn insert(
        &mut self,
        event: EventType,
        id: HandlerId,
        handler: Handler,
    ) -> Option<Handler> {
        let entries = self.handlers.entry(event).or_default();

        if let Some(slot) = entries.iter_mut().find(|(existing, _)| *existing == id) {
            tracing::trace!(handler_id = %id, event = %event, "Handler replaced");
            Some(std::mem::replace(&mut slot.1, handler))
        } else {
            tracing::trace!(handler_id = %id, event = %event, "Handler registered");
            entries.push((id, handler));
            None
        }
    }

    /// Remove, handing back the removed handler and whether `event` is now empty
    pub(crate) fn remove(&mut self, event: EventType, id: &HandlerId) -> (Option<Handler>, bool) {
        let Some(entries) = self.handlers.get_mut(&event) else {
            return (None, true);
        };

        let removed = entries
            .iter()
            .position(|(existing, _)| existing == id)
            .map(|index| entries.remove(index).1);
        if removed.is_some() {
            tracing::trace!(handler_id = %id, event = %event, "Handler deregistered");
        }

        if entries.is_empty() {
            self.handlers.remove(&event);
            (removed, true)
        } else {
            (removed, false)
        }
    }

    /// Remove every handler for every event
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Check if a handler is registered under `id` for `event`
    #[must_use]
    pub fn contains(&self, event: EventType, id: &HandlerId) -> bool {
        self.handlers
            .get(&event)
            .is_some_and(|entries| entries.iter().any(|(existing, _)| existing == id))
    }

    /// Number of handlers registered for `event`
    #[must_use]
    pub fn handler_count(&self, event: EventType) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }

    /// Check if no handler is registered at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Union of the flags of every event with at least one handler
    #[must_use]
    pub fn active_flags(&self) -> EventFlags {
        self.handlers
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .fold(EventFlags::empty(), |flags, (event, _)| flags | event.flag())
    }

    /// Capture the handlers currently registered for `event`
    #[must_use]
    pub fn snapshot(&self, event: EventType) -> DispatchSnapshot {
        let entries = self
            .handlers
            .get(&event)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, handler)| (*id, Rc::clone(handler)))
                    .collect()
            })
            .unwrap_or_default();

        DispatchSnapshot { event, entries }
    }

    /// Invoke every handler currently registered for `event`
    ///
    /// Handlers cannot reach this registry while it is borrowed here; a
    /// registry shared with its own handlers should be dispatched through
    /// [`snapshot`](Self::snapshot) with the borrow released before running.
    pub fn dispatch(&self, event: EventType) -> DispatchReport {
        self.snapshot(event).run()
    }
}
