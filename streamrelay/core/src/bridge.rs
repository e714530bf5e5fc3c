//! Notification Bridge
//!
//! Binds one stream's [`HandlerRegistry`] to the native notification
//! mechanism. The bridge keeps exactly one native subscription per stream and
//! keeps its flag set equal to the union of events that currently have a
//! handler.
//!
//! # Native Callback
//!
//! The callback handed to the [`Notifier`] is built once per bridge and holds a
//! `Weak` reference to the registry. Reinstalling with a different flag set
//! passes the same callback again. When the bridge is dropped the subscription
//! is uninstalled before the registry goes away.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::event::{EventFlags, EventType, NativeEvent};
use crate::registry::{DispatchReport, Handler, HandlerId, HandlerRegistry};
use crate::stream::StreamId;

/// Callback the native mechanism invokes with one event code
pub type NativeCallback = Rc<dyn Fn(NativeEvent)>;

/// The native notification mechanism
///
/// Implementations hold at most one client per stream. Installing again
/// replaces the previous client and flag set; it never adds to it.
pub trait Notifier {
    /// Subscribe `callback` to `flags` for `stream`, replacing any previous client
    fn install_client(&self, stream: StreamId, flags: EventFlags, callback: NativeCallback);

    /// Remove the client for `stream`, if any
    fn uninstall_client(&self, stream: StreamId);
}

/// Binding between one stream's registry and the native mechanism
pub struct NotificationBridge {
    stream: StreamId,
    notifier: Rc<dyn Notifier>,
    registry: Rc<RefCell<HandlerRegistry>>,
    callback: NativeCallback,
    installed: Cell<EventFlags>,
}

impl NotificationBridge {
    /// Create a bridge for `stream` with an empty registry
    ///
    /// Nothing is installed until the first handler is registered.
    #[must_use]
    pub fn new(stream: StreamId, notifier: Rc<dyn Notifier>) -> Self {
        let registry = Rc::new(RefCell::new(HandlerRegistry::new()));
        let weak = Rc::downgrade(&registry);
        let callback: NativeCallback = Rc::new(move |event| deliver(stream, &weak, event));

        Self {
            stream,
            notifier,
            registry,
            callback,
            installed: Cell::new(EventFlags::empty()),
        }
    }

    /// Register a handler and resubscribe if the flag set changed
    pub fn register(&self, event: EventType, id: Option<HandlerId>, handler: Handler) -> HandlerId {
        let id = id.unwrap_or_default();
        let replaced = self.registry.borrow_mut().insert(event, id, handler);
        self.sync();
        // Dropped outside the borrow: a handler's captures may call back in.
        drop(replaced);
        id
    }

    /// Deregister a handler and resubscribe if the flag set changed
    ///
    /// Returns true when no handler is left for `event`.
    pub fn deregister(&self, event: EventType, id: &HandlerId) -> bool {
        let (removed, now_empty) = self.registry.borrow_mut().remove(event, id);
        self.sync();
        drop(removed);
        now_empty
    }

    /// Drop every handler and uninstall the native client
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.registry.borrow_mut());
        self.sync();
        drop(dropped);
    }

    /// Dispatch `event` to the current handlers as if the native side fired it
    pub fn dispatch(&self, event: EventType) -> DispatchReport {
        let snapshot = self.registry.borrow().snapshot(event);
        snapshot.run()
    }

    /// Flags currently installed with the native mechanism
    #[must_use]
    pub fn installed_flags(&self) -> EventFlags {
        self.installed.get()
    }

    /// Number of handlers registered for `event`
    #[must_use]
    pub fn handler_count(&self, event: EventType) -> usize {
        self.registry.borrow().handler_count(event)
    }

    /// Check if a handler is registered under `id` for `event`
    #[must_use]
    pub fn contains(&self, event: EventType, id: &HandlerId) -> bool {
        self.registry.borrow().contains(event, id)
    }

    fn sync(&self) {
        let wanted = self.registry.borrow().active_flags();
        if wanted == self.installed.get() {
            return;
        }

        if wanted.is_empty() {
            self.notifier.uninstall_client(self.stream);
            tracing::debug!(stream = %self.stream, "Native client uninstalled");
        } else {
            self.notifier
                .install_client(self.stream, wanted, Rc::clone(&self.callback));
            tracing::debug!(stream = %self.stream, flags = ?wanted, "Native client installed");
        }
        self.installed.set(wanted);
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        if !self.installed.get().is_empty() {
            self.notifier.uninstall_client(self.stream);
            tracing::debug!(stream = %self.stream, "Native client uninstalled on drop");
        }
    }
}

fn deliver(stream: StreamId, registry: &Weak<RefCell<HandlerRegistry>>, native: NativeEvent) {
    let Some(event) = EventType::from_native(native) else {
        tracing::debug!(stream = %stream, native = %native, "Dropping unrecognized native event");
        return;
    };
    let Some(registry) = registry.upgrade() else {
        return;
    };

    // Borrow only long enough to snapshot; handlers mutate the registry freely.
    let snapshot = registry.borrow().snapshot(event);
    if snapshot.is_empty() {
        return;
    }

    tracing::trace!(stream = %stream, event = %event, handlers = snapshot.len(), "Dispatching");
    let report = snapshot.run();
    if !report.all_succeeded() {
        tracing::warn!(
            stream = %stream,
            event = %event,
            faulted = report.faulted,
            "Dispatch completed with faulted handlers"
        );
    }
}
