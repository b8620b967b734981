//! Event-group and background-completion bookkeeping for sessions.
//!
//! Both types are plain state machines owned by the coordinator actor. They
//! never run callbacks themselves; they hand back whatever became ready so the
//! actor decides how to run it.

use std::fmt;

/// Counts in-flight completion dispatches for one session.
///
/// Waiters registered with [`EventGroup::notify`] are released once the count
/// drops to zero.
pub struct EventGroup<W> {
    outstanding: usize,
    waiters: Vec<W>,
}

impl<W> EventGroup<W> {
    /// Creates a drained group.
    pub fn new() -> Self {
        Self { outstanding: 0, waiters: Vec::new() }
    }

    /// Marks the start of an event.
    pub fn enter(&mut self) {
        self.outstanding += 1;
    }

    /// Marks the end of an event. Returns the waiters released by draining.
    pub fn leave(&mut self) -> Vec<W> {
        if self.outstanding == 0 {
            tracing::warn!("event group left more often than entered");
            return Vec::new();
        }

        self.outstanding -= 1;
        if self.outstanding == 0 {
            std::mem::take(&mut self.waiters)
        } else {
            Vec::new()
        }
    }

    /// Registers a waiter. Returns it back if the group is already drained.
    pub fn notify(&mut self, waiter: W) -> Option<W> {
        if self.outstanding == 0 {
            return Some(waiter);
        }
        self.waiters.push(waiter);
        None
    }

    /// Number of events still in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether no events are in flight.
    pub fn is_drained(&self) -> bool {
        self.outstanding == 0
    }
}

impl<W> Default for EventGroup<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> fmt::Debug for EventGroup<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGroup")
            .field("outstanding", &self.outstanding)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Pairs a background completion handler with the session's "all events
/// delivered" signal, whichever arrives first.
///
/// If the signal arrives with no handler attached, the latch remembers it and
/// the next handler fires as soon as it is set.
pub struct FinishLatch<T> {
    pending: Option<T>,
    finished_without_handler: bool,
}

impl<T> FinishLatch<T> {
    /// Creates an empty latch.
    pub fn new() -> Self {
        Self { pending: None, finished_without_handler: false }
    }

    /// Attaches a handler. Returns the handlers that must fire now.
    ///
    /// A handler that was already pending is superseded and fires
    /// immediately. The new handler fires immediately if the signal was
    /// latched.
    pub fn set(&mut self, handler: T) -> Vec<T> {
        let mut ready = Vec::new();
        if let Some(previous) = self.pending.take() {
            ready.push(previous);
        }

        if self.finished_without_handler {
            self.finished_without_handler = false;
            ready.push(handler);
        } else {
            self.pending = Some(handler);
        }
        ready
    }

    /// Delivers the signal. Returns the pending handler, or latches the flag.
    pub fn fire(&mut self) -> Option<T> {
        match self.pending.take() {
            Some(handler) => Some(handler),
            None => {
                self.finished_without_handler = true;
                None
            },
        }
    }

    /// Forgets a latched signal. Called when new work starts, since the
    /// session is no longer idle.
    pub fn reset(&mut self) {
        self.finished_without_handler = false;
    }

    /// Whether a handler is attached.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl<T> Default for FinishLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FinishLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishLatch")
            .field("pending", &self.pending.is_some())
            .field("finished_without_handler", &self.finished_without_handler)
            .finish()
    }
}

/// Work released when a session's event group drains.
pub enum GroupWaiter {
    /// Host completion for a background wake.
    Completion(Box<dyn FnOnce() + Send>),
    /// Drop the session from the registry.
    RemoveSession,
}

impl fmt::Debug for GroupWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completion(_) => f.write_str("Completion"),
            Self::RemoveSession => f.write_str("RemoveSession"),
        }
    }
}
