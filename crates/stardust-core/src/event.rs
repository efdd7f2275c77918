//! CoEvent: the signal primitive tasks synchronize on.
//!
//! An [`Event`] is a one-shot-or-repeatable signal with a list of subscriber
//! tasks and a generation counter. Tasks subscribe by waiting on it
//! ([`crate::task::wait_event`]); gameplay code fires it with [`Event::signal`]
//! or tears it down with [`Event::cancel`], which wakes every pending waiter
//! with a `Cancelled` status.
//!
//! ## Snapshots
//!
//! A waiting task never trusts the event it subscribed to. It captures an
//! [`EventSnapshot`] at subscription time and compares against it later:
//! a changed or zeroed generation means the event was cancelled (possibly
//! cancelled *and re-armed*) while the task slept. This matters because wake
//! cascades routinely cancel sibling events and re-arm shared ones before a
//! woken task gets to look at anything.
//!
//! ## Reentrancy
//!
//! `signal` and `cancel` move the subscriber list into a local before waking
//! anyone. Woken tasks run to their next suspension immediately and may
//! signal or cancel this very event again; they operate on an already-empty
//! list, so fresh subscriptions made during the cascade only see future
//! signals.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::sched::SchedShared;
use crate::task::{self, TaskId};

// ---------------------------------------------------------------------------
// Status & snapshot
// ---------------------------------------------------------------------------

/// Result of polling an event against a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    /// Nothing happened since the snapshot.
    Pending,
    /// The event was signalled since the snapshot.
    Signaled,
    /// The event was cancelled (or re-armed) since the snapshot.
    Cancelled,
}

/// Value-typed capture of an event's state at subscription time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventSnapshot {
    unique_id: u32,
    num_signaled: u32,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A weak reference to a subscribed task: generational id plus the scheduler
/// that can resolve it. The event never keeps tasks alive.
pub(crate) struct Subscriber {
    pub(crate) task: TaskId,
    pub(crate) sched: Weak<SchedShared>,
}

struct EventInner {
    /// Zero means cancelled; otherwise a process-unique nonzero generation.
    unique_id: Cell<u32>,
    /// Monotonic signal counter.
    num_signaled: Cell<u32>,
    subscribers: RefCell<Vec<Subscriber>>,
}

/// Multi-subscriber signal with cancellation. Cheap to clone; clones refer
/// to the same underlying event.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

fn next_event_id() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    loop {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

impl Event {
    /// Create a fresh, armed event.
    pub fn new() -> Self {
        Event {
            inner: Rc::new(EventInner {
                unique_id: Cell::new(next_event_id()),
                num_signaled: Cell::new(0),
                subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Re-arm this event in place with a fresh generation.
    ///
    /// Outstanding snapshots observe the old generation and poll as
    /// `Cancelled`; the signal counter restarts from zero. Stale
    /// subscriptions are discarded without being woken, so only use this on
    /// events whose waiters were already dealt with (cancel first if not).
    pub fn reinit(&self) {
        self.inner.unique_id.set(next_event_id());
        self.inner.num_signaled.set(0);
        self.inner.subscribers.borrow_mut().clear();
    }

    /// Whether the event has been cancelled and not re-armed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.unique_id.get() == 0
    }

    /// How many times the event has been signalled since it was armed.
    pub fn num_signaled(&self) -> u32 {
        self.inner.num_signaled.get()
    }

    /// Capture the event's current state for later polling.
    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            unique_id: self.inner.unique_id.get(),
            num_signaled: self.inner.num_signaled.get(),
        }
    }

    /// Compare the event against a snapshot taken earlier.
    pub fn poll(&self, snap: &EventSnapshot) -> EventStatus {
        let unique_id = self.inner.unique_id.get();
        let num_signaled = self.inner.num_signaled.get();

        // A changed generation means cancelled (and possibly re-armed); a
        // signal counter that went backwards means re-armed too.
        if unique_id != snap.unique_id || num_signaled < snap.num_signaled || unique_id == 0 {
            return EventStatus::Cancelled;
        }

        if num_signaled > snap.num_signaled {
            return EventStatus::Signaled;
        }

        EventStatus::Pending
    }

    /// Whether the snapshot was taken from the event's current generation.
    pub(crate) fn id_matches(&self, snap: &EventSnapshot) -> bool {
        self.inner.unique_id.get() == snap.unique_id
    }

    pub(crate) fn unique_id(&self) -> u32 {
        self.inner.unique_id.get()
    }

    /// Identity key for deduplicating shared events.
    pub(crate) fn key(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn add_subscriber(&self, sub: Subscriber) {
        let mut subs = self.inner.subscribers.borrow_mut();
        if subs.capacity() == 0 {
            subs.reserve(4);
        }
        subs.push(sub);
    }

    /// Signal the event, waking every current subscriber.
    ///
    /// No-op on a cancelled event. Subscribers are woken in subscription
    /// order, each running to its next suspension point before the next one
    /// is resumed.
    pub fn signal(&self) {
        if self.inner.unique_id.get() == 0 {
            return;
        }

        let count = self.inner.num_signaled.get().wrapping_add(1);
        debug_assert!(count != 0, "event signal counter wrapped");
        self.inner.num_signaled.set(count);

        let subs = self.inner.subscribers.take();
        wake_subscribers(subs);
    }

    /// Signal the event only if it has never been signalled.
    pub fn signal_once(&self) {
        if self.inner.num_signaled.get() == 0 {
            self.signal();
        }
    }

    /// Cancel the event: zero its generation, detach the subscriber list and
    /// wake every subscriber once (they observe `Cancelled` through their
    /// snapshots). Cancelling an already-cancelled event is a no-op.
    pub fn cancel(&self) {
        if self.inner.unique_id.get() == 0 {
            return;
        }

        self.inner.unique_id.set(0);

        let subs = self.inner.subscribers.take();
        wake_subscribers(subs);
        // Woken tasks may have dropped the last external handle; do not
        // touch self past this point.
    }

    /// Drop subscriber entries whose task died somewhere else without ever
    /// being woken by this event.
    pub(crate) fn cleanup_subscribers(&self) {
        self.inner
            .subscribers
            .borrow_mut()
            .retain(|sub| match sub.sched.upgrade() {
                Some(shared) => task::task_exists(&shared, sub.task),
                None => false,
            });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("unique_id", &self.inner.unique_id.get())
            .field("num_signaled", &self.inner.num_signaled.get())
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .finish()
    }
}

fn wake_subscribers(subs: Vec<Subscriber>) {
    for sub in &subs {
        task::wake_subscriber(sub);
    }
}

// ---------------------------------------------------------------------------
// Event groups
// ---------------------------------------------------------------------------

/// A struct of events that are armed and torn down together, e.g. the
/// event set a boss attack publishes. Tasks can host a group so it is
/// cancelled when they die ([`crate::task::host_events`]).
pub trait EventGroup {
    /// Visit every event in the group.
    fn for_each_event(&self, f: &mut dyn FnMut(&Event));

    /// Cancel every event in the group.
    fn cancel_all(&self) {
        self.for_each_event(&mut |event| event.cancel());
    }

    /// Re-arm every event in the group.
    fn reinit_all(&self) {
        self.for_each_event(&mut |event| event.reinit());
    }
}

/// Define a named struct of [`Event`]s implementing [`EventGroup`].
///
/// ```
/// stardust_core::event_group! {
///     pub struct BossEvents {
///         pub phase_started,
///         pub phase_cleared,
///     }
/// }
/// let events = BossEvents::new();
/// events.phase_started.signal();
/// ```
#[macro_export]
macro_rules! event_group {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            $( $(#[$field_meta])* $field_vis $field: $crate::event::Event ),+
        }

        impl $name {
            /// Create the group with every event freshly armed.
            $vis fn new() -> Self {
                Self {
                    $( $field: $crate::event::Event::new() ),+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $crate::event::EventGroup for $name {
            fn for_each_event(&self, f: &mut dyn FnMut(&$crate::event::Event)) {
                $( f(&self.$field); )+
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_poll_lifecycle() {
        let event = Event::new();
        let snap = event.snapshot();

        assert_eq!(event.poll(&snap), EventStatus::Pending);

        event.signal();
        assert_eq!(event.poll(&snap), EventStatus::Signaled);

        // Once signalled relative to a snapshot, never pending again.
        event.signal();
        assert_eq!(event.poll(&snap), EventStatus::Signaled);

        event.cancel();
        assert_eq!(event.poll(&snap), EventStatus::Cancelled);
    }

    #[test]
    fn test_signal_with_no_subscribers_still_counts() {
        let event = Event::new();
        event.signal();
        event.signal();
        assert_eq!(event.num_signaled(), 2);
    }

    #[test]
    fn test_signal_once_is_a_no_op_after_signal() {
        let event = Event::new();
        event.signal();
        event.signal_once();
        assert_eq!(event.num_signaled(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let event = Event::new();
        event.cancel();
        assert!(event.is_cancelled());
        event.cancel();
        assert!(event.is_cancelled());
    }

    #[test]
    fn test_signal_after_cancel_is_a_no_op() {
        let event = Event::new();
        event.cancel();
        event.signal();
        assert_eq!(event.num_signaled(), 0);
    }

    #[test]
    fn test_reinit_invalidates_old_snapshots() {
        let event = Event::new();
        event.signal();
        let snap = event.snapshot();

        event.reinit();
        // New generation, fresh counter: old snapshot reads as cancelled
        // even though num_signaled went backwards rather than forwards.
        assert_eq!(event.poll(&snap), EventStatus::Cancelled);
        assert_eq!(event.num_signaled(), 0);
        assert!(!event.is_cancelled());
    }

    #[test]
    fn test_signal_detaches_the_subscriber_list() {
        use crate::task::TaskId;
        use std::num::NonZeroU32;

        let event = Event::new();
        // Dangling-scheduler subscribers: the wake resolves nothing and is
        // skipped, which is exactly what happens to stale entries.
        for index in 0..2 {
            event.add_subscriber(Subscriber {
                task: TaskId::new(index, NonZeroU32::new(index + 1).unwrap()),
                sched: Weak::new(),
            });
        }
        assert_eq!(event.subscriber_count(), 2);

        event.signal();
        assert_eq!(
            event.subscriber_count(),
            0,
            "signal must detach the list before waking"
        );
        assert_eq!(event.num_signaled(), 1);
    }

    #[test]
    fn test_event_group_cancel_all() {
        event_group! {
            struct PhaseEvents {
                started,
                cleared,
            }
        }

        let events = PhaseEvents::new();
        assert!(!events.started.is_cancelled());
        events.cancel_all();
        assert!(events.started.is_cancelled());
        assert!(events.cleared.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let event = Event::new();
        let alias = event.clone();
        alias.signal();
        assert_eq!(event.num_signaled(), 1);
        event.cancel();
        assert!(alias.is_cancelled());
    }
}
