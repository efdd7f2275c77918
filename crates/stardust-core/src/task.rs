//! CoTask: a single cooperative task.
//!
//! A task is a body of gameplay code running on its own pooled stack. It
//! yields to the scheduler frame by frame, waits on [`Event`]s, spawns
//! subtasks whose lifetimes it bounds, optionally binds itself to a game
//! entity, and carries a scratch arena for allocations that die with it.
//!
//! ## Handles
//!
//! Tasks are referenced by [`TaskId`], a generational handle. A `TaskId`
//! held after the task dies resolves to nothing; it never dangles. Parent
//! links, child lists and event subscriptions all hold `TaskId`s, so a
//! cancellation cascade can tear through a web of tasks without any of the
//! survivors holding a bad reference.
//!
//! ## Current-task context
//!
//! The suspension primitives (`yield_now`, `wait`, `wait_event`, ...) are
//! free functions that resolve the running task through a thread-local
//! stack of context frames. A frame is pushed around every coroutine
//! resume, and the coroutine installs its yielder pointer into the top
//! frame after every switch; this nests correctly across wake cascades,
//! where resuming one task resumes another before the first suspends
//! again. Calling a primitive outside of task context is a programmer
//! error and panics.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroU32;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use corosensei::{Coroutine, CoroutineResult, Yielder};

use stardust_entity::{EntityId, EntityKind};

use crate::event::{Event, EventGroup, EventSnapshot, EventStatus, Subscriber};
use crate::sched::SchedShared;
use crate::scratch::ScratchArena;
use crate::stats;

pub(crate) type TaskCoroutine = Coroutine<(), (), ()>;

// ---------------------------------------------------------------------------
// TaskId & status
// ---------------------------------------------------------------------------

/// Generational handle to a task. Stays safe to hold after the task dies.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    unique_id: NonZeroU32,
}

impl TaskId {
    pub(crate) fn new(index: u32, unique_id: NonZeroU32) -> Self {
        TaskId { index, unique_id }
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn unique_id(self) -> u32 {
        self.unique_id.get()
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}#{})", self.index, self.unique_id)
    }
}

/// Execution state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Alive and waiting between resumes.
    Suspended,
    /// Somewhere on the current call chain.
    Running,
    /// Finished, cancelled, or never existed. Terminal.
    Dead,
}

fn next_unique_id() -> NonZeroU32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    loop {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if let Some(id) = NonZeroU32::new(id) {
            return id;
        }
    }
}

pub(crate) fn fresh_unique_id() -> NonZeroU32 {
    next_unique_id()
}

// ---------------------------------------------------------------------------
// Built-in events
// ---------------------------------------------------------------------------

crate::event_group! {
    /// Events every task publishes. `finished` fires just before the task's
    /// finalizer runs, so a waiter observes the dying task's last published
    /// state intact.
    pub struct TaskEvents {
        pub finished,
    }
}

// ---------------------------------------------------------------------------
// Wait state
// ---------------------------------------------------------------------------

pub(crate) enum WaitState {
    None,
    Delay {
        remaining: i32,
    },
    Event {
        event: Event,
        snapshot: EventSnapshot,
    },
    Subtasks,
}

// ---------------------------------------------------------------------------
// TaskData: the control block
// ---------------------------------------------------------------------------

pub(crate) struct TaskData {
    pub(crate) id: TaskId,
    pub(crate) sched: Weak<SchedShared>,
    name: &'static str,

    parent: Cell<Option<TaskId>>,
    children: RefCell<Vec<TaskId>>,

    bound_entity: Cell<Option<EntityId>>,
    hosted_entity: Cell<Option<EntityId>>,
    hosted_events: RefCell<Vec<Event>>,

    pub(crate) events: TaskEvents,

    /// Optional cleanup callback registered by the body, run first thing
    /// during teardown.
    finalizer: RefCell<Option<Box<dyn FnOnce()>>>,

    /// Set for the duration of teardown; blocks reentrant cancellation and
    /// further event subscriptions.
    finalizing: Cell<bool>,
    /// Set when the task is cancelled while running. The task parks at its
    /// next suspension point and is swept like any dead task.
    killed: Cell<bool>,

    wait: RefCell<WaitState>,
    wait_frames: Cell<i32>,
    wait_event_status: Cell<EventStatus>,

    scratch: ScratchArena,
}

impl TaskData {
    pub(crate) fn new(id: TaskId, sched: Weak<SchedShared>, name: &'static str) -> Self {
        TaskData {
            id,
            sched,
            name,
            parent: Cell::new(None),
            children: RefCell::new(Vec::new()),
            bound_entity: Cell::new(None),
            hosted_entity: Cell::new(None),
            hosted_events: RefCell::new(Vec::new()),
            events: TaskEvents::new(),
            finalizer: RefCell::new(None),
            finalizing: Cell::new(false),
            killed: Cell::new(false),
            wait: RefCell::new(WaitState::None),
            wait_frames: Cell::new(0),
            wait_event_status: Cell::new(EventStatus::Pending),
            scratch: ScratchArena::new(),
        }
    }

    pub(crate) fn attach_child(&self, child: TaskId) {
        self.children.borrow_mut().push(child);
    }

    pub(crate) fn set_parent(&self, parent: TaskId) {
        self.parent.set(Some(parent));
    }

    pub(crate) fn is_finalizing(&self) -> bool {
        self.finalizing.get()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.get()
    }

    /// Whether the task currently waits on the given event generation.
    pub(crate) fn blocking_event(&self) -> Option<Event> {
        match &*self.wait.borrow() {
            WaitState::Event { event, snapshot } if event.id_matches(snapshot) => {
                Some(event.clone())
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Current-task context
// ---------------------------------------------------------------------------

pub(crate) struct ContextFrame {
    task: TaskId,
    data: Rc<TaskData>,
    /// Type-erased pointer to the coroutine's `Yielder`, installed by the
    /// coroutine after every switch. Valid only while the coroutine runs.
    yielder: Cell<Option<*const ()>>,
}

thread_local! {
    static CONTEXT: RefCell<Vec<Rc<ContextFrame>>> = const { RefCell::new(Vec::new()) };
}

fn current_frame() -> Option<Rc<ContextFrame>> {
    CONTEXT.with(|ctx| ctx.borrow().last().cloned())
}

fn current_frame_or_panic() -> Rc<ContextFrame> {
    current_frame().expect("called outside of task context")
}

pub(crate) fn current_sched() -> Option<Rc<SchedShared>> {
    current_frame().and_then(|frame| frame.data.sched.upgrade())
}

fn install_yielder(ptr: *const ()) {
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let top = ctx.last().expect("task resumed without a context frame");
        top.yielder.set(Some(ptr));
    });
}

/// Pops the context frame when a resume returns, including by unwind.
struct FrameGuard;

impl Drop for FrameGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            ctx.borrow_mut().pop();
        });
    }
}

// ---------------------------------------------------------------------------
// Entry & resume machinery
// ---------------------------------------------------------------------------

/// The glue every task coroutine starts in. Runs the body, then performs
/// the natural-death sequence: signal `finished`, tear down.
pub(crate) fn entry_glue(yielder: &Yielder<(), ()>, data: Rc<TaskData>, body: Box<dyn FnOnce()>) {
    install_yielder(yielder as *const Yielder<(), ()> as *const ());

    body();

    data.events.finished.signal();
    if let Some(shared) = data.sched.upgrade() {
        finalize(&shared, data.id);
    }
}

/// Low-level resume: take the coroutine out of its slot, push a context
/// frame, switch, put everything back and record death.
pub(crate) fn resume_raw(shared: &Rc<SchedShared>, id: TaskId) {
    let taken = shared.with_slot(id, |slot| (slot.coro.take(), slot.data.clone()));
    let (mut coro, data) = match taken {
        Some((Some(coro), Some(data))) => (coro, data),
        _ => return,
    };

    stats::update(|s| s.switches_this_frame += 1);

    let finished = {
        CONTEXT.with(|ctx| {
            ctx.borrow_mut().push(Rc::new(ContextFrame {
                task: id,
                data: data.clone(),
                yielder: Cell::new(None),
            }));
        });
        let _guard = FrameGuard;
        matches!(coro.resume(()), CoroutineResult::Return(()))
    };

    shared.with_slot(id, |slot| {
        slot.coro = Some(coro);
        if finished || slot.data.is_none() || data.is_finalizing() || data.is_killed() {
            slot.dead = true;
        }
    });
}

/// Evaluate a task's wait state. Returns true if the task keeps waiting
/// (and accounts the skipped frame), false if it should be resumed.
fn do_wait(data: &TaskData) -> bool {
    let mut wait = data.wait.borrow_mut();
    let still_waiting = match &mut *wait {
        WaitState::None => false,
        WaitState::Delay { remaining } => {
            *remaining -= 1;
            *remaining >= 0
        }
        WaitState::Event { event, snapshot } => match event.poll(snapshot) {
            EventStatus::Pending => true,
            status => {
                data.wait_event_status.set(status);
                false
            }
        },
        WaitState::Subtasks => !data.children.borrow().is_empty(),
    };
    drop(wait);

    if still_waiting {
        data.wait_frames.set(data.wait_frames.get() + 1);
    }
    still_waiting
}

/// Scheduler-facing resume: gate on bound-entity liveness, evaluate the
/// wait state, and re-enter the task if it is due. Returns whether the
/// task actually ran.
pub(crate) fn resume_task(shared: &Rc<SchedShared>, id: TaskId) -> bool {
    let Some(data) = shared.data_of(id) else {
        return false;
    };

    if let Some(entity) = data.bound_entity.get() {
        if !stardust_entity::with(|reg| reg.is_live(entity)) {
            cancel_in(shared, id);
            return false;
        }
    }

    if do_wait(&data) {
        return false;
    }

    *data.wait.borrow_mut() = WaitState::None;
    resume_raw(shared, id);
    true
}

/// Wake path used by events: resolve the subscriber and resume it if it is
/// still a live, suspended task.
pub(crate) fn wake_subscriber(sub: &Subscriber) {
    let Some(shared) = sub.sched.upgrade() else {
        return;
    };
    if shared.status_of(sub.task) != TaskStatus::Suspended {
        return;
    }
    resume_task(&shared, sub.task);
}

/// Whether the handle still resolves to a task slot (regardless of whether
/// the task has been marked dead). Used for subscriber-list cleanup.
pub(crate) fn task_exists(shared: &Rc<SchedShared>, id: TaskId) -> bool {
    shared.with_slot(id, |_| ()).is_some()
}

// ---------------------------------------------------------------------------
// Finalization & cancellation
// ---------------------------------------------------------------------------

/// Run a task's ordered teardown exactly once. Returns false if the task
/// was already finalizing (or already gone).
pub(crate) fn finalize(shared: &Rc<SchedShared>, id: TaskId) -> bool {
    let Some(data) = shared.data_of(id) else {
        return false;
    };
    if data.finalizing.replace(true) {
        return false;
    }

    log::trace!("finalizing task {:?} ({})", id, data.name);

    // The user finalizer runs before any state is torn down, whether the
    // task returned or was cancelled. A panicking finalizer must not take
    // the cascade down with it.
    if let Some(finalizer) = data.finalizer.borrow_mut().take() {
        if catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
            log::error!("task finalizer panicked in {:?} ({})", id, data.name);
        }
    }

    // Unbind first so that events signalled during teardown cannot trigger
    // a second cancellation through the dead-entity gate. This also lets a
    // task wait on its own `finished` event for last-gasp cleanup.
    data.bound_entity.set(None);

    // `finished` may already have fired on the natural-death path; cancel
    // is idempotent on a signalled event.
    data.events.cancel_all();

    for event in data.hosted_events.take() {
        event.cancel();
    }

    if let Some(entity) = data.hosted_entity.take() {
        stardust_entity::with(|reg| {
            reg.despawn(entity);
        });
    }

    if let Some(parent) = data.parent.take() {
        if let Some(parent_data) = shared.data_of(parent) {
            parent_data.children.borrow_mut().retain(|child| *child != id);
        }
    }

    // If we died subscribed to a still-valid event, scrub our stale entry
    // so the subscriber list does not accumulate dead handles.
    let wait = std::mem::replace(&mut *data.wait.borrow_mut(), WaitState::None);
    if let WaitState::Event { event, snapshot } = wait {
        if event.id_matches(&snapshot) {
            event.cleanup_subscribers();
        }
    }

    // Cascade: cancel every child. Children unlink themselves from us as
    // they finalize, but popping here also covers children that are
    // already finalizing further up the call chain.
    loop {
        let child = data.children.borrow_mut().pop();
        let Some(child) = child else {
            break;
        };
        if let Some(child_data) = shared.data_of(child) {
            child_data.parent.set(None);
        }
        cancel_in(shared, child);
    }

    data.scratch.release();

    shared.with_slot(id, |slot| {
        slot.data = None;
    });

    log::trace!("finalized task {:?} ({})", id, data.name);
    true
}

/// Cancel a task. Returns false if the handle is stale or the task already
/// died; true otherwise (including when the task was already mid-finalize
/// somewhere up the call chain).
pub(crate) fn cancel_in(shared: &Rc<SchedShared>, id: TaskId) -> bool {
    if shared.status_of(id) == TaskStatus::Dead {
        return false;
    }

    // Grab the control block before finalize clears the slot's reference:
    // the killed flag must reach the victim's own context frame.
    let data = shared.data_of(id);

    if !finalize(shared, id) {
        // Already being finalized; nothing more to do.
        return true;
    }

    let running = shared
        .with_slot(id, |slot| slot.coro.is_none())
        .unwrap_or(false);

    if running {
        // The victim is live on the current call chain. It parks at its
        // next suspension point and the sweep reclaims its stack; we must
        // not unwind a stack that is still below us.
        if let Some(data) = data {
            data.killed.set(true);
        }
    } else {
        shared.with_slot(id, |slot| {
            slot.dead = true;
        });
    }

    true
}

/// Unwind a dead task's coroutine and recycle its stack and slot.
pub(crate) fn release_task(shared: &Rc<SchedShared>, id: TaskId) {
    let Some((coro, unique_id)) =
        shared.with_slot(id, |slot| (slot.coro.take(), slot.unique_id))
    else {
        return;
    };

    if let Some(mut coro) = coro {
        if !coro.done() {
            // Runs Drop for everything still live on the task's stack; the
            // entry glue's natural-death path is skipped by the unwind.
            coro.force_unwind();
        }
        crate::stack::release(coro.into_stack(), unique_id);
    }

    shared.retire_slot(id);
}

/// Finalize (if still needed) and release, unconditionally. Used by
/// scheduler teardown.
pub(crate) fn force_finish(shared: &Rc<SchedShared>, id: TaskId) {
    if shared.data_of(id).is_some() {
        finalize(shared, id);
    }
    release_task(shared, id);
}

// ---------------------------------------------------------------------------
// Suspension primitives
// ---------------------------------------------------------------------------

fn raw_suspend(frame: &ContextFrame) {
    let ptr = frame
        .yielder
        .get()
        .expect("running task has no yielder installed");

    stats::update(|s| s.switches_this_frame += 1);

    // Safety: the pointer was produced from the Yielder reference handed to
    // this task's entry closure. It points at the parent-link cell on the
    // coroutine's own stack, which stays valid for the coroutine's entire
    // lifetime, and we only dereference it while the coroutine is running.
    let yielder = unsafe { &*ptr.cast::<Yielder<(), ()>>() };
    yielder.suspend(());

    // We were resumed: the scheduler pushed a fresh context frame that does
    // not know our yielder address yet.
    install_yielder(ptr);
}

/// Park a task that must never run user code again. Only the sweep's
/// forced unwind gets it off this loop.
fn park(frame: &ContextFrame) -> ! {
    loop {
        raw_suspend(frame);
    }
}

fn suspend_checked(frame: &ContextFrame) {
    if frame.data.is_killed() {
        park(frame);
    }
    raw_suspend(frame);
    if frame.data.is_killed() {
        park(frame);
    }
}

/// Reset the wait bookkeeping, install a new wait state, and return the
/// previous `(frames waited, last event status)`.
fn begin_wait(data: &TaskData, state: WaitState) -> (i32, EventStatus) {
    let frames = data.wait_frames.replace(0);
    let status = data.wait_event_status.replace(EventStatus::Pending);
    *data.wait.borrow_mut() = state;
    (frames, status)
}

/// Give up the rest of this frame; the task resumes next frame.
pub fn yield_now() {
    let frame = current_frame_or_panic();
    suspend_checked(&frame);
}

/// Suspend for `delay` frames. Returns the number of frames actually
/// waited. `wait(0)` and negative delays return immediately without
/// yielding; `wait(1)` is exactly one yield.
pub fn wait(delay: i32) -> i32 {
    let frame = current_frame_or_panic();
    let data = &frame.data;
    debug_assert!(
        matches!(&*data.wait.borrow(), WaitState::None),
        "wait() called with a wait already in progress"
    );

    if delay == 1 {
        yield_now();
        return 1;
    }

    begin_wait(data, WaitState::Delay { remaining: delay });
    if do_wait(data) {
        suspend_checked(&frame);
    }
    begin_wait(data, WaitState::None).0
}

/// Suspend effectively forever; the task only dies by cancellation.
pub fn stall() {
    wait(i32::MAX);
}

/// Suspend until every subtask has finished or been cancelled. Returns the
/// number of frames waited.
pub fn wait_subtasks() -> i32 {
    let frame = current_frame_or_panic();
    let data = &frame.data;
    debug_assert!(
        matches!(&*data.wait.borrow(), WaitState::None),
        "wait_subtasks() called with a wait already in progress"
    );

    begin_wait(data, WaitState::Subtasks);
    if do_wait(data) {
        suspend_checked(&frame);
    }
    begin_wait(data, WaitState::None).0
}

fn wait_event_internal(event: &Event, once: bool) -> EventStatus {
    let frame = current_frame_or_panic();
    let data = &frame.data;

    // A finalizing task must not subscribe to anything; parking here breaks
    // wait-event loops that would otherwise spin during teardown.
    if data.is_finalizing() || data.is_killed() {
        park(&frame);
    }

    if event.is_cancelled() {
        return EventStatus::Cancelled;
    }

    if once && event.num_signaled() > 0 {
        return EventStatus::Signaled;
    }

    event.add_subscriber(Subscriber {
        task: frame.task,
        sched: data.sched.clone(),
    });

    begin_wait(
        data,
        WaitState::Event {
            event: event.clone(),
            snapshot: event.snapshot(),
        },
    );
    if do_wait(data) {
        suspend_checked(&frame);
    }
    begin_wait(data, WaitState::None).1
}

/// Subscribe to an event and suspend until it is signalled or cancelled.
/// Returns `Cancelled` immediately if the event is already cancelled.
pub fn wait_event(event: &Event) -> EventStatus {
    wait_event_internal(event, false)
}

/// Like [`wait_event`], but returns `Signaled` immediately if the event has
/// ever been signalled, without subscribing.
pub fn wait_event_once(event: &Event) -> EventStatus {
    wait_event_internal(event, true)
}

/// Like [`wait_event`], but a `Cancelled` result cancels the calling task;
/// it only returns on `Signaled`.
pub fn wait_event_or_die(event: &Event) -> EventStatus {
    let status = wait_event(event);
    if status == EventStatus::Cancelled {
        let frame = current_frame_or_panic();
        if let Some(shared) = frame.data.sched.upgrade() {
            cancel_in(&shared, frame.task);
        }
        park(&frame);
    }
    status
}

// ---------------------------------------------------------------------------
// In-task accessors
// ---------------------------------------------------------------------------

/// Handle of the currently running task.
///
/// # Panics
///
/// Panics outside of task context.
pub fn this_task() -> TaskId {
    current_frame_or_panic().task
}

/// Handle of the currently running task, or `None` outside task context.
pub fn try_this_task() -> Option<TaskId> {
    current_frame().map(|frame| frame.task)
}

/// A task's built-in events, if it is still alive. Resolved through the
/// current task's scheduler.
pub fn task_events(id: TaskId) -> Option<TaskEvents> {
    let shared = current_sched()?;
    shared.data_of(id).map(|data| data.events.clone())
}

/// Allocate from the current task's scratch arena. The memory lives until
/// the task finalizes.
pub fn scratch_alloc(size: usize) -> NonNull<u8> {
    let frame = current_frame_or_panic();
    frame.data.scratch.alloc(size)
}

/// Register a cleanup callback for the current task, run first thing when
/// the task finalizes -- after `finished` fires on natural death, before
/// events are cancelled and children are torn down. The callback must not
/// suspend.
///
/// # Panics
///
/// Panics if the task already has a finalizer.
pub fn set_finalizer(finalizer: impl FnOnce() + 'static) {
    let frame = current_frame_or_panic();
    let mut slot = frame.data.finalizer.borrow_mut();
    assert!(slot.is_none(), "task already has a finalizer");
    *slot = Some(Box::new(finalizer));
}

/// Cancel a task from inside another task. Returns false if the handle is
/// stale or the task is already dead.
pub fn cancel_task(id: TaskId) -> bool {
    let frame = current_frame_or_panic();
    match frame.data.sched.upgrade() {
        Some(shared) => cancel_in(&shared, id),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Entity binding
// ---------------------------------------------------------------------------

/// Bind the current task to an entity: the task is force-cancelled as soon
/// as the entity dies. Binding a stale handle cancels the task on the spot.
///
/// # Panics
///
/// Panics if the task is already bound.
pub fn bind_entity(entity: EntityId) {
    let frame = current_frame_or_panic();
    let data = &frame.data;
    assert!(
        data.bound_entity.get().is_none(),
        "task is already bound to an entity"
    );

    if !stardust_entity::with(|reg| reg.is_live(entity)) {
        // Nothing to animate; the task dies instead of running against a
        // dead handle.
        if let Some(shared) = data.sched.upgrade() {
            cancel_in(&shared, frame.task);
        }
        park(&frame);
    }

    data.bound_entity.set(Some(entity));
}

/// Register a fresh entity whose lifetime matches the current task's: the
/// entity is deregistered when the task finalizes, and the task is
/// cancelled if the entity is destroyed externally first.
///
/// # Panics
///
/// Panics if the task already hosts an entity or is already bound.
pub fn host_entity(kind: EntityKind) -> EntityId {
    let frame = current_frame_or_panic();
    let data = &frame.data;
    assert!(
        data.hosted_entity.get().is_none(),
        "task already hosts an entity"
    );
    assert!(
        data.bound_entity.get().is_none(),
        "task is already bound to an entity"
    );

    let entity = stardust_entity::with(|reg| reg.spawn(kind));
    data.hosted_entity.set(Some(entity));
    data.bound_entity.set(Some(entity));
    entity
}

/// Adopt a group of events into the current task: they are cancelled when
/// the task finalizes. The group should be freshly armed.
///
/// # Panics
///
/// Panics if the task already hosts an event group.
pub fn host_events(group: &dyn EventGroup) {
    let frame = current_frame_or_panic();
    let mut hosted = frame.data.hosted_events.borrow_mut();
    assert!(hosted.is_empty(), "task already hosts an event group");
    group.for_each_event(&mut |event| hosted.push(event.clone()));
    assert!(!hosted.is_empty(), "hosted event group is empty");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
