//! CoSched: the per-world scheduler.
//!
//! One scheduler per game world, stepped exactly once per logical frame by
//! the host loop. It owns two task lists: `active` (stepped this frame, in
//! insertion order) and `pending` (spawned during the current frame,
//! promoted at the start of the next). Keeping fresh spawns out of the
//! active list is what makes iteration stable while running tasks spawn
//! more tasks.
//!
//! Tasks live in a slot table. A slot keeps the task's coroutine, its
//! control block and a generation counter; [`crate::task::TaskId`] handles
//! resolve against the generation, so handles to dead tasks go stale
//! instead of dangling. Dead slots are swept at the start of the step that
//! encounters them, returning their stacks to the pool.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use corosensei::Yielder;
use rustc_hash::FxHashMap;

use crate::event::Event;
use crate::stack;
use crate::task::{self, TaskCoroutine, TaskData, TaskEvents, TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// Slot table
// ---------------------------------------------------------------------------

pub(crate) struct TaskSlot {
    /// Generation of the occupying task; zero when the slot is vacant.
    pub(crate) unique_id: u32,
    /// The task's coroutine. Taken out of the slot for the duration of
    /// every resume; `None` while the task is running.
    pub(crate) coro: Option<TaskCoroutine>,
    /// Control block; cleared by finalization.
    pub(crate) data: Option<Rc<TaskData>>,
    /// Set once the task can never run again; the sweep reclaims it.
    pub(crate) dead: bool,
    pub(crate) name: &'static str,
}

/// Scheduler state shared between the public handle, running tasks (via
/// weak backrefs) and event wake-ups.
pub(crate) struct SchedShared {
    slots: RefCell<Vec<TaskSlot>>,
    free_slots: RefCell<Vec<u32>>,
    pub(crate) active: RefCell<Vec<TaskId>>,
    pub(crate) pending: RefCell<Vec<TaskId>>,
}

impl SchedShared {
    fn new() -> Self {
        SchedShared {
            slots: RefCell::new(Vec::new()),
            free_slots: RefCell::new(Vec::new()),
            active: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
        }
    }

    /// Run `f` on the slot `id` resolves to, if the generation matches.
    pub(crate) fn with_slot<R>(&self, id: TaskId, f: impl FnOnce(&mut TaskSlot) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id.index() as usize)?;
        if slot.unique_id != id.unique_id() {
            return None;
        }
        Some(f(slot))
    }

    pub(crate) fn data_of(&self, id: TaskId) -> Option<Rc<TaskData>> {
        self.with_slot(id, |slot| slot.data.clone()).flatten()
    }

    pub(crate) fn status_of(&self, id: TaskId) -> TaskStatus {
        self.with_slot(id, |slot| {
            if slot.dead {
                TaskStatus::Dead
            } else if slot.coro.is_none() {
                TaskStatus::Running
            } else {
                TaskStatus::Suspended
            }
        })
        .unwrap_or(TaskStatus::Dead)
    }

    fn alloc_slot(&self) -> u32 {
        if let Some(index) = self.free_slots.borrow_mut().pop() {
            return index;
        }
        let mut slots = self.slots.borrow_mut();
        slots.push(TaskSlot {
            unique_id: 0,
            coro: None,
            data: None,
            dead: false,
            name: "",
        });
        (slots.len() - 1) as u32
    }

    fn install_slot(&self, index: u32, slot: TaskSlot) {
        self.slots.borrow_mut()[index as usize] = slot;
    }

    /// Vacate a slot after its stack has been released.
    pub(crate) fn retire_slot(&self, id: TaskId) {
        let retired = self
            .with_slot(id, |slot| {
                *slot = TaskSlot {
                    unique_id: 0,
                    coro: None,
                    data: None,
                    dead: false,
                    name: "",
                };
            })
            .is_some();
        if retired {
            self.free_slots.borrow_mut().push(id.index());
        }
    }

    fn live_tasks(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.unique_id != 0 && !slot.dead)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Create a task, link it into `pending`, and run it to its first
/// suspension point before returning (control transfers to the new task
/// immediately, like every invoke form promises).
pub(crate) fn spawn_internal(
    shared: &Rc<SchedShared>,
    name: &'static str,
    parent: Option<TaskId>,
    body: Box<dyn FnOnce()>,
) -> TaskId {
    let unique = task::fresh_unique_id();
    let stack = stack::acquire(unique.get());
    let index = shared.alloc_slot();
    let id = TaskId::new(index, unique);

    let data = Rc::new(TaskData::new(id, Rc::downgrade(shared), name));

    if let Some(parent_id) = parent {
        let parent_data = shared
            .data_of(parent_id)
            .expect("subtask spawned without a live parent task");
        parent_data.attach_child(id);
        data.set_parent(parent_id);
    }

    // The closure is written onto the coroutine's own stack, which is what
    // keeps the argument payload alive after the caller moves on.
    let coro_data = data.clone();
    let coro = TaskCoroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
        task::entry_glue(yielder, coro_data, body);
    });

    shared.install_slot(
        index,
        TaskSlot {
            unique_id: unique.get(),
            coro: Some(coro),
            data: Some(data),
            dead: false,
            name,
        },
    );
    shared.pending.borrow_mut().push(id);

    task::resume_raw(shared, id);

    debug_assert!(
        matches!(
            shared.status_of(id),
            TaskStatus::Suspended | TaskStatus::Dead
        ),
        "freshly spawned task must be suspended or dead"
    );

    id
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The per-world cooperative scheduler. Owned by the enclosing game world
/// and stepped once per logical frame.
pub struct Scheduler {
    shared: Rc<SchedShared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            shared: Rc::new(SchedShared::new()),
        }
    }

    pub(crate) fn shared(&self) -> &Rc<SchedShared> {
        &self.shared
    }

    /// Spawn a root task from a closure. The invoke forms in
    /// [`crate::spawn`] are the public surface over this.
    pub(crate) fn spawn_with(&self, name: &'static str, body: impl FnOnce() + 'static) -> TaskId {
        spawn_internal(&self.shared, name, None, Box::new(body))
    }

    /// Step every eligible task exactly once. Returns the number of tasks
    /// actually resumed.
    ///
    /// Tasks spawned during the step are parked in `pending` and run no
    /// earlier than the next step.
    pub fn step_frame(&mut self) -> u32 {
        let shared = &self.shared;

        // Promote pending spawns, preserving spawn order.
        {
            let mut pending = shared.pending.borrow_mut();
            shared.active.borrow_mut().append(&mut pending);
        }

        let ids = std::mem::take(&mut *shared.active.borrow_mut());
        let mut keep = Vec::with_capacity(ids.len());
        let mut ran = 0u32;

        for id in ids {
            if shared.status_of(id) == TaskStatus::Dead {
                task::release_task(shared, id);
                continue;
            }

            debug_assert_eq!(
                shared.status_of(id),
                TaskStatus::Suspended,
                "active task must be suspended between frames"
            );

            if task::resume_task(shared, id) {
                ran += 1;
            }
            // Tasks that died during this frame are swept next frame.
            keep.push(id);
        }

        debug_assert!(
            shared.active.borrow().is_empty(),
            "nothing appends to the active list mid-step"
        );
        *shared.active.borrow_mut() = keep;

        ran
    }

    /// Cooperative shutdown: cancel every event the world is blocked on
    /// (waking the waiters so they can clean up), then force-finalize all
    /// remaining tasks. The scheduler is empty and reusable afterwards.
    pub fn finish(&mut self) {
        let shared = &self.shared;

        // Gather the blocked events first; a hash set keyed on event
        // identity avoids double-cancelling events shared by several
        // waiters.
        let mut blocked: FxHashMap<usize, (Event, u32)> = FxHashMap::default();
        for list in [&shared.active, &shared.pending] {
            for id in list.borrow().iter() {
                let Some(data) = shared.data_of(*id) else {
                    continue;
                };
                if let Some(event) = data.blocking_event() {
                    blocked.insert(event.key(), (event.clone(), event.unique_id()));
                }
            }
        }

        for (event, unique_id) in blocked.into_values() {
            // A cascade from an earlier cancel may have invalidated this
            // event already; the snapshotted id catches that.
            if event.unique_id() == unique_id {
                event.cancel();
            }
        }

        // Force-finalize everything left, including tasks the cascade
        // spawned into `pending`.
        loop {
            let next = {
                let mut active = shared.active.borrow_mut();
                if active.is_empty() {
                    None
                } else {
                    Some(active.remove(0))
                }
            };
            let next = next.or_else(|| {
                let mut pending = shared.pending.borrow_mut();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            });
            let Some(id) = next else {
                break;
            };
            task::force_finish(shared, id);
        }

        log::debug!("scheduler finished, all tasks retired");
    }

    /// Cancel a task. Idempotent: returns false if the handle is stale or
    /// the task already died.
    pub fn cancel(&self, id: TaskId) -> bool {
        task::cancel_in(&self.shared, id)
    }

    /// Status of the referenced task; `Dead` for stale handles.
    pub fn status_of(&self, id: TaskId) -> TaskStatus {
        self.shared.status_of(id)
    }

    /// A task's built-in events, if it is still alive.
    pub fn task_events(&self, id: TaskId) -> Option<TaskEvents> {
        self.shared.data_of(id).map(|data| data.events.clone())
    }

    /// The debug label a task was spawned with.
    pub fn task_name(&self, id: TaskId) -> Option<&'static str> {
        self.shared.with_slot(id, |slot| slot.name)
    }

    /// Number of live (not yet swept-or-dead) tasks.
    pub fn live_tasks(&self) -> usize {
        self.shared.live_tasks()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("live_tasks", &self.shared.live_tasks())
            .field("active", &self.shared.active.borrow().len())
            .field("pending", &self.shared.pending.borrow().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
