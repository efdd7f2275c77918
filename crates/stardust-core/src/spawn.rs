//! Task definitions and the invoke surface.
//!
//! Gameplay content is authored as named tasks: a [`TaskDef`] couples a
//! unique name, an argument struct and a body. The [`define_task!`] macro
//! writes the boilerplate. Spawning comes in the usual flavours:
//!
//! - `invoke` / `invoke_subtask` -- run now (to the first suspension), as a
//!   root task or parented to the caller.
//! - `invoke_delayed` / `invoke_subtask_delayed` -- sit out a delay first;
//!   a negative delay means the body never runs.
//! - `invoke_when` / `invoke_after` -- trigger on an event. `_when` runs
//!   the body only if the event was signalled; `_after` runs it on
//!   cancellation too.
//! - `cancel_task_when` / `cancel_task_after` -- auxiliary task that
//!   cancels a target when an event fires.
//!
//! Root spawns exist both as free functions (from inside a task, using the
//! caller's scheduler) and as [`Scheduler`] methods (from the host).
//! Subtask spawns are free functions only; they need a running task to
//! parent to.
//!
//! [`TaskHandle`] erases the concrete task behind its argument type, so
//! different task implementations sharing an argument struct can be
//! dispatched from one spawn site (how polymorphic boss attack phases are
//! picked at runtime).

use std::rc::Rc;

use crate::event::{Event, EventStatus};
use crate::sched::{spawn_internal, SchedShared, Scheduler};
use crate::task::{self, TaskId};

// ---------------------------------------------------------------------------
// TaskDef
// ---------------------------------------------------------------------------

/// A named task definition: argument type plus body.
pub trait TaskDef: 'static {
    /// Unique debug name; shows up in logs and `Scheduler::task_name`.
    const NAME: &'static str;
    /// Argument struct moved into the task at spawn.
    type Args: 'static;

    fn run(args: Self::Args);
}

/// Define a task: a unit struct implementing [`TaskDef`].
///
/// ```
/// use stardust_core::{define_task, task::wait};
///
/// define_task! {
///     /// Fires a three-round burst.
///     pub task Burst(args: u32) {
///         for _ in 0..args {
///             wait(5);
///         }
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_task {
    (
        $(#[$meta:meta])*
        $vis:vis task $name:ident($args:ident : $args_ty:ty) $body:block
    ) => {
        $(#[$meta])*
        $vis struct $name;

        impl $crate::spawn::TaskDef for $name {
            const NAME: &'static str = stringify!($name);
            type Args = $args_ty;

            fn run($args: Self::Args) $body
        }
    };
    (
        $(#[$meta:meta])*
        $vis:vis task $name:ident $body:block
    ) => {
        $(#[$meta])*
        $vis struct $name;

        impl $crate::spawn::TaskDef for $name {
            const NAME: &'static str = stringify!($name);
            type Args = ();

            fn run(_args: Self::Args) $body
        }
    };
}

// ---------------------------------------------------------------------------
// Indirect handles
// ---------------------------------------------------------------------------

/// Type-erased handle to any task taking `Args`. Two tasks with the same
/// argument struct are interchangeable behind it.
pub struct TaskHandle<Args: 'static> {
    name: &'static str,
    run: fn(Args),
}

impl<Args: 'static> TaskHandle<Args> {
    pub fn of<T: TaskDef<Args = Args>>() -> Self {
        TaskHandle {
            name: T::NAME,
            run: T::run,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<Args: 'static> Clone for TaskHandle<Args> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Args: 'static> Copy for TaskHandle<Args> {}

// ---------------------------------------------------------------------------
// Thunk bodies shared by every spawn form
// ---------------------------------------------------------------------------

fn delayed_thunk<Args: 'static>(run: fn(Args), delay: i32, args: Args) -> impl FnOnce() {
    move || {
        if delay < 0 {
            return;
        }
        task::wait(delay);
        run(args);
    }
}

fn on_event_thunk<Args: 'static>(
    run: fn(Args),
    event: &Event,
    unconditional: bool,
    args: Args,
) -> impl FnOnce() {
    let event = event.clone();
    move || {
        if task::wait_event(&event) == EventStatus::Signaled || unconditional {
            run(args);
        }
    }
}

fn current_sched() -> Rc<SchedShared> {
    task::current_sched().expect("invoked a task outside of task context")
}

fn parent_id() -> TaskId {
    task::this_task()
}

// ---------------------------------------------------------------------------
// In-task spawn forms
// ---------------------------------------------------------------------------

/// Spawn a root task on the current task's scheduler. Control transfers to
/// the new task until its first suspension.
pub fn invoke<T: TaskDef>(args: T::Args) -> TaskId {
    let shared = current_sched();
    spawn_internal(&shared, T::NAME, None, Box::new(move || T::run(args)))
}

/// Spawn a task parented to the current task; it is cancelled when the
/// current task dies.
pub fn invoke_subtask<T: TaskDef>(args: T::Args) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(
        &shared,
        T::NAME,
        Some(parent),
        Box::new(move || T::run(args)),
    )
}

/// Spawn a root task that waits `delay` frames before running its body.
/// A negative delay spawns a task that exits without running the body.
pub fn invoke_delayed<T: TaskDef>(delay: i32, args: T::Args) -> TaskId {
    let shared = current_sched();
    spawn_internal(
        &shared,
        T::NAME,
        None,
        Box::new(delayed_thunk(T::run, delay, args)),
    )
}

/// Subtask variant of [`invoke_delayed`].
pub fn invoke_subtask_delayed<T: TaskDef>(delay: i32, args: T::Args) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(
        &shared,
        T::NAME,
        Some(parent),
        Box::new(delayed_thunk(T::run, delay, args)),
    )
}

/// Spawn a root task that runs its body only if `event` is signalled; if
/// the event is cancelled instead, the task exits without running it.
pub fn invoke_when<T: TaskDef>(event: &Event, args: T::Args) -> TaskId {
    let shared = current_sched();
    spawn_internal(
        &shared,
        T::NAME,
        None,
        Box::new(on_event_thunk(T::run, event, false, args)),
    )
}

/// Like [`invoke_when`], but the body runs unconditionally once the event
/// is signalled *or* cancelled.
pub fn invoke_after<T: TaskDef>(event: &Event, args: T::Args) -> TaskId {
    let shared = current_sched();
    spawn_internal(
        &shared,
        T::NAME,
        None,
        Box::new(on_event_thunk(T::run, event, true, args)),
    )
}

/// Subtask variant of [`invoke_when`].
pub fn invoke_subtask_when<T: TaskDef>(event: &Event, args: T::Args) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(
        &shared,
        T::NAME,
        Some(parent),
        Box::new(on_event_thunk(T::run, event, false, args)),
    )
}

/// Subtask variant of [`invoke_after`].
pub fn invoke_subtask_after<T: TaskDef>(event: &Event, args: T::Args) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(
        &shared,
        T::NAME,
        Some(parent),
        Box::new(on_event_thunk(T::run, event, true, args)),
    )
}

/// Spawn a task through a type-erased handle.
pub fn invoke_indirect<Args: 'static>(handle: TaskHandle<Args>, args: Args) -> TaskId {
    let shared = current_sched();
    spawn_internal(
        &shared,
        handle.name,
        None,
        Box::new(move || (handle.run)(args)),
    )
}

/// Subtask variant of [`invoke_indirect`].
pub fn invoke_subtask_indirect<Args: 'static>(handle: TaskHandle<Args>, args: Args) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(
        &shared,
        handle.name,
        Some(parent),
        Box::new(move || (handle.run)(args)),
    )
}

/// Spawn an auxiliary task that cancels `target` when `event` is
/// signalled. If the event is cancelled first, the target is left alone.
pub fn cancel_task_when(event: &Event, target: TaskId) -> TaskId {
    let shared = current_sched();
    spawn_cancel_helper(&shared, event, false, target)
}

/// Like [`cancel_task_when`], but also cancels the target if the event is
/// cancelled.
pub fn cancel_task_after(event: &Event, target: TaskId) -> TaskId {
    let shared = current_sched();
    spawn_cancel_helper(&shared, event, true, target)
}

fn spawn_cancel_helper(
    shared: &Rc<SchedShared>,
    event: &Event,
    unconditional: bool,
    target: TaskId,
) -> TaskId {
    let event = event.clone();
    spawn_internal(
        shared,
        "cancel_task_helper",
        None,
        Box::new(move || {
            if task::wait_event(&event) == EventStatus::Signaled || unconditional {
                task::cancel_task(target);
            }
        }),
    )
}

// ---------------------------------------------------------------------------
// Closure spawns (crate-internal)
// ---------------------------------------------------------------------------

/// Spawn a root task from a closure, from inside a task.
pub(crate) fn spawn_root_with(name: &'static str, body: impl FnOnce() + 'static) -> TaskId {
    let shared = current_sched();
    spawn_internal(&shared, name, None, Box::new(body))
}

/// Spawn a subtask from a closure, from inside a task.
pub(crate) fn spawn_subtask_with(name: &'static str, body: impl FnOnce() + 'static) -> TaskId {
    let shared = current_sched();
    let parent = parent_id();
    spawn_internal(&shared, name, Some(parent), Box::new(body))
}

// ---------------------------------------------------------------------------
// Host-side spawn forms
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Spawn a root task from the host.
    pub fn invoke<T: TaskDef>(&self, args: T::Args) -> TaskId {
        spawn_internal(self.shared(), T::NAME, None, Box::new(move || T::run(args)))
    }

    /// Spawn a root task that waits `delay` frames before its body runs.
    pub fn invoke_delayed<T: TaskDef>(&self, delay: i32, args: T::Args) -> TaskId {
        spawn_internal(
            self.shared(),
            T::NAME,
            None,
            Box::new(delayed_thunk(T::run, delay, args)),
        )
    }

    /// Spawn a root task gated on an event being signalled.
    pub fn invoke_when<T: TaskDef>(&self, event: &Event, args: T::Args) -> TaskId {
        spawn_internal(
            self.shared(),
            T::NAME,
            None,
            Box::new(on_event_thunk(T::run, event, false, args)),
        )
    }

    /// Spawn a root task that runs on event signal or cancellation.
    pub fn invoke_after<T: TaskDef>(&self, event: &Event, args: T::Args) -> TaskId {
        spawn_internal(
            self.shared(),
            T::NAME,
            None,
            Box::new(on_event_thunk(T::run, event, true, args)),
        )
    }

    /// Spawn through a type-erased handle.
    pub fn invoke_indirect<Args: 'static>(&self, handle: TaskHandle<Args>, args: Args) -> TaskId {
        spawn_internal(
            self.shared(),
            handle.name,
            None,
            Box::new(move || (handle.run)(args)),
        )
    }

    /// Host-side [`cancel_task_when`].
    pub fn cancel_when(&self, event: &Event, target: TaskId) -> TaskId {
        spawn_cancel_helper(self.shared(), event, false, target)
    }

    /// Host-side [`cancel_task_after`].
    pub fn cancel_after(&self, event: &Event, target: TaskId) -> TaskId {
        spawn_cancel_helper(self.shared(), event, true, target)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
