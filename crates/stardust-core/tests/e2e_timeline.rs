//! End-to-end frame-timeline scenarios driven through the public surface,
//! the way a game loop would drive them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use stardust_core::task::{
    bind_entity, host_entity, wait, wait_event, wait_event_or_die, wait_subtasks, yield_now,
};
use stardust_core::spawn::invoke_subtask;
use stardust_core::{define_task, Event, EventStatus, Scheduler, TaskStatus};
use stardust_entity::EntityKind;

type Records = Rc<RefCell<Vec<&'static str>>>;

// ---------------------------------------------------------------------------
// Scenario: delay then done
// ---------------------------------------------------------------------------

define_task! {
    task DelayThenSignal(done: Event) {
        wait(3);
        done.signal();
    }
}

#[test]
fn delay_then_done() {
    let mut sched = Scheduler::new();
    let done = Event::new();

    let a = sched.invoke::<DelayThenSignal>(done.clone());

    for _ in 0..4 {
        sched.step_frame();
    }

    assert_eq!(done.num_signaled(), 1, "done must fire exactly once");
    assert_eq!(sched.status_of(a), TaskStatus::Dead);
    assert_eq!(sched.live_tasks(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: parent cancels child on return
// ---------------------------------------------------------------------------

define_task! {
    task SleepForever(_args: ()) {
        wait(1_000_000);
    }
}

struct ParentArgs {
    child_out: Rc<Cell<Option<stardust_core::TaskId>>>,
}

define_task! {
    task ShortLivedParent(args: ParentArgs) {
        args.child_out.set(Some(invoke_subtask::<SleepForever>(())));
        wait(2);
    }
}

#[test]
fn parent_cancels_child() {
    let mut sched = Scheduler::new();
    let child_out = Rc::new(Cell::new(None));

    let parent = sched.invoke::<ShortLivedParent>(ParentArgs {
        child_out: child_out.clone(),
    });
    let child = child_out.get().expect("child spawns during parent startup");

    for _ in 0..3 {
        sched.step_frame();
    }

    assert_eq!(sched.status_of(parent), TaskStatus::Dead);
    assert_eq!(
        sched.status_of(child),
        TaskStatus::Dead,
        "returning parent must cancel its sleeping child"
    );
}

// ---------------------------------------------------------------------------
// Scenario: event cascade wakes subscribers in spawn order
// ---------------------------------------------------------------------------

struct RecorderArgs {
    event: Event,
    tag: &'static str,
    out: Records,
}

define_task! {
    task RecordOnEvent(args: RecorderArgs) {
        if wait_event(&args.event) == EventStatus::Signaled {
            args.out.borrow_mut().push(args.tag);
        }
    }
}

define_task! {
    task SignalNextFrame(event: Event) {
        wait(1);
        event.signal();
    }
}

#[test]
fn event_cascade_in_subscription_order() {
    let mut sched = Scheduler::new();
    let event = Event::new();
    let records: Records = Rc::new(RefCell::new(Vec::new()));

    for tag in ["A", "B", "C"] {
        sched.invoke::<RecordOnEvent>(RecorderArgs {
            event: event.clone(),
            tag,
            out: records.clone(),
        });
    }
    sched.invoke::<SignalNextFrame>(event.clone());

    sched.step_frame();
    sched.step_frame();

    assert_eq!(
        *records.borrow(),
        vec!["A", "B", "C"],
        "subscribers must wake in subscription order"
    );
}

// ---------------------------------------------------------------------------
// Scenario: cancellation is immediate and sweeps clean
// ---------------------------------------------------------------------------

define_task! {
    task Immortal(_args: ()) {
        loop {
            yield_now();
        }
    }
}

#[test]
fn cancel_propagation() {
    let mut sched = Scheduler::new();
    let g = sched.invoke::<Immortal>(());

    assert!(sched.cancel(g));
    assert_eq!(
        sched.status_of(g),
        TaskStatus::Dead,
        "cancellation must be synchronous"
    );
    assert_eq!(sched.step_frame(), 0, "nothing left to resume");
    assert!(!sched.cancel(g), "cancelling a dead task is a no-op");
}

// ---------------------------------------------------------------------------
// Scenario: external entity death unbinds and cancels
// ---------------------------------------------------------------------------

struct HostArgs {
    entity_out: Rc<Cell<Option<stardust_entity::EntityId>>>,
}

define_task! {
    task AnimateHostedEntity(args: HostArgs) {
        let entity = host_entity(EntityKind::Projectile);
        args.entity_out.set(Some(entity));
        loop {
            yield_now();
        }
    }
}

#[test]
fn entity_unbinding() {
    let mut sched = Scheduler::new();
    let entity_out = Rc::new(Cell::new(None));

    let t = sched.invoke::<AnimateHostedEntity>(HostArgs {
        entity_out: entity_out.clone(),
    });
    let entity = entity_out.get().expect("entity hosted during startup");
    assert!(stardust_entity::with(|reg| reg.is_live(entity)));

    // The world kills the projectile out from under the task.
    stardust_entity::with(|reg| reg.despawn(entity));

    sched.step_frame();

    assert_eq!(
        sched.status_of(t),
        TaskStatus::Dead,
        "task must be cancelled once its entity dies"
    );
    assert!(
        !stardust_entity::with(|reg| reg.is_live(entity)),
        "entity stays unregistered"
    );
}

#[test]
fn binding_a_dead_handle_cancels_immediately() {
    let mut sched = Scheduler::new();
    let stale = stardust_entity::with(|reg| {
        let id = reg.spawn(EntityKind::Item);
        reg.despawn(id);
        id
    });

    define_task! {
        task BindStale(stale: stardust_entity::EntityId) {
            bind_entity(stale);
            // Unreachable: binding a dead handle kills the task.
            panic!("survived binding a dead entity handle");
        }
    }

    let t = sched.invoke::<BindStale>(stale);
    assert_eq!(sched.status_of(t), TaskStatus::Dead);
    sched.step_frame();
}

// ---------------------------------------------------------------------------
// Scenario: wait_subtasks drains the longest child
// ---------------------------------------------------------------------------

define_task! {
    task TimedWorker(duration: i32) {
        wait(duration);
    }
}

struct JoinArgs {
    done: Event,
}

define_task! {
    task JoinWorkers(args: JoinArgs) {
        invoke_subtask::<TimedWorker>(5);
        invoke_subtask::<TimedWorker>(10);
        wait_subtasks();
        args.done.signal();
    }
}

#[test]
fn wait_subtasks_signals_on_step_eleven() {
    let mut sched = Scheduler::new();
    let done = Event::new();

    sched.invoke::<JoinWorkers>(JoinArgs { done: done.clone() });

    for step in 1..=10 {
        sched.step_frame();
        assert_eq!(
            done.num_signaled(),
            0,
            "done fired early, at step {step} of the spawn+drain timeline"
        );
    }

    sched.step_frame(); // step 11
    assert_eq!(
        done.num_signaled(),
        1,
        "done must fire exactly on step 11 (1 for spawn, 10 to drain)"
    );
}

// ---------------------------------------------------------------------------
// Signal/resubscribe round trips
// ---------------------------------------------------------------------------

struct CountArgs {
    event: Event,
    wakes: Rc<Cell<u32>>,
}

define_task! {
    task CountSignals(args: CountArgs) {
        while wait_event(&args.event) == EventStatus::Signaled {
            args.wakes.set(args.wakes.get() + 1);
        }
    }
}

#[test]
fn two_signals_cause_two_wakes_only_via_resubscription() {
    let mut sched = Scheduler::new();
    let event = Event::new();
    let wakes = Rc::new(Cell::new(0));

    sched.invoke::<CountSignals>(CountArgs {
        event: event.clone(),
        wakes: wakes.clone(),
    });

    // Back-to-back signals within one frame: the first wake clears the
    // subscriber list and the task resubscribes before the second signal.
    event.signal();
    event.signal();
    assert_eq!(wakes.get(), 2);

    // A signal while the task is between subscriptions would be missed;
    // here it is resubscribed, so a third signal wakes it again.
    sched.step_frame();
    event.signal();
    assert_eq!(wakes.get(), 3);

    event.cancel();
    sched.step_frame();
    assert_eq!(sched.live_tasks(), 0, "cancel ends the loop");
}

#[test]
fn waiting_on_a_cancelled_event_returns_immediately() {
    let sched = Scheduler::new();
    let event = Event::new();
    event.cancel();

    let status = Rc::new(Cell::new(EventStatus::Pending));

    struct WaitArgs {
        event: Event,
        status: Rc<Cell<EventStatus>>,
    }

    define_task! {
        task WaitCancelled(args: WaitArgs) {
            args.status.set(wait_event(&args.event));
        }
    }

    let t = sched.invoke::<WaitCancelled>(WaitArgs {
        event,
        status: status.clone(),
    });

    assert_eq!(
        status.get(),
        EventStatus::Cancelled,
        "no suspension on an already-cancelled event"
    );
    assert_eq!(sched.status_of(t), TaskStatus::Dead);
}

// ---------------------------------------------------------------------------
// wait_event_or_die
// ---------------------------------------------------------------------------

struct OrDieArgs {
    event: Event,
    survived: Rc<Cell<bool>>,
}

define_task! {
    task DieOnCancel(args: OrDieArgs) {
        wait_event_or_die(&args.event);
        args.survived.set(true);
    }
}

#[test]
fn wait_event_or_die_kills_on_cancellation() {
    let mut sched = Scheduler::new();
    let event = Event::new();
    let survived = Rc::new(Cell::new(false));

    let t = sched.invoke::<DieOnCancel>(OrDieArgs {
        event: event.clone(),
        survived: survived.clone(),
    });

    event.cancel();
    sched.step_frame();

    assert_eq!(sched.status_of(t), TaskStatus::Dead);
    assert!(!survived.get(), "body after wait_event_or_die must not run");
}

#[test]
fn wait_event_or_die_passes_signals_through() {
    let mut sched = Scheduler::new();
    let event = Event::new();
    let survived = Rc::new(Cell::new(false));

    sched.invoke::<DieOnCancel>(OrDieArgs {
        event: event.clone(),
        survived: survived.clone(),
    });

    event.signal();
    assert!(survived.get(), "signal lets the task continue");
    sched.step_frame();
}

#[test]
fn wait_event_once_accepts_past_signals() {
    let sched = Scheduler::new();
    let event = Event::new();
    event.signal();

    let status = Rc::new(Cell::new(EventStatus::Pending));

    struct OnceArgs {
        event: Event,
        status: Rc<Cell<EventStatus>>,
    }

    define_task! {
        task WaitOnce(args: OnceArgs) {
            args.status.set(stardust_core::task::wait_event_once(&args.event));
        }
    }

    sched.invoke::<WaitOnce>(OnceArgs {
        event,
        status: status.clone(),
    });

    assert_eq!(
        status.get(),
        EventStatus::Signaled,
        "a past signal satisfies wait_event_once without suspending"
    );
}

// ---------------------------------------------------------------------------
// Hosted event groups die with their task
// ---------------------------------------------------------------------------

stardust_core::event_group! {
    struct AttackEvents {
        charge_ready,
        pattern_done,
    }
}

struct HostEventsArgs {
    events: AttackEvents,
}

define_task! {
    task AttackPhase(args: HostEventsArgs) {
        stardust_core::task::host_events(&args.events);
        wait(2);
    }
}

#[test]
fn hosted_events_are_cancelled_with_their_task() {
    let mut sched = Scheduler::new();
    let events = AttackEvents::new();
    let observed = Rc::new(Cell::new(EventStatus::Pending));

    sched.invoke::<AttackPhase>(HostEventsArgs {
        events: events.clone(),
    });

    let observed_in_task = observed.clone();
    let waited_on = events.charge_ready.clone();
    define_task! {
        task WaitCharge(args: (Event, Rc<Cell<EventStatus>>)) {
            let (event, out) = args;
            out.set(wait_event(&event));
        }
    }
    sched.invoke::<WaitCharge>((waited_on, observed_in_task));

    for _ in 0..3 {
        sched.step_frame();
    }

    assert!(
        events.charge_ready.is_cancelled(),
        "hosted events must be cancelled when the task dies"
    );
    assert!(events.pattern_done.is_cancelled());
    assert_eq!(
        observed.get(),
        EventStatus::Cancelled,
        "waiters on hosted events must be woken with Cancelled"
    );
}

// ---------------------------------------------------------------------------
// Shutdown timeouts compose from waits and cancellation
// ---------------------------------------------------------------------------

struct TimeoutArgs {
    deadline: Event,
    outcome: Rc<Cell<EventStatus>>,
}

define_task! {
    task AwaitWithTimeout(args: TimeoutArgs) {
        args.outcome.set(wait_event(&args.deadline));
    }
}

define_task! {
    task Deadline(args: (Event, i32)) {
        let (event, frames) = args;
        wait(frames);
        event.cancel();
    }
}

#[test]
fn timeout_composes_from_wait_and_cancel() {
    let mut sched = Scheduler::new();
    let deadline = Event::new();
    let outcome = Rc::new(Cell::new(EventStatus::Pending));

    sched.invoke::<AwaitWithTimeout>(TimeoutArgs {
        deadline: deadline.clone(),
        outcome: outcome.clone(),
    });
    sched.invoke::<Deadline>((deadline.clone(), 3));

    for _ in 0..3 {
        sched.step_frame();
    }

    assert_eq!(
        outcome.get(),
        EventStatus::Cancelled,
        "the waiter must observe the timeout as cancellation"
    );
}

// ---------------------------------------------------------------------------
// Pool behaviour across a stage worth of spawns
// ---------------------------------------------------------------------------

define_task! {
    task Flicker(frames: i32) {
        wait(frames);
    }
}

#[test]
fn stacks_recycle_across_waves() {
    let mut sched = Scheduler::new();

    for _wave in 0..10 {
        for i in 0..8 {
            sched.invoke::<Flicker>(i % 3);
        }
        for _ in 0..5 {
            sched.step_frame();
        }
    }

    assert_eq!(sched.live_tasks(), 0);
    sched.finish();

    let stats = stardust_core::stats::snapshot();
    assert_eq!(stats.stacks_in_use, 0, "every stack must be back in the pool");
    assert!(
        stats.stacks_allocated <= 16,
        "waves of identical load must reuse pooled stacks, allocated {}",
        stats.stacks_allocated
    );
}
