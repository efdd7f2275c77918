//! Task stack pool.
//!
//! Every task runs on its own fixed-size machine stack. Spawning and killing
//! thousands of bullet-pattern tasks per stage would churn mmap badly, so
//! retired stacks go on a free list and are handed back out on the next
//! spawn. The pool belongs to the scheduler's thread and is deliberately not
//! thread-safe; it lives in a thread-local.
//!
//! With the `stack-usage-stats` feature, acquired stacks are filled with a
//! PRNG-derived canary pattern seeded from the task's unique id, and a sweep
//! at release time estimates how much of the stack the task actually used.

use std::cell::RefCell;

use corosensei::stack::DefaultStack;

use crate::stats;

/// Default stack size per task.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Suggested stack size for memory-constrained targets.
pub const SMALL_STACK_SIZE: usize = 64 * 1024;

/// Pool configuration, applied by [`init`].
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Size of every stack the pool allocates.
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

struct StackPool {
    free: Vec<DefaultStack>,
    stack_size: usize,
}

impl StackPool {
    fn new(config: PoolConfig) -> Self {
        StackPool {
            free: Vec::new(),
            stack_size: config.stack_size,
        }
    }
}

thread_local! {
    static POOL: RefCell<Option<StackPool>> = const { RefCell::new(None) };
}

/// Set up this thread's stack pool. Idempotent in effect: calling it again
/// replaces the pool (pooled stacks are freed, live ones are unaffected).
pub fn init(config: PoolConfig) {
    POOL.with(|pool| {
        *pool.borrow_mut() = Some(StackPool::new(config));
    });
}

/// Tear down this thread's stack pool, freeing every pooled stack.
///
/// Live tasks keep their stacks; schedulers should be finished first.
pub fn shutdown() {
    POOL.with(|pool| {
        *pool.borrow_mut() = None;
    });
    stats::reset();
}

/// Get a stack for a new task, recycling a retired one when possible.
pub(crate) fn acquire(unique_id: u32) -> DefaultStack {
    let stack = POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        let pool = pool.get_or_insert_with(|| StackPool::new(PoolConfig::default()));

        match pool.free.pop() {
            Some(stack) => {
                log::trace!("recycled a pooled stack for task #{unique_id}");
                stack
            }
            None => {
                let stack = DefaultStack::new(pool.stack_size)
                    .expect("failed to allocate coroutine stack");
                stats::update(|s| s.stacks_allocated += 1);
                log::debug!(
                    "allocated stack #{} ({} KiB)",
                    stats::snapshot().stacks_allocated,
                    pool.stack_size / 1024
                );
                stack
            }
        }
    });

    stats::update(|s| s.stacks_in_use += 1);

    #[cfg(feature = "stack-usage-stats")]
    canary::fill(&stack, unique_id);
    #[cfg(not(feature = "stack-usage-stats"))]
    let _ = unique_id;

    stack
}

/// Return a retired task's stack to the free list.
pub(crate) fn release(stack: DefaultStack, unique_id: u32) {
    #[cfg(feature = "stack-usage-stats")]
    canary::estimate_usage(&stack, unique_id);
    #[cfg(not(feature = "stack-usage-stats"))]
    let _ = unique_id;

    stats::update(|s| s.stacks_in_use = s.stacks_in_use.saturating_sub(1));

    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if let Some(pool) = pool.as_mut() {
            pool.free.push(stack);
        }
        // After shutdown the stack is simply dropped.
    });
}

// ---------------------------------------------------------------------------
// Canary-based stack usage accounting
// ---------------------------------------------------------------------------

#[cfg(feature = "stack-usage-stats")]
mod canary {
    //! Crude stack usage estimation: fill the stack with a known 32-bit
    //! pattern at acquire time, then find the first surviving canary below
    //! the used region at release time. The search is a binary search over
    //! data that is not strictly sorted, so it can misjudge when a false
    //! canary appears mid-stack; that is acceptable for an upper-bound
    //! statistic.

    use corosensei::stack::{DefaultStack, Stack};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use crate::stats;

    /// Bytes below the stack base left untouched: corosensei keeps its
    /// initial frame and the entry closure there.
    const UPPER_MARGIN: usize = 64;

    fn pattern(unique_id: u32) -> u32 {
        SmallRng::seed_from_u64(u64::from(unique_id)).random()
    }

    /// The canary-covered word range of a stack. Stacks grow down from
    /// `base`, so the margin is carved off the top.
    fn word_range(stack: &DefaultStack) -> (*mut u32, usize) {
        let lo = stack.limit().get();
        let hi = stack.base().get().saturating_sub(UPPER_MARGIN);
        let lo = (lo + 3) & !3;
        let hi = hi & !3;
        (lo as *mut u32, hi.saturating_sub(lo) / 4)
    }

    pub(super) fn fill(stack: &DefaultStack, unique_id: u32) {
        let canary = pattern(unique_id);
        let (words, len) = word_range(stack);
        for i in 0..len {
            // Safety: the range lies inside the stack's usable region, which
            // we own exclusively until the coroutine is constructed.
            unsafe { words.add(i).write(canary) };
        }
    }

    pub(super) fn estimate_usage(stack: &DefaultStack, unique_id: u32) {
        let canary = pattern(unique_id);
        let (words, len) = word_range(stack);
        if len == 0 {
            return;
        }

        // Safety: same region as fill(); the task is dead and nothing else
        // aliases the stack.
        let words = unsafe { std::slice::from_raw_parts(words, len) };

        // Binary search for the highest word that still looks untouched.
        let mut lo = 0usize;
        let mut span = len;
        while span > 1 {
            let half = span / 2;
            if words[lo + half] == canary {
                lo += half;
                span -= half;
            } else {
                span = half;
            }
        }

        let usage = (len - lo) * 4 + UPPER_MARGIN;
        let total = stack.base().get() - stack.limit().get();

        if usage > stats::snapshot().peak_stack_usage {
            log::debug!(
                "new peak stack usage: {usage} of {total} bytes ({:.02}%); \
                 consider a larger stack size if this approaches the limit",
                usage as f64 / total as f64 * 100.0
            );
            stats::update(|s| s.peak_stack_usage = usage);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_recycles() {
        init(PoolConfig {
            stack_size: SMALL_STACK_SIZE,
        });
        let before = stats::snapshot().stacks_allocated;

        let stack = acquire(1);
        release(stack, 1);
        let again = acquire(2);
        release(again, 2);

        assert_eq!(
            stats::snapshot().stacks_allocated,
            before + 1,
            "second acquire should reuse the pooled stack"
        );
        shutdown();
    }

    #[test]
    fn test_in_use_accounting() {
        init(PoolConfig::default());
        let a = acquire(10);
        let b = acquire(11);
        assert_eq!(stats::snapshot().stacks_in_use, 2);
        release(a, 10);
        release(b, 11);
        assert_eq!(stats::snapshot().stacks_in_use, 0);
        shutdown();
    }
}
