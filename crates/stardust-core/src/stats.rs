//! Scheduler observability counters.
//!
//! Mirrors what the debug overlay wants to draw each frame: how many task
//! stacks exist, how many are in use, and how many context switches the
//! current frame has performed. `peak_stack_usage` is only fed when the
//! `stack-usage-stats` feature is enabled.
//!
//! Counters are thread-local like everything else in the core; there is no
//! persistent format.

use std::cell::Cell;

/// Snapshot of the core's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoStats {
    /// Stacks ever allocated by the pool (live + pooled).
    pub stacks_allocated: usize,
    /// Stacks currently owned by live tasks.
    pub stacks_in_use: usize,
    /// Coroutine switches since the counter was last taken.
    pub switches_this_frame: usize,
    /// Highest observed stack usage in bytes (canary sweep; zero unless
    /// `stack-usage-stats` is enabled).
    pub peak_stack_usage: usize,
}

thread_local! {
    static STATS: Cell<CoStats> = const { Cell::new(CoStats {
        stacks_allocated: 0,
        stacks_in_use: 0,
        switches_this_frame: 0,
        peak_stack_usage: 0,
    }) };
}

pub(crate) fn update(f: impl FnOnce(&mut CoStats)) {
    STATS.with(|stats| {
        let mut value = stats.get();
        f(&mut value);
        stats.set(value);
    });
}

/// Current counter values.
pub fn snapshot() -> CoStats {
    STATS.with(Cell::get)
}

/// Read and reset the per-frame switch counter.
///
/// The host typically calls this once per frame after `step_frame`, the way
/// the debug overlay samples it.
pub fn take_switches_this_frame() -> usize {
    STATS.with(|stats| {
        let mut value = stats.get();
        let taken = value.switches_this_frame;
        value.switches_this_frame = 0;
        stats.set(value);
        taken
    })
}

/// Reset everything. Used by pool shutdown and tests.
pub(crate) fn reset() {
    STATS.with(|stats| stats.set(CoStats::default()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_switches_resets() {
        reset();
        update(|s| s.switches_this_frame += 7);
        assert_eq!(take_switches_this_frame(), 7);
        assert_eq!(snapshot().switches_this_frame, 0);
    }
}
