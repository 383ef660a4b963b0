//! The platform timer collaborator. Out of scope for this
//! crate: only the interface services schedule their timers through.

use alloc::boxed::Box;

/// Opaque timer identity returned by a `Clock` implementation. Equality
/// is all a service needs; it never inspects a handle's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerHandle(pub u64);

/// A monotonically increasing stamp captured alongside a re-armable
/// timer. A callback compares its captured generation against the
/// current one and no-ops on mismatch, which is how this crate survives
/// the race between cancellation and an already-fired callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Generation(pub u64);

/// Hands out strictly increasing `Generation` values.
#[derive(Debug, Default)]
pub struct GenerationCounter(u64);

impl GenerationCounter {
    pub fn next(&mut self) -> Generation {
        self.0 += 1;
        Generation(self.0)
    }
}

/// Schedules delayed and periodic callbacks. A platform adapter backs
/// this with whatever timer wheel or OS facility it has; `canopen-rs`
/// never blocks waiting on one.
pub trait Clock {
    /// Runs `cb` once, `ms` milliseconds from now.
    fn schedule_delayed(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>) -> TimerHandle;

    /// Runs `cb` every `ms` milliseconds. When `staggered_start` is set,
    /// the first firing is delayed by up to `2*ms` of randomized jitter
    /// to avoid every node on the bus waking in lockstep.
    fn schedule_periodic(
        &mut self,
        ms: u64,
        cb: Box<dyn FnMut() + Send>,
        staggered_start: bool,
    ) -> TimerHandle;

    /// Cancels a timer. Cancelling an already-fired or unknown handle is
    /// a no-op.
    fn delete_timer(&mut self, handle: &TimerHandle);

    /// Re-arms a periodic timer's next firing without changing its
    /// period. Optional: the default drops and expects callers that
    /// need a fresh interval to `delete_timer` + reschedule instead.
    fn reset_timer(&mut self, _handle: &TimerHandle) {}

    /// Suspends a timer without discarding its handle. Optional for the
    /// same reason as `reset_timer`.
    fn disable_timer(&mut self, _handle: &TimerHandle) {}
}
