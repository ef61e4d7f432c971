//! The shared-drain protocol: stealing from the coordinator and detecting
//! termination.
//!
//! Every tracer taking part in a parallel phase is counted as active by
//! [`Coordinator::start_parallel_phase`]. Entering [`Tracer::drain_from_shared`]
//! moves it from active to waiting; stealing moves it back. Marking is over
//! once no tracer is active and both shared stacks are empty: every tracer
//! is then either waiting here or has left, and nobody can produce new work.
//! Whoever first observes that raises `should_exit` and broadcasts.
//!
//! A tracer that panics mid-phase never leaves the active count, so the
//! phase is abandoned instead: every waiting tracer returns at once and the
//! panic propagates from the driver.
//!
//! [`Coordinator::start_parallel_phase`]: super::Coordinator::start_parallel_phase

use std::sync::Arc;

use parking_lot::MutexGuard;

use super::marker::{Coordinator, SharedDrainMode, SharedDrainResult, SharedMarkState};
use super::sync::Deadline;
use super::tracer::Tracer;

impl Tracer {
    /// Steal from the shared stacks and drain until marking terminates or
    /// `deadline` elapses.
    ///
    /// The master keeps waiting until termination is detected. A participant
    /// also returns once the exit flag is raised. On
    /// [`SharedDrainResult::TimedOut`] the tracer is counted as active again,
    /// since it may still hold local work; it may call back in later. A
    /// tracer entering with local work left over from a timed-out drain
    /// drains it first, and returns `TimedOut` if the deadline cuts that
    /// short.
    ///
    /// # Panics
    ///
    /// Panics if the tracer was not counted as active when it entered, which
    /// means the parallel phase was never opened.
    pub fn drain_from_shared(
        &mut self,
        mode: SharedDrainMode,
        deadline: Deadline,
    ) -> SharedDrainResult {
        debug_assert!(
            self.is_in_parallel_mode(),
            "drain_from_shared outside parallel mode"
        );

        let coordinator = Arc::clone(self.coordinator());

        #[cfg(feature = "tracing")]
        let _span = super::tracing::span_drain_from_shared(mode).entered();

        loop {
            // Local work first. A drain only stops early at the deadline, and
            // a tracer still holding cells must not be counted as idle.
            self.drain(deadline);
            if !self.is_empty() {
                return SharedDrainResult::TimedOut;
            }

            {
                let mut shared = coordinator.lock();
                shared.begin_waiting();

                if let Some(result) = wait_for_work(&coordinator, &mut shared, mode, deadline) {
                    return result;
                }

                let (collector, mutator) = self.stacks_mut();
                let stolen = shared.steal_into(collector, mutator);

                #[cfg(feature = "tracing")]
                super::tracing::log_steal(stolen, shared.active(), shared.waiting());
                let _ = stolen;
            }
        }
    }

    /// Donate, drain locally, then join the shared drain as the master.
    pub fn drain_in_parallel(&mut self, deadline: Deadline) -> SharedDrainResult {
        self.donate_and_drain(deadline);
        self.drain_from_shared(SharedDrainMode::Master, deadline)
    }
}

/// Block until there is something to steal.
///
/// Returns `None` with the lock still held when work is available, or the
/// final result once this tracer should leave the protocol.
fn wait_for_work(
    coordinator: &Coordinator,
    shared: &mut MutexGuard<'_, SharedMarkState>,
    mode: SharedDrainMode,
    deadline: Deadline,
) -> Option<SharedDrainResult> {
    loop {
        if shared.is_abandoned() {
            return Some(SharedDrainResult::Done);
        }

        if shared.is_terminated() {
            shared.raise_exit();
            coordinator.condvar().notify_all();

            #[cfg(feature = "tracing")]
            super::tracing::log_termination(mode, shared.waiting());
            return Some(SharedDrainResult::Done);
        }

        if shared.has_work() {
            return None;
        }

        if mode == SharedDrainMode::Participant && shared.should_exit() {
            return Some(SharedDrainResult::Done);
        }

        if deadline.has_elapsed() {
            return Some(time_out(shared, mode));
        }

        match deadline.instant() {
            Some(instant) => {
                let _ = coordinator.condvar().wait_until(shared, instant);
            }
            None => coordinator.condvar().wait(shared),
        }
    }
}

fn time_out(
    shared: &mut MutexGuard<'_, SharedMarkState>,
    mode: SharedDrainMode,
) -> SharedDrainResult {
    shared.end_waiting();

    #[cfg(feature = "tracing")]
    super::tracing::log_timeout(mode, shared.active(), shared.waiting());
    let _ = mode;

    SharedDrainResult::TimedOut
}
