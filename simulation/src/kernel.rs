//! Discrete-event simulation kernel.
//!
//! A single-threaded cooperative scheduler over a priority queue of
//! `(scheduled_time, sequence_id, process)` entries. A process is resumed at
//! its scheduled instant, runs to completion with no interleaving, and
//! either suspends again by returning its next delay or finishes by
//! returning `None`. Same-instant entries fire in FIFO enqueue order, which
//! makes a run deterministic given fixed seeds.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A resumable cooperative process over shared state `S`.
pub trait Process<S> {
    /// Runs one step. Returns the delay until the next resume, or `None`
    /// when the process is finished. A zero delay is legal and re-enters at
    /// the same instant (after every entry already queued there).
    fn resume(&mut self, state: &mut S, ctx: &mut Context<'_, S>) -> Option<f64>;
}

/// What a running process sees of the kernel.
pub struct Context<'a, S: 'static> {
    now: f64,
    spawned: &'a mut Vec<Box<dyn Process<S>>>,
}

impl<'a, S: 'static> Context<'a, S> {
    /// The current simulation time
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Schedules a new process. Its first resume happens at the current
    /// instant, after the running step completes.
    pub fn spawn(&mut self, process: Box<dyn Process<S>>) {
        self.spawned.push(process);
    }
}

/// A queue entry. Ordering is by time, then by sequence id.
struct Scheduled<S: 'static> {
    at: f64,
    seq: u64,
    process: Box<dyn Process<S>>,
}

impl<S: 'static> PartialEq for Scheduled<S> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<S: 'static> Eq for Scheduled<S> {}

impl<S: 'static> Ord for Scheduled<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.at.total_cmp(&other.at) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            other => other,
        }
    }
}

impl<S: 'static> PartialOrd for Scheduled<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type Callback<S> = Box<dyn FnMut(&mut S, f64)>;

/// The event loop: owns the shared state, the clock and the time queue.
pub struct Simulation<S: 'static> {
    state: S,
    now: f64,
    next_seq: u64,
    queue: BinaryHeap<Reverse<Scheduled<S>>>,
    before_run: Vec<Callback<S>>,
    after_run: Vec<Callback<S>>,
}

impl<S: 'static> Simulation<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            now: 0.0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            before_run: Vec::new(),
            after_run: Vec::new(),
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    /// Schedules a process for its first resume at the current instant.
    pub fn spawn(&mut self, process: Box<dyn Process<S>>) {
        self.push(self.now, process);
    }

    /// Registers a callback fired once at the start of [Simulation::run_until],
    /// in registration order.
    pub fn before_run(&mut self, callback: impl FnMut(&mut S, f64) + 'static) {
        self.before_run.push(Box::new(callback));
    }

    /// Registers a callback fired once after [Simulation::run_until] reaches
    /// its target time, in registration order.
    pub fn after_run(&mut self, callback: impl FnMut(&mut S, f64) + 'static) {
        self.after_run.push(Box::new(callback));
    }

    fn push(&mut self, at: f64, process: Box<dyn Process<S>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Scheduled { at, seq, process }));
    }

    /// Runs until the head of the queue is past `until`, then pins the clock
    /// to `until`. Entries scheduled exactly at `until` still fire;
    /// unfinished processes stay queued and are dropped with the kernel.
    pub fn run_until(&mut self, until: f64) {
        for callback in &mut self.before_run {
            callback(&mut self.state, self.now);
        }

        let mut spawned: Vec<Box<dyn Process<S>>> = Vec::new();
        loop {
            match self.queue.peek() {
                Some(Reverse(entry)) if entry.at <= until => {}
                _ => break,
            }
            let Reverse(mut entry) = self.queue.pop().expect("peeked entry exists");
            self.now = entry.at;

            let next = {
                let mut ctx = Context {
                    now: self.now,
                    spawned: &mut spawned,
                };
                entry.process.resume(&mut self.state, &mut ctx)
            };

            // Spawned processes enqueue before the parent's own re-arm, in
            // spawn order.
            for process in spawned.drain(..) {
                self.push(self.now, process);
            }
            if let Some(delay) = next {
                debug_assert!(
                    delay >= 0.0 && delay.is_finite(),
                    "suspension delay must be finite and non-negative, got {delay}"
                );
                self.push(self.now + delay, entry.process);
            }
        }
        self.now = until;

        for callback in &mut self.after_run {
            callback(&mut self.state, self.now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace(Vec<(f64, &'static str)>);

    struct Ticker {
        label: &'static str,
        delay: f64,
        remaining: usize,
    }

    impl Process<Trace> for Ticker {
        fn resume(&mut self, state: &mut Trace, ctx: &mut Context<'_, Trace>) -> Option<f64> {
            state.0.push((ctx.now(), self.label));
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(self.delay)
        }
    }

    #[test]
    fn clock_is_pinned_to_run_target() {
        let mut sim = Simulation::new(Trace::default());
        sim.spawn(Box::new(Ticker {
            label: "tick",
            delay: 1.0,
            remaining: 100,
        }));
        sim.run_until(5.5);
        assert_eq!(sim.now(), 5.5);
        // Resumes at 0, 1, ..., 5; the entry for 6 stays queued.
        assert_eq!(sim.state().0.len(), 6);
    }

    #[test]
    fn entries_at_the_target_instant_fire() {
        let mut sim = Simulation::new(Trace::default());
        sim.spawn(Box::new(Ticker {
            label: "tick",
            delay: 2.0,
            remaining: 100,
        }));
        sim.run_until(4.0);
        assert_eq!(
            sim.state().0,
            vec![(0.0, "tick"), (2.0, "tick"), (4.0, "tick")]
        );
    }

    #[test]
    fn same_instant_ties_fire_in_spawn_order() {
        let mut sim = Simulation::new(Trace::default());
        for label in ["a", "b", "c"] {
            sim.spawn(Box::new(Ticker {
                label,
                delay: 1.0,
                remaining: 1,
            }));
        }
        sim.run_until(1.0);
        assert_eq!(
            sim.state().0,
            vec![
                (0.0, "a"),
                (0.0, "b"),
                (0.0, "c"),
                (1.0, "a"),
                (1.0, "b"),
                (1.0, "c"),
            ]
        );
    }

    #[test]
    fn zero_delay_reenters_at_the_same_instant() {
        let mut sim = Simulation::new(Trace::default());
        sim.spawn(Box::new(Ticker {
            label: "z",
            delay: 0.0,
            remaining: 3,
        }));
        sim.run_until(0.0);
        assert_eq!(sim.state().0.len(), 4);
        assert!(sim.state().0.iter().all(|&(t, _)| t == 0.0));
    }

    struct Parent;

    impl Process<Trace> for Parent {
        fn resume(&mut self, state: &mut Trace, ctx: &mut Context<'_, Trace>) -> Option<f64> {
            state.0.push((ctx.now(), "parent"));
            ctx.spawn(Box::new(Ticker {
                label: "child",
                delay: 1.5,
                remaining: 1,
            }));
            None
        }
    }

    #[test]
    fn spawned_process_starts_at_the_current_instant() {
        let mut sim = Simulation::new(Trace::default());
        sim.spawn(Box::new(Parent));
        sim.run_until(2.0);
        assert_eq!(
            sim.state().0,
            vec![(0.0, "parent"), (0.0, "child"), (1.5, "child")]
        );
    }

    #[test]
    fn run_callbacks_fire_once_in_registration_order() {
        let mut sim = Simulation::new(Trace::default());
        sim.before_run(|state: &mut Trace, now| state.0.push((now, "before-1")));
        sim.before_run(|state: &mut Trace, now| state.0.push((now, "before-2")));
        sim.after_run(|state: &mut Trace, now| state.0.push((now, "after")));
        sim.spawn(Box::new(Ticker {
            label: "tick",
            delay: 4.0,
            remaining: 1,
        }));
        sim.run_until(3.0);
        assert_eq!(
            sim.state().0,
            vec![(0.0, "before-1"), (0.0, "before-2"), (0.0, "tick"), (3.0, "after")]
        );
    }
}
