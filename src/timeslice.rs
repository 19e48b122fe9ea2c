//! Time-sliced multi-reader / multi-writer lock.
//!
//! Unlike an arrival-ordered rwlock, ownership alternates between the reader
//! side and the writer side by *time budget*: while a side is active, any
//! number of that side's threads may be inside; once the side's quota (plus
//! grace) elapses and the opposite side has waiters, new entries to the
//! active side stop and the lock flips as soon as the last holder leaves.
//! Queries run on the read side, index mutations on the write side, and
//! neither can starve the other.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Quota configuration for [`TimeSlicedRwLock`].
#[derive(Debug, Clone, Copy)]
pub struct TimeSliceConfig {
    /// Budget granted to the reader side per slice.
    pub read_quota: Duration,
    /// Budget granted to the writer side per slice.
    pub write_quota: Duration,
    /// Extra time readers may keep joining past their quota when writers are
    /// already waiting.
    pub read_grace: Duration,
    /// Extra time writers may keep joining past their quota.
    pub write_grace: Duration,
}

impl Default for TimeSliceConfig {
    fn default() -> Self {
        Self {
            read_quota: Duration::from_millis(10),
            write_quota: Duration::from_millis(1),
            read_grace: Duration::from_micros(500),
            write_grace: Duration::from_micros(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

struct State {
    active_side: Side,
    active_count: usize,
    waiting_readers: usize,
    waiting_writers: usize,
    slice_started: Instant,
}

impl State {
    fn waiting_on(&self, side: Side) -> usize {
        match side {
            Side::Read => self.waiting_readers,
            Side::Write => self.waiting_writers,
        }
    }
}

/// Reader/writer lock with time-budgeted alternation.
pub struct TimeSlicedRwLock {
    config: TimeSliceConfig,
    state: Mutex<State>,
    turnstile: Condvar,
}

impl Default for TimeSlicedRwLock {
    fn default() -> Self {
        Self::new(TimeSliceConfig::default())
    }
}

impl TimeSlicedRwLock {
    pub fn new(config: TimeSliceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                active_side: Side::Read,
                active_count: 0,
                waiting_readers: 0,
                waiting_writers: 0,
                slice_started: Instant::now(),
            }),
            turnstile: Condvar::new(),
        }
    }

    fn budget(&self, side: Side) -> Duration {
        match side {
            Side::Read => self.config.read_quota + self.config.read_grace,
            Side::Write => self.config.write_quota + self.config.write_grace,
        }
    }

    fn may_enter(&self, state: &State, side: Side) -> bool {
        if state.active_side != side {
            if state.active_count > 0 {
                return false;
            }
            // The owning side is idle: flip once its budget is spent or when
            // nobody on that side wants back in.
            return state.waiting_on(state.active_side) == 0
                || state.slice_started.elapsed() >= self.budget(state.active_side);
        }
        // Our side owns the slice. An actively held side admits joiners —
        // a transaction drain parks on the write side while pool workers
        // enter it — so the budget governs handoff at idle points: once
        // spent with the opposite side waiting, new entries wait for the
        // flip.
        let opposite = match side {
            Side::Read => Side::Write,
            Side::Write => Side::Read,
        };
        state.waiting_on(opposite) == 0
            || state.active_count > 0
            || state.slice_started.elapsed() < self.budget(side)
    }

    fn acquire(&self, side: Side) {
        let mut state = self.state.lock();
        loop {
            if self.may_enter(&state, side) {
                if state.active_side != side {
                    state.active_side = side;
                    state.slice_started = Instant::now();
                }
                state.active_count += 1;
                return;
            }
            match side {
                Side::Read => state.waiting_readers += 1,
                Side::Write => state.waiting_writers += 1,
            }
            // Re-check on a short tick as well: quota expiry is time-driven,
            // not event-driven, so a sleeping waiter must poll the clock.
            let deadline = Instant::now() + self.budget(state.active_side);
            self.turnstile.wait_until(&mut state, deadline);
            match side {
                Side::Read => state.waiting_readers -= 1,
                Side::Write => state.waiting_writers -= 1,
            }
        }
    }

    fn release(&self, side: Side) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.active_side, side);
        debug_assert!(state.active_count > 0);
        state.active_count -= 1;
        if state.active_count == 0 {
            self.turnstile.notify_all();
        }
    }

    /// Enter the read side. Blocks while the writer slice is active.
    pub fn read(&self) -> TimeSliceReadGuard<'_> {
        self.acquire(Side::Read);
        TimeSliceReadGuard { lock: self }
    }

    /// Enter the write side. Multiple writers may hold the slice at once;
    /// per-structure synchronization is the caller's concern.
    pub fn write(&self) -> TimeSliceWriteGuard<'_> {
        self.acquire(Side::Write);
        TimeSliceWriteGuard { lock: self }
    }
}

pub struct TimeSliceReadGuard<'a> {
    lock: &'a TimeSlicedRwLock,
}

impl Drop for TimeSliceReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(Side::Read);
    }
}

pub struct TimeSliceWriteGuard<'a> {
    lock: &'a TimeSlicedRwLock,
}

impl Drop for TimeSliceWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(Side::Write);
    }
}
