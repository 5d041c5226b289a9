// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use std::sync::{Condvar, Mutex, MutexGuard};

/// A [`Mutex`]-[`Condvar`] monitor guarding one queue's shared state.
///
/// Two condition variables share the single mutex:
/// - `work` wakes the queue's worker thread when an entry is appended,
/// - `done` wakes completion waiters when a drain cycle ends or the worker
///   exits.
///
/// Keeping the two wakeup channels separate lets an enqueue issue exactly one
/// `notify_one` without the wakeup being consumed by a thread blocked in
/// [`wait_done_while()`](Self::wait_done_while), which would leave the worker
/// asleep with a non-empty FIFO.
pub struct Monitor<S> {
    state: Mutex<S>,
    work: Condvar,
    done: Condvar,
}

impl<S> Monitor<S> {
    /// Creates a monitor initialized with the given state.
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            work: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Locks the shared state.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap()
    }

    /// Wakes the worker thread blocked in
    /// [`wait_work_while()`](Self::wait_work_while).
    pub fn notify_work(&self) {
        self.work.notify_one();
    }

    /// Wakes every thread blocked in
    /// [`wait_done_while()`](Self::wait_done_while).
    pub fn notify_done(&self) {
        self.done.notify_all();
    }

    /// Blocks the worker thread until the predicate turns false.
    pub fn wait_work_while<'a>(
        &self,
        guard: MutexGuard<'a, S>,
        predicate: impl FnMut(&mut S) -> bool,
    ) -> MutexGuard<'a, S> {
        self.work.wait_while(guard, predicate).unwrap()
    }

    /// Blocks a completion waiter until the predicate turns false.
    pub fn wait_done_while<'a>(
        &self,
        guard: MutexGuard<'a, S>,
        predicate: impl FnMut(&mut S) -> bool,
    ) -> MutexGuard<'a, S> {
        self.done.wait_while(guard, predicate).unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[test]
    fn work_channel_wakes_the_consumer() {
        let monitor = Arc::new(Monitor::new(VecDeque::<i32>::new()));

        let consumer = std::thread::spawn({
            let monitor = monitor.clone();
            move || {
                let guard = monitor.lock();
                let mut guard = monitor.wait_work_while(guard, |queue| queue.is_empty());
                guard.pop_front().unwrap()
            }
        });

        monitor.lock().push_back(42);
        monitor.notify_work();

        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn done_channel_wakes_all_waiters() {
        let monitor = Arc::new(Monitor::new(false));

        let waiters: [_; 2] = std::array::from_fn(|_| {
            std::thread::spawn({
                let monitor = monitor.clone();
                move || {
                    let guard = monitor.lock();
                    let guard = monitor.wait_done_while(guard, |done| !*done);
                    assert!(*guard);
                }
            })
        });

        *monitor.lock() = true;
        monitor.notify_done();

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
