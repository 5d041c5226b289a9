// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One execution lane: a pending FIFO, its generation counter and the
//! dedicated worker thread draining it.

use super::sync::Monitor;
use super::work::Work;
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

/// Closure applied by a worker thread to each drained payload. The user
/// callback, its argument and the serialization decorator are folded into it
/// at build time.
pub(crate) type Executor<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An entry of the pending FIFO.
pub(crate) enum Entry<T> {
    /// A unit of work submitted by a producer.
    Work(Work<T>),
    /// Distinguished exit item, enqueued once per queue during teardown. It
    /// travels the normal FIFO path, so it orders after every item enqueued
    /// before teardown began.
    Exit,
}

impl<T> Entry<T> {
    /// Whether this entry carries the given work item.
    pub(crate) fn is(&self, work: &Work<T>) -> bool {
        match self {
            Entry::Work(mine) => mine.same(work),
            Entry::Exit => false,
        }
    }
}

/// State shared between a queue's worker thread and its producers and
/// waiters, guarded by the queue's [`Monitor`].
pub(crate) struct QueueState<T> {
    /// Items submitted but not yet swapped out into a batch.
    pub(crate) pending: VecDeque<Entry<T>>,
    /// Odd exactly while the worker is executing a drained batch, even
    /// otherwise. Only the worker thread increments it, always under the
    /// lock, so waiters can detect "a batch that might contain my item is
    /// currently executing" by parity and wake on the next change.
    pub(crate) generation: u64,
    /// Set by the worker thread on its way out, after the final drain.
    pub(crate) worker_gone: bool,
}

/// Shared core of a queue. Cache-padded so that per-CPU queues sitting next
/// to each other in the owning array don't share cache lines.
pub(crate) type QueueCore<T> = Arc<CachePadded<Monitor<QueueState<T>>>>;

pub(crate) fn new_core<T>() -> QueueCore<T> {
    Arc::new(CachePadded::new(Monitor::new(QueueState {
        pending: VecDeque::new(),
        generation: 0,
        worker_gone: false,
    })))
}

/// One execution lane of a [`WorkQueue`](crate::WorkQueue).
pub(crate) struct Queue<T> {
    pub(crate) core: QueueCore<T>,
    /// Identity of the worker thread, for the self-wait guard.
    pub(crate) worker_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl<T> Queue<T> {
    pub(crate) fn new(core: QueueCore<T>, handle: JoinHandle<()>) -> Self {
        Self {
            core,
            worker_id: handle.thread().id(),
            handle: Some(handle),
        }
    }

    /// Appends an entry to the pending FIFO and wakes the worker thread with
    /// exactly one notification. This is the only submission path; teardown
    /// routes its exit item through here as well.
    pub(crate) fn push(&self, entry: Entry<T>) {
        let mut state = self.core.lock();
        state.pending.push_back(entry);
        drop(state);
        self.core.notify_work();
    }

    /// Drains the queue and reaps its worker thread. Idempotent: only the
    /// first call does anything.
    pub(crate) fn finalize(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.push(Entry::Exit);
        let state = self.core.lock();
        let state = self.core.wait_done_while(state, |s| !s.worker_gone);
        drop(state);
        log_debug!(
            "reaping worker `{}`",
            handle.thread().name().unwrap_or("<unnamed>")
        );
        if handle.join().is_err() {
            log_error!("a worker thread panicked while draining");
        }
    }
}

/// Context owned by a queue's worker thread.
pub(crate) struct WorkerContext<T> {
    pub(crate) core: QueueCore<T>,
    pub(crate) executor: Executor<T>,
}

impl<T> WorkerContext<T> {
    /// Main loop run by the worker thread: sleep while the FIFO is empty,
    /// swap it out as a batch, execute the batch in FIFO order with no lock
    /// held, notify waiters, repeat until the exit item shows up.
    pub(crate) fn run(&self) {
        let _guard = PanicNotifier { core: &self.core };
        let mut exit = false;
        while !exit {
            let batch = {
                let state = self.core.lock();
                let mut state = self.core.wait_work_while(state, |s| s.pending.is_empty());
                let batch = mem::take(&mut state.pending);
                // Enter the draining state: parity flips to odd.
                state.generation += 1;
                batch
            };
            log_debug!(
                "[{}] draining a batch of {} entries",
                thread_name(),
                batch.len()
            );
            for entry in batch {
                match entry {
                    Entry::Work(work) => {
                        (self.executor)(work.payload());
                        work.clear_queued();
                    }
                    Entry::Exit => exit = true,
                }
            }
            let mut state = self.core.lock();
            // Back to idle: parity flips to even.
            state.generation += 1;
            if exit {
                state.worker_gone = true;
            }
            drop(state);
            self.core.notify_done();
        }
        log_debug!("[{}] worker exiting", thread_name());
    }
}

/// If the worker unwinds (the callback is caller logic and is never caught or
/// retried), waiters and `finalize` must still wake up rather than sleep
/// forever on a thread that no longer exists.
struct PanicNotifier<'a, T> {
    core: &'a QueueCore<T>,
}

impl<T> Drop for PanicNotifier<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        log_error!("[{}] worker panicked while draining", thread_name());
        // User code runs with the lock released, so the mutex cannot be
        // poisoned here.
        let mut state = self.core.lock();
        if state.generation % 2 == 1 {
            state.generation += 1;
        }
        state.worker_gone = true;
        drop(state);
        self.core.notify_done();
    }
}

/// Name of the current worker thread, for log lines.
#[cfg(feature = "log")]
fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("<worker>")
        .to_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn worker_drains_in_order_and_acknowledges_exit() {
        let core = new_core::<usize>();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let executor: Executor<usize> = {
            let seen = seen.clone();
            Arc::new(move |i: &usize| seen.lock().unwrap().push(*i))
        };
        let context = WorkerContext {
            core: core.clone(),
            executor,
        };
        let handle = std::thread::Builder::new()
            .name("lane/0".to_owned())
            .spawn(move || context.run())
            .unwrap();
        let mut queue = Queue::new(core, handle);

        for i in 0..3 {
            queue.push(Entry::Work(Work::new(i)));
        }
        queue.finalize();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        let state = queue.core.lock();
        assert!(state.worker_gone);
        assert_eq!(state.generation % 2, 0);
    }

    #[test]
    fn exit_entry_matches_no_work_item() {
        let work = Work::new(7);
        assert!(Entry::Work(work.clone()).is(&work));
        assert!(!Entry::<i32>::Exit.is(&work));
    }

    #[test]
    fn panicking_worker_still_flags_itself_gone() {
        let core = new_core::<()>();
        let executor: Executor<()> = Arc::new(|_| panic!("callback failure"));
        let context = WorkerContext {
            core: core.clone(),
            executor,
        };
        let handle = std::thread::Builder::new()
            .name("lane/panic".to_owned())
            .spawn(move || context.run())
            .unwrap();
        let mut queue = Queue::new(core, handle);

        queue.push(Entry::Work(Work::new(())));
        // Must not hang: the panic notifier flags the worker as gone.
        queue.finalize();
        assert!(queue.core.lock().worker_gone);
    }
}
