// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The caller-visible work-queue handle and its builder.

use super::queue::{new_core, Entry, Executor, Queue, WorkerContext};
use super::work::Work;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::convert::TryFrom;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

/// Index of a CPU, used to steer work items to a specific queue under per-CPU
/// mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuId(
    /// Zero-based CPU index.
    pub usize,
);

/// Number of CPUs to mirror with queues under per-CPU mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuCount {
    /// One queue per CPU reported by
    /// [`std::thread::available_parallelism()`].
    Detected,
    /// One queue per CPU of an explicitly given topology.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for CpuCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(cpu_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(cpu_count)?;
        Ok(CpuCount::Count(count))
    }
}

/// Policy to pin per-CPU worker threads to their CPU.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to its CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to its CPU. If CPU pinning isn't supported on
    /// this platform (or not implemented), building a work queue will panic.
    Always,
}

/// Configuration flags for a [`WorkQueue`].
///
/// The default is one global queue, a serialized callback and no extended
/// register state.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    /// Create one queue (and one worker thread) per CPU instead of a single
    /// global queue, with producers optionally steering items by [`CpuId`]
    /// hint.
    pub per_cpu: bool,
    /// The callback is safe to run concurrently on several workers. When
    /// false, a coarse serialization mutex shared by all of this work queue's
    /// workers is held around every callback invocation.
    pub mpsafe: bool,
    /// The callback uses extended register state. This is pass-through
    /// configuration: hosted targets preserve that state across context
    /// switches anyway, so the flag is recorded but decorates nothing.
    pub fpu_context: bool,
}

/// Scheduling priority for a work queue's worker threads.
///
/// Pass-through configuration: hosted `std` threads expose no portable
/// priority control, so the value is carried as data and not acted upon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Priority(
    /// Raw priority value, higher is more urgent.
    pub i32,
);

/// A worker thread failed to start during [`WorkQueueBuilder::build()`].
///
/// The engine rolls back every queue it had already started (their workers
/// are drained and joined) before surfacing this error, so no partially
/// initialized [`WorkQueue`] ever escapes.
#[derive(Debug, Error)]
#[error("failed to spawn worker thread `{thread}`: {source}")]
pub struct SpawnError {
    thread: String,
    #[source]
    source: io::Error,
}

impl SpawnError {
    /// Name of the worker thread that failed to start.
    pub fn thread(&self) -> &str {
        &self.thread
    }
}

/// A builder for [`WorkQueue`].
pub struct WorkQueueBuilder {
    /// Base name of the work queue. Worker threads are named
    /// `"{name}/{index}"`. Must be non-empty.
    pub name: String,
    /// Pass-through scheduling priority for the worker threads.
    pub priority: Priority,
    /// Configuration flags.
    pub flags: Flags,
    /// CPU topology to mirror under [`Flags::per_cpu`]; ignored otherwise.
    pub cpus: CpuCount,
    /// Policy to pin workers to their CPU; ignored unless [`Flags::per_cpu`]
    /// is set.
    pub pinning: CpuPinningPolicy,
}

impl WorkQueueBuilder {
    /// Returns a builder with the given name and every other field at its
    /// default: one global queue, serialized callback, no pinning.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::default(),
            flags: Flags::default(),
            cpus: CpuCount::Detected,
            pinning: CpuPinningPolicy::No,
        }
    }

    /// Spawns one worker thread per queue and returns the work-queue handle.
    ///
    /// The `callback` runs on a worker thread for every enqueued item, with
    /// shared access to the item's payload and to `arg`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use workqueue::{Work, WorkQueueBuilder};
    /// let counter = Arc::new(AtomicUsize::new(0));
    /// let wq = WorkQueueBuilder::new("example")
    ///     .build(
    ///         |delta: &usize, counter: &Arc<AtomicUsize>| {
    ///             counter.fetch_add(*delta, Ordering::SeqCst);
    ///         },
    ///         counter.clone(),
    ///     )
    ///     .unwrap();
    ///
    /// let work = Work::new(3);
    /// wq.enqueue(&work, None);
    /// wq.wait(&work);
    /// assert_eq!(counter.load(Ordering::SeqCst), 3);
    /// wq.destroy();
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if any worker thread fails to start; queues
    /// started before the failure are fully torn down first.
    pub fn build<T, A, F>(self, callback: F, arg: A) -> Result<WorkQueue<T>, SpawnError>
    where
        T: Send + Sync + 'static,
        A: Send + Sync + 'static,
        F: Fn(&T, &A) + Send + Sync + 'static,
    {
        WorkQueue::create(self, callback, arg)
    }
}

/// A handle to a set of dedicated worker threads executing deferred work in
/// FIFO order.
///
/// A `WorkQueue` owns one queue, or one queue per CPU under
/// [`Flags::per_cpu`]. Each queue pairs a pending FIFO with a worker thread
/// that repeatedly swaps the whole FIFO out as a batch and runs the
/// registered callback over every item with no lock held, so producers keep
/// enqueueing into the next batch concurrently.
///
/// The handle is fully initialized when [`WorkQueueBuilder::build()`]
/// returns: every worker thread is running. Dropping the handle (or calling
/// [`destroy()`](Self::destroy)) drains every queue and joins every worker.
pub struct WorkQueue<T: Send + Sync + 'static> {
    name: String,
    queues: Vec<Queue<T>>,
}

impl<T: Send + Sync + 'static> WorkQueue<T> {
    /// Creates the queues and spawns their workers, rolling everything back
    /// on a spawn failure.
    fn create<A, F>(builder: WorkQueueBuilder, callback: F, arg: A) -> Result<Self, SpawnError>
    where
        A: Send + Sync + 'static,
        F: Fn(&T, &A) + Send + Sync + 'static,
    {
        assert!(!builder.name.is_empty(), "work queue name must not be empty");

        let num_queues = if builder.flags.per_cpu {
            match builder.cpus {
                CpuCount::Detected => thread::available_parallelism()
                    .expect("Getting the available parallelism failed")
                    .get(),
                CpuCount::Count(count) => count.get(),
            }
        } else {
            1
        };

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        if builder.flags.per_cpu {
            match builder.pinning {
                CpuPinningPolicy::No => (),
                CpuPinningPolicy::IfSupported => {
                    log_warn!("Pinning threads to CPUs is not implemented on this platform.")
                }
                CpuPinningPolicy::Always => {
                    panic!("Pinning threads to CPUs is not implemented on this platform.")
                }
            }
        }

        if builder.flags.fpu_context {
            log_debug!(
                "[{}] fpu_context requested; extended state is preserved by the host",
                builder.name
            );
        }

        // The MPSAFE decorator: a non-MP-safe callback is serialized across
        // all of this work queue's workers.
        let serial = (!builder.flags.mpsafe).then(|| Mutex::new(()));
        let executor: Executor<T> = match serial {
            Some(serial) => Arc::new(move |payload: &T| {
                let _serial = serial.lock().unwrap();
                callback(payload, &arg);
            }),
            None => Arc::new(move |payload: &T| callback(payload, &arg)),
        };

        let mut queues: Vec<Queue<T>> = Vec::with_capacity(num_queues);
        for index in 0..num_queues {
            let thread_name = format!("{}/{index}", builder.name);
            let core = new_core::<T>();
            let context = WorkerContext {
                core: core.clone(),
                executor: executor.clone(),
            };
            let per_cpu = builder.flags.per_cpu;
            let pinning = builder.pinning;
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    if per_cpu {
                        pin_to_cpu(index, pinning);
                    }
                    context.run()
                });
            match spawned {
                Ok(handle) => queues.push(Queue::new(core, handle)),
                Err(source) => {
                    log_error!(
                        "[{}] failed to spawn worker `{thread_name}`; rolling back {} queue(s)",
                        builder.name,
                        queues.len()
                    );
                    for queue in &mut queues {
                        queue.finalize();
                    }
                    return Err(SpawnError {
                        thread: thread_name,
                        source,
                    });
                }
            }
        }
        log_debug!(
            "[{}] spawned {} worker thread(s) at priority {:?}",
            builder.name,
            queues.len(),
            builder.priority
        );

        Ok(Self {
            name: builder.name,
            queues,
        })
    }

    /// Base name this work queue was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of queues (and worker threads) owned by this handle: 1, or the
    /// CPU count under per-CPU mode.
    pub fn num_queues(&self) -> NonZeroUsize {
        self.queues.len().try_into().unwrap()
    }

    /// Appends `work` to one queue's pending FIFO and wakes that queue's
    /// worker. Never blocks on the worker and cannot fail.
    ///
    /// Under per-CPU mode the target queue is `cpu`, or the calling thread's
    /// current CPU when `None` (on platforms with no way to ask, queue 0).
    /// The hint is reduced modulo the number of queues. Without per-CPU mode
    /// the hint is ignored.
    ///
    /// Re-enqueueing an item whose callback has not yet returned is a
    /// programming error, caught by a debug assertion.
    pub fn enqueue(&self, work: &Work<T>, cpu: Option<CpuId>) {
        let already = work.mark_queued();
        debug_assert!(!already, "work item is already enqueued");

        let index = if self.queues.len() == 1 {
            0
        } else {
            cpu.map_or_else(current_cpu, |cpu| cpu.0) % self.queues.len()
        };
        self.queues[index].push(Entry::Work(work.clone()));
    }

    /// Blocks until `work` has finished executing on this work queue.
    ///
    /// For each queue, this scans the pending FIFO for the item and sleeps
    /// through drain cycles while it is found there; since a batch already
    /// executing is no longer "pending" but may still contain the item, it
    /// then also sleeps out any cycle in flight (detected by generation
    /// parity) before moving on. Under per-CPU mode the engine does not
    /// record which queue an item was routed to, so every queue is checked.
    ///
    /// # Self-wait
    ///
    /// Called from a queue's own worker thread (i.e. from inside a callback),
    /// this skips that queue instead of sleeping on a drain cycle the caller
    /// is itself supposed to complete. The call is then guaranteed to
    /// *return*, but deliberately does **not** guarantee that the item has
    /// completed. This weak escape hatch only prevents self-deadlock; do not
    /// use it as a completion barrier from callback context.
    pub fn wait(&self, work: &Work<T>) {
        let caller = thread::current().id();
        for queue in &self.queues {
            if queue.worker_id == caller {
                continue;
            }
            let state = queue.core.lock();
            // While the item sits in the pending FIFO, re-check after every
            // completed drain cycle. A gone worker cannot complete anything
            // anymore, so don't sleep on one (only reachable after a callback
            // panic, which is already fatal to the engine).
            let mut state = queue.core.wait_done_while(state, |s| {
                !s.worker_gone && s.pending.iter().any(|entry| entry.is(work))
            });
            if state.generation % 2 == 1 {
                let generation = state.generation;
                state = queue
                    .core
                    .wait_done_while(state, |s| !s.worker_gone && s.generation == generation);
            }
            drop(state);
        }
    }

    /// Drains every queue and terminates every worker thread.
    ///
    /// Consuming the handle enforces the teardown contract: no further
    /// [`enqueue()`](Self::enqueue) can happen once teardown has begun. For
    /// each queue a distinguished exit item is pushed through the normal
    /// submission path, so it executes after everything already enqueued;
    /// the worker acknowledges it and is then joined.
    ///
    /// After this returns, every previously enqueued item (including any
    /// waited-on item) has been executed and no worker threads remain.
    /// Dropping the handle performs the same teardown.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        for queue in &mut self.queues {
            queue.finalize();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for WorkQueue<T> {
    /// Drains every queue and joins every worker thread.
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Pins the calling worker thread to the given CPU, according to policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_to_cpu(index: usize, pinning: CpuPinningPolicy) {
    match pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(index) {
                log_warn!("Failed to set CPU affinity for worker #{index}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for worker #{index}: {_e}");
            } else {
                log_debug!("Pinned worker #{index} to CPU #{index}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(index) {
                panic!("Failed to set CPU affinity for worker #{index}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for worker #{index}: {e}");
            } else {
                log_debug!("Pinned worker #{index} to CPU #{index}");
            }
        }
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_to_cpu(_index: usize, _pinning: CpuPinningPolicy) {}

/// Index of the CPU the calling thread is currently running on, used as the
/// default affinity hint. Falls back to 0 where the platform exposes no way
/// to ask.
#[cfg(all(not(miri), any(target_os = "android", target_os = "linux")))]
fn current_cpu() -> usize {
    nix::sched::sched_getcpu().unwrap_or(0)
}

#[cfg(any(miri, not(any(target_os = "android", target_os = "linux"))))]
fn current_cpu() -> usize {
    0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_count_try_from_usize() {
        assert!(CpuCount::try_from(0).is_err());
        assert_eq!(
            CpuCount::try_from(1),
            Ok(CpuCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn build_defaults_to_one_queue() {
        let wq = WorkQueueBuilder::new("defaults")
            .build(|_: &(), _: &()| (), ())
            .unwrap();
        assert_eq!(wq.name(), "defaults");
        assert_eq!(wq.num_queues().get(), 1);
        wq.destroy();
    }

    #[test]
    fn build_per_cpu_detected() {
        let mut builder = WorkQueueBuilder::new("detected");
        builder.flags.per_cpu = true;
        let wq = builder.build(|_: &(), _: &()| (), ()).unwrap();
        assert_eq!(
            wq.num_queues(),
            thread::available_parallelism().unwrap()
        );
        wq.destroy();
    }

    #[test]
    fn build_per_cpu_pinned_if_supported() {
        let mut builder = WorkQueueBuilder::new("pinned");
        builder.flags.per_cpu = true;
        builder.pinning = CpuPinningPolicy::IfSupported;
        let wq = builder.build(|_: &(), _: &()| (), ()).unwrap();
        wq.destroy();
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn build_per_cpu_pinned_always_not_supported() {
        let mut builder = WorkQueueBuilder::new("pinned");
        builder.flags.per_cpu = true;
        builder.pinning = CpuPinningPolicy::Always;
        let _ = builder.build(|_: &(), _: &()| (), ());
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_name_is_a_programming_error() {
        let _ = WorkQueueBuilder::new("").build(|_: &(), _: &()| (), ());
    }

    #[test]
    fn spawn_error_reports_the_thread_name() {
        let error = SpawnError {
            thread: "broken/0".to_owned(),
            source: io::Error::from(io::ErrorKind::WouldBlock),
        };
        assert_eq!(error.thread(), "broken/0");
        assert!(error.to_string().contains("broken/0"));
    }
}
