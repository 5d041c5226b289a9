// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Work item handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A unit of deferred work.
///
/// A `Work` is a cheap handle around a caller-supplied payload. Cloning it
/// clones the handle, not the payload: all clones designate the same unit of
/// work, and [`WorkQueue::wait()`](crate::WorkQueue::wait) relies on that
/// identity to tell "my item" apart from everything else in flight.
///
/// While an item is pending or part of a batch being drained, the engine only
/// reads the payload through `&T`. The item must not be enqueued a second time
/// until its callback has returned (which a producer can observe via
/// [`wait()`](crate::WorkQueue::wait)); a double enqueue is a programming
/// error caught by a debug assertion.
pub struct Work<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    payload: T,
    /// True from enqueue until the callback for this item returns.
    queued: AtomicBool,
}

impl<T> Work<T> {
    /// Wraps a payload into a work item.
    pub fn new(payload: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                payload,
                queued: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a reference to the payload.
    pub fn payload(&self) -> &T {
        &self.shared.payload
    }

    /// Marks the item as linked into a pending FIFO, returning whether it
    /// already was.
    pub(crate) fn mark_queued(&self) -> bool {
        self.shared.queued.swap(true, Ordering::AcqRel)
    }

    /// Clears the linked mark once the callback for this item has returned.
    pub(crate) fn clear_queued(&self) {
        self.shared.queued.store(false, Ordering::Release);
    }

    /// Whether two handles designate the same unit of work.
    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Clone for Work<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let work = Work::new(1);
        let other = Work::new(1);
        assert!(work.same(&work.clone()));
        assert!(!work.same(&other));
    }

    #[test]
    fn payload_is_readable_through_any_clone() {
        let work = Work::new("payload");
        let clone = work.clone();
        assert_eq!(*clone.payload(), "payload");
    }

    #[test]
    fn queued_mark_round_trip() {
        let work = Work::new(());
        assert!(!work.mark_queued());
        assert!(work.mark_queued());
        work.clear_queued();
        assert!(!work.mark_queued());
    }
}
