// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: the work-queue handle, per-queue worker loops and
//! synchronization primitives.

mod queue;
mod sync;
mod work;
mod work_queue;

pub use work::Work;
pub use work_queue::{
    CpuCount, CpuId, CpuPinningPolicy, Flags, Priority, SpawnError, WorkQueue, WorkQueueBuilder,
};
