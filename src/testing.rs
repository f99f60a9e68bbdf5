// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fixtures shared by the unit tests.

use std::alloc::Layout;
use std::cell::Cell;
use std::cmp::Ordering;
use std::panic;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::alloc::{AllocError, Global, RawAlloc};

#[derive(Debug, Default)]
struct Stats {
    live: Cell<usize>,
    allocations: Cell<usize>,
    fail_next: Cell<bool>,
    dropped: Cell<usize>,
}

/// A stateful allocator that counts live blocks. Clones share their counters.
#[derive(Debug, Default, Clone)]
pub(crate) struct CountingAlloc {
    stats: Rc<Stats>,
    panic_on_drop: bool,
}

impl CountingAlloc {
    pub(crate) fn new() -> CountingAlloc {
        CountingAlloc::default()
    }

    /// Blocks allocated and not yet returned.
    pub(crate) fn live(&self) -> usize {
        self.stats.live.get()
    }

    /// Blocks ever allocated.
    pub(crate) fn allocations(&self) -> usize {
        self.stats.allocations.get()
    }

    /// Instances sharing these counters that have been dropped.
    pub(crate) fn dropped(&self) -> usize {
        self.stats.dropped.get()
    }

    /// Makes the next allocation fail.
    pub(crate) fn fail_next(&self) {
        self.stats.fail_next.set(true);
    }

    /// A clone sharing these counters that panics when dropped.
    pub(crate) fn panicking_on_drop(&self) -> CountingAlloc {
        CountingAlloc {
            stats: Rc::clone(&self.stats),
            panic_on_drop: true,
        }
    }
}

unsafe impl RawAlloc for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if self.stats.fail_next.replace(false) {
            return Err(AllocError::new(layout));
        }
        let ptr = Global.allocate(layout)?;
        self.stats.live.set(self.stats.live.get() + 1);
        self.stats.allocations.set(self.stats.allocations.get() + 1);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        assert!(self.stats.live.get() > 0, "deallocated more than allocated");
        self.stats.live.set(self.stats.live.get() - 1);
        Global.deallocate(ptr, layout)
    }
}

impl Drop for CountingAlloc {
    fn drop(&mut self) {
        self.stats.dropped.set(self.stats.dropped.get() + 1);
        if self.panic_on_drop {
            panic::panic_any("allocator dropped");
        }
    }
}

/// A shared drop counter.
#[derive(Debug, Default, Clone)]
pub(crate) struct Drops(Rc<Cell<usize>>);

impl Drops {
    pub(crate) fn new() -> Drops {
        Drops::default()
    }

    pub(crate) fn count(&self) -> usize {
        self.0.get()
    }

    pub(crate) fn track<T>(&self, value: T) -> Tracked<T> {
        Tracked {
            value,
            drops: self.clone(),
        }
    }

    fn record(&self) {
        self.0.set(self.0.get() + 1);
    }
}

/// A value that records its own destruction.
#[derive(Debug)]
pub(crate) struct Tracked<T> {
    pub(crate) value: T,
    drops: Drops,
}

impl<T> Clone for Tracked<T>
where
    T: Clone,
{
    fn clone(&self) -> Tracked<T> {
        self.drops.track(self.value.clone())
    }
}

impl<T> PartialEq for Tracked<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Tracked<T>) -> bool {
        self.value == other.value
    }
}

impl<T> PartialOrd for Tracked<T>
where
    T: PartialOrd,
{
    fn partial_cmp(&self, other: &Tracked<T>) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.drops.record();
    }
}

/// A payload whose destructor panics with a `&'static str` message.
#[derive(Debug)]
pub(crate) struct PanicOnDrop {
    message: &'static str,
    drops: Drops,
}

impl PanicOnDrop {
    pub(crate) fn new(message: &'static str, drops: &Drops) -> PanicOnDrop {
        PanicOnDrop {
            message,
            drops: drops.clone(),
        }
    }
}

impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        self.drops.record();
        panic::panic_any(self.message);
    }
}
