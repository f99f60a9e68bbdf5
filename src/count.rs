// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The reference counter shared by every envelope, container and intrusive
//! object in this crate.
//!
//! With the `multithreaded` feature the counter is an [`AtomicUsize`];
//! otherwise it is a [`Cell<usize>`]. The choice is made when the crate is
//! compiled and nothing else in the crate branches on it.
//!
//! [`AtomicUsize`]: https://doc.rust-lang.org/std/sync/atomic/struct.AtomicUsize.html
//! [`Cell<usize>`]: https://doc.rust-lang.org/std/cell/struct.Cell.html

#[cfg(not(feature = "multithreaded"))]
use std::cell::Cell;
use std::fmt::{Debug, Formatter, Result as FmtResult};
#[cfg(feature = "multithreaded")]
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// Counts beyond this are treated as a leak of handles and abort, as `Arc`
/// does.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// A reference count that may be mutated through a shared reference.
///
/// Bookkeeping is not part of the logical value of the object that owns it,
/// which is why every operation takes `&self`.
pub(crate) struct RefCount {
    #[cfg(not(feature = "multithreaded"))]
    value: Cell<usize>,
    #[cfg(feature = "multithreaded")]
    value: AtomicUsize,
}

#[cfg(not(feature = "multithreaded"))]
impl RefCount {
    pub(crate) const fn new(value: usize) -> RefCount {
        RefCount {
            value: Cell::new(value),
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.value.get()
    }

    /// Increments and returns the new count.
    pub(crate) fn inc(&self) -> usize {
        let value = self.value.get() + 1;
        if value > MAX_REFCOUNT {
            std::process::abort();
        }
        self.value.set(value);
        value
    }

    /// Increments only when the count is currently nonzero.
    pub(crate) fn inc_if_nonzero(&self) -> bool {
        match self.value.get() {
            0 => false,
            _ => {
                self.inc();
                true
            },
        }
    }

    /// Decrements and returns the new count.
    pub(crate) fn dec(&self) -> usize {
        let value = self.value.get();
        debug_assert!(value != 0, "reference count released below zero");
        self.value.set(value - 1);
        value - 1
    }
}

#[cfg(feature = "multithreaded")]
impl RefCount {
    pub(crate) const fn new(value: usize) -> RefCount {
        RefCount {
            value: AtomicUsize::new(value),
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Increments and returns the new count.
    pub(crate) fn inc(&self) -> usize {
        // A new reference can only be made from an existing one, so no
        // ordering is needed here.
        let old = self.value.fetch_add(1, Ordering::Relaxed);
        if old >= MAX_REFCOUNT {
            std::process::abort();
        }
        old + 1
    }

    /// Increments only when the count is currently nonzero.
    pub(crate) fn inc_if_nonzero(&self) -> bool {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            if current >= MAX_REFCOUNT {
                std::process::abort();
            }
            match self.value.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrements and returns the new count.
    ///
    /// When the count reaches zero an acquire fence is issued so that every
    /// use of the object through other references happens before whatever
    /// the caller does next (destruction, deallocation).
    pub(crate) fn dec(&self) -> usize {
        let old = self.value.fetch_sub(1, Ordering::Release);
        debug_assert!(old != 0, "reference count released below zero");
        if old == 1 {
            atomic::fence(Ordering::Acquire);
        }
        old - 1
    }
}

impl Debug for RefCount {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.get())
    }
}
