// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Property tests for reference counting across every container kind.

use std::alloc::Layout;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;

use envelope::{
    derives, AllocError, CowPtr, CreateError, Envelope, Global, ManagedPtr, PolyEnvelope, RawAlloc, Strong, Weak,
};
use proptest::prelude::*;

/// Counts live blocks. Clones share the counter.
#[derive(Clone, Default)]
struct Counting(Rc<Cell<usize>>);

impl Counting {
    fn live(&self) -> usize {
        self.0.get()
    }
}

unsafe impl RawAlloc for Counting {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = Global.allocate(layout)?;
        self.0.set(self.0.get() + 1);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        assert!(self.0.get() > 0, "deallocated more than allocated");
        self.0.set(self.0.get() - 1);
        Global.deallocate(ptr, layout)
    }
}

/// Records its own destruction.
struct Sentinel(Rc<Cell<usize>>);

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

trait Animal {
    fn legs(&self) -> u32;
}

struct Dog(Sentinel);

impl Animal for Dog {
    fn legs(&self) -> u32 {
        4
    }
}

derives!(Dog: dyn Animal);

#[derive(Debug, Clone, Copy)]
enum HandleOp {
    Clone,
    Drop,
}

fn handle_op() -> impl Strategy<Value = HandleOp> {
    prop_oneof![Just(HandleOp::Clone), Just(HandleOp::Drop)]
}

#[derive(Debug, Clone, Copy)]
enum WeakOp {
    CloneStrong,
    DropStrong,
    Downgrade,
    DropWeak,
    Upgrade,
}

fn weak_op() -> impl Strategy<Value = WeakOp> {
    prop_oneof![
        Just(WeakOp::CloneStrong),
        Just(WeakOp::DropStrong),
        Just(WeakOp::Downgrade),
        Just(WeakOp::DropWeak),
        Just(WeakOp::Upgrade),
    ]
}

proptest! {
    /// The count always equals the number of live handles, and the payload is
    /// destroyed exactly once, when the last handle goes.
    #[test]
    fn refcount_conservation(ops in prop::collection::vec(handle_op(), 0..100)) {
        let drops = Rc::new(Cell::new(0));
        let alloc = Counting::default();
        let mut handles: Vec<ManagedPtr<Envelope<Sentinel, Counting>>> =
            vec![ManagedPtr::new_in(Sentinel(drops.clone()), alloc.clone())];

        for op in ops {
            match op {
                HandleOp::Clone => {
                    let handle = handles[0].clone();
                    handles.push(handle);
                }
                HandleOp::Drop => {
                    handles.pop();
                }
            }

            if handles.is_empty() {
                break;
            }
            prop_assert_eq!(handles[0].ref_count(), handles.len());
            prop_assert_eq!(drops.get(), 0);
        }

        drop(handles);
        prop_assert_eq!(drops.get(), 1);
        prop_assert_eq!(alloc.live(), 0);
    }

    /// Writing through one copy-on-write handle never shows through another.
    #[test]
    fn copy_on_write_isolation(initial in any::<i32>(), written in any::<i32>()) {
        let mut a: CowPtr<Envelope<i32>> = CowPtr::new(initial);
        let b = a.clone();
        prop_assert_eq!(a.ref_count(), 2);

        *a.make_mut().unwrap() = written;

        prop_assert_eq!(a.get(), Some(&written));
        prop_assert_eq!(b.get(), Some(&initial));
        prop_assert!(!a.ptr_eq(&b));
        prop_assert_eq!(a.ref_count(), 1);
        prop_assert_eq!(b.ref_count(), 1);
    }

    /// The weak count never drops below the strong count, the payload goes
    /// with the last strong handle, and the memory with the last handle.
    #[test]
    fn weak_outlives_strong(ops in prop::collection::vec(weak_op(), 0..100)) {
        let drops = Rc::new(Cell::new(0));
        let alloc = Counting::default();
        let mut strongs: Vec<Strong<Sentinel, Counting>> = vec![Strong::new_in(Sentinel(drops.clone()), alloc.clone())];
        let mut weaks: Vec<Weak<Sentinel, Counting>> = Vec::new();

        for op in ops {
            match op {
                WeakOp::CloneStrong => {
                    if let Some(strong) = strongs.first().cloned() {
                        strongs.push(strong);
                    }
                }
                WeakOp::DropStrong => {
                    strongs.pop();
                }
                WeakOp::Downgrade => {
                    if let Some(strong) = strongs.first() {
                        weaks.push(Strong::downgrade(strong));
                    }
                }
                WeakOp::DropWeak => {
                    weaks.pop();
                }
                WeakOp::Upgrade => {
                    if let Some(weak) = weaks.first() {
                        let upgraded = weak.upgrade();
                        prop_assert_eq!(upgraded.is_some(), !strongs.is_empty());
                        strongs.extend(upgraded);
                    }
                }
            }

            let (strong, weak) = match (strongs.first(), weaks.first()) {
                (Some(s), _) => (Strong::strong_count(s), Strong::weak_count(s)),
                (None, Some(w)) => (w.strong_count(), w.weak_count()),
                (None, None) => break,
            };
            prop_assert!(weak >= strong);
            prop_assert_eq!(strong, strongs.len());
            prop_assert_eq!(weak, strongs.len() + weaks.len());
            prop_assert_eq!(drops.get(), if strongs.is_empty() { 1 } else { 0 });
            prop_assert_eq!(alloc.live(), 1);
        }

        drop(strongs);
        prop_assert_eq!(drops.get(), 1);
        drop(weaks);
        prop_assert_eq!(alloc.live(), 0);
    }

    /// Handles to a derived payload viewed through its base run the derived
    /// destructor exactly once.
    #[test]
    fn polymorphic_destroy(clones in 0usize..16) {
        let drops = Rc::new(Cell::new(0));
        let first: ManagedPtr<PolyEnvelope<dyn Animal>> = ManagedPtr::new_derived(Dog(Sentinel(drops.clone())), Global);
        let handles: Vec<_> = (0..clones).map(|_| first.clone()).collect();

        prop_assert_eq!(first.get().map(|animal| animal.legs()), Some(4));
        prop_assert_eq!(first.ref_count(), clones + 1);

        drop(first);
        drop(handles);
        prop_assert_eq!(drops.get(), 1);
    }
}

#[test]
fn partial_construction_is_not_leaked() {
    let drops = Rc::new(Cell::new(0));
    let alloc = Counting::default();

    let failed = Envelope::<Sentinel, Counting>::try_create_with(
        || {
            let _partial = Sentinel(drops.clone());
            Err("refused")
        },
        alloc.clone(),
    );
    assert!(matches!(failed, Err(CreateError::Construct("refused"))));
    assert_eq!(alloc.live(), 0, "memory leaked after a failed payload constructor.");
    assert_eq!(drops.get(), 1, "the constructor's partial state was not dropped exactly once.");

    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = Strong::<Sentinel, Counting>::new_with_in(
            || -> Sentinel {
                let _partial = Sentinel(drops.clone());
                panic!("constructor")
            },
            alloc.clone(),
        );
    }));
    assert!(panicked.is_err());
    assert_eq!(alloc.live(), 0, "memory leaked after a panicking payload constructor.");
    assert_eq!(drops.get(), 2, "a destructor ran on a payload that was never built.");
}

#[test]
fn weak_only_container() {
    let alloc = Counting::default();
    let first: Weak<Sentinel, Counting> = Weak::new_in(alloc.clone());
    let second = first.clone();

    assert_eq!(second.weak_count(), 2);
    assert_eq!(second.strong_count(), 0);
    assert!(first.upgrade().is_none());

    drop(first);
    drop(second);
    assert_eq!(alloc.live(), 0);
}
