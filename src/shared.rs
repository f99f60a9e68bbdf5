// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The strong/weak container.
//!
//! One allocation holds an optional payload, the allocator, and two counts.
//! The *strong* count is the number of [`Strong`] handles; the payload exists
//! exactly while it is nonzero. The *weak* count is the number of [`Weak`]
//! handles plus one unit for every strong handle, so it is never below the
//! strong count. The memory is returned exactly when it reaches zero.
//!
//! A strong release drops the payload (when it was the last strong handle)
//! *before* it gives up its weak unit, so a payload whose destructor looks at
//! a weak handle to itself still finds valid memory.
//!
//! Releases follow the container's [failure tier]: a panicking destructor
//! never stops the counts from being updated or the memory from being freed.
//!
//! [`Strong`]: ./struct.Strong.html
//! [`Weak`]: ./struct.Weak.html
//! [failure tier]: ./trait.FailureTier.html

use std::alloc::Layout;
use std::any::type_name;
use std::cmp::Ordering;
use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter, Pointer, Result as FmtResult};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ops::Deref;
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::alloc::{expect_alloc, AllocError, Global, RawAlloc, RawBox};
use crate::count::RefCount;
use crate::error::{Error, ReleaseError};
use crate::tier::{self, FailureTier, Finalizer, NoFail};

struct Block<T, A, P>
where
    A: RawAlloc,
{
    strong: RefCount,
    weak: RefCount,
    alloc: A,
    value: MaybeUninit<T>,
    phantom: PhantomData<P>,
}

impl<T, A, P> Block<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    /// Allocates a block, constructing the payload with `f` if one is given.
    fn allocate<F>(f: Option<F>, alloc: A) -> Result<NonNull<Block<T, A, P>>, AllocError>
    where
        F: FnOnce() -> T,
    {
        let raw = RawBox::<Block<T, A, P>, A>::allocate(&alloc)?;
        let (strong, value) = match f {
            Some(f) => (1, MaybeUninit::new(f())),
            None => (0, MaybeUninit::uninit()),
        };
        let ptr = raw.transfer();
        unsafe {
            ptr.as_ptr().write(Block {
                strong: RefCount::new(strong),
                weak: RefCount::new(1),
                alloc,
                value,
                phantom: PhantomData,
            });
        }
        trace!(payload = type_name::<T>(), strong, "container created");
        Ok(ptr)
    }

    /// Drops the payload.
    ///
    /// # Safety
    ///
    /// The strong count must just have reached zero.
    unsafe fn drop_value(this: NonNull<Block<T, A, P>>, finalizer: &mut Finalizer<P>) {
        let value = ptr::addr_of_mut!((*this.as_ptr()).value).cast::<T>();
        trace!(payload = type_name::<T>(), "container payload destroyed");
        finalizer.payload(|| ptr::drop_in_place(value));
    }

    /// Gives up one weak unit and frees the block when it was the last.
    ///
    /// # Safety
    ///
    /// The caller must own the weak unit, and must not touch the block
    /// afterwards.
    unsafe fn release_weak(this: NonNull<Block<T, A, P>>, finalizer: &mut Finalizer<P>) {
        let raw = this.as_ptr();
        if (*ptr::addr_of!((*raw).weak)).dec() == 0 {
            let alloc = ptr::read(ptr::addr_of!((*raw).alloc));
            alloc.deallocate(this.cast(), Layout::new::<Block<T, A, P>>());
            trace!(payload = type_name::<T>(), "container deallocated");
            finalizer.allocator(move || drop(alloc));
        }
    }

    /// Gives up one strong unit and the weak unit tied to it.
    ///
    /// # Safety
    ///
    /// The caller must own a strong unit, and must not touch the block
    /// afterwards.
    unsafe fn release_strong(this: NonNull<Block<T, A, P>>) -> Result<(), ReleaseError> {
        let mut finalizer = Finalizer::<P>::new();
        if (*ptr::addr_of!((*this.as_ptr()).strong)).dec() == 0 {
            Block::drop_value(this, &mut finalizer);
        }
        Block::release_weak(this, &mut finalizer);
        finalizer.finish()
    }
}

/// A strong handle to a strong/weak container. The payload lives as long as
/// any `Strong` handle does.
///
/// `Strong` dereferences to the payload, so its own operations are associated
/// functions: `Strong::strong_count(&s)`.
///
/// The `P` parameter selects the [failure tier]. With a tier that lets a
/// destructor fail, [`release`] reports the failure, and dropping the handle
/// re-raises it unless the thread is already panicking.
///
/// # Examples
///
/// ```rust
/// use envelope::Strong;
///
/// let five: Strong<i32> = Strong::new(5);
/// let weak_five = Strong::downgrade(&five);
///
/// assert_eq!(*five, 5);
/// assert_eq!(Strong::strong_count(&five), 1);
/// assert_eq!(Strong::weak_count(&five), 2);
///
/// drop(five);
/// assert!(weak_five.upgrade().is_none());
/// ```
///
/// [failure tier]: ./trait.FailureTier.html
/// [`release`]: ./struct.Strong.html#method.release
pub struct Strong<T, A = Global, P = NoFail>
where
    A: RawAlloc,
    P: FailureTier,
{
    ptr: NonNull<Block<T, A, P>>,
    phantom: PhantomData<T>,
}

/// A weak handle to a strong/weak container. It keeps the memory alive but
/// not the payload, and can be promoted to a [`Strong`] while the payload
/// exists.
///
/// [`Strong`]: ./struct.Strong.html
pub struct Weak<T, A = Global, P = NoFail>
where
    A: RawAlloc,
    P: FailureTier,
{
    ptr: NonNull<Block<T, A, P>>,
    phantom: PhantomData<T>,
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, A, P> Send for Strong<T, A, P>
where
    T: Send + Sync,
    A: RawAlloc + Send + Sync,
    P: FailureTier,
{
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, A, P> Sync for Strong<T, A, P>
where
    T: Send + Sync,
    A: RawAlloc + Send + Sync,
    P: FailureTier,
{
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, A, P> Send for Weak<T, A, P>
where
    T: Send + Sync,
    A: RawAlloc + Send + Sync,
    P: FailureTier,
{
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, A, P> Sync for Weak<T, A, P>
where
    T: Send + Sync,
    A: RawAlloc + Send + Sync,
    P: FailureTier,
{
}

impl<T, A, P> Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    /// Creates a container holding `value`, with one strong handle.
    pub fn new(value: T) -> Strong<T, A, P>
    where
        A: Default,
    {
        Strong::new_in(value, A::default())
    }

    /// Like [`new`], allocating from `alloc`. Allocation failure is reported
    /// through `handle_alloc_error`.
    ///
    /// [`new`]: ./struct.Strong.html#method.new
    pub fn new_in(value: T, alloc: A) -> Strong<T, A, P> {
        expect_alloc(Strong::try_new_in(value, alloc))
    }

    pub fn try_new_in(value: T, alloc: A) -> Result<Strong<T, A, P>, AllocError> {
        Strong::new_with_in(|| value, alloc)
    }

    /// Allocates a container, then constructs its payload with `f`. If `f`
    /// panics, the memory is released and no destructor runs.
    pub fn new_with_in<F>(f: F, alloc: A) -> Result<Strong<T, A, P>, AllocError>
    where
        F: FnOnce() -> T,
    {
        let ptr = Block::allocate(Some(f), alloc)?;
        Ok(Strong {
            ptr,
            phantom: PhantomData,
        })
    }

    /// Releases this handle, reporting a destructor failure instead of
    /// panicking with it.
    ///
    /// Counts are updated and memory is freed whether or not a destructor
    /// fails. With the [`NoFail`] tier this always returns `Ok`.
    ///
    /// [`NoFail`]: ./enum.NoFail.html
    pub fn release(this: Strong<T, A, P>) -> Result<(), ReleaseError> {
        let ptr = this.ptr;
        mem::forget(this);
        unsafe { Block::release_strong(ptr) }
    }

    /// Creates a new [`Weak`] handle to the same container.
    ///
    /// [`Weak`]: ./struct.Weak.html
    pub fn downgrade(this: &Strong<T, A, P>) -> Weak<T, A, P> {
        this.weak().inc();
        Weak {
            ptr: this.ptr,
            phantom: PhantomData,
        }
    }

    /// Releases this handle and returns a weak handle to the same container.
    pub fn into_weak(this: Strong<T, A, P>) -> Result<Weak<T, A, P>, ReleaseError> {
        let weak = Strong::downgrade(&this);
        Strong::release(this)?;
        Ok(weak)
    }

    /// The number of strong handles.
    pub fn strong_count(this: &Strong<T, A, P>) -> usize {
        this.strong().get()
    }

    /// The weak count: the number of [`Weak`] handles plus one for every
    /// strong handle.
    ///
    /// [`Weak`]: ./struct.Weak.html
    pub fn weak_count(this: &Strong<T, A, P>) -> usize {
        this.weak().get()
    }

    /// Mutable access to the payload when no other handle, strong or weak,
    /// refers to the container.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::Strong;
    ///
    /// let mut x: Strong<i32> = Strong::new(3);
    /// *Strong::get_mut(&mut x).unwrap() = 4;
    /// assert_eq!(*x, 4);
    ///
    /// let _y = Strong::downgrade(&x);
    /// assert!(Strong::get_mut(&mut x).is_none());
    /// ```
    pub fn get_mut(this: &mut Strong<T, A, P>) -> Option<&mut T> {
        if Strong::strong_count(this) == 1 && Strong::weak_count(this) == 1 {
            Some(unsafe { &mut *Strong::value_ptr(this) })
        } else {
            None
        }
    }

    /// Whether both handles refer to the same container.
    pub fn ptr_eq(this: &Strong<T, A, P>, other: &Strong<T, A, P>) -> bool {
        this.ptr == other.ptr
    }

    /// The allocator the container was allocated from.
    pub fn allocator(this: &Strong<T, A, P>) -> &A {
        unsafe { &*ptr::addr_of!((*this.ptr.as_ptr()).alloc) }
    }

    /// Points this handle at a fresh container holding `value`, allocated from
    /// a clone of the current allocator, then releases the old container.
    ///
    /// Weak handles to the old container are not carried over.
    pub fn emplace(this: &mut Strong<T, A, P>, value: T) -> Result<(), ReleaseError>
    where
        A: Clone,
    {
        let fresh = Strong::new_in(value, Strong::allocator(this).clone());
        Strong::release(mem::replace(this, fresh))
    }

    fn value_ptr(this: &Strong<T, A, P>) -> *mut T {
        unsafe { ptr::addr_of_mut!((*this.ptr.as_ptr()).value).cast::<T>() }
    }

    fn strong(&self) -> &RefCount {
        unsafe { &*ptr::addr_of!((*self.ptr.as_ptr()).strong) }
    }

    fn weak(&self) -> &RefCount {
        unsafe { &*ptr::addr_of!((*self.ptr.as_ptr()).weak) }
    }
}

impl<T, A, P> Clone for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn clone(&self) -> Strong<T, A, P> {
        self.strong().inc();
        self.weak().inc();
        Strong {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T, A, P> Drop for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn drop(&mut self) {
        tier::raise(unsafe { Block::release_strong(self.ptr) });
    }
}

impl<T, A, P> Deref for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*Strong::value_ptr(self) }
    }
}

impl<T, A, P> AsRef<T> for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T, A, P> Default for Strong<T, A, P>
where
    T: Default,
    A: RawAlloc + Default,
    P: FailureTier,
{
    fn default() -> Strong<T, A, P> {
        Strong::new(T::default())
    }
}

impl<T, A, P> PartialEq for Strong<T, A, P>
where
    T: PartialEq,
    A: RawAlloc,
    P: FailureTier,
{
    fn eq(&self, other: &Strong<T, A, P>) -> bool {
        **self == **other
    }
}

impl<T, A, P> PartialOrd for Strong<T, A, P>
where
    T: PartialOrd,
    A: RawAlloc,
    P: FailureTier,
{
    fn partial_cmp(&self, other: &Strong<T, A, P>) -> Option<Ordering> {
        (**self).partial_cmp(&**other)
    }
}

impl<T, A, P> Eq for Strong<T, A, P>
where
    T: Eq,
    A: RawAlloc,
    P: FailureTier,
{
}

impl<T, A, P> Ord for Strong<T, A, P>
where
    T: Ord,
    A: RawAlloc,
    P: FailureTier,
{
    fn cmp(&self, other: &Strong<T, A, P>) -> Ordering {
        (**self).cmp(&**other)
    }
}

impl<T, A, P> Hash for Strong<T, A, P>
where
    T: Hash,
    A: RawAlloc,
    P: FailureTier,
{
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        (**self).hash(state);
    }
}

impl<T, A, P> Borrow<T> for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn borrow(&self) -> &T {
        self
    }
}

impl<T, A, P> Pointer for Strong<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{:p}", &**self)
    }
}

impl<T, A, P> Debug for Strong<T, A, P>
where
    T: Debug,
    A: RawAlloc,
    P: FailureTier,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(&**self, f)
    }
}

impl<T, A, P> Display for Strong<T, A, P>
where
    T: Display,
    A: RawAlloc,
    P: FailureTier,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Display::fmt(&**self, f)
    }
}

impl<T, A, P> Weak<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    /// Creates a container that holds no payload and never will. Promoting
    /// the returned handle always fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::Weak;
    ///
    /// let empty: Weak<i64> = Weak::new();
    /// assert!(empty.upgrade().is_none());
    /// assert_eq!(empty.weak_count(), 1);
    /// ```
    pub fn new() -> Weak<T, A, P>
    where
        A: Default,
    {
        Weak::new_in(A::default())
    }

    /// Like [`new`], allocating from `alloc`. Allocation failure is reported
    /// through `handle_alloc_error`.
    ///
    /// [`new`]: ./struct.Weak.html#method.new
    pub fn new_in(alloc: A) -> Weak<T, A, P> {
        expect_alloc(Weak::try_new_in(alloc))
    }

    pub fn try_new_in(alloc: A) -> Result<Weak<T, A, P>, AllocError> {
        let ptr = Block::allocate(None::<fn() -> T>, alloc)?;
        Ok(Weak {
            ptr,
            phantom: PhantomData,
        })
    }

    /// Promotes to a [`Strong`] handle if the payload still exists.
    ///
    /// [`Strong`]: ./struct.Strong.html
    pub fn upgrade(&self) -> Option<Strong<T, A, P>> {
        if self.strong().inc_if_nonzero() {
            self.weak().inc();
            Some(Strong {
                ptr: self.ptr,
                phantom: PhantomData,
            })
        } else {
            debug!(payload = type_name::<T>(), "weak promotion failed: no object present");
            None
        }
    }

    /// Like [`upgrade`], reporting [`Error::NoObjectPresent`] on failure.
    ///
    /// [`upgrade`]: ./struct.Weak.html#method.upgrade
    /// [`Error::NoObjectPresent`]: ./enum.Error.html#variant.NoObjectPresent
    pub fn try_upgrade(&self) -> Result<Strong<T, A, P>, Error> {
        self.upgrade().ok_or(Error::NoObjectPresent)
    }

    /// Releases this handle, reporting an allocator destructor failure
    /// instead of panicking with it.
    pub fn release(this: Weak<T, A, P>) -> Result<(), ReleaseError> {
        let ptr = this.ptr;
        mem::forget(this);
        let mut finalizer = Finalizer::<P>::new();
        unsafe { Block::release_weak(ptr, &mut finalizer) };
        finalizer.finish()
    }

    /// The number of strong handles.
    pub fn strong_count(&self) -> usize {
        self.strong().get()
    }

    /// The number of weak handles plus one for every strong handle.
    pub fn weak_count(&self) -> usize {
        self.weak().get()
    }

    /// Whether both handles refer to the same container.
    pub fn ptr_eq(&self, other: &Weak<T, A, P>) -> bool {
        self.ptr == other.ptr
    }

    fn strong(&self) -> &RefCount {
        unsafe { &*ptr::addr_of!((*self.ptr.as_ptr()).strong) }
    }

    fn weak(&self) -> &RefCount {
        unsafe { &*ptr::addr_of!((*self.ptr.as_ptr()).weak) }
    }
}

impl<T, A, P> Clone for Weak<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn clone(&self) -> Weak<T, A, P> {
        self.weak().inc();
        Weak {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T, A, P> Drop for Weak<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn drop(&mut self) {
        let mut finalizer = Finalizer::<P>::new();
        unsafe { Block::release_weak(self.ptr, &mut finalizer) };
        tier::raise(finalizer.finish());
    }
}

impl<T, A, P> Default for Weak<T, A, P>
where
    A: RawAlloc + Default,
    P: FailureTier,
{
    fn default() -> Weak<T, A, P> {
        Weak::new()
    }
}

impl<T, A, P> Debug for Weak<T, A, P>
where
    A: RawAlloc,
    P: FailureTier,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "(Weak)")
    }
}
