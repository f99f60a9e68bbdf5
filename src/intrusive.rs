// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Intrusive reference counting.
//!
//! A type that embeds a [`SharedCount`] and implements [`SharedObject`] can be
//! shared through [`SharedPtr`] without a separate envelope: the count lives
//! inside the object. The count is interior-mutable, so it is adjusted through
//! shared references.
//!
//! [`SharedCount`]: ./struct.SharedCount.html
//! [`SharedObject`]: ./trait.SharedObject.html
//! [`SharedPtr`]: ./struct.SharedPtr.html

use std::alloc::Layout;
use std::any::type_name;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use tracing::trace;

use crate::alloc::{expect_alloc, AllocError, Global, RawBox, Stateless};
use crate::compare::address;
use crate::count::RefCount;
use crate::error::ReleaseError;
use crate::poly::Derives;
use crate::tier::{self, FailureTier, Finalizer, NoFail};

/// The reference count embedded in a [`SharedObject`].
///
/// A new count starts at one, the unit adopted by the first [`SharedPtr`].
/// The count is not part of an object's value: cloning yields a fresh count
/// and any two counts compare equal.
///
/// [`SharedObject`]: ./trait.SharedObject.html
/// [`SharedPtr`]: ./struct.SharedPtr.html
pub struct SharedCount(RefCount);

impl SharedCount {
    pub fn new() -> SharedCount {
        SharedCount(RefCount::new(1))
    }

    /// The number of handles sharing the object.
    pub fn get(&self) -> usize {
        self.0.get()
    }

    fn add_ref(&self) -> usize {
        self.0.inc()
    }

    fn release(&self) -> usize {
        self.0.dec()
    }
}

impl Clone for SharedCount {
    fn clone(&self) -> SharedCount {
        SharedCount::new()
    }
}

impl Default for SharedCount {
    fn default() -> SharedCount {
        SharedCount::new()
    }
}

impl PartialEq for SharedCount {
    fn eq(&self, _other: &SharedCount) -> bool {
        true
    }
}

impl Eq for SharedCount {}

impl Debug for SharedCount {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_tuple("SharedCount").field(&self.get()).finish()
    }
}

/// A type that carries its own reference count.
///
/// # Safety
///
/// `shared_count` must return a count stored inside `self`, and the same count
/// for every call over the object's whole lifetime. Handles trust that count
/// to decide when the object is deleted; a count borrowed from elsewhere, or
/// one that changes between calls, lets a handle free the object while others
/// still point at it.
///
/// ```compile_fail
/// use envelope::{SharedCount, SharedObject};
///
/// struct Session {
///     count: SharedCount,
/// }
///
/// unsafe impl SharedObject for Session {
///     fn shared_count(&self) -> &SharedCount {
///         &self.count
///     }
/// }
/// ```
///
/// # Examples
///
/// ```rust
/// use envelope::{SharedCount, SharedObject, SharedPtr};
///
/// struct Session {
///     count: SharedCount,
///     user: String,
/// }
///
/// unsafe impl SharedObject for Session {
///     fn shared_count(&self) -> &SharedCount {
///         &self.count
///     }
/// }
///
/// let first: SharedPtr<Session> = SharedPtr::new(Session {
///     count: SharedCount::new(),
///     user: "ferris".to_owned(),
/// });
/// let second = first.clone();
///
/// assert_eq!(second.get().unwrap().user, "ferris");
/// assert_eq!(first.ref_count(), 2);
/// ```
pub unsafe trait SharedObject {
    fn shared_count(&self) -> &SharedCount;
}

/// A nullable handle to a heap-allocated [`SharedObject`].
///
/// Cloning increments the object's embedded count; dropping decrements it and
/// deletes the object when it reaches zero. `P` is the [failure tier] of the
/// object's destructor; only its payload axis applies, as the object is
/// always allocated from [`Global`].
///
/// [`SharedObject`]: ./trait.SharedObject.html
/// [failure tier]: ./trait.FailureTier.html
/// [`Global`]: ./struct.Global.html
pub struct SharedPtr<T, P = NoFail>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    ptr: Option<NonNull<T>>,
    phantom: PhantomData<(Box<T>, P)>,
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, P> Send for SharedPtr<T, P>
where
    T: SharedObject + Send + Sync + ?Sized,
    P: FailureTier,
{
}

#[cfg(feature = "multithreaded")]
unsafe impl<T, P> Sync for SharedPtr<T, P>
where
    T: SharedObject + Send + Sync + ?Sized,
    P: FailureTier,
{
}

impl<T, P> SharedPtr<T, P>
where
    T: SharedObject,
    P: FailureTier,
{
    /// Moves `value` to the heap and adopts its initial count.
    pub fn new(value: T) -> SharedPtr<T, P> {
        expect_alloc(SharedPtr::try_new(value))
    }

    pub fn try_new(value: T) -> Result<SharedPtr<T, P>, AllocError> {
        SharedPtr::try_new_with(|| value)
    }

    /// Allocates, then constructs the object with `f`. If `f` panics, the
    /// memory is released before the panic continues.
    pub fn try_new_with<F>(f: F) -> Result<SharedPtr<T, P>, AllocError>
    where
        F: FnOnce() -> T,
    {
        let raw = RawBox::<T, Global>::allocate(&Global)?;
        unsafe { raw.as_ptr().write(f()) };
        let ptr = raw.transfer();
        debug_assert_eq!(
            unsafe { ptr.as_ref() }.shared_count().get(),
            1,
            "a new shared object must start with a count of one"
        );
        trace!(object = type_name::<T>(), "shared object created");
        Ok(SharedPtr {
            ptr: Some(ptr),
            phantom: PhantomData,
        })
    }

    /// Releases the current object, then points this handle at a new one
    /// holding `value`.
    ///
    /// The handle is empty while `value` is being placed, so a failure in
    /// between leaves it null. The new object is in place even when releasing
    /// the old one failed; that failure is returned.
    pub fn emplace(&mut self, value: T) -> Result<(), ReleaseError> {
        self.emplace_with(|| value)
    }

    pub fn emplace_with<F>(&mut self, f: F) -> Result<(), ReleaseError>
    where
        F: FnOnce() -> T,
    {
        let released = SharedPtr::release(self.take());
        *self = SharedPtr::new(f());
        released
    }
}

impl<T, P> SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    pub fn null() -> SharedPtr<T, P> {
        SharedPtr {
            ptr: None,
            phantom: PhantomData,
        }
    }

    /// Like [`emplace`], for an object of a type that derives from `T`.
    ///
    /// [`emplace`]: ./struct.SharedPtr.html#method.emplace
    pub fn emplace_derived<D>(&mut self, value: D) -> Result<(), ReleaseError>
    where
        D: SharedObject + Derives<T>,
    {
        let released = SharedPtr::release(self.take());
        *self = SharedPtr::<D, P>::new(value).upcast();
        released
    }

    /// Converts to a handle to a base of the object.
    ///
    /// The object is later dropped and deallocated as a `B`, so `B` must be a
    /// trait object the object implements (or `T` itself).
    ///
    /// # Panics
    ///
    /// Panics if the object's size or alignment seen through `B` differs from
    /// its own.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{derives, SharedCount, SharedObject, SharedPtr};
    ///
    /// trait Shape: SharedObject {
    ///     fn area(&self) -> f64;
    /// }
    ///
    /// struct Square(SharedCount, f64);
    ///
    /// unsafe impl SharedObject for Square {
    ///     fn shared_count(&self) -> &SharedCount {
    ///         &self.0
    ///     }
    /// }
    ///
    /// impl Shape for Square {
    ///     fn area(&self) -> f64 {
    ///         self.1 * self.1
    ///     }
    /// }
    ///
    /// derives!(Square: dyn Shape);
    ///
    /// let square: SharedPtr<Square> = SharedPtr::new(Square(SharedCount::new(), 2.0));
    /// let shape: SharedPtr<dyn Shape> = square.upcast();
    /// assert_eq!(shape.get().unwrap().area(), 4.0);
    /// ```
    pub fn upcast<B>(self) -> SharedPtr<B, P>
    where
        B: SharedObject + ?Sized,
        T: Derives<B>,
    {
        if let Some(object) = self.get() {
            let base = <T as Derives<B>>::upcast(object as *const T as *mut T);
            assert_eq!(
                Layout::for_value(unsafe { &*base }),
                Layout::for_value(object),
                "upcast to a base that does not own the whole object"
            );
        }
        match self.into_raw() {
            Some(ptr) => unsafe {
                let base = <T as Derives<B>>::upcast(ptr.as_ptr());
                SharedPtr::from_raw(NonNull::new_unchecked(base))
            },
            None => SharedPtr::null(),
        }
    }

    /// Adopts one count unit of the object at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`into_raw`] (or be an object allocated from
    /// [`Global`] with its own layout), and the caller must own the unit it
    /// hands over.
    ///
    /// [`into_raw`]: ./struct.SharedPtr.html#method.into_raw
    /// [`Global`]: ./struct.Global.html
    pub unsafe fn from_raw(ptr: NonNull<T>) -> SharedPtr<T, P> {
        SharedPtr {
            ptr: Some(ptr),
            phantom: PhantomData,
        }
    }

    /// Creates a new handle to an object already owned by another handle,
    /// incrementing its count.
    ///
    /// # Safety
    ///
    /// `object` must be owned by a live `SharedPtr` with the same tier.
    pub unsafe fn from_object(object: &T) -> SharedPtr<T, P> {
        object.shared_count().add_ref();
        SharedPtr::from_raw(NonNull::from(object))
    }

    /// Gives up the handle without touching the count.
    pub fn into_raw(self) -> Option<NonNull<T>> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// Mutable access when this is the only handle.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.ptr {
            Some(ptr) if self.ref_count() == 1 => Some(unsafe { &mut *ptr.as_ptr() }),
            _ => None,
        }
    }

    /// The object's count, or zero for a null handle.
    pub fn ref_count(&self) -> usize {
        self.get().map_or(0, |object| object.shared_count().get())
    }

    pub fn ptr_eq(&self, other: &SharedPtr<T, P>) -> bool {
        self == other
    }

    /// Leaves this handle null, returning what it held.
    pub fn take(&mut self) -> SharedPtr<T, P> {
        mem::replace(self, SharedPtr::null())
    }

    /// Releases the handle, reporting a destructor failure instead of
    /// panicking with it.
    ///
    /// The memory is freed whether or not the destructor fails.
    pub fn release(this: SharedPtr<T, P>) -> Result<(), ReleaseError> {
        match this.into_raw() {
            Some(ptr) => unsafe { release::<T, P>(ptr) },
            None => Ok(()),
        }
    }
}

/// Drops one unit and deletes the object at zero.
unsafe fn release<T, P>(ptr: NonNull<T>) -> Result<(), ReleaseError>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    if ptr.as_ref().shared_count().release() != 0 {
        return Ok(());
    }

    let layout = Layout::for_value(ptr.as_ref());
    let mut finalizer = Finalizer::<P>::new();
    finalizer.payload(|| ptr::drop_in_place(ptr.as_ptr()));
    Global::deallocate_static(ptr.cast(), layout);
    trace!(object = type_name::<T>(), "shared object deleted");
    finalizer.finish()
}

impl<T, P> Clone for SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    fn clone(&self) -> SharedPtr<T, P> {
        if let Some(object) = self.get() {
            object.shared_count().add_ref();
        }
        SharedPtr {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T, P> Drop for SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            tier::raise(unsafe { release::<T, P>(ptr) });
        }
    }
}

impl<T, P> Default for SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    fn default() -> SharedPtr<T, P> {
        SharedPtr::null()
    }
}

impl<T, P> PartialEq for SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
    fn eq(&self, other: &SharedPtr<T, P>) -> bool {
        let addr = |ptr: Option<NonNull<T>>| ptr.map_or(0, |ptr| address(ptr.as_ptr()));
        addr(self.ptr) == addr(other.ptr)
    }
}

impl<T, P> Eq for SharedPtr<T, P>
where
    T: SharedObject + ?Sized,
    P: FailureTier,
{
}

impl<T, P> Debug for SharedPtr<T, P>
where
    T: SharedObject + Debug + ?Sized,
    P: FailureTier,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self.get() {
            Some(object) => Debug::fmt(object, f),
            None => write!(f, "(null)"),
        }
    }
}
