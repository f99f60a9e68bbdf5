// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The managed envelope: one heap block holding a reference count, the
//! allocator that produced the block, and a payload.
//!
//! Envelopes are handed out as raw [`NonNull`] pointers with a count of one,
//! and are normally adopted straight away by a handle such as [`ManagedPtr`]
//! or [`ManagedRef`]. The handles talk to envelopes only through the
//! [`Managed`] and [`Duplicate`] traits, which the polymorphic envelopes
//! implement as well.
//!
//! [`NonNull`]: https://doc.rust-lang.org/std/ptr/struct.NonNull.html
//! [`ManagedPtr`]: ./struct.ManagedPtr.html
//! [`ManagedRef`]: ./struct.ManagedRef.html
//! [`Managed`]: ./trait.Managed.html
//! [`Duplicate`]: ./trait.Duplicate.html

use std::alloc::Layout;
use std::any::type_name;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use tracing::trace;

use crate::alloc::{expect_alloc, AllocError, Global, RawAlloc, RawBox};
use crate::compare::ByValue;
use crate::count::RefCount;
use crate::error::CreateError;

/// A reference-counted block that knows how to destroy itself.
///
/// # Safety
///
/// Implementors guarantee that:
///
/// - `add_ref` and `release` adjust one shared count and return its new value;
/// - `get` and `target_ptr` refer to the same payload for as long as the count
///   is nonzero;
/// - `destroy` drops the payload and returns the block's memory to the
///   allocator it came from, using nothing but the block itself.
pub unsafe trait Managed {
    /// The payload type handles expose.
    type Target: ?Sized;

    /// How handles to this envelope compare: [`ByValue`] or [`ByAddress`].
    ///
    /// [`ByValue`]: ./enum.ByValue.html
    /// [`ByAddress`]: ./enum.ByAddress.html
    type Compare;

    /// Increments the count and returns the new value.
    fn add_ref(&self) -> usize;

    /// Decrements the count and returns the new value. Reaching zero does not
    /// destroy anything; the caller decides.
    fn release(&self) -> usize;

    fn ref_count(&self) -> usize;

    fn get(&self) -> &Self::Target;

    /// A pointer to the payload, valid for writes.
    ///
    /// # Safety
    ///
    /// `this` must point to a live envelope. Writing through the result is
    /// only sound while the caller holds the only reference.
    unsafe fn target_ptr(this: NonNull<Self>) -> NonNull<Self::Target>;

    /// Drops the payload and frees the envelope.
    ///
    /// # Safety
    ///
    /// `this` must point to a live envelope whose count a call to `release`
    /// has just brought to zero. The envelope must not be used afterwards.
    unsafe fn destroy(this: NonNull<Self>);
}

/// An envelope that can copy itself for copy-on-write.
///
/// # Safety
///
/// `copy` must return a new envelope with a count of one holding an
/// independent copy of the payload.
pub unsafe trait Duplicate: Managed {
    fn copy(&self) -> Result<NonNull<Self>, AllocError>;
}

/// An envelope holding a `T` allocated from an `A`, compared by `C`.
///
/// The allocator is stored inline. A stateless allocator such as [`Global`]
/// is zero-sized, so an `Envelope<T>` is exactly a count plus a `T`.
///
/// # Examples
///
/// ```rust
/// use envelope::{Envelope, Global, Managed};
///
/// let ptr = Envelope::<_>::create(42, Global);
/// let envelope = unsafe { ptr.as_ref() };
///
/// assert_eq!(*envelope.get(), 42);
/// assert_eq!(envelope.ref_count(), 1);
///
/// assert_eq!(envelope.add_ref(), 2);
/// assert_eq!(envelope.release(), 1);
///
/// if envelope.release() == 0 {
///     unsafe { Envelope::destroy(ptr) };
/// }
/// ```
///
/// [`Global`]: ./struct.Global.html
pub struct Envelope<T, A = Global, C = ByValue>
where
    A: RawAlloc,
{
    count: RefCount,
    alloc: A,
    value: T,
    phantom: PhantomData<C>,
}

impl<T, A, C> Envelope<T, A, C>
where
    A: RawAlloc,
{
    /// Allocates an envelope holding `value`, with a count of one.
    ///
    /// Allocation failure is reported through [`handle_alloc_error`], as
    /// `Box::new` does. See [`try_create`] for a fallible version.
    ///
    /// [`handle_alloc_error`]: https://doc.rust-lang.org/std/alloc/fn.handle_alloc_error.html
    /// [`try_create`]: ./struct.Envelope.html#method.try_create
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create(value: T, alloc: A) -> NonNull<Envelope<T, A, C>> {
        expect_alloc(Envelope::try_create(value, alloc))
    }

    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn try_create(value: T, alloc: A) -> Result<NonNull<Envelope<T, A, C>>, AllocError> {
        Envelope::create_with(|| value, alloc)
    }

    /// Allocates an envelope, then constructs its payload with `f`.
    ///
    /// If `f` panics, the memory is returned to `alloc` before the panic
    /// continues and no payload destructor runs.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{Envelope, Global, Managed};
    ///
    /// let ptr = Envelope::<_>::create_with(|| vec![1, 2, 3], Global).unwrap();
    /// let envelope = unsafe { ptr.as_ref() };
    /// assert_eq!(envelope.get().len(), 3);
    ///
    /// assert_eq!(envelope.release(), 0);
    /// unsafe { Envelope::destroy(ptr) };
    /// ```
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create_with<F>(f: F, alloc: A) -> Result<NonNull<Envelope<T, A, C>>, AllocError>
    where
        F: FnOnce() -> T,
    {
        let raw = RawBox::<Envelope<T, A, C>, A>::allocate(&alloc)?;
        let value = f();
        Ok(unsafe { Envelope::init(raw.transfer(), value, alloc) })
    }

    /// Like [`create_with`], for payload constructors that can fail.
    ///
    /// [`create_with`]: ./struct.Envelope.html#method.create_with
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn try_create_with<F, E>(f: F, alloc: A) -> Result<NonNull<Envelope<T, A, C>>, CreateError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let raw = RawBox::<Envelope<T, A, C>, A>::allocate(&alloc)?;
        let value = f().map_err(CreateError::Construct)?;
        Ok(unsafe { Envelope::init(raw.transfer(), value, alloc) })
    }

    /// Allocates memory for an envelope without constructing the payload.
    ///
    /// See [`Reservation`].
    ///
    /// [`Reservation`]: ./struct.Reservation.html
    pub fn reserve(alloc: A) -> Result<Reservation<T, A, C>, AllocError> {
        let raw = RawBox::<Envelope<T, A, C>, A>::allocate(&alloc)?;
        Ok(Reservation {
            ptr: raw.transfer(),
            alloc,
        })
    }

    /// The allocator this envelope was allocated from.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Allocates a new envelope holding a clone of the payload, from a clone
    /// of this envelope's allocator. The copy starts with a count of one.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn copy(&self) -> Result<NonNull<Envelope<T, A, C>>, AllocError>
    where
        T: Clone,
        A: Clone,
    {
        let copy = Envelope::create_with(|| self.value.clone(), self.alloc.clone())?;
        trace!(payload = type_name::<T>(), "envelope copied");
        Ok(copy)
    }

    /// Writes the header and payload into freshly allocated memory.
    unsafe fn init(ptr: NonNull<Envelope<T, A, C>>, value: T, alloc: A) -> NonNull<Envelope<T, A, C>> {
        ptr.as_ptr().write(Envelope {
            count: RefCount::new(1),
            alloc,
            value,
            phantom: PhantomData,
        });
        trace!(payload = type_name::<T>(), "envelope created");
        ptr
    }
}

unsafe impl<T, A, C> Managed for Envelope<T, A, C>
where
    A: RawAlloc,
{
    type Target = T;
    type Compare = C;

    fn add_ref(&self) -> usize {
        self.count.inc()
    }

    fn release(&self) -> usize {
        self.count.dec()
    }

    fn ref_count(&self) -> usize {
        self.count.get()
    }

    fn get(&self) -> &T {
        &self.value
    }

    unsafe fn target_ptr(this: NonNull<Envelope<T, A, C>>) -> NonNull<T> {
        NonNull::new_unchecked(ptr::addr_of_mut!((*this.as_ptr()).value))
    }

    unsafe fn destroy(this: NonNull<Envelope<T, A, C>>) {
        let raw = this.as_ptr();
        debug_assert_eq!(
            (*raw).count.get(),
            0,
            "envelope destroyed while still referenced"
        );
        trace!(payload = type_name::<T>(), "envelope destroyed");

        // The memory is returned even if the payload's destructor panics.
        let alloc = ptr::read(ptr::addr_of!((*raw).alloc));
        let _memory = RawBox::from_raw(this, &alloc);
        ptr::drop_in_place(ptr::addr_of_mut!((*raw).value));
    }
}

unsafe impl<T, A, C> Duplicate for Envelope<T, A, C>
where
    T: Clone,
    A: RawAlloc + Clone,
{
    fn copy(&self) -> Result<NonNull<Envelope<T, A, C>>, AllocError> {
        Envelope::copy(self)
    }
}

impl<T, A, C> Debug for Envelope<T, A, C>
where
    T: Debug,
    A: RawAlloc,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("Envelope")
            .field("count", &self.count)
            .field("value", &self.value)
            .finish()
    }
}

/// Envelope memory whose payload has not been constructed yet.
///
/// This is the two-phase path for payloads that cannot be produced as a
/// single value first, for example ones initialized field by field through
/// [`value_ptr`]. Dropping an unfinished reservation returns the memory and
/// runs no destructor.
///
/// # Examples
///
/// ```rust
/// use std::ptr;
///
/// use envelope::{Envelope, Global, Managed};
///
/// struct Pair {
///     left: u32,
///     right: u32,
/// }
///
/// let mut reservation = Envelope::<Pair>::reserve(Global).unwrap();
/// let pair = reservation.value_ptr();
/// let ptr = unsafe {
///     ptr::addr_of_mut!((*pair).left).write(1);
///     ptr::addr_of_mut!((*pair).right).write(2);
///     reservation.assume_init()
/// };
///
/// let envelope = unsafe { ptr.as_ref() };
/// assert_eq!(envelope.get().left + envelope.get().right, 3);
///
/// assert_eq!(envelope.release(), 0);
/// unsafe { Envelope::destroy(ptr) };
/// ```
///
/// [`value_ptr`]: ./struct.Reservation.html#method.value_ptr
pub struct Reservation<T, A = Global, C = ByValue>
where
    A: RawAlloc,
{
    ptr: NonNull<Envelope<T, A, C>>,
    alloc: A,
}

impl<T, A, C> Reservation<T, A, C>
where
    A: RawAlloc,
{
    /// Uninitialized storage for the payload.
    pub fn value_ptr(&mut self) -> *mut T {
        unsafe { ptr::addr_of_mut!((*self.ptr.as_ptr()).value) }
    }

    /// Stores `value` and finishes the envelope.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn write(mut self, value: T) -> NonNull<Envelope<T, A, C>> {
        unsafe {
            self.value_ptr().write(value);
            self.assume_init()
        }
    }

    /// Constructs the payload with `f` and finishes the envelope. If `f`
    /// panics the memory is released.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn init_with<F>(self, f: F) -> NonNull<Envelope<T, A, C>>
    where
        F: FnOnce() -> T,
    {
        let value = f();
        self.write(value)
    }

    /// Finishes an envelope whose payload was written through [`value_ptr`].
    ///
    /// # Safety
    ///
    /// The payload must be fully initialized.
    ///
    /// [`value_ptr`]: ./struct.Reservation.html#method.value_ptr
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub unsafe fn assume_init(self) -> NonNull<Envelope<T, A, C>> {
        let this = ManuallyDrop::new(self);
        let raw = this.ptr.as_ptr();
        ptr::addr_of_mut!((*raw).count).write(RefCount::new(1));
        ptr::addr_of_mut!((*raw).alloc).write(ptr::read(&this.alloc));
        trace!(payload = type_name::<T>(), "envelope created in place");
        this.ptr
    }
}

impl<T, A, C> Drop for Reservation<T, A, C>
where
    A: RawAlloc,
{
    fn drop(&mut self) {
        unsafe {
            self.alloc
                .deallocate(self.ptr.cast(), Layout::new::<Envelope<T, A, C>>());
        }
    }
}
