// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Polymorphic envelopes: a payload of a derived type stored behind a
//! base-typed handle.
//!
//! The base never needs to know how to destroy the derived value. At the
//! moment the derived type is known, the envelope records a destroy operation
//! for that exact type, and every base-typed path that has to destroy the
//! envelope goes through it.
//!
//! There are two flavours, and a handle type always uses exactly one of them:
//!
//! - [`PolyEnvelope`] stores the destroy operation as a plain function pointer
//!   in its header. It is the smaller of the two and cannot be copied.
//! - [`PolyObject`] is a trait object over the whole envelope. Its dispatch
//!   table carries destroy and copy, so copy-on-write handles work with it.
//!
//! "Derived" and "base" are expressed with [`Derives`]: usually the base is a
//! trait object and the [`derives!`] macro declares the relation.
//!
//! [`PolyEnvelope`]: ./struct.PolyEnvelope.html
//! [`PolyObject`]: ./trait.PolyObject.html
//! [`Derives`]: ./trait.Derives.html
//! [`derives!`]: ./macro.derives.html

use std::any::type_name;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use tracing::trace;

use crate::alloc::{expect_alloc, AllocError, RawAlloc, RawBox};
use crate::compare::{address, ByAddress};
use crate::count::RefCount;
use crate::managed::{Duplicate, Managed};

/// `Self` can be viewed as a `B` at the same address.
///
/// Every type derives from itself. A type derives from a trait object it
/// implements once that is declared with [`derives!`]. A `#[repr(C)]` type
/// whose first field is a `B` may implement this by casting the pointer.
///
/// # Safety
///
/// `upcast` must return a pointer to the same address, with the same
/// provenance, that is valid as a `B` for as long as the `Self` is.
///
/// [`derives!`]: ./macro.derives.html
pub unsafe trait Derives<B>
where
    B: ?Sized,
{
    fn upcast(this: *mut Self) -> *mut B;
}

unsafe impl<T> Derives<T> for T {
    fn upcast(this: *mut T) -> *mut T {
        this
    }
}

/// Declares that a type derives from one or more trait objects it implements.
///
/// # Examples
///
/// ```rust
/// use envelope::{derives, Derives};
///
/// trait Named {
///     fn name(&self) -> &str;
/// }
///
/// struct Cat;
///
/// impl Named for Cat {
///     fn name(&self) -> &str {
///         "cat"
///     }
/// }
///
/// derives!(Cat: dyn Named);
///
/// let mut cat = Cat;
/// let named = <Cat as Derives<dyn Named>>::upcast(&mut cat);
/// assert_eq!(unsafe { (*named).name() }, "cat");
/// ```
#[macro_export]
macro_rules! derives {
    ($derived:ty: $($base:ty),+ $(,)?) => {
        $(
            unsafe impl $crate::Derives<$base> for $derived {
                fn upcast(this: *mut Self) -> *mut $base {
                    this
                }
            }
        )+
    };
}

/// The header of an envelope whose payload is a derived type, viewed as a `B`.
///
/// The header sits at the start of a larger block that also holds the
/// allocator and the derived value. It carries the count, a base-typed pointer
/// to the derived value and the destroy operation captured for the derived
/// type when the envelope was created.
///
/// Handles compare these envelopes by address unless another strategy is
/// chosen with `C`.
///
/// # Examples
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use envelope::{derives, Global, ManagedPtr, PolyEnvelope};
///
/// trait Shape {
///     fn area(&self) -> f64;
/// }
///
/// struct Square {
///     side: f64,
///     dropped: Rc<Cell<bool>>,
/// }
///
/// impl Shape for Square {
///     fn area(&self) -> f64 {
///         self.side * self.side
///     }
/// }
///
/// impl Drop for Square {
///     fn drop(&mut self) {
///         self.dropped.set(true);
///     }
/// }
///
/// derives!(Square: dyn Shape);
///
/// let dropped = Rc::new(Cell::new(false));
/// let square = Square { side: 3.0, dropped: Rc::clone(&dropped) };
///
/// let shape: ManagedPtr<PolyEnvelope<dyn Shape>> = ManagedPtr::new_derived(square, Global);
/// assert_eq!(shape.get().unwrap().area(), 9.0);
///
/// drop(shape);
/// assert!(dropped.get());
/// ```
pub struct PolyEnvelope<B, C = ByAddress>
where
    B: ?Sized,
{
    count: RefCount,
    base: NonNull<B>,
    destroy: unsafe fn(NonNull<PolyEnvelope<B, C>>),
    phantom: PhantomData<C>,
}

#[repr(C)]
struct PolyBlock<D, B, A, C>
where
    B: ?Sized,
    A: RawAlloc,
{
    header: PolyEnvelope<B, C>,
    alloc: A,
    value: D,
}

impl<B, C> PolyEnvelope<B, C>
where
    B: ?Sized,
{
    /// Allocates an envelope holding `value`, viewed as a `B`, with a count of
    /// one. Allocation failure is reported through `handle_alloc_error`.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create<D, A>(value: D, alloc: A) -> NonNull<PolyEnvelope<B, C>>
    where
        D: Derives<B>,
        A: RawAlloc,
    {
        expect_alloc(PolyEnvelope::create_with(|| value, alloc))
    }

    /// Allocates an envelope, then constructs the derived payload with `f`.
    /// If `f` panics, the memory is released.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create_with<D, A, F>(f: F, alloc: A) -> Result<NonNull<PolyEnvelope<B, C>>, AllocError>
    where
        D: Derives<B>,
        A: RawAlloc,
        F: FnOnce() -> D,
    {
        let raw = RawBox::<PolyBlock<D, B, A, C>, A>::allocate(&alloc)?;
        let value = f();
        let block = raw.transfer().as_ptr();

        unsafe {
            ptr::addr_of_mut!((*block).alloc).write(alloc);
            let value_ptr = ptr::addr_of_mut!((*block).value);
            value_ptr.write(value);

            let base = D::upcast(value_ptr);
            debug_assert_eq!(
                address(base),
                address(value_ptr),
                "base pointer does not alias the derived value"
            );

            ptr::addr_of_mut!((*block).header).write(PolyEnvelope {
                count: RefCount::new(1),
                base: NonNull::new_unchecked(base),
                destroy: destroy_block::<D, B, A, C>,
                phantom: PhantomData,
            });

            trace!(
                derived = type_name::<D>(),
                base = type_name::<B>(),
                "polymorphic envelope created"
            );
            Ok(NonNull::new_unchecked(block).cast())
        }
    }
}

/// Destroys a `PolyBlock` through its header. Captured per derived type.
unsafe fn destroy_block<D, B, A, C>(header: NonNull<PolyEnvelope<B, C>>)
where
    B: ?Sized,
    A: RawAlloc,
{
    let block = header.cast::<PolyBlock<D, B, A, C>>();
    let raw = block.as_ptr();
    trace!(
        derived = type_name::<D>(),
        base = type_name::<B>(),
        "polymorphic envelope destroyed"
    );

    let alloc = ptr::read(ptr::addr_of!((*raw).alloc));
    let _memory = RawBox::from_raw(block, &alloc);
    ptr::drop_in_place(ptr::addr_of_mut!((*raw).value));
}

unsafe impl<B, C> Managed for PolyEnvelope<B, C>
where
    B: ?Sized,
{
    type Target = B;
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

    fn get(&self) -> &B {
        unsafe { self.base.as_ref() }
    }

    unsafe fn target_ptr(this: NonNull<PolyEnvelope<B, C>>) -> NonNull<B> {
        (*this.as_ptr()).base
    }

    unsafe fn destroy(this: NonNull<PolyEnvelope<B, C>>) {
        let header = this.as_ptr();
        debug_assert_eq!(
            (*header).count.get(),
            0,
            "envelope destroyed while still referenced"
        );
        ((*header).destroy)(this)
    }
}

impl<B, C> Debug for PolyEnvelope<B, C>
where
    B: ?Sized + Debug,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PolyEnvelope")
            .field("count", &self.count)
            .field("value", &self.get())
            .finish()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// The bookkeeping every [`PolyObject`] starts with.
///
/// [`PolyObject`]: ./trait.PolyObject.html
#[doc(hidden)]
pub struct VirtualHeader<B>
where
    B: ?Sized,
{
    count: RefCount,
    base: NonNull<B>,
}

/// An envelope holding some type derived from `B`, with destroy and copy
/// dispatched through a trait object.
///
/// Handles hold a `dyn PolyObject<B>`. Envelopes are created with
/// [`create`] on the trait object type, and can be copied, so copy-on-write
/// handles accept them.
///
/// This trait is sealed.
///
/// # Examples
///
/// ```rust
/// use envelope::{derives, CowPtr, Global, PolyObject};
///
/// trait Counter {
///     fn bump(&mut self);
///     fn total(&self) -> u32;
/// }
///
/// #[derive(Clone)]
/// struct Clicks(u32);
///
/// impl Counter for Clicks {
///     fn bump(&mut self) {
///         self.0 += 1;
///     }
///
///     fn total(&self) -> u32 {
///         self.0
///     }
/// }
///
/// derives!(Clicks: dyn Counter);
///
/// let mut first: CowPtr<dyn PolyObject<dyn Counter>> = CowPtr::new_virtual(Clicks(0), Global);
/// let second = first.clone();
///
/// first.make_mut().unwrap().bump();
///
/// assert_eq!(first.get().unwrap().total(), 1);
/// assert_eq!(second.get().unwrap().total(), 0);
/// ```
///
/// [`create`]: #method.create
pub unsafe trait PolyObject<B>: sealed::Sealed
where
    B: ?Sized,
{
    #[doc(hidden)]
    fn header(&self) -> &VirtualHeader<B>;

    /// The destroy operation for the concrete envelope type; takes the
    /// envelope's address.
    #[doc(hidden)]
    fn destructor(&self) -> unsafe fn(NonNull<u8>);

    #[doc(hidden)]
    fn copy_object(&self) -> Result<NonNull<dyn PolyObject<B>>, AllocError>;
}

struct VirtualBlock<D, B, A>
where
    B: ?Sized,
    A: RawAlloc,
{
    header: VirtualHeader<B>,
    alloc: A,
    value: D,
}

impl<D, B, A> sealed::Sealed for VirtualBlock<D, B, A>
where
    B: ?Sized,
    A: RawAlloc,
{
}

unsafe impl<D, B, A> PolyObject<B> for VirtualBlock<D, B, A>
where
    D: Derives<B> + Clone + 'static,
    B: ?Sized + 'static,
    A: RawAlloc + Clone + 'static,
{
    fn header(&self) -> &VirtualHeader<B> {
        &self.header
    }

    fn destructor(&self) -> unsafe fn(NonNull<u8>) {
        destroy_virtual::<D, B, A>
    }

    fn copy_object(&self) -> Result<NonNull<dyn PolyObject<B>>, AllocError> {
        let copy = <dyn PolyObject<B>>::create_with(|| self.value.clone(), self.alloc.clone())?;
        trace!(derived = type_name::<D>(), "polymorphic envelope copied");
        Ok(copy)
    }
}

unsafe fn destroy_virtual<D, B, A>(ptr: NonNull<u8>)
where
    B: ?Sized,
    A: RawAlloc,
{
    let block = ptr.cast::<VirtualBlock<D, B, A>>();
    let raw = block.as_ptr();
    trace!(derived = type_name::<D>(), "polymorphic envelope destroyed");

    let alloc = ptr::read(ptr::addr_of!((*raw).alloc));
    let _memory = RawBox::from_raw(block, &alloc);
    ptr::drop_in_place(ptr::addr_of_mut!((*raw).value));
}

impl<B> dyn PolyObject<B>
where
    B: ?Sized + 'static,
{
    /// Allocates an envelope holding `value`, viewed as a `B`, with a count of
    /// one. Allocation failure is reported through `handle_alloc_error`.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create<D, A>(value: D, alloc: A) -> NonNull<dyn PolyObject<B>>
    where
        D: Derives<B> + Clone + 'static,
        A: RawAlloc + Clone + 'static,
    {
        expect_alloc(<dyn PolyObject<B>>::create_with(|| value, alloc))
    }

    /// Allocates an envelope, then constructs the derived payload with `f`.
    /// If `f` panics, the memory is released.
    #[must_use = "the returned envelope leaks unless it is adopted by a handle or destroyed"]
    pub fn create_with<D, A, F>(f: F, alloc: A) -> Result<NonNull<dyn PolyObject<B>>, AllocError>
    where
        D: Derives<B> + Clone + 'static,
        A: RawAlloc + Clone + 'static,
        F: FnOnce() -> D,
    {
        let raw = RawBox::<VirtualBlock<D, B, A>, A>::allocate(&alloc)?;
        let value = f();
        let block = raw.transfer().as_ptr();

        unsafe {
            ptr::addr_of_mut!((*block).alloc).write(alloc);
            let value_ptr = ptr::addr_of_mut!((*block).value);
            value_ptr.write(value);

            let base = D::upcast(value_ptr);
            debug_assert_eq!(
                address(base),
                address(value_ptr),
                "base pointer does not alias the derived value"
            );

            ptr::addr_of_mut!((*block).header).write(VirtualHeader {
                count: RefCount::new(1),
                base: NonNull::new_unchecked(base),
            });

            trace!(
                derived = type_name::<D>(),
                base = type_name::<B>(),
                "polymorphic envelope created"
            );
            Ok(NonNull::new_unchecked(block as *mut dyn PolyObject<B>))
        }
    }
}

unsafe impl<B> Managed for dyn PolyObject<B>
where
    B: ?Sized + 'static,
{
    type Target = B;
    type Compare = ByAddress;

    fn add_ref(&self) -> usize {
        self.header().count.inc()
    }

    fn release(&self) -> usize {
        self.header().count.dec()
    }

    fn ref_count(&self) -> usize {
        self.header().count.get()
    }

    fn get(&self) -> &B {
        unsafe { self.header().base.as_ref() }
    }

    unsafe fn target_ptr(this: NonNull<dyn PolyObject<B>>) -> NonNull<B> {
        this.as_ref().header().base
    }

    unsafe fn destroy(this: NonNull<dyn PolyObject<B>>) {
        let destructor = {
            let object = this.as_ref();
            debug_assert_eq!(
                object.header().count.get(),
                0,
                "envelope destroyed while still referenced"
            );
            object.destructor()
        };
        destructor(this.cast())
    }
}

unsafe impl<B> Duplicate for dyn PolyObject<B>
where
    B: ?Sized + 'static,
{
    fn copy(&self) -> Result<NonNull<dyn PolyObject<B>>, AllocError> {
        self.copy_object()
    }
}
