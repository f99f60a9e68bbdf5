// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Allocator capability and raw-memory ownership.
//!
//! Every envelope and container in this crate is generic over a
//! [`RawAlloc`]. An allocator is either *stateful* (each instance carries
//! data and must travel with the memory it handed out) or *stateless* (all
//! instances are interchangeable). The classification is the associated
//! constant [`RawAlloc::STATELESS`]; stateless allocators additionally
//! implement [`Stateless`], which offers allocation without an instance.
//!
//! An allocator is stored by value next to the memory it manages. A stateless
//! allocator is a zero-sized type, so storing it costs nothing and moving it
//! out before deallocation compiles to nothing: the same code path serves
//! both classes without a runtime branch.
//!
//! [`RawAlloc`]: ./trait.RawAlloc.html
//! [`RawAlloc::STATELESS`]: ./trait.RawAlloc.html#associatedconstant.STATELESS
//! [`Stateless`]: ./trait.Stateless.html

use std::alloc::{self as std_alloc, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use thiserror::Error;

/// The memory allocator failed to satisfy a request.
///
/// # Examples
///
/// ```rust
/// use std::alloc::Layout;
///
/// use envelope::AllocError;
///
/// let error = AllocError::new(Layout::new::<u64>());
/// assert_eq!(error.to_string(), "memory allocation of 8 bytes failed");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory allocation of {} bytes failed", .layout.size())]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    /// Creates an error for a request of the given layout.
    pub fn new(layout: Layout) -> AllocError {
        AllocError { layout }
    }

    /// The layout that could not be allocated.
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// An allocator of untyped memory blocks.
///
/// # Safety
///
/// A block returned by [`allocate`] must be valid for reads and writes of
/// `layout.size()` bytes and aligned to `layout.align()`, and must stay valid
/// until it is passed to [`deallocate`] on this allocator or on any clone or
/// move of it.
///
/// [`allocate`]: ./trait.RawAlloc.html#tymethod.allocate
/// [`deallocate`]: ./trait.RawAlloc.html#tymethod.deallocate
pub unsafe trait RawAlloc: Sized {
    /// Whether all instances of this allocator are interchangeable.
    ///
    /// Defaults to "the type is zero-sized": a value with no data cannot
    /// distinguish itself from another.
    const STATELESS: bool = mem::size_of::<Self>() == 0;

    /// Allocates a block of memory described by `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`] on this allocator (or an
    /// equivalent one) with the same `layout`, and not yet deallocated.
    ///
    /// [`allocate`]: ./trait.RawAlloc.html#tymethod.allocate
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A stateless allocator: a zero-sized token whose allocation functions may be
/// called without a stored instance.
///
/// Implementing this for a type that is not zero-sized fails to compile the
/// first time one of the provided functions is used.
///
/// # Examples
///
/// ```rust
/// use std::alloc::Layout;
///
/// use envelope::{Global, RawAlloc, Stateless};
///
/// assert!(Global::STATELESS);
///
/// let layout = Layout::new::<u32>();
/// let block = Global::allocate_static(layout).unwrap();
/// unsafe { Global::deallocate_static(block, layout) };
/// ```
pub trait Stateless: RawAlloc + Default + Copy {
    #[doc(hidden)]
    const ZERO_SIZED: () = assert!(
        mem::size_of::<Self>() == 0,
        "a stateless allocator must be zero-sized"
    );

    /// Equivalent to `Self::default().allocate(layout)`.
    fn allocate_static(layout: Layout) -> Result<NonNull<u8>, AllocError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::ZERO_SIZED;
        Self::default().allocate(layout)
    }

    /// Equivalent to `Self::default().deallocate(ptr, layout)`.
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::deallocate`].
    ///
    /// [`RawAlloc::deallocate`]: ./trait.RawAlloc.html#tymethod.deallocate
    unsafe fn deallocate_static(ptr: NonNull<u8>, layout: Layout) {
        #[allow(clippy::let_unit_value)]
        let () = Self::ZERO_SIZED;
        Self::default().deallocate(ptr, layout)
    }
}

/// The process-wide allocator registered with `#[global_allocator]` (or the
/// system allocator). This is the default allocator of every type in this
/// crate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Global;

unsafe impl RawAlloc for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            // Zero-sized requests never touch the heap.
            return Ok(dangling(layout));
        }
        NonNull::new(unsafe { std_alloc::alloc(layout) }).ok_or(AllocError::new(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            std_alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

impl Stateless for Global {}

/// A well-aligned, non-null pointer for zero-sized blocks.
fn dangling(layout: Layout) -> NonNull<u8> {
    // The alignment is a nonzero power of two, so this is never null.
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

/// Unwraps an allocation result the way `Box::new` does: an allocation
/// failure is reported to `handle_alloc_error`.
pub(crate) fn expect_alloc<T>(result: Result<T, AllocError>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => std_alloc::handle_alloc_error(error.layout()),
    }
}

/// A smart deallocation pointer: owns uninitialized memory for one `T`
/// obtained from an allocator, and returns it to that allocator when dropped
/// unless ownership is [`transfer`]red first.
///
/// This is how every constructor in this crate guarantees that memory
/// allocated before a payload constructor fails is released exactly once.
///
/// Dropping a `RawBox` never runs a destructor on the memory; it only
/// deallocates it.
///
/// # Examples
///
/// ```rust
/// use envelope::{Global, RawBox};
///
/// let raw = RawBox::<u64, _>::allocate(&Global).unwrap();
/// unsafe { raw.as_ptr().write(17) };
///
/// let ptr = raw.transfer();
/// assert_eq!(unsafe { *ptr.as_ptr() }, 17);
///
/// // The caller now owns the memory and must release it.
/// let raw = unsafe { RawBox::from_raw(ptr, &Global) };
/// drop(raw);
/// ```
///
/// [`transfer`]: ./struct.RawBox.html#method.transfer
pub struct RawBox<'a, T, A>
where
    A: RawAlloc,
{
    ptr: NonNull<T>,
    alloc: &'a A,
    phantom: PhantomData<T>,
}

impl<'a, T, A> RawBox<'a, T, A>
where
    A: RawAlloc,
{
    /// Allocates uninitialized memory for one `T`.
    pub fn allocate(alloc: &'a A) -> Result<RawBox<'a, T, A>, AllocError> {
        let ptr = alloc.allocate(Layout::new::<T>())?;
        Ok(RawBox {
            ptr: ptr.cast(),
            alloc,
            phantom: PhantomData,
        })
    }

    /// Takes ownership of memory previously allocated for one `T`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by `alloc` (or an equivalent allocator)
    /// with `Layout::new::<T>()` and must not be owned by anything else. Any
    /// value stored there will not be dropped.
    pub unsafe fn from_raw(ptr: NonNull<T>, alloc: &'a A) -> RawBox<'a, T, A> {
        RawBox {
            ptr,
            alloc,
            phantom: PhantomData,
        }
    }

    /// The uninitialized memory.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Gives up ownership of the memory without deallocating it.
    pub fn transfer(self) -> NonNull<T> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }
}

impl<'a, T, A> Drop for RawBox<'a, T, A>
where
    A: RawAlloc,
{
    fn drop(&mut self) {
        unsafe {
            self.alloc
                .deallocate(self.ptr.cast(), Layout::new::<T>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingAlloc;

    #[test]
    fn stateless_classification() {
        assert!(Global::STATELESS, "Global was classified as stateful.");
        assert!(
            !CountingAlloc::STATELESS,
            "a counting allocator was classified as stateless."
        );
        assert_eq!(mem::size_of::<Global>(), 0, "Global carries data.");
    }

    #[test]
    fn global_round_trip() {
        let layout = Layout::new::<[u64; 4]>();
        let ptr = Global.allocate(layout).unwrap();
        assert_eq!(
            ptr.as_ptr() as usize % layout.align(),
            0,
            "Global returned a misaligned block."
        );
        unsafe { Global.deallocate(ptr, layout) };
    }

    #[test]
    fn global_zero_sized() {
        let layout = Layout::new::<()>();
        let ptr = Global.allocate(layout).unwrap();
        unsafe { Global.deallocate(ptr, layout) };
    }

    #[test]
    fn raw_box_deallocates_on_drop() {
        let alloc = CountingAlloc::new();
        {
            let _raw = RawBox::<u64, _>::allocate(&alloc).unwrap();
            assert_eq!(alloc.live(), 1, "RawBox did not allocate.");
        }
        assert_eq!(alloc.live(), 0, "RawBox leaked its memory when dropped.");
    }

    #[test]
    fn raw_box_transfer() {
        let alloc = CountingAlloc::new();
        let raw = RawBox::<u64, _>::allocate(&alloc).unwrap();
        let ptr = raw.transfer();
        assert_eq!(
            alloc.live(),
            1,
            "RawBox deallocated memory it had transferred."
        );

        drop(unsafe { RawBox::from_raw(ptr, &alloc) });
        assert_eq!(alloc.live(), 0, "reclaimed RawBox leaked its memory.");
    }

    #[test]
    fn allocation_failure() {
        let alloc = CountingAlloc::new();
        alloc.fail_next();

        let error = RawBox::<u64, _>::allocate(&alloc).err().unwrap();
        assert_eq!(error.layout(), Layout::new::<u64>());
        assert_eq!(alloc.live(), 0, "a failed allocation was counted.");
    }
}
