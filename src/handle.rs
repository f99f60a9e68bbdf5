// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Handles to managed envelopes.
//!
//! A handle holds one unit of its envelope's count. Cloning a handle adds a
//! reference, dropping it releases one, and the release that brings the count
//! to zero destroys the envelope through the envelope itself.
//!
//! [`ManagedPtr`] may be null and rebinds on assignment, like a pointer.
//! [`ManagedRef`] always refers to an envelope and assigns values *through* to
//! the payload, like a reference.
//!
//! Both kinds take a `const COW: bool` parameter. With copy-on-write enabled
//! (the [`CowPtr`] and [`CowRef`] aliases) a mutable access first makes sure
//! the handle's envelope is not shared, copying it when it is.
//!
//! [`ManagedPtr`]: ./struct.ManagedPtr.html
//! [`ManagedRef`]: ./struct.ManagedRef.html
//! [`CowPtr`]: ./type.CowPtr.html
//! [`CowRef`]: ./type.CowRef.html

use std::any::type_name;
use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter, Pointer, Result as FmtResult};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::alloc::{expect_alloc, AllocError, RawAlloc};
use crate::compare::{address, CompareEq, CompareHash, CompareOrd};
use crate::error::Error;
use crate::managed::{Duplicate, Envelope, Managed};
use crate::poly::{Derives, PolyEnvelope, PolyObject};

/// A nullable handle that copies its envelope before mutable access when the
/// envelope is shared.
pub type CowPtr<E> = ManagedPtr<E, true>;

/// An always-populated handle that copies its envelope before mutable access
/// when the envelope is shared.
pub type CowRef<E> = ManagedRef<E, true>;

/// Releases one reference, destroying the envelope when it was the last.
unsafe fn release<E>(ptr: NonNull<E>)
where
    E: Managed + ?Sized,
{
    if ptr.as_ref().release() == 0 {
        E::destroy(ptr);
    }
}

/// Replaces a shared envelope with a private copy.
unsafe fn make_unique<E>(slot: &mut NonNull<E>) -> Result<(), AllocError>
where
    E: Duplicate + ?Sized,
{
    if slot.as_ref().ref_count() > 1 {
        let copy = slot.as_ref().copy()?;
        debug!(
            payload = type_name::<E::Target>(),
            "copy-on-write duplicated a shared envelope"
        );
        release(mem::replace(slot, copy));
    }
    Ok(())
}

unsafe fn target_mut<'a, E>(ptr: NonNull<E>) -> &'a mut E::Target
where
    E: Managed + ?Sized,
{
    &mut *E::target_ptr(ptr).as_ptr()
}

/// Stores `value` in the envelope. A shared envelope is left alone: a
/// copy-on-write handle moves to a fresh envelope, any other handle gets the
/// value back.
unsafe fn assign<T, A, C, const COW: bool>(
    slot: &mut NonNull<Envelope<T, A, C>>,
    value: T,
) -> Result<(), T>
where
    A: RawAlloc + Clone,
{
    let envelope = slot.as_ref();
    if envelope.ref_count() == 1 {
        *target_mut(*slot) = value;
        Ok(())
    } else if COW {
        let fresh = Envelope::create(value, envelope.allocator().clone());
        debug!(
            payload = type_name::<T>(),
            "copy-on-write assignment detached from a shared envelope"
        );
        release(mem::replace(slot, fresh));
        Ok(())
    } else {
        Err(value)
    }
}

/// A nullable, reference-counted handle to a managed envelope.
///
/// Assigning a `ManagedPtr` rebinds it to another envelope. Comparisons follow
/// the envelope's comparison strategy; two null handles are equal, and a null
/// handle orders before any populated one.
///
/// # Examples
///
/// ```rust
/// use envelope::{Envelope, ManagedPtr};
///
/// let five: ManagedPtr<Envelope<i32>> = ManagedPtr::new(5);
/// let also_five = five.clone();
///
/// assert_eq!(five.get(), Some(&5));
/// assert_eq!(five.ref_count(), 2);
/// assert!(five.ptr_eq(&also_five));
///
/// let nothing: ManagedPtr<Envelope<i32>> = ManagedPtr::null();
/// assert!(nothing.is_null());
/// assert!(nothing < five);
/// ```
pub struct ManagedPtr<E, const COW: bool = false>
where
    E: Managed + ?Sized,
{
    ptr: Option<NonNull<E>>,
    phantom: PhantomData<E>,
}

#[cfg(feature = "multithreaded")]
unsafe impl<E, const COW: bool> Send for ManagedPtr<E, COW> where E: Managed + ?Sized + Send + Sync {}

#[cfg(feature = "multithreaded")]
unsafe impl<E, const COW: bool> Sync for ManagedPtr<E, COW> where E: Managed + ?Sized + Send + Sync {}

impl<E, const COW: bool> ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    /// A handle to nothing.
    pub fn null() -> ManagedPtr<E, COW> {
        ManagedPtr {
            ptr: None,
            phantom: PhantomData,
        }
    }

    /// Adopts an envelope without changing its count, as returned by
    /// `Envelope::create` or [`into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live envelope, and one unit of its count must
    /// belong to nobody else.
    ///
    /// [`into_raw`]: ./struct.ManagedPtr.html#method.into_raw
    pub unsafe fn from_raw(ptr: NonNull<E>) -> ManagedPtr<E, COW> {
        ManagedPtr {
            ptr: Some(ptr),
            phantom: PhantomData,
        }
    }

    /// Adds a reference to an envelope and returns a handle holding it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live envelope.
    pub unsafe fn from_raw_shared(ptr: NonNull<E>) -> ManagedPtr<E, COW> {
        ptr.as_ref().add_ref();
        ManagedPtr::from_raw(ptr)
    }

    /// Gives up the handle's reference without releasing it.
    pub fn into_raw(self) -> Option<NonNull<E>> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn as_raw(&self) -> Option<NonNull<E>> {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&E::Target> {
        self.ptr.map(|ptr| unsafe { ptr.as_ref() }.get())
    }

    /// The envelope's count, or 0 for a null handle.
    pub fn ref_count(&self) -> usize {
        self.ptr.map_or(0, |ptr| unsafe { ptr.as_ref().ref_count() })
    }

    /// Whether both handles refer to the same envelope. Two null handles do.
    pub fn ptr_eq(&self, other: &ManagedPtr<E, COW>) -> bool {
        self.ptr.map(|ptr| address(ptr.as_ptr())) == other.ptr.map(|ptr| address(ptr.as_ptr()))
    }

    /// Mutable access to the payload if this handle is the only one referring
    /// to it. Never copies.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{Envelope, ManagedPtr};
    ///
    /// let mut x: ManagedPtr<Envelope<i32>> = ManagedPtr::new(3);
    /// *x.get_mut().unwrap() = 4;
    /// assert_eq!(x.get(), Some(&4));
    ///
    /// let _y = x.clone();
    /// assert!(x.get_mut().is_none());
    /// ```
    pub fn get_mut(&mut self) -> Option<&mut E::Target> {
        let ptr = self.ptr?;
        unsafe {
            if ptr.as_ref().ref_count() == 1 {
                Some(target_mut(ptr))
            } else {
                None
            }
        }
    }

    /// Moves the reference out, leaving a null handle behind.
    pub fn take(&mut self) -> ManagedPtr<E, COW> {
        mem::replace(self, ManagedPtr::null())
    }

    /// Releases the reference and becomes null.
    pub fn reset(&mut self) {
        drop(self.take());
    }
}

impl<E> ManagedPtr<E, true>
where
    E: Duplicate + ?Sized,
{
    /// Mutable access to the payload, copying the envelope first if it is
    /// shared. Returns `None` for a null handle.
    ///
    /// Allocation failure during the copy is reported through
    /// `handle_alloc_error`; see [`try_make_mut`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{CowPtr, Envelope};
    ///
    /// let mut data: CowPtr<Envelope<i32>> = CowPtr::new(5);
    ///
    /// *data.make_mut().unwrap() += 1; // Won't copy anything
    /// let other_data = data.clone(); // Won't copy the payload
    /// *data.make_mut().unwrap() += 1; // Copies the envelope
    /// *data.make_mut().unwrap() += 1; // Won't copy anything
    ///
    /// assert_eq!(data.get(), Some(&8));
    /// assert_eq!(other_data.get(), Some(&6));
    /// ```
    ///
    /// [`try_make_mut`]: ./struct.ManagedPtr.html#method.try_make_mut
    pub fn make_mut(&mut self) -> Option<&mut E::Target> {
        let slot = self.ptr.as_mut()?;
        unsafe {
            expect_alloc(make_unique(slot));
            Some(target_mut(*slot))
        }
    }

    pub fn try_make_mut(&mut self) -> Result<&mut E::Target, Error> {
        let slot = self.ptr.as_mut().ok_or(Error::Null)?;
        unsafe {
            make_unique(slot)?;
            Ok(target_mut(*slot))
        }
    }
}

impl<T, A, C, const COW: bool> ManagedPtr<Envelope<T, A, C>, COW>
where
    A: RawAlloc,
{
    /// Creates a handle to a fresh envelope holding `value`.
    pub fn new(value: T) -> ManagedPtr<Envelope<T, A, C>, COW>
    where
        A: Default,
    {
        ManagedPtr::new_in(value, A::default())
    }

    pub fn new_in(value: T, alloc: A) -> ManagedPtr<Envelope<T, A, C>, COW> {
        unsafe { ManagedPtr::from_raw(Envelope::create(value, alloc)) }
    }

    pub fn try_new_in(value: T, alloc: A) -> Result<ManagedPtr<Envelope<T, A, C>, COW>, AllocError> {
        Ok(unsafe { ManagedPtr::from_raw(Envelope::try_create(value, alloc)?) })
    }

    /// Points the handle at a fresh envelope holding `value`. The new envelope
    /// is built before the old reference is released, so a failed
    /// construction leaves the handle as it was.
    pub fn create(&mut self, value: T)
    where
        A: Default,
    {
        *self = ManagedPtr::new(value);
    }

    /// Like [`create`], constructing the payload with `f` once memory for it
    /// has been allocated.
    ///
    /// [`create`]: ./struct.ManagedPtr.html#method.create
    pub fn create_with<F>(&mut self, f: F)
    where
        A: Default,
        F: FnOnce() -> T,
    {
        let ptr = expect_alloc(Envelope::create_with(f, A::default()));
        *self = unsafe { ManagedPtr::from_raw(ptr) };
    }

    /// Stores `value` in the referenced envelope.
    ///
    /// If the envelope is shared, a copy-on-write handle moves to a fresh
    /// envelope holding `value` and leaves the other handles untouched. Any
    /// other handle refuses and returns the value. A null handle always
    /// returns the value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{CowPtr, Envelope, ManagedPtr};
    ///
    /// let mut plain: ManagedPtr<Envelope<&str>> = ManagedPtr::new("a");
    /// assert_eq!(plain.set("b"), Ok(()));
    /// let _other = plain.clone();
    /// assert_eq!(plain.set("c"), Err("c"));
    ///
    /// let mut cow: CowPtr<Envelope<&str>> = CowPtr::new("a");
    /// let other = cow.clone();
    /// assert_eq!(cow.set("b"), Ok(()));
    /// assert_eq!(cow.get(), Some(&"b"));
    /// assert_eq!(other.get(), Some(&"a"));
    /// ```
    pub fn set(&mut self, value: T) -> Result<(), T>
    where
        A: Clone,
    {
        match self.ptr.as_mut() {
            Some(slot) => unsafe { assign::<T, A, C, COW>(slot, value) },
            None => Err(value),
        }
    }
}

impl<B, C, const COW: bool> ManagedPtr<PolyEnvelope<B, C>, COW>
where
    B: ?Sized,
{
    /// Creates a base-typed handle to a fresh envelope holding a derived
    /// value. See [`PolyEnvelope`].
    ///
    /// [`PolyEnvelope`]: ./struct.PolyEnvelope.html
    pub fn new_derived<D, A>(value: D, alloc: A) -> ManagedPtr<PolyEnvelope<B, C>, COW>
    where
        D: Derives<B>,
        A: RawAlloc,
    {
        unsafe { ManagedPtr::from_raw(PolyEnvelope::create(value, alloc)) }
    }
}

impl<B, const COW: bool> ManagedPtr<dyn PolyObject<B>, COW>
where
    B: ?Sized + 'static,
{
    /// Creates a base-typed handle to a fresh envelope holding a derived
    /// value, destroyed and copied through a trait object. See
    /// [`PolyObject`].
    ///
    /// [`PolyObject`]: ./trait.PolyObject.html
    pub fn new_virtual<D, A>(value: D, alloc: A) -> ManagedPtr<dyn PolyObject<B>, COW>
    where
        D: Derives<B> + Clone + 'static,
        A: RawAlloc + Clone + 'static,
    {
        unsafe { ManagedPtr::from_raw(<dyn PolyObject<B>>::create(value, alloc)) }
    }
}

impl<E, const COW: bool> Clone for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    fn clone(&self) -> ManagedPtr<E, COW> {
        match self.ptr {
            Some(ptr) => unsafe { ManagedPtr::from_raw_shared(ptr) },
            None => ManagedPtr::null(),
        }
    }

    fn clone_from(&mut self, source: &ManagedPtr<E, COW>) {
        if !self.ptr_eq(source) {
            *self = source.clone();
        }
    }
}

impl<E, const COW: bool> Drop for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            unsafe { release(ptr) };
        }
    }
}

impl<E, const COW: bool> Default for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    fn default() -> ManagedPtr<E, COW> {
        ManagedPtr::null()
    }
}

impl<E, const COW: bool> From<ManagedRef<E, COW>> for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    fn from(reference: ManagedRef<E, COW>) -> ManagedPtr<E, COW> {
        unsafe { ManagedPtr::from_raw(ManagedRef::into_raw(reference)) }
    }
}

impl<E, const COW: bool> PartialEq for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareEq<E::Target>,
{
    fn eq(&self, other: &ManagedPtr<E, COW>) -> bool {
        match (self.get(), other.get()) {
            (Some(a), Some(b)) => <E::Compare as CompareEq<E::Target>>::eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<E, const COW: bool> PartialOrd for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareOrd<E::Target>,
{
    fn partial_cmp(&self, other: &ManagedPtr<E, COW>) -> Option<Ordering> {
        match (self.get(), other.get()) {
            (Some(a), Some(b)) => <E::Compare as CompareOrd<E::Target>>::partial_cmp(a, b),
            (None, None) => Some(Ordering::Equal),
            (None, Some(_)) => Some(Ordering::Less),
            (Some(_), None) => Some(Ordering::Greater),
        }
    }
}

impl<E, const COW: bool> Eq for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareHash<E::Target>,
{
}

impl<E, const COW: bool> Hash for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareHash<E::Target>,
{
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self.get() {
            Some(value) => {
                state.write_u8(1);
                <E::Compare as CompareHash<E::Target>>::hash(value, state);
            }
            None => state.write_u8(0),
        }
    }
}

impl<E, const COW: bool> Pointer for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self.get() {
            Some(value) => write!(f, "{:p}", value),
            None => Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

impl<E, const COW: bool> Debug for ManagedPtr<E, COW>
where
    E: Managed + ?Sized,
    E::Target: Debug,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self.get() {
            Some(value) => Debug::fmt(value, f),
            None => write!(f, "(null)"),
        }
    }
}

/// An always-populated, reference-counted handle to a managed envelope.
///
/// A `ManagedRef` behaves like a reference: [`set`] stores a value *through*
/// the handle into its envelope, instead of rebinding the handle. Rebinding
/// is explicit ([`set_object`], `clone_from`, or plain assignment of another
/// handle).
///
/// Like [`Rc`], the handle dereferences to the payload, so its own
/// operations are associated functions: `ManagedRef::ref_count(&r)`.
///
/// # Examples
///
/// ```rust
/// use envelope::{CowRef, Envelope};
///
/// let mut first: CowRef<Envelope<String>> = CowRef::new(String::from("ab"));
/// let second = first.clone();
///
/// CowRef::make_mut(&mut first).push('c');
///
/// assert_eq!(*first, "abc");
/// assert_eq!(*second, "ab");
/// assert_eq!(CowRef::ref_count(&second), 1);
/// ```
///
/// [`set`]: ./struct.ManagedRef.html#method.set
/// [`set_object`]: ./struct.ManagedRef.html#method.set_object
/// [`Rc`]: https://doc.rust-lang.org/std/rc/struct.Rc.html
pub struct ManagedRef<E, const COW: bool = false>
where
    E: Managed + ?Sized,
{
    ptr: NonNull<E>,
    phantom: PhantomData<E>,
}

#[cfg(feature = "multithreaded")]
unsafe impl<E, const COW: bool> Send for ManagedRef<E, COW> where E: Managed + ?Sized + Send + Sync {}

#[cfg(feature = "multithreaded")]
unsafe impl<E, const COW: bool> Sync for ManagedRef<E, COW> where E: Managed + ?Sized + Send + Sync {}

impl<E, const COW: bool> ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    /// Adopts an envelope without changing its count.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live envelope, and one unit of its count must
    /// belong to nobody else.
    pub unsafe fn from_raw(ptr: NonNull<E>) -> ManagedRef<E, COW> {
        ManagedRef {
            ptr,
            phantom: PhantomData,
        }
    }

    /// Gives up the handle's reference without releasing it.
    pub fn into_raw(this: ManagedRef<E, COW>) -> NonNull<E> {
        let ptr = this.ptr;
        mem::forget(this);
        ptr
    }

    pub fn as_raw(this: &ManagedRef<E, COW>) -> NonNull<E> {
        this.ptr
    }

    /// Takes over the reference held by a nullable handle.
    ///
    /// # Errors
    ///
    /// [`Error::Null`] if `ptr` is null.
    ///
    /// [`Error::Null`]: ./enum.Error.html#variant.Null
    pub fn from_ptr(ptr: ManagedPtr<E, COW>) -> Result<ManagedRef<E, COW>, Error> {
        match ptr.into_raw() {
            Some(raw) => Ok(unsafe { ManagedRef::from_raw(raw) }),
            None => Err(Error::Null),
        }
    }

    /// Rebinds this handle to the envelope `ptr` refers to.
    ///
    /// # Errors
    ///
    /// [`Error::Null`] if `ptr` is null; the handle is left unchanged.
    ///
    /// [`Error::Null`]: ./enum.Error.html#variant.Null
    pub fn set_object(this: &mut ManagedRef<E, COW>, ptr: &ManagedPtr<E, COW>) -> Result<(), Error> {
        let raw = ptr.as_raw().ok_or(Error::Null)?;
        if address(raw.as_ptr()) != address(this.ptr.as_ptr()) {
            *this = unsafe {
                raw.as_ref().add_ref();
                ManagedRef::from_raw(raw)
            };
        }
        Ok(())
    }

    pub fn ref_count(this: &ManagedRef<E, COW>) -> usize {
        unsafe { this.ptr.as_ref().ref_count() }
    }

    pub fn ptr_eq(this: &ManagedRef<E, COW>, other: &ManagedRef<E, COW>) -> bool {
        address(this.ptr.as_ptr()) == address(other.ptr.as_ptr())
    }

    /// Mutable access to the payload if this handle is the only one referring
    /// to it. Never copies.
    pub fn get_mut(this: &mut ManagedRef<E, COW>) -> Option<&mut E::Target> {
        unsafe {
            if this.ptr.as_ref().ref_count() == 1 {
                Some(target_mut(this.ptr))
            } else {
                None
            }
        }
    }
}

impl<E> ManagedRef<E, true>
where
    E: Duplicate + ?Sized,
{
    /// Mutable access to the payload, copying the envelope first if it is
    /// shared. Allocation failure is reported through `handle_alloc_error`.
    pub fn make_mut(this: &mut ManagedRef<E, true>) -> &mut E::Target {
        unsafe {
            expect_alloc(make_unique(&mut this.ptr));
            target_mut(this.ptr)
        }
    }

    pub fn try_make_mut(this: &mut ManagedRef<E, true>) -> Result<&mut E::Target, AllocError> {
        unsafe {
            make_unique(&mut this.ptr)?;
            Ok(target_mut(this.ptr))
        }
    }
}

impl<T, A, C, const COW: bool> ManagedRef<Envelope<T, A, C>, COW>
where
    A: RawAlloc,
{
    pub fn new(value: T) -> ManagedRef<Envelope<T, A, C>, COW>
    where
        A: Default,
    {
        ManagedRef::new_in(value, A::default())
    }

    pub fn new_in(value: T, alloc: A) -> ManagedRef<Envelope<T, A, C>, COW> {
        unsafe { ManagedRef::from_raw(Envelope::create(value, alloc)) }
    }

    pub fn try_new_in(value: T, alloc: A) -> Result<ManagedRef<Envelope<T, A, C>, COW>, AllocError> {
        Ok(unsafe { ManagedRef::from_raw(Envelope::try_create(value, alloc)?) })
    }

    /// Rebinds the handle to a fresh envelope holding `value`. The new
    /// envelope is built before the old reference is released.
    pub fn create(this: &mut ManagedRef<Envelope<T, A, C>, COW>, value: T)
    where
        A: Default,
    {
        *this = ManagedRef::new(value);
    }

    /// Stores `value` through the handle into its envelope.
    ///
    /// If the envelope is shared, a copy-on-write handle moves to a fresh
    /// envelope holding `value`; any other handle refuses and returns the
    /// value, since writing would change what the other handles see while
    /// they may be reading it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use envelope::{Envelope, ManagedRef};
    ///
    /// let mut counter: ManagedRef<Envelope<u32>> = ManagedRef::new(1);
    /// let before = ManagedRef::as_raw(&counter);
    ///
    /// ManagedRef::set(&mut counter, 2).unwrap();
    ///
    /// assert_eq!(*counter, 2);
    /// assert_eq!(ManagedRef::as_raw(&counter), before);
    /// ```
    pub fn set(this: &mut ManagedRef<Envelope<T, A, C>, COW>, value: T) -> Result<(), T>
    where
        A: Clone,
    {
        unsafe { assign::<T, A, C, COW>(&mut this.ptr, value) }
    }

    /// Stores a clone of `other`'s payload through this handle, as [`set`]
    /// does.
    ///
    /// [`set`]: ./struct.ManagedRef.html#method.set
    pub fn assign_from(
        this: &mut ManagedRef<Envelope<T, A, C>, COW>,
        other: &ManagedRef<Envelope<T, A, C>, COW>,
    ) -> Result<(), T>
    where
        T: Clone,
        A: Clone,
    {
        if ManagedRef::ptr_eq(this, other) {
            return Ok(());
        }
        ManagedRef::set(this, (**other).clone())
    }
}

impl<B, C, const COW: bool> ManagedRef<PolyEnvelope<B, C>, COW>
where
    B: ?Sized,
{
    /// Creates a base-typed handle to a fresh envelope holding a derived
    /// value. See [`PolyEnvelope`].
    ///
    /// [`PolyEnvelope`]: ./struct.PolyEnvelope.html
    pub fn new_derived<D, A>(value: D, alloc: A) -> ManagedRef<PolyEnvelope<B, C>, COW>
    where
        D: Derives<B>,
        A: RawAlloc,
    {
        unsafe { ManagedRef::from_raw(PolyEnvelope::create(value, alloc)) }
    }
}

impl<B, const COW: bool> ManagedRef<dyn PolyObject<B>, COW>
where
    B: ?Sized + 'static,
{
    /// Creates a base-typed handle to a fresh envelope holding a derived
    /// value, destroyed and copied through a trait object.
    pub fn new_virtual<D, A>(value: D, alloc: A) -> ManagedRef<dyn PolyObject<B>, COW>
    where
        D: Derives<B> + Clone + 'static,
        A: RawAlloc + Clone + 'static,
    {
        unsafe { ManagedRef::from_raw(<dyn PolyObject<B>>::create(value, alloc)) }
    }
}

impl<E, const COW: bool> Clone for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    fn clone(&self) -> ManagedRef<E, COW> {
        unsafe {
            self.ptr.as_ref().add_ref();
            ManagedRef::from_raw(self.ptr)
        }
    }

    fn clone_from(&mut self, source: &ManagedRef<E, COW>) {
        if !ManagedRef::ptr_eq(self, source) {
            *self = source.clone();
        }
    }
}

impl<E, const COW: bool> Drop for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    fn drop(&mut self) {
        unsafe { release(self.ptr) };
    }
}

impl<T, A, C, const COW: bool> Default for ManagedRef<Envelope<T, A, C>, COW>
where
    T: Default,
    A: RawAlloc + Default,
{
    fn default() -> ManagedRef<Envelope<T, A, C>, COW> {
        ManagedRef::new(T::default())
    }
}

impl<E, const COW: bool> Deref for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    type Target = E::Target;

    fn deref(&self) -> &E::Target {
        unsafe { self.ptr.as_ref() }.get()
    }
}

impl<E, const COW: bool> AsRef<E::Target> for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    fn as_ref(&self) -> &E::Target {
        self
    }
}

impl<E, const COW: bool> PartialEq for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareEq<E::Target>,
{
    fn eq(&self, other: &ManagedRef<E, COW>) -> bool {
        <E::Compare as CompareEq<E::Target>>::eq(&**self, &**other)
    }
}

impl<E, const COW: bool> PartialOrd for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareOrd<E::Target>,
{
    fn partial_cmp(&self, other: &ManagedRef<E, COW>) -> Option<Ordering> {
        <E::Compare as CompareOrd<E::Target>>::partial_cmp(&**self, &**other)
    }
}

impl<E, const COW: bool> Eq for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareHash<E::Target>,
{
}

impl<E, const COW: bool> Hash for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Compare: CompareHash<E::Target>,
{
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        <E::Compare as CompareHash<E::Target>>::hash(&**self, state);
    }
}

impl<E, const COW: bool> Pointer for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{:p}", &**self)
    }
}

impl<E, const COW: bool> Debug for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Target: Debug,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(&**self, f)
    }
}

impl<E, const COW: bool> Display for ManagedRef<E, COW>
where
    E: Managed + ?Sized,
    E::Target: Display,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Display::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ByAddress;
    use crate::testing::{CountingAlloc, Drops, Tracked};
    use crate::Global;
    use std::panic::{self, AssertUnwindSafe};

    type Ptr<T> = ManagedPtr<Envelope<T>>;
    type Ref<T> = ManagedRef<Envelope<T>>;

    #[test]
    fn null() {
        let null: Ptr<i32> = ManagedPtr::null();
        assert!(null.is_null());
        assert_eq!(null.get(), None);
        assert_eq!(null.ref_count(), 0);
        assert!(null.clone().is_null(), "a clone of null was populated.");
        assert!(Ptr::<i32>::default().is_null());
    }

    #[test]
    fn clone_and_drop() {
        let drops = Drops::new();
        let first: Ptr<_> = ManagedPtr::new(drops.track(1));
        let second = first.clone();
        assert_eq!(first.ref_count(), 2);
        assert!(first.ptr_eq(&second));

        drop(first);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(drops.count(), 0, "payload dropped while referenced.");

        drop(second);
        assert_eq!(drops.count(), 1, "payload not dropped exactly once.");
    }

    #[test]
    fn clone_from_self_is_a_no_op() {
        let mut first: Ptr<_> = ManagedPtr::new(1);
        let alias = first.clone();
        first.clone_from(&alias);
        assert_eq!(first.ref_count(), 2, "self-assignment changed the count.");

        let other: Ptr<_> = ManagedPtr::new(2);
        first.clone_from(&other);
        assert!(first.ptr_eq(&other), "clone_from did not rebind.");
        assert_eq!(alias.ref_count(), 1, "clone_from did not release the old envelope.");
        assert_eq!(other.ref_count(), 2);
    }

    #[test]
    fn take_and_reset() {
        let drops = Drops::new();
        let mut ptr: Ptr<_> = ManagedPtr::new(drops.track(()));
        let taken = ptr.take();
        assert!(ptr.is_null());
        assert_eq!(taken.ref_count(), 1, "take changed the count.");

        let mut taken = taken;
        taken.reset();
        assert!(taken.is_null());
        assert_eq!(drops.count(), 1);
    }

    #[test]
    fn raw_round_trip() {
        let ptr: Ptr<_> = ManagedPtr::new(5);
        let raw = ptr.into_raw().unwrap();
        let shared: Ptr<_> = unsafe { ManagedPtr::from_raw_shared(raw) };
        assert_eq!(shared.ref_count(), 2);
        let owned: Ptr<_> = unsafe { ManagedPtr::from_raw(raw) };
        assert_eq!(owned.ref_count(), 2);
        assert_eq!(owned.get(), Some(&5));
    }

    #[test]
    fn create_builds_before_releasing() {
        let alloc = CountingAlloc::new();
        let drops = Drops::new();
        let mut ptr: ManagedPtr<Envelope<Tracked<i32>, CountingAlloc>> =
            ManagedPtr::new_in(drops.track(1), alloc.clone());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            ptr.create_with(|| panic!("constructor"));
        }));

        assert!(result.is_err());
        assert_eq!(ptr.get().map(|value| value.value), Some(1), "a failed create changed the handle.");
        assert_eq!(drops.count(), 0, "a failed create released the old payload.");

        ptr.create(drops.track(2));
        assert_eq!(ptr.get().map(|value| value.value), Some(2));
        assert_eq!(drops.count(), 1, "create did not release the old payload.");
        assert_eq!(alloc.live(), 0, "create did not free the old envelope.");
    }

    #[test]
    fn get_mut() {
        let mut ptr: Ptr<_> = ManagedPtr::new(1);
        *ptr.get_mut().unwrap() = 2;
        assert_eq!(ptr.get(), Some(&2));

        let other = ptr.clone();
        assert!(ptr.get_mut().is_none(), "get_mut allowed mutating a shared payload.");
        drop(other);
        assert!(ptr.get_mut().is_some());

        let mut null: Ptr<i32> = ManagedPtr::null();
        assert!(null.get_mut().is_none());
    }

    #[test]
    fn copy_on_write_walkthrough() {
        let mut e1: CowPtr<Envelope<i32>> = CowPtr::new(42);
        assert_eq!(e1.ref_count(), 1);
        assert_eq!(e1.get(), Some(&42));

        let other = e1.clone();
        assert_eq!(e1.ref_count(), 2);
        drop(other);
        assert_eq!(e1.ref_count(), 1);

        let before = e1.as_raw();
        *e1.make_mut().unwrap() += 1;
        assert_eq!(e1.as_raw(), before, "make_mut copied an unshared envelope.");
        assert_eq!(e1.get(), Some(&43));

        let snapshot = e1.clone();
        assert_eq!(e1.ref_count(), 2);
        *e1.make_mut().unwrap() += 1;

        assert!(!e1.ptr_eq(&snapshot), "make_mut did not copy a shared envelope.");
        assert_eq!(snapshot.as_raw(), before, "the other handle moved.");
        assert_eq!(e1.get(), Some(&44));
        assert_eq!(snapshot.get(), Some(&43), "the write leaked into the other handle.");
        assert_eq!(e1.ref_count(), 1);
        assert_eq!(snapshot.ref_count(), 1);
    }

    #[test]
    fn make_mut_null() {
        let mut null: CowPtr<Envelope<i32>> = CowPtr::null();
        assert!(null.make_mut().is_none());
        assert_eq!(null.try_make_mut().unwrap_err(), Error::Null);
    }

    #[test]
    fn try_make_mut_allocation_failure() {
        let alloc = CountingAlloc::new();
        let mut ptr: CowPtr<Envelope<i32, CountingAlloc>> = CowPtr::new_in(1, alloc.clone());
        let other = ptr.clone();

        alloc.fail_next();
        assert!(matches!(ptr.try_make_mut(), Err(Error::Alloc(_))));
        assert!(ptr.ptr_eq(&other), "a failed copy moved the handle.");
        assert_eq!(ptr.ref_count(), 2, "a failed copy changed the count.");

        *ptr.try_make_mut().unwrap() = 2;
        assert_eq!(other.get(), Some(&1));
        assert_eq!(alloc.live(), 2);
    }

    #[test]
    fn set() {
        let mut plain: Ptr<_> = ManagedPtr::new(1);
        assert_eq!(plain.set(2), Ok(()));
        let shared = plain.clone();
        assert_eq!(plain.set(3), Err(3), "set wrote into a shared envelope.");
        assert_eq!(shared.get(), Some(&2));

        let mut null: Ptr<i32> = ManagedPtr::null();
        assert_eq!(null.set(1), Err(1));

        let mut cow: CowPtr<Envelope<i32>> = CowPtr::new(1);
        let before = cow.as_raw();
        cow.set(2).unwrap();
        assert_eq!(cow.as_raw(), before, "set moved an unshared copy-on-write handle.");
        let shared = cow.clone();
        cow.set(3).unwrap();
        assert_eq!(cow.get(), Some(&3));
        assert_eq!(shared.get(), Some(&2));
    }

    #[test]
    fn comparison() {
        let a: Ptr<_> = ManagedPtr::new(1);
        let b: Ptr<_> = ManagedPtr::new(1);
        let c: Ptr<_> = ManagedPtr::new(2);
        let null: Ptr<i32> = ManagedPtr::null();

        assert_eq!(a, b, "equal payloads compared unequal by value.");
        assert!(a < c);
        assert_ne!(a, null);
        assert_eq!(null, ManagedPtr::null(), "two null handles compared unequal.");
        assert!(null < a, "null did not order first.");
        assert_eq!(null.partial_cmp(&ManagedPtr::null()), Some(Ordering::Equal));

        let x: ManagedPtr<Envelope<i32, Global, ByAddress>> = ManagedPtr::new(1);
        let y: ManagedPtr<Envelope<i32, Global, ByAddress>> = ManagedPtr::new(1);
        assert_ne!(x, y, "distinct envelopes compared equal by address.");
        assert_eq!(x, x.clone());
    }

    #[test]
    fn debug() {
        let ptr: Ptr<_> = ManagedPtr::new(7);
        assert_eq!(format!("{:?}", ptr), "7");
        assert_eq!(format!("{:?}", Ptr::<i32>::null()), "(null)");
        let reference: Ref<_> = ManagedRef::new("text");
        assert_eq!(format!("{:?}", reference), "\"text\"");
        assert_eq!(format!("{}", reference), "text");
    }

    #[test]
    fn reference_assigns_through() {
        let mut reference: Ref<_> = ManagedRef::new(1);
        let raw = ManagedRef::as_raw(&reference);

        ManagedRef::set(&mut reference, 5).unwrap();
        assert_eq!(*reference, 5);
        assert_eq!(ManagedRef::as_raw(&reference), raw, "set rebound the reference.");

        let alias = reference.clone();
        assert_eq!(ManagedRef::set(&mut reference, 6), Err(6));
        assert_eq!(*alias, 5);
    }

    #[test]
    fn reference_assign_from() {
        let mut target: Ref<_> = ManagedRef::new(String::from("old"));
        let source: Ref<_> = ManagedRef::new(String::from("new"));
        let raw = ManagedRef::as_raw(&target);

        ManagedRef::assign_from(&mut target, &source).unwrap();
        assert_eq!(*target, "new");
        assert_eq!(ManagedRef::as_raw(&target), raw, "assign_from rebound the reference.");
        assert!(!ManagedRef::ptr_eq(&target, &source));

        let alias = target.clone();
        assert_eq!(ManagedRef::assign_from(&mut target, &alias), Ok(()));
    }

    #[test]
    fn reference_copy_on_write() {
        let mut first: CowRef<Envelope<Vec<i32>>> = CowRef::new(vec![1]);
        let second = first.clone();

        CowRef::make_mut(&mut first).push(2);
        assert_eq!(*first, vec![1, 2]);
        assert_eq!(*second, vec![1], "the write leaked into the other handle.");

        let third = second.clone();
        let mut second = second;
        CowRef::set(&mut second, vec![9]).unwrap();
        assert_eq!(*second, vec![9]);
        assert_eq!(*third, vec![1]);
    }

    #[test]
    fn reference_rebinding() {
        let mut reference: Ref<_> = ManagedRef::new(1);
        let ptr: Ptr<_> = ManagedPtr::new(2);

        ManagedRef::set_object(&mut reference, &ptr).unwrap();
        assert_eq!(*reference, 2);
        assert_eq!(ptr.ref_count(), 2);

        let null: Ptr<i32> = ManagedPtr::null();
        assert_eq!(ManagedRef::set_object(&mut reference, &null), Err(Error::Null));
        assert_eq!(*reference, 2, "a failed set_object changed the reference.");

        ManagedRef::create(&mut reference, 3);
        assert_eq!(*reference, 3);
        assert_eq!(ptr.ref_count(), 1);
    }

    #[test]
    fn reference_conversions() {
        let reference: Ref<_> = ManagedRef::new(4);
        let ptr: Ptr<_> = ManagedPtr::from(reference);
        assert_eq!(ptr.ref_count(), 1, "conversion changed the count.");

        let reference = ManagedRef::from_ptr(ptr).unwrap();
        assert_eq!(*reference, 4);
        assert_eq!(ManagedRef::ref_count(&reference), 1);

        assert_eq!(
            ManagedRef::from_ptr(Ptr::<i32>::null()).unwrap_err(),
            Error::Null
        );
    }

    #[test]
    fn reference_default() {
        let reference: Ref<String> = ManagedRef::default();
        assert_eq!(*reference, "");
        assert_eq!(ManagedRef::ref_count(&reference), 1);
    }

    #[test]
    fn polymorphic_handles() {
        trait Animal {
            fn legs(&self) -> u32;
        }

        #[derive(Clone)]
        struct Bird(Tracked<()>);

        impl Animal for Bird {
            fn legs(&self) -> u32 {
                2
            }
        }

        crate::derives!(Bird: dyn Animal);

        let drops = Drops::new();
        {
            let plain: ManagedRef<PolyEnvelope<dyn Animal>> =
                ManagedRef::new_derived(Bird(drops.track(())), Global);
            let alias = plain.clone();
            assert_eq!(plain.legs(), 2);
            assert!(plain == alias, "a handle did not equal its clone by address.");
        }
        assert_eq!(drops.count(), 1);

        {
            let mut first: CowPtr<dyn PolyObject<dyn Animal>> =
                CowPtr::new_virtual(Bird(drops.track(())), Global);
            let second = first.clone();
            first.make_mut().unwrap();
            assert!(!first.ptr_eq(&second), "make_mut did not copy a virtual envelope.");
            assert!(first != second, "copied envelopes compared equal by address.");
            assert_eq!(first.get().unwrap().legs(), 2);
        }
        assert_eq!(drops.count(), 3, "a copied derived value was not dropped.");
    }

    #[test]
    fn hash_follows_comparison() {
        use std::collections::HashSet;

        let mut by_value: HashSet<Ref<String>> = HashSet::new();
        by_value.insert(ManagedRef::new("a".to_owned()));
        by_value.insert(ManagedRef::new("a".to_owned()));
        assert_eq!(by_value.len(), 1, "equal payloads hashed apart by value.");

        type Identity = ManagedPtr<Envelope<String, Global, ByAddress>>;
        let first: Identity = ManagedPtr::new("a".to_owned());
        let mut by_address: HashSet<Identity> = HashSet::new();
        by_address.insert(first.clone());
        by_address.insert(first);
        by_address.insert(ManagedPtr::new("a".to_owned()));
        by_address.insert(ManagedPtr::null());
        by_address.insert(ManagedPtr::null());
        assert_eq!(by_address.len(), 3, "identity hashing merged distinct envelopes.");
    }

    #[test]
    fn pointer() {
        let reference: Ref<i32> = ManagedRef::new(1);
        assert_eq!(format!("{:p}", reference), format!("{:p}", &*reference));

        let pointer: Ptr<i32> = ManagedPtr::from(reference.clone());
        assert_eq!(format!("{:p}", pointer), format!("{:p}", &*reference));
        assert_eq!(format!("{:p}", Ptr::<i32>::null()), format!("{:p}", ptr::null::<u8>()));
    }
}
