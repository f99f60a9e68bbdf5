// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library provides reference-counted object envelopes: heap blocks
//! that keep a payload together with its reference count and the allocator
//! that produced them, and the handles used to share them.
//!
//! - [`Envelope`] holds one payload of a concrete type. [`PolyEnvelope`] and
//!   [`PolyObject`] hold a payload of a derived type behind a base (usually
//!   trait-object) view, destroying it with the derived destructor.
//! - [`ManagedPtr`] is a nullable handle and [`ManagedRef`] an always
//!   populated one. Their copy-on-write forms, [`CowPtr`] and [`CowRef`],
//!   duplicate a shared envelope before handing out mutable access.
//! - [`Strong`] and [`Weak`] share a container whose payload lives as long
//!   as any strong handle, and whose memory lives as long as any handle.
//! - [`SharedPtr`] shares an object that embeds its own [`SharedCount`].
//!
//! # Technical Details
//!
//! Every envelope is allocated from a [`RawAlloc`]. The default, [`Global`],
//! is zero-sized, so envelopes using it carry no allocator state at all.
//! A stateful allocator is stored in the envelope and is the last thing
//! dropped when the envelope goes away, after its memory has been returned.
//!
//! Payload and allocator destructors may panic. A container's
//! [`FailureTier`] decides which of those panics are caught: caught failures
//! never interrupt bookkeeping, the first one is reported by `release` (or
//! re-raised when the handle is dropped), and any failure that happens while
//! the thread is already unwinding is logged and discarded.
//!
//! With the `multithreaded` feature, counts are atomic and handles are `Send`
//! and `Sync` whenever their payload and allocator are.
//!
//! [`Envelope`]: ./struct.Envelope.html
//! [`PolyEnvelope`]: ./struct.PolyEnvelope.html
//! [`PolyObject`]: ./trait.PolyObject.html
//! [`ManagedPtr`]: ./struct.ManagedPtr.html
//! [`ManagedRef`]: ./struct.ManagedRef.html
//! [`CowPtr`]: ./type.CowPtr.html
//! [`CowRef`]: ./type.CowRef.html
//! [`Strong`]: ./struct.Strong.html
//! [`Weak`]: ./struct.Weak.html
//! [`SharedPtr`]: ./struct.SharedPtr.html
//! [`SharedCount`]: ./struct.SharedCount.html
//! [`RawAlloc`]: ./trait.RawAlloc.html
//! [`Global`]: ./struct.Global.html
//! [`FailureTier`]: ./trait.FailureTier.html

mod alloc;
mod compare;
mod count;
mod error;
mod handle;
mod intrusive;
mod managed;
mod poly;
mod shared;
mod tier;

#[cfg(test)]
mod testing;

pub use crate::alloc::{AllocError, Global, RawAlloc, RawBox, Stateless};
pub use crate::compare::{ByAddress, ByValue, CompareEq, CompareHash, CompareOrd};
pub use crate::error::{CreateError, Error, ReleaseError, Stage};
pub use crate::handle::{CowPtr, CowRef, ManagedPtr, ManagedRef};
pub use crate::intrusive::{SharedCount, SharedObject, SharedPtr};
pub use crate::managed::{Duplicate, Envelope, Managed, Reservation};
#[doc(hidden)]
pub use crate::poly::VirtualHeader;
pub use crate::poly::{Derives, PolyEnvelope, PolyObject};
pub use crate::shared::{Strong, Weak};
pub use crate::tier::{AllocMayFail, BothMayFail, Contained, FailureTier, NoFail, PayloadMayFail};
