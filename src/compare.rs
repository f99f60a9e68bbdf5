// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Compile-time selection of how handles compare.
//!
//! Each envelope type names a comparison strategy. [`ByValue`] forwards to the
//! payload's own `PartialEq`/`PartialOrd`; [`ByAddress`] compares the identity
//! of the envelopes. Handle comparison dispatches through the strategy with no
//! runtime branch.
//!
//! [`ByValue`]: ./enum.ByValue.html
//! [`ByAddress`]: ./enum.ByAddress.html

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Compare payloads with their own comparison operators.
#[derive(Debug)]
pub enum ByValue {}

/// Compare payloads by address, ignoring their values.
#[derive(Debug)]
pub enum ByAddress {}

/// Equality under a comparison strategy.
pub trait CompareEq<T>
where
    T: ?Sized,
{
    fn eq(a: &T, b: &T) -> bool;
}

/// Ordering under a comparison strategy.
pub trait CompareOrd<T>: CompareEq<T>
where
    T: ?Sized,
{
    fn partial_cmp(a: &T, b: &T) -> Option<Ordering>;
}

/// Hashing consistent with [`CompareEq`] under the same strategy. Only
/// implemented where that equality is total, so handles comparing through it
/// are also `Eq`.
///
/// [`CompareEq`]: ./trait.CompareEq.html
pub trait CompareHash<T>: CompareEq<T>
where
    T: ?Sized,
{
    fn hash<H>(value: &T, state: &mut H)
    where
        H: Hasher;
}

impl<T> CompareEq<T> for ByValue
where
    T: ?Sized + PartialEq,
{
    fn eq(a: &T, b: &T) -> bool {
        a == b
    }
}

impl<T> CompareOrd<T> for ByValue
where
    T: ?Sized + PartialOrd,
{
    fn partial_cmp(a: &T, b: &T) -> Option<Ordering> {
        a.partial_cmp(b)
    }
}

impl<T> CompareHash<T> for ByValue
where
    T: ?Sized + Hash + Eq,
{
    fn hash<H>(value: &T, state: &mut H)
    where
        H: Hasher,
    {
        value.hash(state);
    }
}

impl<T> CompareEq<T> for ByAddress
where
    T: ?Sized,
{
    fn eq(a: &T, b: &T) -> bool {
        address(a) == address(b)
    }
}

impl<T> CompareOrd<T> for ByAddress
where
    T: ?Sized,
{
    fn partial_cmp(a: &T, b: &T) -> Option<Ordering> {
        Some(address(a).cmp(&address(b)))
    }
}

impl<T> CompareHash<T> for ByAddress
where
    T: ?Sized,
{
    fn hash<H>(value: &T, state: &mut H)
    where
        H: Hasher,
    {
        address(value).hash(state);
    }
}

/// The data address of a possibly unsized value; vtable and length metadata
/// is ignored.
pub(crate) fn address<T>(value: *const T) -> usize
where
    T: ?Sized,
{
    value as *const u8 as usize
}
