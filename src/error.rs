// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::panic;

use thiserror::Error;

use crate::alloc::AllocError;

/// Errors reported by handle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Memory could not be obtained for a new envelope or container.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// A weak handle was promoted after its payload was destroyed, or for a
    /// container that never held one.
    #[error("no object present")]
    NoObjectPresent,
    /// A nullable handle was required to be populated.
    #[error("handle is null")]
    Null,
}

/// A fallible payload constructor could not produce an envelope.
///
/// Whatever memory was reserved for the envelope has already been released
/// when this error is observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateError<E> {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("payload construction failed: {0}")]
    Construct(E),
}

/// The part of a release that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The payload's destructor.
    Payload,
    /// The allocator's destructor, run after the memory was returned to it.
    Allocator,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Stage::Payload => f.write_str("payload destructor"),
            Stage::Allocator => f.write_str("allocator destructor"),
        }
    }
}

/// A destructor panicked while a handle was being released.
///
/// Reference counts were updated and memory was reclaimed before this error
/// was produced; it only reports what went wrong.
///
/// # Examples
///
/// ```rust
/// use envelope::{Global, PayloadMayFail, Stage, Strong};
///
/// struct Fragile;
///
/// impl Drop for Fragile {
///     fn drop(&mut self) {
///         panic!("disk on fire");
///     }
/// }
///
/// let strong: Strong<Fragile, Global, PayloadMayFail> = Strong::new(Fragile);
/// let error = Strong::release(strong).unwrap_err();
///
/// assert_eq!(error.stage(), Stage::Payload);
/// assert_eq!(error.message(), Some("disk on fire"));
/// ```
#[derive(Error)]
#[error("{stage} panicked during release{}", suffix(.panic))]
pub struct ReleaseError {
    stage: Stage,
    panic: Box<dyn Any + Send + 'static>,
}

impl ReleaseError {
    pub(crate) fn new(stage: Stage, panic: Box<dyn Any + Send + 'static>) -> ReleaseError {
        ReleaseError { stage, panic }
    }

    /// Which destructor failed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The panic message, when the panic payload was a string.
    pub fn message(&self) -> Option<&str> {
        message(&self.panic)
    }

    /// The original panic payload.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.panic
    }

    /// Continues the original panic.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.panic)
    }
}

fn message<'a>(panic: &'a Box<dyn Any + Send + 'static>) -> Option<&'a str> {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        Some(message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        Some(message)
    } else {
        None
    }
}

fn suffix(panic: &Box<dyn Any + Send + 'static>) -> String {
    message(panic).map_or_else(String::new, |message| format!(": {}", message))
}

impl Debug for ReleaseError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ReleaseError")
            .field("stage", &self.stage)
            .field("message", &self.message())
            .finish()
    }
}
