// Copyright 2018 0-0-1 and Contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Failure tiers: how a release reacts to a destructor that panics.
//!
//! A tier is chosen per container type as a type parameter. It states which
//! destructors may fail, and releases only pay for catching panics in the
//! stages that are declared fallible. Whatever the tier, a failure never
//! skips bookkeeping: counts are decremented and memory is returned before a
//! failure is reported.
//!
//! When more than one stage fails, the first failure is reported and later
//! ones are logged and dropped. When the release itself runs while the thread
//! is already unwinding, every failure is logged and dropped so that the
//! original panic is not replaced.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::warn;

use crate::error::{ReleaseError, Stage};

/// A compile-time failure policy for releasing a container.
pub trait FailureTier: 'static {
    /// The payload's destructor may panic.
    const PAYLOAD_MAY_FAIL: bool;
    /// The allocator's destructor may panic.
    const ALLOC_MAY_FAIL: bool;
    /// Whether a caught failure is reported to the caller. When `false`,
    /// failures are always logged and dropped.
    const PROPAGATE: bool = true;
}

/// Neither the payload nor the allocator may fail; releasing never fails.
///
/// A panic from a destructor under this tier is not caught, and the release
/// that triggered it does not complete.
#[derive(Debug)]
pub enum NoFail {}

/// Only the payload's destructor may fail.
#[derive(Debug)]
pub enum PayloadMayFail {}

/// Only the allocator's destructor may fail.
#[derive(Debug)]
pub enum AllocMayFail {}

/// Both destructors may fail; at most one failure is reported.
#[derive(Debug)]
pub enum BothMayFail {}

/// The payload's destructor may fail, but the failure is contained: it is
/// logged and never reported to the caller.
#[derive(Debug)]
pub enum Contained {}

impl FailureTier for NoFail {
    const PAYLOAD_MAY_FAIL: bool = false;
    const ALLOC_MAY_FAIL: bool = false;
}

impl FailureTier for PayloadMayFail {
    const PAYLOAD_MAY_FAIL: bool = true;
    const ALLOC_MAY_FAIL: bool = false;
}

impl FailureTier for AllocMayFail {
    const PAYLOAD_MAY_FAIL: bool = false;
    const ALLOC_MAY_FAIL: bool = true;
}

impl FailureTier for BothMayFail {
    const PAYLOAD_MAY_FAIL: bool = true;
    const ALLOC_MAY_FAIL: bool = true;
}

impl FailureTier for Contained {
    const PAYLOAD_MAY_FAIL: bool = true;
    const ALLOC_MAY_FAIL: bool = false;
    const PROPAGATE: bool = false;
}

/// Runs the stages of one release under a tier and collects the failure to
/// report, if any.
pub(crate) struct Finalizer<P>
where
    P: FailureTier,
{
    unwinding: bool,
    failure: Option<ReleaseError>,
    phantom: PhantomData<P>,
}

impl<P> Finalizer<P>
where
    P: FailureTier,
{
    /// Must be created on entry to the release, before any destructor runs.
    pub(crate) fn new() -> Finalizer<P> {
        Finalizer {
            unwinding: thread::panicking(),
            failure: None,
            phantom: PhantomData,
        }
    }

    /// Runs the payload's destructor.
    pub(crate) fn payload<F>(&mut self, f: F)
    where
        F: FnOnce(),
    {
        self.stage(Stage::Payload, P::PAYLOAD_MAY_FAIL, f)
    }

    /// Runs the allocator's destructor.
    pub(crate) fn allocator<F>(&mut self, f: F)
    where
        F: FnOnce(),
    {
        self.stage(Stage::Allocator, P::ALLOC_MAY_FAIL, f)
    }

    fn stage<F>(&mut self, stage: Stage, may_fail: bool, f: F)
    where
        F: FnOnce(),
    {
        if !may_fail {
            f();
            return;
        }

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let error = ReleaseError::new(stage, panic);
            if self.unwinding {
                warn!(%error, "release failed while unwinding; failure dropped");
            } else if !P::PROPAGATE {
                warn!(%error, "release failed; failure contained");
            } else if self.failure.is_some() {
                warn!(%error, "second release failure dropped");
            } else {
                self.failure = Some(error);
            }
        }
    }

    /// The failure to report, if any.
    pub(crate) fn finish(self) -> Result<(), ReleaseError> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Re-raises a release failure from a `Drop` implementation.
///
/// A finalizer never reports a failure when it started during an unwind, so
/// this never panics while panicking.
pub(crate) fn raise(result: Result<(), ReleaseError>) {
    if let Err(error) = result {
        error.resume();
    }
}
