// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and deadlines.

use core::time::Duration;
use std::time::Instant;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Moment {
    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }

    /// Return the delta between `self` and `earlier` in milliseconds,
    /// saturating at zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let d = self.inner.saturating_duration_since(earlier.inner);
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn checked_add(&self, d: Duration) -> Option<Moment> {
        self.inner.checked_add(d).map(|inner| Moment { inner })
    }
}

/// A point in time by which something must have happened.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Moment>,
}

impl Deadline {
    /// A deadline `timeout` from now. An unrepresentable deadline never
    /// expires.
    pub fn after(timeout: Duration) -> Self {
        Self { at: Moment::now().checked_add(timeout) }
    }

    /// Time left until the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.inner.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
