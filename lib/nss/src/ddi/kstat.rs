// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named counter sets.
//!
//! Counters are updated from any context (including the receive drain
//! path) through a shared reference, so each one is a relaxed atomic.
//! Snapshots are not consistent *as a whole*; each individual value is
//! uncorrupted, but a group may reflect a partially completed update.
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use thiserror::Error;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// # Example
///
/// To declare a new kstat provider simply define a struct of named
/// fields with type [`KStatU64`] and derive `KStatProvider`.
///
/// ```ignore
/// use nss::ddi::kstat::KStatProvider;
/// use nss::ddi::kstat::KStatU64;
/// use kstat_macro::KStatProvider;
///
/// #[derive(KStatProvider)]
/// struct SomeStats {
///     msgs_out: KStatU64,
///     msgs_in: KStatU64,
/// }
///
/// let stats = SomeStats::new();
/// stats.msgs_out.incr(1);
/// assert_eq!(stats.snapshot().msgs_out, 1);
/// ```
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// An initialized, named [`KStatProvider`].
///
/// There is no system-wide registry to publish to when running
/// hosted; we keep the names so they show up in logs and snapshots.
pub struct KStatNamed<T: KStatProvider> {
    module: String,
    name: String,
    pub vals: Box<T>,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        if module.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(module.to_string()));
        }
        if name.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(name.to_string()));
        }

        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { module: module.to_string(), name: name.to_string(), vals })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Maximum length of a counter name, including the terminator.
pub const KSTAT_STRLEN: usize = 31;

/// A 64-bit unsigned named counter.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: AtomicU64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        if name.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(name.to_string()));
        }
        if name.contains('\0') {
            return Err(Error::NulChar);
        }
        Ok(())
    }

    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(&self, n: u64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }
}

/// A kstat error.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("kstat name too long: {0}")]
    NameTooLong(String),

    #[error("kstat name contains NUL char")]
    NulChar,
}

#[cfg(test)]
mod test {
    use super::*;
    use kstat_macro::KStatProvider;

    #[derive(KStatProvider)]
    struct TestStats {
        hits: KStatU64,
        misses: KStatU64,
    }

    #[test]
    fn snapshot_reflects_updates() {
        let ks =
            KStatNamed::new("nss", "test", TestStats::new()).unwrap();
        ks.vals.hits.incr(3);
        ks.vals.misses.incr(1);
        ks.vals.hits.decr(1);
        let snap = ks.vals.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(ks.vals.num_fields(), 2);
        assert_eq!(ks.name(), "test");
    }

    #[test]
    fn long_names_rejected() {
        let long = "x".repeat(KSTAT_STRLEN);
        assert!(KStatNamed::new("nss", &long, TestStats::new()).is_err());
    }
}
