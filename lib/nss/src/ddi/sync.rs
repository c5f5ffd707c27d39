// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! These wrap the std primitives behind the same small API the driver
//! uses everywhere. A poisoned lock is recovered rather than
//! propagated: a panicking callback must not wedge the receive path.
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ops::DerefMut;
use core::time::Duration;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::thread::ThreadId;

/// A mutex.
///
/// We name it `KMutex` on purpose: the driver's locks are short
/// critical sections that are never held across a blocking wait, and
/// the distinct name makes that contract visible at the use site.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> KMutex<T> {
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

/// A reader/writer lock.
pub struct KRwLock<T> {
    inner: RwLock<T>,
}

pub struct KRwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct KRwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for KRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for KRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KRwLock<T> {
    pub fn new(val: T) -> Self {
        KRwLock { inner: RwLock::new(val) }
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        KRwLockReadGuard { guard }
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        let guard =
            self.inner.write().unwrap_or_else(PoisonError::into_inner);
        KRwLockWriteGuard { guard }
    }
}

/// A condition variable paired with a [`KMutex`].
pub struct KCondvar {
    cv: Condvar,
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn wait<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
    ) -> KMutexGuard<'a, T> {
        let guard =
            self.cv.wait(lock.guard).unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }

    /// Wait for at most `timeout`. The returned flag is `true` when the
    /// wait ended because the timeout elapsed.
    pub fn wait_timeout<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (KMutexGuard<'a, T>, bool) {
        let (guard, res) = self
            .cv
            .wait_timeout(lock.guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (KMutexGuard { guard }, res.timed_out())
    }
}

/// A mutual exclusion mechanism which loans out access to a single
/// internal token. This is used to ensure at most one thread is present
/// in a critical section *without actively holding a [`KMutex`]*.
///
/// The synchronous request adapters hold a token across the whole
/// send-and-wait of a request. The wait is long (seconds) and the
/// receive path must be free to take every other lock meanwhile.
pub struct TokenLock<T> {
    holder: KMutex<Option<ThreadId>>,
    cv: KCondvar,
    inner: UnsafeCell<T>,
}

// SAFETY: Access to `inner` is only ever granted to the single thread
// recorded in `holder`.
unsafe impl<T: Send> Send for TokenLock<T> {}
unsafe impl<T: Send> Sync for TokenLock<T> {}

impl<T> TokenLock<T> {
    pub fn new(token: T) -> Self {
        let holder = KMutex::new(None);
        let cv = KCondvar::new();

        Self { holder, cv, inner: UnsafeCell::new(token) }
    }

    pub fn lock(&self) -> Token<'_, T> {
        let mut thread_lock = self.holder.lock();

        while thread_lock.is_some() {
            thread_lock = self.cv.wait(thread_lock);
        }

        *thread_lock = Some(std::thread::current().id());

        Token { lock: self }
    }

    /// Is some thread currently holding the token?
    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }
}

pub struct Token<'a, T> {
    lock: &'a TokenLock<T>,
}

impl<T> Deref for Token<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus we are safe to take a shared ref
        // (no other writers).
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for Token<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Only the thread indicated by `parent.holder`
        // can have a `Token`, thus there are no other writers.
        // Rust has also guaranteed this is the only &mut to the Token
        // itself, so no other readers.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for Token<'_, T> {
    fn drop(&mut self) {
        let mut thread_lock = self.lock.holder.lock();
        *thread_lock = None;
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn default_mutex_holds_default_value() {
        let m: KMutex<Vec<u8>> = KMutex::default();
        assert!(m.lock().is_empty());
        m.lock().push(7);
        assert_eq!(m.into_inner(), vec![7]);
    }

    #[test]
    fn wait_timeout_expires() {
        let m = KMutex::new(false);
        let cv = KCondvar::new();
        let start = Instant::now();
        let (guard, timed_out) =
            cv.wait_timeout(m.lock(), Duration::from_millis(20));
        assert!(timed_out);
        assert!(!*guard);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn token_lock_serializes() {
        let tl = Arc::new(TokenLock::new(0u32));
        let mut handles = vec![];

        for _ in 0..4 {
            let tl = tl.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let mut tok = tl.lock();
                    let v = *tok;
                    std::thread::yield_now();
                    *tok = v + 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*tl.lock(), 400);
        assert!(!tl.is_held());
    }
}
