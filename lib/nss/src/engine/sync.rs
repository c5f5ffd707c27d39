// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Request/response correlation and the synchronous request adapter.
//!
//! Every request that wants an answer is given a fresh, nonzero request
//! id which travels to the firmware in the envelope's `cb` field and
//! comes back in the reply. The pending table maps ids to wherever the
//! reply should go. A reply whose id is no longer in the table (the
//! caller gave up) is a *late* response: it is logged and counted, and
//! never reaches the caller who abandoned it, nor anyone who has since
//! reused the adapter.
use super::Error;
use super::Result;
use super::msg::Msg;
use super::msg::ReplyTo;
use super::top::NssTop;
use crate::api::Response;
use crate::ddi::sync::KCondvar;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::TokenLock;
use crate::ddi::time::Deadline;
use crate::provider::LogLevel;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ReqId = u32;

/// A one-shot slot a blocked caller waits on.
pub struct Completion {
    id: AtomicU32,
    slot: KMutex<Option<Msg>>,
    abandoned: AtomicBool,
    cv: KCondvar,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            id: AtomicU32::new(0),
            slot: KMutex::new(None),
            abandoned: AtomicBool::new(false),
            cv: KCondvar::new(),
        }
    }

    /// The request id this completion was armed with; zero before
    /// the request was sent.
    pub fn id(&self) -> ReqId {
        self.id.load(Ordering::Acquire)
    }

    fn complete(&self, msg: Msg) {
        *self.slot.lock() = Some(msg);
        self.cv.notify_all();
    }

    /// Wake the waiter without a reply; no reply will ever come.
    fn abandon(&self) {
        let _slot = self.slot.lock();
        self.abandoned.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Wait for the reply, up to `timeout`. Returns early with `None`
    /// if the request is abandoned.
    pub fn wait(&self, timeout: Duration) -> Option<Msg> {
        let deadline = Deadline::after(timeout);
        let mut slot = self.slot.lock();
        loop {
            if let Some(msg) = slot.take() {
                return Some(msg);
            }

            if self.is_abandoned() {
                return None;
            }

            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(slot, remaining);
            slot = guard;
        }
    }

    pub fn take(&self) -> Option<Msg> {
        self.slot.lock().take()
    }
}

/// What became of an inbound response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// Handed to the waiter or callback of an outstanding request.
    Delivered,
    /// Nobody is waiting for this id any more.
    Late(ReqId),
    /// The message carries no request id.
    Untracked,
}

/// Requests in flight, by id.
pub struct PendingTable {
    next: AtomicU32,
    inflight: KMutex<BTreeMap<ReqId, ReplyTo>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1), inflight: KMutex::new(BTreeMap::new()) }
    }

    /// Assign a request id to `reply` and track it until resolved or
    /// cancelled.
    pub fn arm(&self, reply: ReplyTo) -> ReqId {
        let mut inflight = self.inflight.lock();
        let id = loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !inflight.contains_key(&id) {
                break id;
            }
        };

        if let ReplyTo::Waiter(done) = &reply {
            done.id.store(id, Ordering::Release);
        }
        inflight.insert(id, reply);
        id
    }

    /// Stop tracking `id`. Returns `false` if it was already resolved.
    pub fn cancel(&self, id: ReqId) -> bool {
        self.inflight.lock().remove(&id).is_some()
    }

    pub fn is_pending(&self, id: ReqId) -> bool {
        self.inflight.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Route a response to whoever is waiting for it.
    ///
    /// A waiter is completed while the table lock is held, so a caller
    /// whose [`PendingTable::cancel`] fails is guaranteed to find the
    /// reply in its completion. Callbacks run after the lock is
    /// dropped.
    pub fn resolve(&self, msg: &Msg) -> Resolution {
        let id = msg.cm.cb;
        if id == 0 {
            return Resolution::Untracked;
        }

        let reply = {
            let mut inflight = self.inflight.lock();
            match inflight.remove(&id) {
                None => return Resolution::Late(id),
                Some(ReplyTo::Waiter(done)) => {
                    done.complete(msg.clone());
                    return Resolution::Delivered;
                }
                Some(reply) => reply,
            }
        };

        if let ReplyTo::Callback { cb, app_data } = reply {
            cb(app_data.as_ref(), msg);
        }
        Resolution::Delivered
    }

    /// Forget everything in flight. Blocked callers are woken and see
    /// their request abandoned; pending callbacks never run.
    pub fn clear(&self) {
        let inflight = core::mem::take(&mut *self.inflight.lock());
        for reply in inflight.into_values() {
            if let ReplyTo::Waiter(done) = reply {
                done.abandon();
            }
        }
    }
}

/// Anything but an ACK is a rejection. A response code we do not know
/// is reported as [`Response::EMsg`].
pub fn expect_ack(reply: &Msg) -> Result<()> {
    match reply.cm.response() {
        Ok(Response::Ack) => Ok(()),
        Ok(response) => Err(Error::Nack { response, error: reply.cm.error }),
        Err(_) => {
            Err(Error::Nack { response: Response::EMsg, error: reply.cm.error })
        }
    }
}

/// Serializes a subsystem's blocking requests and bounds how long each
/// one waits for its reply.
///
/// The adapter's token is held for the whole send-and-wait, so a second
/// caller blocks until the first has its answer or has timed out. A
/// timed-out request is cancelled before the token is released, which
/// is what keeps a late reply from being mistaken for the next
/// caller's.
pub struct SyncAdapter {
    name: &'static str,
    gate: TokenLock<()>,
    timeout: Duration,
}

impl SyncAdapter {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self { name, gate: TokenLock::new(()), timeout }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a request is in progress.
    pub fn is_busy(&self) -> bool {
        self.gate.is_held()
    }

    /// Send `msg` through `send` and block for its response.
    ///
    /// `send` receives the message with its reply route attached and
    /// must hand it to [`NssTop::tx_ctrl`] (possibly after
    /// subsystem-specific checks). If it fails, the error is returned
    /// immediately without waiting. A request abandoned by
    /// [`NssTop::shutdown`] fails with [`Error::NotReady`].
    pub fn call<F>(&self, top: &NssTop, msg: Msg, send: F) -> Result<Msg>
    where
        F: FnOnce(Msg) -> Result<()>,
    {
        let _token = self.gate.lock();

        let done = Arc::new(Completion::new());
        send(msg.with_reply(ReplyTo::Waiter(done.clone())))?;

        match done.wait(self.timeout) {
            Some(reply) => Ok(reply),
            None if done.is_abandoned() => Err(Error::NotReady),
            None if top.pending().cancel(done.id()) => {
                Err(self.timed_out(top, done.id()))
            }

            // The reply won the race with the cancel, or the request
            // left the table some other way.
            None => match done.take() {
                Some(reply) => Ok(reply),
                None if done.is_abandoned() => Err(Error::NotReady),
                None => Err(self.timed_out(top, done.id())),
            },
        }
    }

    /// As [`SyncAdapter::call`], but anything other than an ACK is an
    /// error.
    pub fn call_ack<F>(&self, top: &NssTop, msg: Msg, send: F) -> Result<Msg>
    where
        F: FnOnce(Msg) -> Result<()>,
    {
        let reply = self.call(top, msg, send)?;
        expect_ack(&reply)?;
        Ok(reply)
    }

    fn timed_out(&self, top: &NssTop, req_id: ReqId) -> Error {
        let ms = self.timeout.as_millis() as u64;
        top.stats().vals.sync_timeouts.incr(1);
        top.log(
            LogLevel::Warn,
            &format!(
                "{}: no response to request {req_id} after {ms} ms",
                self.name
            ),
        );
        self.timeout_probe(req_id, ms);
        Error::Timeout(ms)
    }

    fn timeout_probe(&self, req_id: ReqId, timeout_ms: u64) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                crate::nss_provider::sync__timeout!(
                    || (self.name, req_id, timeout_ms)
                );
            } else {
                let (_, _) = (req_id, timeout_ms);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::CoreId;
    use crate::cfg::DriverCfg;
    use crate::engine::msg::MsgCallback;
    use crate::engine::top::test_top;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    fn reply_for(id: ReqId) -> Msg {
        let mut msg = Msg::header_only(1, 0).as_response(Response::Ack, 0);
        msg.cm.cb = id;
        msg
    }

    #[test]
    fn ids_are_nonzero_and_unique() {
        let tbl = PendingTable::new();
        tbl.next.store(u32::MAX, Ordering::Relaxed);
        let done = Arc::new(Completion::new());
        let a = tbl.arm(ReplyTo::Waiter(done.clone()));
        let b = tbl.arm(ReplyTo::Waiter(done.clone()));
        assert_eq!(a, u32::MAX);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(done.id(), b);
        assert_eq!(tbl.len(), 2);
    }

    #[test]
    fn waiter_is_completed() {
        let tbl = PendingTable::new();
        let done = Arc::new(Completion::new());
        let id = tbl.arm(ReplyTo::Waiter(done.clone()));
        assert_eq!(tbl.resolve(&reply_for(id)), Resolution::Delivered);
        assert!(!tbl.is_pending(id));
        let got = done.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.cm.cb, id);
    }

    #[test]
    fn callback_runs_once() {
        let tbl = PendingTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: MsgCallback = Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let id = tbl.arm(ReplyTo::Callback { cb, app_data: None });
        assert_eq!(tbl.resolve(&reply_for(id)), Resolution::Delivered);
        assert_eq!(tbl.resolve(&reply_for(id)), Resolution::Late(id));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancelled_request_is_late() {
        let tbl = PendingTable::new();
        let done = Arc::new(Completion::new());
        let id = tbl.arm(ReplyTo::Waiter(done.clone()));
        assert!(tbl.cancel(id));
        assert!(!tbl.cancel(id));
        assert_eq!(tbl.resolve(&reply_for(id)), Resolution::Late(id));
        assert!(done.take().is_none());
        assert_eq!(tbl.resolve(&reply_for(0)), Resolution::Untracked);
    }

    #[test]
    fn wait_times_out() {
        let done = Completion::new();
        assert!(done.wait(Duration::from_millis(5)).is_none());
        assert!(!done.is_abandoned());
    }

    #[test]
    fn clear_wakes_blocked_waiters() {
        let tbl = Arc::new(PendingTable::new());
        let done = Arc::new(Completion::new());
        tbl.arm(ReplyTo::Waiter(done.clone()));

        let waiter = done.clone();
        let start = Instant::now();
        let th = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        tbl.clear();

        assert!(th.join().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(done.is_abandoned());
        assert!(tbl.is_empty());
    }

    #[test]
    fn shutdown_fails_blocked_call() {
        let (top, _, log) = test_top(&DriverCfg::default());
        let adapter = Arc::new(SyncAdapter::new("test", Duration::from_millis(1500)));

        let (t, a) = (top.clone(), adapter.clone());
        let start = Instant::now();
        let th = thread::spawn(move || {
            a.call(&t, Msg::header_only(5, 0), |msg| {
                t.tx_ctrl(t.core(CoreId::Core0)?, msg)
            })
        });
        thread::sleep(Duration::from_millis(100));
        top.shutdown();

        assert_eq!(th.join().unwrap().map(|_| ()), Err(Error::NotReady));
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(!adapter.is_busy());
        assert_eq!(top.stats().vals.sync_timeouts.val(), 0);
        assert_eq!(log.count_matching(LogLevel::Warn, "no response"), 0);
    }

    #[test]
    fn vanished_request_is_counted_as_timeout() {
        let (top, _, log) = test_top(&DriverCfg::default());
        let adapter = SyncAdapter::new("test", Duration::from_millis(10));

        // The entry leaves the table without a reply or a shutdown,
        // so the adapter's own cancel finds nothing.
        let res = adapter.call(&top, Msg::header_only(5, 0), |mut msg| {
            let reply = msg.take_reply().ok_or(Error::BadParam("reply"))?;
            let id = top.pending().arm(reply);
            assert!(top.pending().cancel(id));
            Ok(())
        });

        assert_eq!(res.map(|_| ()), Err(Error::Timeout(10)));
        assert_eq!(top.stats().vals.sync_timeouts.val(), 1);
        assert_eq!(log.count_matching(LogLevel::Warn, "test: no response"), 1);
    }

    #[test]
    fn gate_is_released_after_timeout() {
        let (top, _, _) = test_top(&DriverCfg::default());
        let adapter = SyncAdapter::new("test", Duration::from_millis(10));
        let send = |msg: Msg| -> Result<()> {
            top.tx_ctrl(top.core(CoreId::Core0)?, msg)
        };

        assert_eq!(
            adapter.call(&top, Msg::header_only(5, 0), send).map(|_| ()),
            Err(Error::Timeout(10))
        );
        assert!(!adapter.is_busy());
        assert_eq!(
            adapter.call(&top, Msg::header_only(5, 0), send).map(|_| ()),
            Err(Error::Timeout(10))
        );
        assert_eq!(top.stats().vals.sync_timeouts.val(), 2);
        assert!(top.pending().is_empty());
    }
}
