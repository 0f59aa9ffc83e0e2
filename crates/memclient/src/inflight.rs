//! Per-connection in-flight request tracking.
//!
//! Correlation is positional: the order requests are enqueued on a
//! connection equals their on-wire order, so the i-th parsed response frame
//! belongs to the i-th queued request. The opaque token is only consulted to
//! recognize skipped quiet commands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::{Request, Status};

/// Decoded payload delivered to the waiter of one request.
#[derive(Debug, Clone)]
pub(crate) enum ResponsePayload {
    /// Success with no payload: a skipped quiet command or a bodyless frame.
    Empty,
    /// A fully parsed single response frame.
    Frame {
        status: Status,
        flags: u32,
        cas: u64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    },
    /// The collected `Stat` sequence, one entry per statistic frame.
    Stats(Vec<(Bytes, Bytes)>),
}

#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub payload: ResponsePayload,
    pub is_error: bool,
}

/// One pending request with its single-shot completion signal.
pub(crate) struct InflightRequest {
    pub request: Request,
    /// Whether the server suppresses the success response for this request.
    pub quiet: bool,
    /// The caller's key, kept for collating multi-key results.
    pub origin_key: Option<Bytes>,
    slot: Mutex<Option<Completion>>,
    /// Guards against double completion when the parser and a
    /// timeout-triggered cleanup race.
    disposed: AtomicBool,
    notify: Notify,
    stats: Mutex<Vec<(Bytes, Bytes)>>,
}

impl InflightRequest {
    pub(crate) fn new(request: Request, origin_key: Option<Bytes>) -> Arc<Self> {
        let quiet = request.op.is_quiet();
        Arc::new(Self {
            request,
            quiet,
            origin_key,
            slot: Mutex::new(None),
            disposed: AtomicBool::new(false),
            notify: Notify::new(),
            stats: Mutex::new(Vec::new()),
        })
    }

    /// Deliver the result and wake the waiter. Returns false if the request
    /// was already completed by the other party of the race.
    pub(crate) fn complete(&self, payload: ResponsePayload, is_error: bool) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.slot.lock().unwrap() = Some(Completion { payload, is_error });
        self.notify.notify_one();
        true
    }

    /// Write the current result and wake the waiter without consuming the
    /// single-shot. Multi-response sequences call this for every
    /// non-terminal frame; the disposed flag keeps an already-completed
    /// request untouched, so only the first signal reaches the waiter.
    pub(crate) fn progress(&self, payload: ResponsePayload, is_error: bool) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        *self.slot.lock().unwrap() = Some(Completion { payload, is_error });
        self.notify.notify_one();
        true
    }

    /// Append one `Stat` frame to the sequence.
    pub(crate) fn push_stat(&self, key: Bytes, value: Bytes) {
        self.stats.lock().unwrap().push((key, value));
    }

    /// The sequence gathered so far, for per-frame progress results.
    pub(crate) fn stats_snapshot(&self) -> Vec<(Bytes, Bytes)> {
        self.stats.lock().unwrap().clone()
    }

    pub(crate) fn take_stats(&self) -> Vec<(Bytes, Bytes)> {
        std::mem::take(&mut *self.stats.lock().unwrap())
    }

    /// Non-blocking read of the result slot, used when collating a batch
    /// whose earlier members were already populated by the parser.
    pub(crate) fn try_result(&self) -> Option<Completion> {
        self.slot.lock().unwrap().clone()
    }

    /// Wait for completion within `timeout` (`None` waits forever).
    pub(crate) async fn await_completion(&self, timeout: Option<Duration>) -> Result<Completion> {
        let wait = async {
            loop {
                if let Some(done) = self.try_result() {
                    return done;
                }
                self.notify.notified().await;
            }
        };
        match timeout {
            None => Ok(wait.await),
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout { what: "response", timeout: Some(limit) }),
        }
    }
}

/// FIFO of pending requests attached to one connection.
///
/// Single producer (the connection's writer) and single consumer (the
/// connection's parser); the mutex is only held for queue edits.
#[derive(Default)]
pub(crate) struct InflightQueue {
    inner: Mutex<VecDeque<Arc<InflightRequest>>>,
}

impl InflightQueue {
    pub(crate) fn push(&self, request: Arc<InflightRequest>) {
        self.inner.lock().unwrap().push_back(request);
    }

    pub(crate) fn peek(&self) -> Option<Arc<InflightRequest>> {
        self.inner.lock().unwrap().front().cloned()
    }

    pub(crate) fn pop(&self) -> Option<Arc<InflightRequest>> {
        self.inner.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Remove and return everything still pending; used when the connection
    /// dies so every waiter is failed exactly once.
    pub(crate) fn drain(&self) -> Vec<Arc<InflightRequest>> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}
