//! Request/response correlation
//!
//! [`ResponseBroker`] pairs replies with the callers waiting for them.
//! Each pending id owns a oneshot channel and, when it has a timeout, a
//! timer task armed at registration. The timer expires the entry whether
//! or not anyone is polling the waiter; dropping the waiter removes its
//! entry too, so entries never outlive their deadline or their caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Ev3Error, Result};

struct PendingRequest<T> {
    /// Distinguishes this registration from a later one reusing the id
    serial: u64,
    sender: oneshot::Sender<Result<T>>,
    timer: Option<JoinHandle<()>>,
}

impl<T> PendingRequest<T> {
    fn complete(self, outcome: Result<T>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The waiter may already be gone; the outcome is discarded then.
        let _ = self.sender.send(outcome);
    }
}

type Table<T> = Mutex<HashMap<u16, PendingRequest<T>>>;

/// Correlation table from request id to waiting future
pub struct ResponseBroker<T> {
    pending: Arc<Table<T>>,
    next_serial: Arc<AtomicU64>,
}

impl<T> Clone for ResponseBroker<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            next_serial: Arc::clone(&self.next_serial),
        }
    }
}

impl<T> Default for ResponseBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(table: &Table<T>) -> MutexGuard<'_, HashMap<u16, PendingRequest<T>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `id` only if it still belongs to registration `serial`
fn take_registration<T>(table: &Table<T>, id: u16, serial: u64) -> Option<PendingRequest<T>> {
    let mut table = lock(table);
    if table.get(&id).map(|e| e.serial) == Some(serial) {
        table.remove(&id)
    } else {
        None
    }
}

impl<T: Send + 'static> ResponseBroker<T> {
    /// Start waiting for the reply to `id`
    ///
    /// A zero `timeout` waits forever. Otherwise the entry expires after
    /// `timeout` even if the returned future is never polled. Fails if
    /// `id` is already pending. Must be called inside a tokio runtime
    /// when `timeout` is non-zero.
    pub fn register_wait(&self, id: u16, timeout: Duration) -> Result<ResponseFuture<T>> {
        let (sender, receiver) = oneshot::channel();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = lock(&self.pending);
            if table.contains_key(&id) {
                return Err(Ev3Error::correlation(format!(
                    "request {} is already waiting for a response",
                    id
                )));
            }
            let timer = (!timeout.is_zero())
                .then(|| spawn_timer(Arc::downgrade(&self.pending), id, serial, timeout));
            table.insert(
                id,
                PendingRequest {
                    serial,
                    sender,
                    timer,
                },
            );
        }

        Ok(ResponseFuture {
            id,
            serial,
            receiver,
            pending: Arc::downgrade(&self.pending),
            done: false,
        })
    }
}

fn spawn_timer<T: Send + 'static>(
    table: Weak<Table<T>>,
    id: u16,
    serial: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(table) = table.upgrade() else {
            return;
        };
        if let Some(mut entry) = take_registration(&table, id, serial) {
            // This task is finishing anyway.
            entry.timer = None;
            entry.complete(Err(Ev3Error::Timeout {
                id,
                timeout_ms: timeout.as_millis() as u64,
            }));
        }
    })
}

impl<T> ResponseBroker<T> {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver the reply for `id`, cancelling its timer
    pub fn settle(&self, id: u16, value: T) -> Result<()> {
        let entry = lock(&self.pending).remove(&id).ok_or_else(|| {
            Ev3Error::correlation(format!("no pending request for response {}", id))
        })?;
        entry.complete(Ok(value));
        Ok(())
    }

    /// Fail every pending wait
    pub fn reject_all<F>(&self, mut error: F)
    where
        F: FnMut(u16) -> Ev3Error,
    {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (id, entry) in drained {
            entry.complete(Err(error(id)));
        }
    }

    /// Number of requests currently waiting
    pub fn size(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether a reply for `id` is awaited
    pub fn is_pending(&self, id: u16) -> bool {
        lock(&self.pending).contains_key(&id)
    }
}

/// Resolves with the reply for one request id
///
/// Resolves exactly once: with the settled value, a timeout, or the error
/// given to [`ResponseBroker::reject_all`].
pub struct ResponseFuture<T> {
    id: u16,
    serial: u64,
    receiver: oneshot::Receiver<Result<T>>,
    pending: Weak<Table<T>>,
    done: bool,
}

impl<T> ResponseFuture<T> {
    /// Id this future is waiting on
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            panic!("ResponseFuture polled after completion");
        }

        let result = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        self.done = true;
        Poll::Ready(result.unwrap_or_else(|_| {
            Err(Ev3Error::correlation(format!(
                "pending entry for request {} was dropped",
                self.id
            )))
        }))
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(table) = self.pending.upgrade() {
            if let Some(entry) = take_registration(&table, self.id, self.serial) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
    }
}
