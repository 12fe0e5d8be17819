//! Synchronous call bridge.
//!
//! The channel to the service is callback based and a callback may never
//! fire, for instance when the service dies mid-call. [`SyncBridge::invoke`]
//! turns such a call into a blocking one with a deadline. Calls through one
//! bridge are serialized: at most one [`PendingCall`] exists at a time.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::ipc::ClientError;

/// Slot a reply is written into; disarmed once the caller stops waiting.
struct Slot<T> {
    token: Uuid,
    sender: Mutex<Option<SyncSender<Result<T, ClientError>>>>,
}

impl<T> Slot<T> {
    fn fill(&self, result: Result<T, ClientError>) -> bool {
        let sender = lock(&self.sender).take();
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                tracing::debug!(token = %self.token, "Discarding late reply");
                false
            }
        }
    }
}

/// Type-erased access to the pending slot, for early failure.
trait Abort: Send + Sync {
    fn abort(&self, error: ClientError) -> bool;
    fn disarm(&self);
}

impl<T: Send> Abort for Slot<T> {
    fn abort(&self, error: ClientError) -> bool {
        self.fill(Err(error))
    }

    fn disarm(&self) {
        lock(&self.sender).take();
    }
}

/// Completion handle passed to the body of [`SyncBridge::invoke`].
///
/// Completing after the caller gave up is harmless: the value is dropped.
/// Dropping the handle without completing fails the call with
/// [`ClientError::NotConnected`].
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completion<T> {
    /// Delivers the result. Returns `false` if nobody is waiting anymore.
    pub fn complete(self, result: Result<T, ClientError>) -> bool {
        self.slot.fill(result)
    }

    /// Correlation token of the call this completion belongs to.
    #[must_use]
    pub fn token(&self) -> Uuid {
        self.slot.token
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        // Releases the sender if `complete` was never called.
        lock(&self.slot.sender).take();
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.slot.token)
            .finish()
    }
}

/// The single in-flight call of a bridge.
pub struct PendingCall {
    pub token: Uuid,
    pub deadline: Instant,
    slot: Arc<dyn Abort>,
}

/// Turns callback-based calls into blocking calls with a timeout.
#[derive(Default)]
pub struct SyncBridge {
    /// Serializes callers.
    call_lock: Mutex<()>,
    /// Thread currently inside `invoke`, to reject re-entrant calls.
    owner: Mutex<Option<ThreadId>>,
    pending: Mutex<Option<PendingCall>>,
}

impl SyncBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` and blocks until it completes or `timeout` elapses.
    ///
    /// `body` runs with the bridge lock held and must not call back into the
    /// same bridge.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if no result arrived in time
    /// - [`ClientError::NotConnected`] if the completion was dropped unused
    /// - [`ClientError::Unexpected`] on a re-entrant call from the same thread
    /// - any error the body completed with
    pub fn invoke<T, F>(&self, timeout: Duration, body: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>),
    {
        let current = thread::current().id();
        if *lock(&self.owner) == Some(current) {
            return Err(ClientError::Unexpected(
                "re-entrant blocking call on the same client".to_string(),
            ));
        }

        let _guard = lock(&self.call_lock);
        *lock(&self.owner) = Some(current);

        let (tx, rx) = mpsc::sync_channel(1);
        let slot = Arc::new(Slot {
            token: Uuid::new_v4(),
            sender: Mutex::new(Some(tx)),
        });
        let token = slot.token;
        *lock(&self.pending) = Some(PendingCall {
            token,
            deadline: Instant::now() + timeout,
            slot: Arc::clone(&slot) as Arc<dyn Abort>,
        });

        tracing::trace!(%token, timeout_ms = timeout.as_millis(), "Blocking call started");
        body(Completion {
            slot: Arc::clone(&slot),
        });

        let result = match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Safe: timeout values are never going to exceed u64::MAX milliseconds
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                tracing::debug!(%token, timeout_ms, "Blocking call timed out");
                Err(ClientError::Timeout(timeout_ms))
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!(%token, "Completion dropped without a reply");
                Err(ClientError::NotConnected)
            }
        };

        slot.disarm();
        lock(&self.pending).take();
        lock(&self.owner).take();
        result
    }

    /// Fails the in-flight call, if any, with `error`.
    ///
    /// Returns `true` if a waiting caller received the error.
    pub fn fail_pending(&self, error: ClientError) -> bool {
        let slot = lock(&self.pending).as_ref().map(|call| Arc::clone(&call.slot));
        match slot {
            Some(slot) => slot.abort(error),
            None => false,
        }
    }

    /// Token of the in-flight call, if any.
    #[must_use]
    pub fn pending_token(&self) -> Option<Uuid> {
        lock(&self.pending).as_ref().map(|call| call.token)
    }

    /// Deadline of the in-flight call, if any.
    #[must_use]
    pub fn pending_deadline(&self) -> Option<Instant> {
        lock(&self.pending).as_ref().map(|call| call.deadline)
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("pending", &self.pending_token())
            .finish_non_exhaustive()
    }
}

/// Locks a mutex, ignoring poisoning; the guarded state stays consistent
/// because every critical section is a single assignment or take.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn returns_value_from_inline_completion() {
        let bridge = SyncBridge::new();
        let result = bridge.invoke(Duration::from_secs(1), |done| {
            done.complete(Ok(7));
        });
        assert_eq!(result, Ok(7));
        assert!(bridge.pending_token().is_none());
    }

    #[test]
    fn returns_value_from_other_thread() {
        let bridge = SyncBridge::new();
        let result: Result<&str, _> = bridge.invoke(Duration::from_secs(2), |done| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                done.complete(Ok("late but in time"));
            });
        });
        assert_eq!(result, Ok("late but in time"));
    }

    #[test]
    fn times_out_and_discards_late_reply() {
        let bridge = SyncBridge::new();
        let mut parked = None;
        let started = Instant::now();
        let result: Result<u8, _> = bridge.invoke(Duration::from_millis(100), |done| {
            parked = Some(done);
        });
        let elapsed = started.elapsed();

        assert_eq!(result, Err(ClientError::Timeout(100)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        let late = parked.take().unwrap();
        assert!(!late.complete(Ok(1)));
    }

    #[test]
    fn dropped_completion_fails_fast() {
        let bridge = SyncBridge::new();
        let started = Instant::now();
        let result: Result<(), _> = bridge.invoke(Duration::from_secs(10), drop);
        assert_eq!(result, Err(ClientError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn errors_are_propagated() {
        let bridge = SyncBridge::new();
        let result: Result<(), _> = bridge.invoke(Duration::from_secs(1), |done| {
            done.complete(Err(ClientError::Remote("denied".to_string())));
        });
        assert_eq!(result, Err(ClientError::Remote("denied".to_string())));
    }

    #[test]
    fn reentrant_call_is_rejected() {
        let bridge = SyncBridge::new();
        let result: Result<Result<(), ClientError>, _> =
            bridge.invoke(Duration::from_secs(1), |done| {
                let inner = bridge.invoke(Duration::from_secs(1), |d: Completion<()>| {
                    d.complete(Ok(()));
                });
                done.complete(Ok(inner));
            });
        assert!(matches!(result, Ok(Err(ClientError::Unexpected(_)))));
    }

    #[test]
    fn fail_pending_wakes_caller() {
        let bridge = Arc::new(SyncBridge::new());
        let failer = Arc::clone(&bridge);
        let handle = thread::spawn(move || {
            while failer.pending_token().is_none() {
                thread::sleep(Duration::from_millis(5));
            }
            assert!(failer.pending_deadline().is_some());
            failer.fail_pending(ClientError::NotConnected)
        });

        let mut parked = None;
        let started = Instant::now();
        let result: Result<(), _> = bridge.invoke(Duration::from_secs(10), |done| {
            parked = Some(done);
        });
        assert_eq!(result, Err(ClientError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.join().unwrap());
        assert!(!bridge.fail_pending(ClientError::NotConnected));
    }

    #[test]
    fn concurrent_calls_never_overlap() {
        let bridge = Arc::new(SyncBridge::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    bridge.invoke(Duration::from_secs(5), |done| {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        let in_flight = Arc::clone(&in_flight);
                        thread::spawn(move || {
                            thread::sleep(Duration::from_millis(30));
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            done.complete(Ok(()));
                        });
                    })
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), Ok(()));
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
