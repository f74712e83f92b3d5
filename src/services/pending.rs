//! Correlation table of a dispatcher: which callers are waiting on which job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::AnalysisStatus;

/// What a released waiter receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Answered(AnalysisStatus),
    Cancelled,
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(Completion),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("Dispatcher is shutting down")]
    Closed,

    #[error("Job {0} already has a waiter")]
    Duplicate(Uuid),
}

/// Map from job id to the sender half that releases its waiter.
///
/// Removing an entry is what grants the right to release the waiter, so each
/// waiter is released at most once no matter which path gets there first.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<Uuid, oneshot::Sender<Completion>>,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for `job_id`. Must happen before the job is published.
    pub fn register(
        self: &Arc<Self>,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<PendingRequest, RegisterError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(RegisterError::Closed);
            }
            if inner.waiters.contains_key(&job_id) {
                return Err(RegisterError::Duplicate(job_id));
            }
            inner.waiters.insert(job_id, tx);
        }

        Ok(PendingRequest {
            job_id,
            deadline: Instant::now() + timeout,
            rx,
            table: Arc::clone(self),
            settled: false,
        })
    }

    /// Hand `status` to the waiter of `job_id`. Returns false when nobody is
    /// waiting any more (timed out, cancelled, or never registered here).
    pub fn complete(&self, job_id: Uuid, status: AnalysisStatus) -> bool {
        let Some(tx) = self.lock().waiters.remove(&job_id) else {
            return false;
        };
        // The receiver may be gone if the caller's task was aborted.
        tx.send(Completion::Answered(status)).is_ok()
    }

    /// Drop the entry for `job_id`. Returns whether it was still present.
    pub fn remove(&self, job_id: Uuid) -> bool {
        self.lock().waiters.remove(&job_id).is_some()
    }

    /// Release every waiter with [`Completion::Cancelled`] and refuse new
    /// registrations. Returns the number of waiters released.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.waiters.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Completion::Cancelled);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One caller's registered wait. Dropping it without waiting removes the entry.
pub struct PendingRequest {
    job_id: Uuid,
    deadline: Instant,
    rx: oneshot::Receiver<Completion>,
    table: Arc<PendingTable>,
    settled: bool,
}

impl PendingRequest {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self) -> WaitOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(completion)) => WaitOutcome::Completed(completion),
            // Sender dropped unsent: the table itself went away.
            Ok(Err(_)) => WaitOutcome::Completed(Completion::Cancelled),
            Err(_) if self.table.remove(self.job_id) => WaitOutcome::TimedOut,
            Err(_) => {
                // A responder removed the entry just before the deadline and
                // is about to send; take its value instead of reporting a timeout.
                match (&mut self.rx).await {
                    Ok(completion) => WaitOutcome::Completed(completion),
                    Err(_) => WaitOutcome::Completed(Completion::Cancelled),
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.settled {
            self.table.remove(self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(text: &str) -> AnalysisStatus {
        AnalysisStatus::Ok {
            analysis_text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_complete_releases_matching_waiter() {
        let table = Arc::new(PendingTable::new());
        let id = Uuid::new_v4();
        let pending = table.register(id, Duration::from_secs(5)).unwrap();

        assert!(table.complete(id, ok("done")));
        assert_eq!(
            pending.wait().await,
            WaitOutcome::Completed(Completion::Answered(ok("done")))
        );
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let table = Arc::new(PendingTable::new());
        let id = Uuid::new_v4();
        let _first = table.register(id, Duration::from_secs(5)).unwrap();
        assert_eq!(
            table.register(id, Duration::from_secs(5)).err(),
            Some(RegisterError::Duplicate(id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_response_is_ignored() {
        let table = Arc::new(PendingTable::new());
        let id = Uuid::new_v4();
        let pending = table.register(id, Duration::from_millis(50)).unwrap();

        assert_eq!(pending.wait().await, WaitOutcome::TimedOut);
        assert!(table.is_empty());
        assert!(!table.complete(id, ok("too late")));
    }

    #[tokio::test]
    async fn test_dropping_request_removes_entry() {
        let table = Arc::new(PendingTable::new());
        let pending = table.register(Uuid::new_v4(), Duration::from_secs(5)).unwrap();
        assert_eq!(table.len(), 1);
        drop(pending);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_response_racing_deadline_releases_once() {
        for _ in 0..200 {
            let table = Arc::new(PendingTable::new());
            let id = Uuid::new_v4();
            let pending = table.register(id, Duration::from_millis(1)).unwrap();

            let responder = {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    table.complete(id, ok("raced"))
                })
            };

            let outcome = pending.wait().await;
            let delivered = responder.await.unwrap();

            match outcome {
                WaitOutcome::TimedOut => assert!(!delivered),
                WaitOutcome::Completed(Completion::Answered(_)) => assert!(delivered),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert!(table.is_empty());
        }
    }

    #[tokio::test]
    async fn test_close_cancels_everyone_and_refuses_new_waiters() {
        let table = Arc::new(PendingTable::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| table.register(Uuid::new_v4(), Duration::from_secs(60)).unwrap())
            .collect();

        assert_eq!(table.close(), 3);
        for pending in waiters {
            assert_eq!(
                pending.wait().await,
                WaitOutcome::Completed(Completion::Cancelled)
            );
        }
        assert!(table.is_empty());
        assert_eq!(
            table.register(Uuid::new_v4(), Duration::from_secs(1)).err(),
            Some(RegisterError::Closed)
        );
    }
}
