//! Per-unit table of outstanding request ids. Each entry parks exactly
//! one waiter until a matching `resolve`/`reject` frame arrives, its timer
//! fires, or the unit closes (unless the caller opted out of that).

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use protocol::{Correlation, MAX_CORRELATION, Value};
use tokio::sync::oneshot;

use crate::error::SendError;

#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Resolved(Value),
    Rejected(Value),
    /// A `stream-resolve`: `channel` is the id the *responder* allocated
    /// for the stream (see [`crate::stream::StreamController`]) — the
    /// caller adopts it rather than whatever placeholder id it sent in
    /// the original reader-request/writer-request frame.
    StreamResolved { channel: Correlation, value: Value },
}

pub type ResponseResult = Result<ResponseOutcome, SendError>;

struct Entry {
    tx: oneshot::Sender<ResponseResult>,
    ignore_unit_close: bool,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub struct CorrelationTable {
    entries: std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<Correlation, Entry>>>,
    next_id: StdMutex<Correlation>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
            next_id: StdMutex::new(0),
        }
    }

    /// Allocates a fresh correlation id, registers a one-shot waiter, and
    /// arms a timer. Returns the id plus a receiver the caller awaits.
    pub async fn prepare(
        &self,
        timeout: Duration,
        ignore_unit_close: bool,
    ) -> (Correlation, oneshot::Receiver<ResponseResult>) {
        let (tx, rx) = oneshot::channel();
        let corr = {
            let mut guard = self.entries.lock().await;
            let id = next_free_id(&self.next_id, &guard.keys().copied().collect());
            guard.insert(id, Entry { tx, ignore_unit_close });
            id
        };

        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut guard = entries.lock().await;
            if let Some(entry) = guard.remove(&corr) {
                let _ = entry.tx.send(Err(SendError::Timeout(timeout)));
            }
        });

        (corr, rx)
    }

    /// Delivers `outcome` to the waiter registered for `corr`. No-op if
    /// the entry was already removed (responded, timed out, or cancelled).
    pub async fn respond(&self, corr: Correlation, outcome: ResponseResult) {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.remove(&corr) {
            let _ = entry.tx.send(outcome);
        }
    }

    /// Fails every waiter that did not opt out of unit-close cancellation.
    /// Entries that did opt out remain armed and still expire on timeout.
    pub async fn on_unit_close(&self) {
        let mut guard = self.entries.lock().await;
        let stale: Vec<Correlation> = guard
            .iter()
            .filter(|(_, e)| !e.ignore_unit_close)
            .map(|(corr, _)| *corr)
            .collect();
        for corr in stale {
            if let Some(entry) = guard.remove(&corr) {
                let _ = entry.tx.send(Err(SendError::UnitClosed));
            }
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

fn next_free_id(next_id: &StdMutex<Correlation>, in_use: &HashSet<Correlation>) -> Correlation {
    let mut guard = next_id.lock().unwrap();
    loop {
        let candidate = *guard;
        *guard = if candidate >= MAX_CORRELATION { 0 } else { candidate + 1 };
        if !in_use.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_delivers_outcome_to_waiter() {
        let table = CorrelationTable::new();
        let (corr, rx) = table.prepare(Duration::from_secs(5), false).await;
        table.respond(corr, Ok(ResponseOutcome::Resolved(Value::Bool(true)))).await;
        let outcome = rx.await.unwrap().unwrap();
        assert!(matches!(outcome, ResponseOutcome::Resolved(Value::Bool(true))));
    }

    #[tokio::test]
    async fn timeout_fires_when_nobody_responds() {
        let table = CorrelationTable::new();
        let (_corr, rx) = table.prepare(Duration::from_millis(10), false).await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(SendError::Timeout(_))));
    }

    #[tokio::test]
    async fn unit_close_fails_waiters_that_did_not_opt_out() {
        let table = CorrelationTable::new();
        let (_corr1, rx1) = table.prepare(Duration::from_secs(5), false).await;
        let (corr2, rx2) = table.prepare(Duration::from_secs(5), true).await;
        table.on_unit_close().await;
        assert!(matches!(rx1.await.unwrap(), Err(SendError::UnitClosed)));
        // corr2 opted out — it stays armed, so responding still works.
        table.respond(corr2, Ok(ResponseOutcome::Resolved(Value::Null))).await;
        assert!(matches!(rx2.await.unwrap(), Ok(ResponseOutcome::Resolved(Value::Null))));
    }

    #[tokio::test]
    async fn respond_after_removal_is_a_no_op() {
        let table = CorrelationTable::new();
        let (corr, rx) = table.prepare(Duration::from_secs(5), false).await;
        table.respond(corr, Ok(ResponseOutcome::Resolved(Value::Null))).await;
        // Second respond on the same id should not panic.
        table.respond(corr, Ok(ResponseOutcome::Rejected(Value::Null))).await;
        assert!(matches!(rx.await.unwrap(), Ok(ResponseOutcome::Resolved(Value::Null))));
    }
}
