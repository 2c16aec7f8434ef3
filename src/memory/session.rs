//! Generation sessions: exclusive scope, write lock, cancellation

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex, MutexGuard};

use super::models::SessionScope;
use crate::error::{ContextError, Result};

/// Mutable session state guarded by the session write lock
pub(crate) struct SessionState {
    pub scope: SessionScope,
    pub next_seq: u64,
}

/// A generation session.
///
/// The scope belongs to this session alone. Writers hold the state mutex,
/// so at most one write is active per session at any time.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    cancel_tx: watch::Sender<bool>,
    ended: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: String, scope: SessionScope, next_seq: u64) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState { scope, next_seq }),
            cancel_tx,
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot of the current scope
    pub async fn scope(&self) -> SessionScope {
        self.state.lock().await.scope.clone()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Signal every in-flight request of this session to stop
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Handle that resolves once the session is cancelled
    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            session_id: self.id.clone(),
            rx: self.cancel_tx.subscribe(),
        }
    }

    /// Error unless the session still accepts writes
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_ended() {
            return Err(ContextError::SessionClosed(self.id.clone()));
        }
        if self.is_cancelled() {
            return Err(ContextError::Cancelled(self.id.clone()));
        }
        Ok(())
    }
}

/// Cancellation receiver handed to in-flight requests
#[derive(Clone)]
pub struct CancelSignal {
    session_id: String,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error if cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ContextError::Cancelled(self.session_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Completes once cancelled. Pending forever if the session is dropped
    /// without being cancelled.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let session = Session::new("s".to_string(), SessionScope::new("s"), 0);
        let mut signal = session.cancel_signal();
        assert!(signal.check().is_ok());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.is_cancelled()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.cancel();

        assert!(waiter.await.unwrap());
        assert!(matches!(session.ensure_writable(), Err(ContextError::Cancelled(_))));
    }

    #[test]
    fn test_signal_pending_until_cancel() {
        let session = Session::new("s".to_string(), SessionScope::new("s"), 0);
        let mut signal = session.cancel_signal();
        let mut cancelled = tokio_test::task::spawn(async move { signal.cancelled().await });

        tokio_test::assert_pending!(cancelled.poll());
        session.cancel();
        assert!(cancelled.is_woken());
        tokio_test::assert_ready!(cancelled.poll());
    }

    #[tokio::test]
    async fn test_ended_session_rejects_writes() {
        let session = Session::new("s".to_string(), SessionScope::new("s"), 0);
        session.mark_ended();
        assert!(matches!(session.ensure_writable(), Err(ContextError::SessionClosed(_))));
    }
}
