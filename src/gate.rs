//! Admission gate: a fixed pool of persistence sessions.
//!
//! Any number of connections may be open, but only as many frames as there
//! are pooled sessions can be persisted at once. [`AdmissionGate::acquire`]
//! waits for a free session; the returned [`SessionLease`] puts it back when
//! dropped, on every path out of the caller (success, error, or
//! cancellation). A lease marked failed refreshes its session on the way back
//! so a broken connection to the backend is not handed to the next caller.
//!
//! ## Concurrency
//!
//! A `Semaphore` counts idle sessions and a `Mutex<Vec<_>>` holds them. The
//! two move in lockstep: a permit is only released after its session is back
//! in the free list.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::store::{Session, Store, StoreError};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("admission gate is closed")]
pub struct GateClosed;

struct Pool<S> {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<S>>,
    size: usize,
}

impl<S> Pool<S> {
    fn idle(&self) -> MutexGuard<'_, Vec<S>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of backend sessions. Cloning shares the pool.
pub struct AdmissionGate<S> {
    pool: Arc<Pool<S>>,
}

impl<S> Clone for AdmissionGate<S> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<S: Session> AdmissionGate<S> {
    /// Open `size` sessions on `store` and pool them.
    pub fn open<St>(store: &St, size: usize) -> Result<Self, StoreError>
    where
        St: Store<Session = S>,
    {
        let sessions = (0..size)
            .map(|_| store.open_session())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_sessions(sessions))
    }

    /// Pool already-open sessions.
    pub fn from_sessions(sessions: Vec<S>) -> Self {
        let size = sessions.len();
        Self {
            pool: Arc::new(Pool {
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(sessions),
                size,
            }),
        }
    }

    /// Wait for an idle session.
    pub async fn acquire(&self) -> Result<SessionLease<S>, GateClosed> {
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        // Holding a permit guarantees an idle session.
        let session = self.pool.idle().pop().ok_or(GateClosed)?;
        Ok(SessionLease {
            session: Some(session),
            failed: false,
            pool: Arc::clone(&self.pool),
            _permit: permit,
        })
    }

    /// Stop handing out sessions. Pending and future `acquire` calls fail;
    /// outstanding leases still return normally.
    pub fn close(&self) {
        self.pool.permits.close();
    }

    /// Number of sessions currently idle.
    pub fn available(&self) -> usize {
        self.pool.permits.available_permits()
    }

    /// Total number of pooled sessions.
    pub fn size(&self) -> usize {
        self.pool.size
    }
}

/// Exclusive use of one pooled session until dropped.
pub struct SessionLease<S: Session> {
    session: Option<S>,
    failed: bool,
    pool: Arc<Pool<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: Session> SessionLease<S> {
    /// Refresh the session before it goes back into the pool.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl<S: Session> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session.as_ref().expect("lease holds its session until dropped")
    }
}

impl<S: Session> DerefMut for SessionLease<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().expect("lease holds its session until dropped")
    }
}

impl<S: Session> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if self.failed {
                session.refresh();
                debug!("Refreshed persistence session after failure");
            }
            self.pool.idle().push(session);
        }
        // `_permit` is released after this, once the session is back.
    }
}
