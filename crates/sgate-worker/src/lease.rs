//! Assignment leases.
//!
//! A lease ties a job to the worker that owns it. Every state write by the
//! worker happens while holding the lease guard; revocation takes the same
//! lock, so once `revoke` returns no further write from the old owner can
//! land.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use sgate_models::{JobId, WorkerId};

struct LeaseInner {
    job_id: JobId,
    worker_id: WorkerId,
    revoked: Mutex<bool>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

/// Proof that the lease was valid when the guard was taken.
pub struct LeaseGuard<'a> {
    _lock: MutexGuard<'a, bool>,
}

impl Lease {
    pub fn new(job_id: JobId, worker_id: WorkerId) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                job_id,
                worker_id,
                revoked: Mutex::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    /// Cancelled on revocation. Job-level tokens are children of it.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Take the write guard, or `None` if the lease is gone.
    pub async fn guard(&self) -> Option<LeaseGuard<'_>> {
        let lock = self.inner.revoked.lock().await;
        if *lock {
            None
        } else {
            Some(LeaseGuard { _lock: lock })
        }
    }

    /// Revoke the lease, waiting for any in-flight guarded write.
    pub async fn revoke(&self) {
        let mut lock = self.inner.revoked.lock().await;
        *lock = true;
        self.inner.token.cancel();
    }
}
