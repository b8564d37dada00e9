//! Per-execution capability bag.
//!
//! A [`Context`] is created for every top-level evaluation (a script run or
//! one REPL entry) and handed to every effectful verb. It bundles the
//! granted permission set, the shared limit buckets, and a cancellation
//! signal. Child contexts (spawned servers, the KV persister) share the
//! buckets and are cancelled with their parent.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{LimitError, RtError};
use crate::limit::Limiter;
use crate::permission::Permission;

#[derive(Debug)]
struct Inner {
    grants: Vec<Permission>,
    limiter: Arc<Limiter>,
    cancel: CancellationToken,
    parent: Option<Context>,
}

/// Cheaply cloneable handle; clones share grants, buckets and signal.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    #[must_use]
    pub fn new(grants: Vec<Permission>, limiter: Limiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                grants,
                limiter: Arc::new(limiter),
                cancel: CancellationToken::new(),
                parent: None,
            }),
        }
    }

    /// Child context sharing this one's buckets and grants. Its signal is
    /// chained: cancelling the parent cancels the child, not vice versa.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                grants: self.inner.grants.clone(),
                limiter: Arc::clone(&self.inner.limiter),
                cancel: self.inner.cancel.child_token(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Pure capability check: no bucket effect, must precede reservations.
    ///
    /// Linear scan of the granted set, first satisfaction wins. The error
    /// carries the requested permission verbatim.
    pub fn check(&self, request: &Permission) -> Result<(), RtError> {
        if self.inner.grants.iter().any(|g| g.satisfies(request)) {
            Ok(())
        } else {
            tracing::debug!(requested = %request, "permission denied");
            Err(RtError::denied(request.clone()))
        }
    }

    /// Blocking reservation of `n` tokens from bucket `name`.
    pub async fn take(&self, name: &str, n: u64) -> Result<(), RtError> {
        self.inner.limiter.take(name, n, &self.inner.cancel).await
    }

    /// Refill rate of a declared bucket; [`LimitError::RateUnknown`] otherwise.
    pub fn get_rate(&self, name: &str) -> Result<u64, LimitError> {
        self.inner.limiter.rate(name)
    }

    /// Rate if declared; `None` means the stream is unlimited.
    #[must_use]
    pub fn declared_rate(&self, name: &str) -> Option<u64> {
        self.inner.limiter.declared_rate(name)
    }

    #[must_use]
    pub fn limiter(&self) -> &Limiter {
        &self.inner.limiter
    }

    #[must_use]
    pub fn grants(&self) -> &[Permission] {
        &self.inner.grants
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Bail out early if the signal already fired. Chunk loops call this at
    /// every chunk boundary.
    pub fn ensure_live(&self) -> Result<(), RtError> {
        if self.is_cancelled() {
            Err(RtError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Process working directory used to absolutize relative script paths.
    #[must_use]
    pub fn cwd(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }
}
