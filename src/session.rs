//! Ambient — concurrency primitives (spec §5). A correlation tag travels
//! with each compile/execute submission inside the pipeline's `comment`
//! field; cancellation looks the tag up and aborts the matching in-flight
//! future. Grounded directly on the teacher's
//! `engine/drivers/mongodb.rs`'s `active_queries: Mutex<HashMap<QueryId,
//! (SessionId, AbortHandle)>>` plus `futures::future::{AbortHandle,
//! Abortable}` — generalized from one hardcoded map per driver instance to
//! one `QuerySession` per logical session, each tracking its own tags.

use std::collections::HashMap;
use std::fmt;

use futures::future::{AbortHandle, AbortRegistration};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationTag(pub Uuid);

impl CorrelationTag {
    pub fn new() -> Self {
        CorrelationTag(Uuid::new_v4())
    }
}

impl Default for CorrelationTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Cancelled,
}

struct Inner {
    active: HashMap<CorrelationTag, AbortHandle>,
    state: SessionState,
}

/// One query session's cancellation bookkeeping. Submissions register a
/// tag before running and deregister it on completion; cancelling a tag
/// that is not currently registered means the cancel raced ahead of the
/// submission, so the session latches into `Cancelled` and rejects further
/// submissions until `reset`.
pub struct QuerySession {
    inner: Mutex<Inner>,
}

impl QuerySession {
    pub fn new() -> Self {
        QuerySession { inner: Mutex::new(Inner { active: HashMap::new(), state: SessionState::Active }) }
    }

    /// Registers `tag` for an about-to-run submission, returning the
    /// registration to wrap the submission's future in `Abortable::new`.
    /// Fails with `QueryCancelled` if the session is already cancelled.
    pub async fn begin(&self, tag: CorrelationTag) -> EngineResult<AbortRegistration> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Cancelled {
            return Err(EngineError::QueryCancelled);
        }
        let (handle, registration) = AbortHandle::new_pair();
        inner.active.insert(tag, handle);
        Ok(registration)
    }

    /// Deregisters `tag` once its submission has finished, successfully or
    /// otherwise.
    pub async fn complete(&self, tag: CorrelationTag) {
        self.inner.lock().await.active.remove(&tag);
    }

    /// Cancels `tag`. If it is currently running, aborts it. If it has not
    /// been registered yet (or has already completed), the session is
    /// marked cancelled so the submission is rejected when it does arrive.
    pub async fn cancel(&self, tag: CorrelationTag) {
        let mut inner = self.inner.lock().await;
        match inner.active.remove(&tag) {
            Some(handle) => handle.abort(),
            None => inner.state = SessionState::Cancelled,
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        self.inner.lock().await.state == SessionState::Cancelled
    }

    /// Clears the cancelled state, allowing new submissions again.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Active;
        inner.active.clear();
    }
}

impl Default for QuerySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::Abortable;

    #[tokio::test]
    async fn cancelling_a_running_tag_aborts_it() {
        let session = QuerySession::new();
        let tag = CorrelationTag::new();
        let reg = session.begin(tag).await.unwrap();

        let fut = Abortable::new(async { tokio::time::sleep(std::time::Duration::from_secs(60)).await }, reg);
        session.cancel(tag).await;
        let result = fut.await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancelling_before_submission_latches_cancelled_state() {
        let session = QuerySession::new();
        let tag = CorrelationTag::new();
        session.cancel(tag).await;
        assert!(session.is_cancelled().await);

        let err = session.begin(CorrelationTag::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::QueryCancelled));

        session.reset().await;
        assert!(!session.is_cancelled().await);
        assert!(session.begin(CorrelationTag::new()).await.is_ok());
    }

    #[tokio::test]
    async fn complete_deregisters_tag() {
        let session = QuerySession::new();
        let tag = CorrelationTag::new();
        let _reg = session.begin(tag).await.unwrap();
        session.complete(tag).await;
        assert_eq!(session.inner.lock().await.active.len(), 0);
    }
}
