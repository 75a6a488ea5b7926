//! Transaction scoping for pipeline stages.
//!
//! A [`UnitOfWork`] opens one store transaction, hands the stage access to
//! the event queue, the scene table and the artifact bucket, and closes the
//! transaction according to how the stage ended:
//!
//! | stage result                        | transaction | returned            |
//! |-------------------------------------|-------------|---------------------|
//! | `Ok`                                | commit      | `Outcome::Committed`|
//! | expected error (incl. queue empty)  | commit      | `Outcome::Failed`   |
//! | deadline, policy `drop`             | commit      | `Outcome::Failed`   |
//! | deadline, policy `retry`            | rollback    | `Err`               |
//! | any other error                     | rollback    | `Err`               |
//!
//! Committing on an expected error consumes the triggering event; rolling
//! back leaves it queued for another attempt.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::config::DeadlinePolicy;
use crate::error::{Result, StiltError};
use crate::queue::{EventQueue, Store, StoreTransaction};
use crate::scene::SceneRepository;
use crate::storage::ArtifactStore;

/// How a finished unit of work ended, when it did not need a rollback.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The stage succeeded and its writes are durable.
    Committed(T),
    /// The stage failed in an expected way; its event is consumed.
    Failed(StiltError),
}

impl<T> Outcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// The expected failure, if any.
    pub fn failure(&self) -> Option<&StiltError> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Committed(_) => None,
        }
    }

    /// True when the stage found nothing to do.
    pub fn is_queue_empty(&self) -> bool {
        self.failure().is_some_and(StiltError::is_queue_empty)
    }
}

/// Scoped access to one store transaction plus the artifact bucket.
pub struct UnitOfWork<S: Store> {
    store: Arc<S>,
    artifacts: Arc<dyn ArtifactStore>,
    deadline_policy: DeadlinePolicy,
    tx: Option<S::Tx>,
}

impl<S: Store> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("store", &std::any::type_name::<S>())
            .field("deadline_policy", &self.deadline_policy)
            .field("active", &self.tx.is_some())
            .finish()
    }
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(
        store: Arc<S>,
        artifacts: Arc<dyn ArtifactStore>,
        deadline_policy: DeadlinePolicy,
    ) -> Self {
        Self {
            store,
            artifacts,
            deadline_policy,
            tx: None,
        }
    }

    pub fn deadline_policy(&self) -> DeadlinePolicy {
        self.deadline_policy
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Open a transaction. Units of work do not nest.
    pub async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(StiltError::UnitOfWorkActive);
        }
        self.tx = Some(self.store.begin().await?);
        Ok(())
    }

    /// The event queue inside the active transaction.
    pub fn events(&mut self) -> Result<&mut dyn EventQueue> {
        match self.tx.as_mut() {
            Some(tx) => Ok(tx as &mut dyn EventQueue),
            None => Err(StiltError::NoActiveUnitOfWork),
        }
    }

    /// The scene table inside the active transaction.
    pub fn scenes(&mut self) -> Result<&mut dyn SceneRepository> {
        match self.tx.as_mut() {
            Some(tx) => Ok(tx as &mut dyn SceneRepository),
            None => Err(StiltError::NoActiveUnitOfWork),
        }
    }

    /// The artifact bucket, available only inside a unit of work.
    ///
    /// Artifact writes are not transactional; they happen before the
    /// transaction commits and survive a rollback.
    pub fn artifacts(&self) -> Result<Arc<dyn ArtifactStore>> {
        if self.tx.is_none() {
            return Err(StiltError::NoActiveUnitOfWork);
        }
        Ok(Arc::clone(&self.artifacts))
    }

    fn commits_on(&self, err: &StiltError) -> bool {
        if err.is_deadline() {
            return self.deadline_policy == DeadlinePolicy::Drop;
        }
        err.is_expected()
    }

    /// Close the active transaction according to `result`.
    pub async fn finish<T>(&mut self, result: Result<T>) -> Result<Outcome<T>> {
        let tx = self.tx.take().ok_or(StiltError::NoActiveUnitOfWork)?;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(Outcome::Committed(value))
            }
            Err(err) if self.commits_on(&err) => {
                tx.commit().await?;
                if err.is_queue_empty() {
                    debug!(error = %err, "nothing to do");
                } else {
                    error!(error = %err, "stage failed; event consumed");
                }
                Ok(Outcome::Failed(err))
            }
            Err(err) => {
                error!(error = %err, "stage failed unexpectedly; rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Run `body` inside a fresh transaction and close it with
    /// [`finish`](Self::finish).
    pub async fn run<T, F>(&mut self, body: F) -> Result<Outcome<T>>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork<S>) -> BoxFuture<'u, Result<T>> + Send,
    {
        self.begin().await?;
        let result = body(self).await;
        self.finish(result).await
    }
}
