use async_trait::async_trait;

use crate::error::Result;
use crate::events::{Event, EventId, EventKind};
use crate::scene::SceneRepository;

/// Durable, transactional FIFO of pipeline events.
///
/// Every method runs inside the caller's transaction. A dequeued event is
/// gone only once that transaction commits; on rollback it becomes visible
/// again. Concurrent transactions never receive the same event: rows claimed
/// by one are skipped by the others rather than waited on.
#[async_trait]
pub trait EventQueue: Send {
    /// Append one event.
    async fn enqueue(&mut self, event: &Event) -> Result<EventId>;

    /// Append several events, preserving their order.
    async fn enqueue_many(&mut self, events: &[Event]) -> Result<Vec<EventId>> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(self.enqueue(event).await?);
        }
        Ok(ids)
    }

    /// Claim and remove the oldest unclaimed event of `kind`.
    ///
    /// Fails with [`StiltError::NotFound`](crate::StiltError::NotFound) when
    /// nothing is available.
    async fn dequeue(&mut self, kind: EventKind) -> Result<Event>;

    /// Events of `kind` visible to this transaction.
    async fn count(&mut self, kind: EventKind) -> Result<u64>;
}

/// One open transaction over the queue and the scene table.
#[async_trait]
pub trait StoreTransaction: EventQueue + SceneRepository + Sized + 'static {
    async fn commit(self) -> Result<()>;
    async fn rollback(self) -> Result<()>;
}

/// Source of transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTransaction;

    async fn begin(&self) -> Result<Self::Tx>;
}
