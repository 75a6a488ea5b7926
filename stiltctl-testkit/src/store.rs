use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use stiltctl::{
    Event, EventId, EventKind, EventQueue, EventRecord, Result, RowLock, SceneId, SceneRecord,
    SceneRepository, StiltError, Store, StoreTransaction,
};
use tokio::sync::OwnedMutexGuard;

/// In-memory [`Store`] with the locking behavior of the Postgres backend.
///
/// - A dequeued event is hidden from every other transaction until the
///   claiming one ends; commit deletes it, rollback or drop releases it.
/// - Enqueued events and scene writes become visible to others only on
///   commit.
/// - `get_scene(.., RowLock::ForUpdate)` waits for other holders of the
///   scene's row lock, which is released when the transaction ends.
/// - A scene inserted by an uncommitted transaction already counts as a
///   duplicate for everyone else.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    next_id: i64,
    events: BTreeMap<i64, EventRecord>,
    claimed: HashSet<i64>,
    scenes: HashMap<SceneId, SceneRecord>,
    pending_scenes: HashSet<SceneId>,
    row_locks: HashMap<SceneId, Arc<tokio::sync::Mutex<()>>>,
    commits: u64,
    rollbacks: u64,
}

impl StoreState {
    fn allocate_id(&mut self) -> EventId {
        self.next_id += 1;
        EventId(self.next_id)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed events of `kind`, including ones claimed by open
    /// transactions.
    pub fn queued(&self, kind: EventKind) -> usize {
        self.state
            .lock()
            .events
            .values()
            .filter(|record| record.event_name == kind.as_str())
            .count()
    }

    /// Committed events of `kind`, oldest first.
    pub fn events(&self, kind: EventKind) -> Vec<Event> {
        self.state
            .lock()
            .events
            .values()
            .filter(|record| record.event_name == kind.as_str())
            .filter_map(|record| record.decode().ok())
            .collect()
    }

    /// Insert a raw row, bypassing encoding. Useful for poison events.
    pub fn insert_record(&self, event_name: &str, event_data: serde_json::Value) -> EventId {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.events.insert(
            id.0,
            EventRecord {
                id,
                created_at: Utc::now(),
                event_name: event_name.to_string(),
                event_data,
            },
        );
        id
    }

    /// The committed state of a scene.
    pub fn scene(&self, scene_id: &SceneId) -> Option<SceneRecord> {
        self.state.lock().scenes.get(scene_id).cloned()
    }

    pub fn scene_count(&self) -> usize {
        self.state.lock().scenes.len()
    }

    pub fn commits(&self) -> u64 {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.lock().rollbacks
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            claimed: Vec::new(),
            inserted: Vec::new(),
            created: Vec::new(),
            updated: HashMap::new(),
            locks: HashMap::new(),
            open: true,
        })
    }
}

/// One open in-memory transaction. Dropping it rolls back.
pub struct InMemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    claimed: Vec<i64>,
    inserted: Vec<EventRecord>,
    created: Vec<SceneRecord>,
    updated: HashMap<SceneId, SceneRecord>,
    locks: HashMap<SceneId, OwnedMutexGuard<()>>,
    open: bool,
}

impl InMemoryTransaction {
    fn visible_scene(&self, scene_id: &SceneId) -> Option<SceneRecord> {
        if let Some(scene) = self.updated.get(scene_id) {
            return Some(scene.clone());
        }
        if let Some(scene) = self.created.iter().find(|s| s.scene_id() == scene_id) {
            return Some(scene.clone());
        }
        self.state.lock().scenes.get(scene_id).cloned()
    }

    async fn lock_scene(&mut self, scene_id: &SceneId) {
        if self.locks.contains_key(scene_id) {
            return;
        }
        let mutex = {
            let mut state = self.state.lock();
            Arc::clone(state.row_locks.entry(scene_id.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        self.locks.insert(scene_id.clone(), guard);
    }

    fn release(&mut self, committed: bool) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.state.lock();
        for id in self.claimed.drain(..) {
            state.claimed.remove(&id);
            if committed {
                state.events.remove(&id);
            }
        }
        for scene in self.created.drain(..) {
            state.pending_scenes.remove(scene.scene_id());
            if committed {
                state.scenes.insert(scene.scene_id().clone(), scene);
            }
        }
        if committed {
            for record in self.inserted.drain(..) {
                state.events.insert(record.id.0, record);
            }
            for (scene_id, scene) in self.updated.drain() {
                state.scenes.insert(scene_id, scene);
            }
            state.commits += 1;
        } else {
            state.rollbacks += 1;
        }
        drop(state);
        self.locks.clear();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[async_trait]
impl EventQueue for InMemoryTransaction {
    async fn enqueue(&mut self, event: &Event) -> Result<EventId> {
        let encoded = event.encode()?;
        let id = self.state.lock().allocate_id();
        self.inserted.push(EventRecord {
            id,
            created_at: Utc::now(),
            event_name: encoded.event_name,
            event_data: encoded.event_data,
        });
        Ok(id)
    }

    async fn dequeue(&mut self, kind: EventKind) -> Result<Event> {
        let own = self
            .inserted
            .iter()
            .position(|record| record.event_name == kind.as_str());
        let committed = {
            let mut state = self.state.lock();
            let next = state
                .events
                .values()
                .find(|r| r.event_name == kind.as_str() && !state.claimed.contains(&r.id.0))
                .map(|r| r.id.0);
            match (next, own.map(|i| self.inserted[i].id.0)) {
                (Some(id), Some(own_id)) if own_id < id => None,
                (Some(id), _) => {
                    state.claimed.insert(id);
                    state.events.get(&id).cloned()
                }
                (None, _) => None,
            }
        };

        let record = match (committed, own) {
            (Some(record), _) => {
                self.claimed.push(record.id.0);
                record
            }
            (None, Some(index)) => self.inserted.remove(index),
            (None, None) => return Err(StiltError::NotFound(kind)),
        };
        record.decode()
    }

    async fn count(&mut self, kind: EventKind) -> Result<u64> {
        let committed = self
            .state
            .lock()
            .events
            .values()
            .filter(|r| r.event_name == kind.as_str() && !self.claimed.contains(&r.id.0))
            .count();
        let own = self
            .inserted
            .iter()
            .filter(|r| r.event_name == kind.as_str())
            .count();
        Ok((committed + own) as u64)
    }
}

#[async_trait]
impl SceneRepository for InMemoryTransaction {
    async fn create_scene(&mut self, scene: &SceneRecord) -> Result<()> {
        let scene_id = scene.scene_id();
        if self.created.iter().any(|s| s.scene_id() == scene_id) {
            return Err(StiltError::SceneExists(scene_id.clone()));
        }
        {
            let mut state = self.state.lock();
            if state.scenes.contains_key(scene_id) || state.pending_scenes.contains(scene_id) {
                return Err(StiltError::SceneExists(scene_id.clone()));
            }
            state.pending_scenes.insert(scene_id.clone());
        }
        self.created.push(scene.clone());
        Ok(())
    }

    async fn get_scene(&mut self, scene_id: &SceneId, lock: RowLock) -> Result<SceneRecord> {
        if lock == RowLock::ForUpdate {
            self.lock_scene(scene_id).await;
        }
        self.visible_scene(scene_id)
            .ok_or_else(|| StiltError::SceneNotFound(scene_id.clone()))
    }

    async fn save_scene(&mut self, scene: &SceneRecord) -> Result<()> {
        let scene_id = scene.scene_id();
        if let Some(created) = self.created.iter_mut().find(|s| s.scene_id() == scene_id) {
            *created = scene.clone();
            return Ok(());
        }
        if self.visible_scene(scene_id).is_none() {
            return Err(StiltError::SceneNotFound(scene_id.clone()));
        }
        self.lock_scene(scene_id).await;
        self.updated.insert(scene_id.clone(), scene.clone());
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(mut self) -> Result<()> {
        self.release(true);
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.release(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::domain_config;

    #[tokio::test]
    async fn test_claimed_event_is_hidden_until_rollback() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.enqueue(&Event::SceneCreated {
            domain_config: domain_config(1, 1),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        first.dequeue(EventKind::SceneCreated).await.unwrap();

        let mut second = store.begin().await.unwrap();
        assert!(matches!(
            second.dequeue(EventKind::SceneCreated).await,
            Err(StiltError::NotFound(EventKind::SceneCreated))
        ));

        first.rollback().await.unwrap();
        second.dequeue(EventKind::SceneCreated).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(store.queued(EventKind::SceneCreated), 0);
    }

    #[tokio::test]
    async fn test_pending_scene_counts_as_duplicate() {
        let store = InMemoryStore::new();
        let scene = SceneRecord::new(SceneId::new("s"), 4);

        let mut first = store.begin().await.unwrap();
        first.create_scene(&scene).await.unwrap();

        let mut second = store.begin().await.unwrap();
        assert!(matches!(
            second.create_scene(&scene).await,
            Err(StiltError::SceneExists(_))
        ));

        drop(first);
        second.create_scene(&scene).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(store.scene(&SceneId::new("s")), Some(scene));
        assert_eq!(store.rollbacks(), 1);
    }
}
