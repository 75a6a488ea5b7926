//! Queue and scene semantics against a real Postgres.
//!
//! Each test runs in its own table prefix and drops it afterwards.
//! Run with: `cargo test --test postgres_queue --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::collections::HashSet;
use std::sync::Arc;

use stiltctl::persistence::{PgStore, Schema};
use stiltctl::{
    Event, EventKind, EventQueue, PersistenceConfig, RowLock, SceneId, SceneRecord,
    SceneRepository, StiltError, Store, StoreTransaction,
};
use stiltctl_testkit::fixtures::domain_config;
use uuid::Uuid;

async fn connect() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let prefix = format!("t_{}", Uuid::new_v4().simple());
    let schema = Schema::with_prefix(&prefix).expect("prefix");
    let config = PersistenceConfig::new(url).with_max_connections(20);
    let store = PgStore::connect(&config, schema).await.expect("connect");
    store.healthcheck().await.expect("healthcheck");
    store.migrate().await.expect("migrate");
    store
}

async fn cleanup(store: &PgStore) {
    store.schema().drop(store.pool()).await.ok();
}

fn simulation_events(nx: usize) -> Vec<Event> {
    domain_config(nx, 1)
        .simulation_manifests()
        .into_iter()
        .map(|manifest| Event::SimulationCreated { manifest })
        .collect()
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn skip_locked_dequeue_delivers_each_event_once() {
    let store = Arc::new(connect().await);
    let events = simulation_events(12);
    let mut tx = store.begin().await.unwrap();
    tx.enqueue_many(&events).await.unwrap();
    tx.commit().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut tx = store.begin().await.unwrap();
            let event = match tx.dequeue(EventKind::SimulationCreated).await {
                Ok(Event::SimulationCreated { manifest }) => Some(manifest.simulation_id()),
                Ok(other) => panic!("unexpected {other:?}"),
                Err(StiltError::NotFound(_)) => None,
                Err(err) => panic!("dequeue failed: {err}"),
            };
            tx.commit().await.unwrap();
            event
        }));
    }

    let mut seen = HashSet::new();
    let mut delivered = 0;
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            delivered += 1;
            seen.insert(id);
        }
    }
    assert_eq!(delivered, events.len());
    assert_eq!(seen.len(), events.len());

    cleanup(&store).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn rollback_returns_event_to_queue() {
    let store = connect().await;
    let mut tx = store.begin().await.unwrap();
    tx.enqueue_many(&simulation_events(1)).await.unwrap();
    tx.commit().await.unwrap();

    let mut claim = store.begin().await.unwrap();
    claim.dequeue(EventKind::SimulationCreated).await.unwrap();
    claim.rollback().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.count(EventKind::SimulationCreated).await.unwrap(), 1);
    tx.dequeue(EventKind::SimulationCreated).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(matches!(
        tx.dequeue(EventKind::SimulationCreated).await,
        Err(StiltError::NotFound(EventKind::SimulationCreated))
    ));
    tx.rollback().await.unwrap();

    cleanup(&store).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn duplicate_scene_does_not_abort_transaction() {
    let store = connect().await;
    let scene = SceneRecord::new(SceneId::new("scene-a"), 3);

    let mut tx = store.begin().await.unwrap();
    tx.create_scene(&scene).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(matches!(
        tx.create_scene(&scene).await,
        Err(StiltError::SceneExists(_))
    ));
    // The transaction is still usable after the conflict.
    tx.enqueue_many(&simulation_events(1)).await.unwrap();
    tx.commit().await.unwrap();

    cleanup(&store).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn locked_increments_are_not_lost() {
    let store = Arc::new(connect().await);
    let scene_id = SceneId::new("scene-b");
    let mut tx = store.begin().await.unwrap();
    tx.create_scene(&SceneRecord::new(scene_id.clone(), 10))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        let scene_id = scene_id.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = store.begin().await.unwrap();
            let mut scene = tx.get_scene(&scene_id, RowLock::ForUpdate).await.unwrap();
            scene.record_success().unwrap();
            tx.save_scene(&scene).await.unwrap();
            tx.commit().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut tx = store.begin().await.unwrap();
    let scene = tx.get_scene(&scene_id, RowLock::None).await.unwrap();
    assert_eq!(scene.successful_simulations(), 10);
    assert!(scene.is_complete());
    tx.rollback().await.unwrap();

    cleanup(&store).await;
}
