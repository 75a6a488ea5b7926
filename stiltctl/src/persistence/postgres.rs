use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::schema::Schema;
use crate::config::{DatabaseConnection, PersistenceConfig};
use crate::domain::SceneId;
use crate::error::{Result, StiltError};
use crate::events::{Event, EventId, EventKind, EventRecord};
use crate::queue::{EventQueue, Store, StoreTransaction};
use crate::scene::{RowLock, SceneRecord, SceneRepository};

pub(crate) fn connect_options(connection: &DatabaseConnection) -> Result<PgConnectOptions> {
    Ok(match connection {
        DatabaseConnection::Url(url) => url.parse()?,
        DatabaseConnection::Params(params) => PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.username)
            .password(&params.password)
            .database(&params.database),
    })
}

/// PostgreSQL-backed [`Store`].
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    schema: Arc<Schema>,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: Schema) -> Self {
        Self {
            pool,
            schema: Arc::new(schema),
        }
    }

    /// Open a pool sized by `config`.
    pub async fn connect(config: &PersistenceConfig, schema: Schema) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(connect_options(&config.connection)?)
            .await?;
        Ok(Self::new(pool, schema))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        self.schema.create(&self.pool).await
    }

    pub async fn healthcheck(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction {
            tx,
            schema: Arc::clone(&self.schema),
        })
    }
}

/// One open database transaction.
///
/// Dropping it without [`commit`](StoreTransaction::commit) rolls back.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    schema: Arc<Schema>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("events", &self.schema.events_table())
            .finish_non_exhaustive()
    }
}

fn to_db_counter(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StiltError::CounterOverflow(value))
}

#[async_trait]
impl EventQueue for PgTransaction {
    async fn enqueue(&mut self, event: &Event) -> Result<EventId> {
        let encoded = event.encode()?;
        let id: i64 = sqlx::query_scalar(self.schema.enqueue_sql())
            .bind(&encoded.event_name)
            .bind(&encoded.event_data)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(EventId(id))
    }

    async fn dequeue(&mut self, kind: EventKind) -> Result<Event> {
        let row = sqlx::query(self.schema.dequeue_sql())
            .bind(kind.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some(row) = row else {
            return Err(StiltError::NotFound(kind));
        };

        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let record = EventRecord {
            id: EventId(row.try_get("id")?),
            created_at,
            event_name: row.try_get("event_name")?,
            event_data: row.try_get("event_data")?,
        };
        debug!(event_id = %record.id, event_kind = %kind, "claimed event");
        record.decode()
    }

    async fn count(&mut self, kind: EventKind) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(self.schema.count_sql())
            .bind(kind.as_str())
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl SceneRepository for PgTransaction {
    async fn create_scene(&mut self, scene: &SceneRecord) -> Result<()> {
        let inserted: Option<i32> = sqlx::query_scalar(self.schema.insert_scene_sql())
            .bind(scene.scene_id().as_str())
            .bind(to_db_counter(scene.successful_simulations())?)
            .bind(to_db_counter(scene.total_simulations())?)
            .fetch_optional(&mut *self.tx)
            .await?;
        match inserted {
            Some(_) => Ok(()),
            None => Err(StiltError::SceneExists(scene.scene_id().clone())),
        }
    }

    async fn get_scene(&mut self, scene_id: &SceneId, lock: RowLock) -> Result<SceneRecord> {
        let row = sqlx::query(self.schema.select_scene_sql(lock == RowLock::ForUpdate))
            .bind(scene_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StiltError::SceneNotFound(scene_id.clone()))?;
        let successful: i32 = row.try_get("successful_simulations")?;
        let total: i32 = row.try_get("total_simulations")?;
        SceneRecord::restore(scene_id.clone(), i64::from(successful), i64::from(total))
    }

    async fn save_scene(&mut self, scene: &SceneRecord) -> Result<()> {
        let result = sqlx::query(self.schema.update_scene_sql())
            .bind(scene.scene_id().as_str())
            .bind(to_db_counter(scene.successful_simulations())?)
            .bind(to_db_counter(scene.total_simulations())?)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StiltError::SceneNotFound(scene.scene_id().clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
