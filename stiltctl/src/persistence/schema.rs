use sqlx::PgPool;
use tracing::debug;

use crate::error::{Result, StiltError};

/// Table names and SQL for one stiltctl installation.
///
/// An optional prefix puts every table in its own namespace, which lets
/// tests share a database without seeing each other's rows.
#[derive(Clone, Debug)]
pub struct Schema {
    events_table: String,
    scenes_table: String,
    enqueue: String,
    dequeue: String,
    count: String,
    insert_scene: String,
    select_scene: String,
    select_scene_for_update: String,
    update_scene: String,
}

impl Default for Schema {
    fn default() -> Self {
        Self::build(String::new())
    }
}

impl Schema {
    /// Tables named `{prefix}_events` and `{prefix}_scenes`.
    ///
    /// The prefix must be a plain identifier.
    pub fn with_prefix(prefix: &str) -> Result<Self> {
        let valid = !prefix.is_empty()
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !prefix.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(StiltError::InvalidConfig(format!(
                "invalid table prefix {prefix:?}"
            )));
        }
        Ok(Self::build(format!("{prefix}_")))
    }

    fn build(prefix: String) -> Self {
        let events = format!("{prefix}events");
        let scenes = format!("{prefix}scenes");
        Self {
            enqueue: format!(
                "INSERT INTO {events} (event_name, event_data) VALUES ($1, $2) RETURNING id"
            ),
            dequeue: format!(
                "DELETE FROM {events} WHERE id = (\
                 SELECT id FROM {events} WHERE event_name = $1 \
                 ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED) \
                 RETURNING id, created_at, event_name, event_data"
            ),
            count: format!("SELECT COUNT(*) FROM {events} WHERE event_name = $1"),
            insert_scene: format!(
                "INSERT INTO {scenes} (scene_id, successful_simulations, total_simulations) \
                 VALUES ($1, $2, $3) ON CONFLICT (scene_id) DO NOTHING RETURNING id"
            ),
            select_scene: format!(
                "SELECT successful_simulations, total_simulations FROM {scenes} WHERE scene_id = $1"
            ),
            select_scene_for_update: format!(
                "SELECT successful_simulations, total_simulations FROM {scenes} \
                 WHERE scene_id = $1 FOR UPDATE"
            ),
            update_scene: format!(
                "UPDATE {scenes} SET successful_simulations = $2, total_simulations = $3, \
                 updated_at = NOW() WHERE scene_id = $1"
            ),
            events_table: events,
            scenes_table: scenes,
        }
    }

    pub fn events_table(&self) -> &str {
        &self.events_table
    }

    pub fn scenes_table(&self) -> &str {
        &self.scenes_table
    }

    pub(crate) fn enqueue_sql(&self) -> &str {
        &self.enqueue
    }

    pub(crate) fn dequeue_sql(&self) -> &str {
        &self.dequeue
    }

    pub(crate) fn count_sql(&self) -> &str {
        &self.count
    }

    pub(crate) fn insert_scene_sql(&self) -> &str {
        &self.insert_scene
    }

    pub(crate) fn select_scene_sql(&self, for_update: bool) -> &str {
        if for_update {
            &self.select_scene_for_update
        } else {
            &self.select_scene
        }
    }

    pub(crate) fn update_scene_sql(&self) -> &str {
        &self.update_scene
    }

    /// DDL creating both tables and their indexes, one statement each.
    pub fn create_statements(&self) -> Vec<String> {
        let events = &self.events_table;
        let scenes = &self.scenes_table;
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {events} (\
                 id BIGSERIAL PRIMARY KEY, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 event_name TEXT NOT NULL, \
                 event_data JSONB NOT NULL)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {events}_name_id_idx ON {events} (event_name, id)"),
            format!(
                "CREATE TABLE IF NOT EXISTS {scenes} (\
                 id SERIAL PRIMARY KEY, \
                 scene_id TEXT NOT NULL UNIQUE, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 successful_simulations INTEGER NOT NULL DEFAULT 0, \
                 total_simulations INTEGER NOT NULL, \
                 CONSTRAINT {scenes}_counters_check CHECK (\
                 successful_simulations >= 0 AND successful_simulations <= total_simulations))"
            ),
        ]
    }

    pub fn drop_statements(&self) -> Vec<String> {
        vec![
            format!("DROP TABLE IF EXISTS {}", self.events_table),
            format!("DROP TABLE IF EXISTS {}", self.scenes_table),
        ]
    }

    /// Create missing tables. Idempotent.
    pub async fn create(&self, pool: &PgPool) -> Result<()> {
        for statement in self.create_statements() {
            sqlx::query(&statement).execute(pool).await?;
        }
        debug!(events = %self.events_table, scenes = %self.scenes_table, "schema ready");
        Ok(())
    }

    pub async fn drop(&self, pool: &PgPool) -> Result<()> {
        for statement in self.drop_statements() {
            sqlx::query(&statement).execute(pool).await?;
        }
        Ok(())
    }

    /// Drop and recreate both tables.
    pub async fn reset(&self, pool: &PgPool) -> Result<()> {
        self.drop(pool).await?;
        self.create(pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let schema = Schema::default();
        assert_eq!(schema.events_table(), "events");
        assert_eq!(schema.scenes_table(), "scenes");
        assert!(schema.dequeue_sql().contains("FOR UPDATE SKIP LOCKED"));
        assert!(schema.dequeue_sql().starts_with("DELETE FROM events"));
    }

    #[test]
    fn test_prefixed_tables() {
        let schema = Schema::with_prefix("t_abc123").unwrap();
        assert_eq!(schema.events_table(), "t_abc123_events");
        assert!(schema
            .create_statements()
            .iter()
            .any(|s| s.contains("t_abc123_scenes_counters_check")));
        assert!(schema.insert_scene_sql().contains("ON CONFLICT (scene_id) DO NOTHING"));
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        assert!(Schema::with_prefix("x; DROP TABLE events").is_err());
        assert!(Schema::with_prefix("1abc").is_err());
        assert!(Schema::with_prefix("").is_err());
    }
}
