/// PostgreSQL persistence for the event queue and scene table.
///
/// [`Schema`] owns the table names and every SQL statement; [`PgStore`]
/// opens transactions against it and implements [`Store`](crate::queue::Store).
pub mod postgres;
pub mod schema;

pub use postgres::{PgStore, PgTransaction};
pub use schema::Schema;
