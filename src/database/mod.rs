//! Database module - PostgreSQL + pgvector
//!
//! Durable storage for conversational turns: content, embedding column with
//! cosine-distance ordering, JSONB metadata and the supporting indexes.

mod postgres;
mod turns;

pub use postgres::{init_pool, init_pool_for_migrations, migrations, PostgresPool, TURNS_TABLE};
pub use turns::PgTurnBackend;
