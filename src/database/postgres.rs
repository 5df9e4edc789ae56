//! PostgreSQL database connection and migrations

use crate::config::{DatabaseConfig, MAX_INDEXABLE_DIMENSIONS};
use crate::error::{Error, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// PostgreSQL connection pool type alias
pub type PostgresPool = PgPool;

/// Name of the turns table
pub const TURNS_TABLE: &str = "conversation_turns";

/// Initialize the PostgreSQL connection pool.
///
/// The pool is bounded by `max_connections`; when every connection is busy,
/// callers wait up to the connect timeout for one to free up.
pub async fn init_pool(config: &DatabaseConfig) -> Result<PostgresPool> {
    init_pool_with_options(config, true).await
}

/// Initialize the PostgreSQL connection pool without pgvector check
/// Use this for running migrations before pgvector is installed
pub async fn init_pool_for_migrations(config: &DatabaseConfig) -> Result<PostgresPool> {
    init_pool_with_options(config, false).await
}

async fn init_pool_with_options(config: &DatabaseConfig, require_pgvector: bool) -> Result<PostgresPool> {
    info!(
        max_connections = config.max_connections,
        "Initializing PostgreSQL connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(config.url.expose_secret())
        .await?;

    verify_database(&pool, require_pgvector).await?;

    info!("PostgreSQL connection pool initialized successfully");
    Ok(pool)
}

/// Verify database connection and optionally check for required extensions
async fn verify_database(pool: &PgPool, require_pgvector: bool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;

    if require_pgvector {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(pool)
                .await?;

        if result.is_none() {
            return Err(Error::Database(sqlx::Error::Configuration(
                "pgvector extension is not installed. Run: CREATE EXTENSION vector;".into(),
            )));
        }
    }

    Ok(())
}

/// Database migrations
pub mod migrations {
    use super::*;
    use tracing::warn;

    /// Run all migrations for a store of `dimensions`-long vectors.
    ///
    /// `lists` sizes the ivfflat index; it is only built when pgvector can
    /// index vectors of this dimension.
    pub async fn run(pool: &PgPool, dimensions: usize, lists: usize) -> Result<()> {
        info!(dimensions, "Running database migrations");

        match sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(pool)
            .await
        {
            Ok(_) => info!("pgvector extension enabled"),
            Err(e) => {
                warn!("Could not create pgvector extension: {}. Vector features may not work.", e);
                warn!("If you need vector support, run as superuser: CREATE EXTENSION vector;");
            }
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TURNS_TABLE} (
                id UUID PRIMARY KEY,
                session_id TEXT,
                user_input TEXT NOT NULL DEFAULT '',
                assistant_response TEXT NOT NULL DEFAULT '',
                embedding vector({dimensions}) NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT turn_has_text CHECK (user_input <> '' OR assistant_response <> '')
            )
        "#
        ))
        .execute(pool)
        .await?;

        verify_dimensions(pool, dimensions).await?;

        // Each index must be a separate query for SQLx
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_turns_session_id ON {TURNS_TABLE}(session_id)"
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_turns_created_at ON {TURNS_TABLE}(created_at)"
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_turns_content_hash ON {TURNS_TABLE} ((metadata->>'contentHash'))"
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_turns_time_aware_hash ON {TURNS_TABLE} ((metadata->>'timeAwareHash'))"
        ))
        .execute(pool)
        .await?;

        if dimensions <= MAX_INDEXABLE_DIMENSIONS {
            sqlx::query(&format!(
                r#"
                CREATE INDEX IF NOT EXISTS idx_turns_embedding ON {TURNS_TABLE}
                USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})
            "#
            ))
            .execute(pool)
            .await
            .ok(); // Ignore if not enough data or vector type not available
        } else {
            warn!(
                dimensions,
                max = MAX_INDEXABLE_DIMENSIONS,
                "Vector dimension exceeds pgvector's index limit; searches will use exact scans"
            );
        }

        info!("Database migrations completed");
        Ok(())
    }

    /// Fail if the table was created for a different dimension
    async fn verify_dimensions(pool: &PgPool, dimensions: usize) -> Result<()> {
        let typmod: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT atttypmod FROM pg_attribute
            WHERE attrelid = $1::regclass AND attname = 'embedding'
        "#,
        )
        .bind(TURNS_TABLE)
        .fetch_optional(pool)
        .await?;

        match typmod {
            Some((existing,)) if existing > 0 && existing as usize != dimensions => {
                Err(Error::Config(format!(
                    "{} stores {}-dimensional vectors but {} are configured",
                    TURNS_TABLE, existing, dimensions
                )))
            }
            _ => Ok(()),
        }
    }
}
