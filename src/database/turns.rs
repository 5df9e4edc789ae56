//! Turn persistence backed by PostgreSQL + pgvector

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::postgres::{PostgresPool, TURNS_TABLE};
use crate::config::IndexMode;
use crate::core::storage::{DuplicateProbe, NearestQuery, TurnBackend};
use crate::core::types::{Metadata, ScoredTurn, Turn, TurnId};
use crate::error::Result;
use crate::memory::index;

const TURN_COLUMNS: &str =
    "id, session_id, user_input, assistant_response, embedding, metadata, created_at, updated_at";

#[derive(FromRow)]
struct TurnRow {
    id: Uuid,
    session_id: Option<String>,
    user_input: String,
    assistant_response: String,
    embedding: Vector,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TurnRow> for Turn {
    fn from(row: TurnRow) -> Self {
        Turn {
            id: row.id,
            session_id: row.session_id,
            user_input: row.user_input,
            assistant_response: row.assistant_response,
            embedding: row.embedding.to_vec(),
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    turn: TurnRow,
    similarity: f64,
}

/// Turn store backed by PostgreSQL + pgvector
#[derive(Clone)]
pub struct PgTurnBackend {
    pool: PostgresPool,
}

impl PgTurnBackend {
    /// Create a new backend over an initialized pool
    pub fn new(pool: PostgresPool) -> Self {
        PgTurnBackend { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PostgresPool {
        &self.pool
    }
}

#[async_trait]
impl TurnBackend for PgTurnBackend {
    fn id(&self) -> &str {
        "postgres"
    }

    async fn insert(&self, turn: &Turn) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {TURNS_TABLE} ({TURN_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#
        ))
        .bind(turn.id)
        .bind(&turn.session_id)
        .bind(&turn.user_input)
        .bind(&turn.assistant_response)
        .bind(Vector::from(turn.embedding.clone()))
        .bind(Json(&turn.metadata))
        .bind(turn.created_at)
        .bind(turn.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: TurnId) -> Result<Option<Turn>> {
        let row: Option<TurnRow> = sqlx::query_as(&format!(
            "SELECT {TURN_COLUMNS} FROM {TURNS_TABLE} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Turn::from))
    }

    async fn nearest(&self, query: &NearestQuery) -> Result<Vec<ScoredTurn>> {
        let mut tx = self.pool.begin().await?;

        // Scoped to this transaction: force a sequential scan for exact mode,
        // widen the probe count for approximate mode.
        match query.mode {
            IndexMode::Exact => {
                sqlx::query("SELECT set_config('enable_indexscan', 'off', true)")
                    .execute(&mut *tx)
                    .await?;
            }
            IndexMode::Approximate => {
                sqlx::query("SELECT set_config('ivfflat.probes', $1, true)")
                    .bind(query.probes.max(1).to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        // The floor is applied after LIMIT: rows are ordered by distance, so
        // anything cut by the limit scores no higher than what was kept.
        let rows: Vec<ScoredRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TURN_COLUMNS}, 1 - (embedding <=> $1) AS similarity
            FROM {TURNS_TABLE}
            WHERE ($2::text IS NULL OR session_id = $2)
            ORDER BY embedding <=> $1, created_at DESC
            LIMIT $3
        "#
        ))
        .bind(Vector::from(query.embedding.clone()))
        .bind(&query.session_id)
        .bind(query.limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let candidates = rows
            .into_iter()
            .map(|r| ScoredTurn {
                turn: r.turn.into(),
                score: r.similarity as f32,
            })
            .collect();

        Ok(index::rank(candidates, query.limit, query.floor))
    }

    async fn find_duplicates(&self, probe: &DuplicateProbe) -> Result<Vec<Turn>> {
        let rows: Vec<TurnRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TURN_COLUMNS} FROM {TURNS_TABLE}
            WHERE session_id = $1
              AND created_at >= $2
              AND (metadata->>'contentHash' = $3 OR metadata->>'timeAwareHash' = $4)
            ORDER BY created_at DESC
        "#
        ))
        .bind(&probe.session_id)
        .bind(probe.since)
        .bind(&probe.content_hash)
        .bind(&probe.time_aware_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Turn::from).collect())
    }

    async fn merge_metadata(
        &self,
        id: TurnId,
        patch: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(Json<Metadata>,)> = sqlx::query_as(&format!(
            "SELECT metadata FROM {TURNS_TABLE} WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((Json(mut metadata),)) = current else {
            return Ok(false);
        };
        metadata.merge_additive(patch);

        sqlx::query(&format!(
            "UPDATE {TURNS_TABLE} SET metadata = $2, updated_at = $3 WHERE id = $1"
        ))
        .bind(id)
        .bind(Json(&metadata))
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, id: TurnId) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {TURNS_TABLE} WHERE id = $1"))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {TURNS_TABLE} WHERE created_at < $1"))
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
