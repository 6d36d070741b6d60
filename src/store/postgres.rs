//! PostgreSQL request store

use super::{RequestStats, RequestStore};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::request::{Amount, BridgeRequest, RequestId, RequestState, TxRef};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

const SELECT_COLUMNS: &str = r#"
    SELECT id, direction, source_account, dest_account, amount, release_amount, state,
           source_tx_ref, dest_tx_ref, attempts, retry_ceiling, open_submission,
           failure_reason, awaiting_since, next_attempt_at, created_at, updated_at
    FROM bridge_requests
"#;

/// Request store for PostgreSQL persistence
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_requests (
                id UUID PRIMARY KEY,
                direction VARCHAR(20) NOT NULL,
                source_account TEXT NOT NULL,
                dest_account TEXT,
                amount TEXT NOT NULL,
                release_amount TEXT,
                state VARCHAR(32) NOT NULL,
                source_tx_ref TEXT,
                dest_tx_ref TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                retry_ceiling INTEGER NOT NULL,
                open_submission INTEGER,
                failure_reason TEXT,
                awaiting_since TIMESTAMPTZ,
                next_attempt_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_requests_state
            ON bridge_requests (state, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per source transaction that has started settling
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_claims (
                direction VARCHAR(20) NOT NULL,
                source_tx_ref TEXT NOT NULL,
                request_id UUID NOT NULL REFERENCES bridge_requests (id),
                claimed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (direction, source_tx_ref)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn insert(&self, request: &BridgeRequest) -> BridgeResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO bridge_requests
                (id, direction, source_account, dest_account, amount, release_amount, state,
                 source_tx_ref, dest_tx_ref, attempts, retry_ceiling, open_submission,
                 failure_reason, awaiting_since, next_attempt_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.direction.as_str())
        .bind(&request.source_account)
        .bind(request.dest_account.as_deref())
        .bind(request.amount.to_string())
        .bind(request.release_amount.map(|a| a.to_string()))
        .bind(request.state.as_str())
        .bind(request.source_tx_ref.as_ref().map(TxRef::as_str))
        .bind(request.dest_tx_ref.as_ref().map(TxRef::as_str))
        .bind(request.attempts as i32)
        .bind(request.retry_ceiling as i32)
        .bind(request.open_submission.map(|a| a as i32))
        .bind(request.failure_reason.as_deref())
        .bind(request.awaiting_since)
        .bind(request.next_attempt_at)
        .bind(request.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(BridgeError::DuplicateId(request.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: RequestId) -> BridgeResult<Option<BridgeRequest>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn update(&self, request: &BridgeRequest, expected: RequestState) -> BridgeResult<()> {
        if !expected.can_transition_to(request.state) {
            return Err(BridgeError::InvalidStateTransition {
                from: expected,
                to: request.state,
            });
        }

        let mut tx = self.pool.begin().await?;

        if let Some((direction, source_tx_ref)) = request.settlement_key() {
            sqlx::query(
                r#"
                INSERT INTO settlement_claims (direction, source_tx_ref, request_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (direction, source_tx_ref) DO NOTHING
                "#,
            )
            .bind(direction.as_str())
            .bind(source_tx_ref.as_str())
            .bind(request.id.as_uuid())
            .execute(&mut *tx)
            .await?;

            let holder: Uuid = sqlx::query_scalar(
                "SELECT request_id FROM settlement_claims WHERE direction = $1 AND source_tx_ref = $2",
            )
            .bind(direction.as_str())
            .bind(source_tx_ref.as_str())
            .fetch_one(&mut *tx)
            .await?;

            if holder != request.id.as_uuid() {
                tx.rollback().await?;
                return Err(BridgeError::DuplicateSettlement {
                    holder: RequestId::from_uuid(holder),
                    source_tx_ref,
                });
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE bridge_requests
            SET dest_account = $3, release_amount = $4, state = $5, source_tx_ref = $6,
                dest_tx_ref = $7, attempts = $8, retry_ceiling = $9, open_submission = $10,
                failure_reason = $11, awaiting_since = $12, next_attempt_at = $13,
                amount = $14, updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(expected.as_str())
        .bind(request.dest_account.as_deref())
        .bind(request.release_amount.map(|a| a.to_string()))
        .bind(request.state.as_str())
        .bind(request.source_tx_ref.as_ref().map(TxRef::as_str))
        .bind(request.dest_tx_ref.as_ref().map(TxRef::as_str))
        .bind(request.attempts as i32)
        .bind(request.retry_ceiling as i32)
        .bind(request.open_submission.map(|a| a as i32))
        .bind(request.failure_reason.as_deref())
        .bind(request.awaiting_since)
        .bind(request.next_attempt_at)
        .bind(request.amount.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(request.id).await? {
                Some(_) => Err(BridgeError::Conflict {
                    id: request.id,
                    expected,
                }),
                None => Err(BridgeError::NotFound(request.id)),
            };
        }

        tx.commit().await?;
        debug!("Request {} stored as {}", request.id, request.state);
        Ok(())
    }

    async fn list_by_state(&self, state: RequestState) -> BridgeResult<Vec<BridgeRequest>> {
        let rows = sqlx::query(&format!(
            "{} WHERE state = $1 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn stats(&self) -> BridgeResult<RequestStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM bridge_requests GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = RequestStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            stats.add(parse_column(&state)?, count as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

fn parse_column<T>(value: &str) -> BridgeResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| BridgeError::Internal(format!("corrupt column value {:?}: {}", value, e)))
}

fn request_from_row(row: &PgRow) -> BridgeResult<BridgeRequest> {
    let direction: String = row.try_get("direction")?;
    let state: String = row.try_get("state")?;
    let amount: String = row.try_get("amount")?;
    let release_amount: Option<String> = row.try_get("release_amount")?;
    let source_tx_ref: Option<String> = row.try_get("source_tx_ref")?;
    let dest_tx_ref: Option<String> = row.try_get("dest_tx_ref")?;
    let open_submission: Option<i32> = row.try_get("open_submission")?;
    let awaiting_since: Option<DateTime<Utc>> = row.try_get("awaiting_since")?;
    let next_attempt_at: Option<DateTime<Utc>> = row.try_get("next_attempt_at")?;

    Ok(BridgeRequest {
        id: RequestId::from_uuid(row.try_get("id")?),
        direction: parse_column(&direction)?,
        source_account: row.try_get("source_account")?,
        dest_account: row.try_get("dest_account")?,
        amount: parse_column::<Amount>(&amount)?,
        release_amount: release_amount
            .as_deref()
            .map(parse_column::<Amount>)
            .transpose()?,
        state: parse_column(&state)?,
        source_tx_ref: source_tx_ref.map(TxRef::new),
        dest_tx_ref: dest_tx_ref.map(TxRef::new),
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        retry_ceiling: row.try_get::<i32, _>("retry_ceiling")? as u32,
        open_submission: open_submission.map(|a| a as u32),
        failure_reason: row.try_get("failure_reason")?,
        awaiting_since,
        next_attempt_at,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
