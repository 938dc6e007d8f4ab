//! Persistence contract for the feature provider and the audit store.
//!
//! The pipeline owns the contract, not the schema: reads feed the
//! scoring signals, the single write hands off the audit row. The
//! production adapter is a Postgres pool.

use crate::error::PipelineError;
use crate::types::{DecisionRecord, HistoricalRefundSample, ItemDetail, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

/// Feature provider and audit-store contract.
#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Historical `(user_id, amount)` refund pairs for anomaly scoring.
    async fn refund_history(&self) -> Result<Vec<HistoricalRefundSample>, PipelineError>;

    /// Profile of the requesting user, `None` when no row exists.
    async fn user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, PipelineError>;

    /// Line items of the order under refund.
    async fn item_details(&self, order_id: i64) -> Result<Vec<ItemDetail>, PipelineError>;

    /// Hand the audit row to the store.
    async fn insert_decision(&self, record: &DecisionRecord) -> Result<(), PipelineError>;
}

#[derive(Debug, FromRow)]
struct SampleRow {
    user_id: i64,
    amount: f64,
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub created_at: DateTime<Utc>,
    pub total_orders: i64,
    pub total_refunds: i64,
    pub flagged_for_fraud: bool,
}

impl UserRow {
    /// Derive the profile; account age comes from the row's creation
    /// timestamp.
    pub(crate) fn into_profile(self, now: DateTime<Utc>) -> UserProfile {
        UserProfile {
            account_age_days: (now - self.created_at).num_days(),
            total_orders: self.total_orders,
            total_refunds: self.total_refunds,
            flagged_for_fraud: self.flagged_for_fraud,
        }
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    item_id: i64,
    name: String,
    quantity: i32,
    price: f64,
}

/// Postgres-backed store.
pub struct PgRefundStore {
    pool: PgPool,
}

impl PgRefundStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| PipelineError::collaborator("database", e.into()))?;
        info!(max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }
}

#[async_trait]
impl RefundStore for PgRefundStore {
    async fn refund_history(&self) -> Result<Vec<HistoricalRefundSample>, PipelineError> {
        let rows = sqlx::query_as::<_, SampleRow>("SELECT user_id, amount FROM refund_requests")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::collaborator("database", e.into()))?;

        debug!(samples = rows.len(), "Fetched refund history");

        Ok(rows
            .into_iter()
            .map(|row| HistoricalRefundSample::new(row.user_id, row.amount))
            .collect())
    }

    async fn user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, PipelineError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT created_at, total_orders, total_refunds, flagged_for_fraud
            FROM users WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::collaborator("database", e.into()))?;

        Ok(row.map(|row| row.into_profile(Utc::now())))
    }

    async fn item_details(&self, order_id: i64) -> Result<Vec<ItemDetail>, PipelineError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT i.item_id, i.name, oi.quantity, oi.price
            FROM order_items oi
            JOIN items i ON oi.item_id = i.item_id
            WHERE oi.order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::collaborator("database", e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| ItemDetail {
                item_id: row.item_id,
                name: row.name,
                quantity: row.quantity,
                unit_price: row.price,
            })
            .collect())
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO refund_decisions
                (refund_request_id, ai_prediction, fraud_score, final_decision, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.request_id)
        .bind(record.ai_prediction())
        .bind(record.fraud_score())
        .bind(record.final_decision.as_str())
        .bind(record.decided_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::collaborator("database", e.into()))?;

        debug!(request_id = %record.request_id, "Decision record persisted");
        Ok(())
    }
}
