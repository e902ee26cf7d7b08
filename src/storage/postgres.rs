//! PostgreSQL message storage

use super::{MsgStorage, StatusCounts};
use crate::config::StorageConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{Message, MsgId, MsgStatus, Receipt, Request, Response};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Message storage persisted in PostgreSQL
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect a pool using the storage configuration
    pub async fn new(config: &StorageConfig) -> DeliveryResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| DeliveryError::Config("postgres storage requires a url".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if missing
    pub async fn run_migrations(&self) -> DeliveryResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                request JSONB NOT NULL,
                response JSONB,
                receipt JSONB,
                status VARCHAR(20) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_status
            ON messages (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Message storage migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> DeliveryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch(&self, id: &MsgId) -> DeliveryResult<Message> {
        let row = sqlx::query(
            r#"
            SELECT request, response, receipt, status, created_at, updated_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DeliveryError::MsgNotFound(*id))?;

        decode_row(&row)
    }

    async fn set_column(
        &self,
        id: &MsgId,
        column: &'static str,
        value: serde_json::Value,
    ) -> DeliveryResult<()> {
        let sql = format!(
            "UPDATE messages SET {} = $2, updated_at = NOW() WHERE id = $1",
            column
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(value)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeliveryError::MsgNotFound(*id));
        }
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> DeliveryResult<Message> {
    let request: Request = serde_json::from_value(row.get("request"))?;
    let response: Option<serde_json::Value> = row.get("response");
    let receipt: Option<serde_json::Value> = row.get("receipt");
    let status: String = row.get("status");

    Ok(Message {
        request,
        response: response.map(serde_json::from_value).transpose()?,
        receipt: receipt.map(serde_json::from_value).transpose()?,
        status: status.parse()?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

#[async_trait]
impl MsgStorage for PostgresStorage {
    async fn add_msg(&self, request: Request) -> DeliveryResult<()> {
        let id = request.id;
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, request, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(&request)?)
        .bind(MsgStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeliveryError::DuplicateMsg(id));
        }

        debug!(%id, "Stored message");
        Ok(())
    }

    async fn get_msg(&self, id: &MsgId) -> DeliveryResult<Message> {
        self.fetch(id).await
    }

    async fn update_msg(&self, msg: Message) -> DeliveryResult<()> {
        let id = msg.id();
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET request = $2, response = $3, receipt = $4, status = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(&msg.request)?)
        .bind(msg.response.as_ref().map(serde_json::to_value).transpose()?)
        .bind(msg.receipt.as_ref().map(serde_json::to_value).transpose()?)
        .bind(msg.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeliveryError::MsgNotFound(id));
        }
        Ok(())
    }

    async fn update_response(&self, response: Response) -> DeliveryResult<()> {
        let id = response.id;
        self.set_column(&id, "response", serde_json::to_value(&response)?)
            .await
    }

    async fn update_receipt(&self, receipt: Receipt) -> DeliveryResult<()> {
        let id = receipt.id;
        self.set_column(&id, "receipt", serde_json::to_value(&receipt)?)
            .await
    }

    async fn update_msg_status(&self, id: &MsgId, status: MsgStatus) -> DeliveryResult<()> {
        let mut msg = self.fetch(id).await?;
        msg.set_status(status)?;

        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn has_msg(&self, id: &MsgId) -> DeliveryResult<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn status_counts(&self) -> DeliveryResult<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM messages
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.add(status.parse()?, count as u64);
        }
        Ok(counts)
    }
}
