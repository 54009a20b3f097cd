//! store/sqlite_store.rs
//! Implementación SQLite (sqlx) del Campaign Store.

use async_trait::async_trait;
use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use uuid::Uuid;

use crate::{
    errors::Result,
    models::{
        campaign_model::{Campaign, CampaignStatus, NewCampaign},
        delivery_model::{DeliveryRecord, DeliveryStatus},
        from_millis,
        recipient_model::{NewRecipient, Recipient},
        session_model::{LinkChallenge, SessionRecord, SessionStatus},
        to_millis,
    },
    store::CampaignStore,
};

const CAMPAIGN_COLUMNS: &str = "id, tenant_id, name, message_template, media_url, group_filter, \
     status, scheduled_at_ms, heartbeat_at_ms, error_message, created_at_ms, updated_at_ms";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    db_pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Abre un pool propio (creando el archivo si falta) y corre las migraciones.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let db_pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self::new(db_pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn new(db_pool: Pool<Sqlite>) -> Self {
        SqliteStore { db_pool }
    }

    /// Corre migraciones con sqlx
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db_pool).await?;
        Ok(())
    }
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        message_template: row.try_get("message_template")?,
        media_url: row.try_get("media_url")?,
        group_filter: row.try_get("group_filter")?,
        status: status.parse().map_err(decode_err)?,
        scheduled_time: row
            .try_get::<Option<i64>, _>("scheduled_at_ms")?
            .map(from_millis),
        heartbeat_at: row
            .try_get::<Option<i64>, _>("heartbeat_at_ms")?
            .map(from_millis),
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at_ms")?),
        updated_at: from_millis(row.try_get("updated_at_ms")?),
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let status: String = row.try_get("status")?;
    let challenge = match row.try_get::<Option<String>, _>("last_link_challenge")? {
        Some(raw) => Some(serde_json::from_str::<LinkChallenge>(&raw)?),
        None => None,
    };
    Ok(SessionRecord {
        tenant_id: row.try_get("tenant_id")?,
        status: status.parse::<SessionStatus>().map_err(decode_err)?,
        serialized_state: row.try_get("serialized_state")?,
        last_link_challenge: challenge,
        updated_at: from_millis(row.try_get("updated_at_ms")?),
    })
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn create_campaign(&self, req: &NewCampaign) -> Result<Campaign> {
        let id = Uuid::new_v4().to_string();
        let now = to_millis(Utc::now());
        let status = if req.scheduled_time.is_some() {
            CampaignStatus::Pending
        } else {
            CampaignStatus::Draft
        };
        let name = req.name.clone().unwrap_or_else(|| "General".to_string());

        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, tenant_id, name, message_template, media_url, group_filter,
                status, scheduled_at_ms, heartbeat_at_ms, error_message,
                created_at_ms, updated_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, ?9)
            "#,
        )
        .bind(&id)
        .bind(&req.tenant_id)
        .bind(&name)
        .bind(&req.message_template)
        .bind(&req.media_url)
        .bind(&req.group_filter)
        .bind(status.as_str())
        .bind(req.scheduled_time.map(to_millis))
        .bind(now)
        .execute(&self.db_pool)
        .await?;

        self.get_campaign(&id)
            .await?
            .ok_or_else(|| crate::errors::Error::campaign_not_found(id))
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn get_campaign_status(&self, id: &str) -> Result<Option<CampaignStatus>> {
        let row = sqlx::query("SELECT status FROM campaigns WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;
        match row {
            Some(r) => {
                let raw: String = r.try_get("status")?;
                Ok(Some(raw.parse().map_err(decode_err)?))
            }
            None => Ok(None),
        }
    }

    async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE tenant_id = ?1 \
             ORDER BY created_at_ms DESC, id"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.db_pool)
            .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
             WHERE status = 'pending' AND scheduled_at_ms IS NOT NULL AND scheduled_at_ms <= ?1 \
             ORDER BY scheduled_at_ms, id"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.db_pool)
            .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn get_stale_campaigns(&self, heartbeat_before: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
             WHERE status = 'sending' AND heartbeat_at_ms IS NOT NULL AND heartbeat_at_ms < ?1 \
             ORDER BY heartbeat_at_ms, id"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(heartbeat_before))
            .fetch_all(&self.db_pool)
            .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn claim_campaign(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expected: Vec<CampaignStatus> = expected
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect();
        if expected.is_empty() {
            return Ok(false);
        }
        // "?3, ?4, ..." uno por estado esperado
        let placeholders = (0..expected.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE campaigns
            SET status = 'sending',
                heartbeat_at_ms = ?2,
                updated_at_ms = ?2
            WHERE id = ?1 AND status IN ({placeholders})
            "#
        );

        let mut query = sqlx::query(&sql).bind(id).bind(to_millis(now));
        for status in &expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.db_pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_stale_campaign(
        &self,
        id: &str,
        expected_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET heartbeat_at_ms = ?3, updated_at_ms = ?3
            WHERE id = ?1 AND status = 'sending' AND heartbeat_at_ms = ?2
            "#,
        )
        .bind(id)
        .bind(to_millis(expected_heartbeat))
        .bind(to_millis(now))
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_campaign(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET heartbeat_at_ms = ?2, updated_at_ms = ?2 \
             WHERE id = ?1 AND status = 'sending'",
        )
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn schedule_campaign(&self, id: &str, scheduled_time: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'pending', scheduled_at_ms = ?2, updated_at_ms = ?3
            WHERE id = ?1 AND status IN ('draft', 'pending')
            "#,
        )
        .bind(id)
        .bind(to_millis(scheduled_time))
        .bind(to_millis(Utc::now()))
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_campaign(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'cancelled', updated_at_ms = ?2
            WHERE id = ?1 AND status IN ('pending', 'sending')
            "#,
        )
        .bind(id)
        .bind(to_millis(Utc::now()))
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = ?2, error_message = ?3, updated_at_ms = ?4
            WHERE id = ?1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(to_millis(Utc::now()))
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_recipient(&self, req: &NewRecipient) -> Result<Recipient> {
        let result = sqlx::query(
            r#"
            INSERT INTO recipients (tenant_id, display_name, address, group_tag, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&req.tenant_id)
        .bind(&req.display_name)
        .bind(&req.address)
        .bind(&req.group_tag)
        .bind(to_millis(Utc::now()))
        .execute(&self.db_pool)
        .await?;

        Ok(Recipient {
            id: result.last_insert_rowid(),
            tenant_id: req.tenant_id.clone(),
            display_name: req.display_name.clone(),
            address: req.address.clone(),
            group_tag: req.group_tag.clone(),
        })
    }

    async fn list_recipients(
        &self,
        tenant_id: &str,
        group_filter: Option<&str>,
    ) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, display_name, address, group_tag
            FROM recipients
            WHERE tenant_id = ?1 AND (?2 IS NULL OR group_tag = ?2)
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(group_filter)
        .fetch_all(&self.db_pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for r in rows {
            result.push(Recipient {
                id: r.try_get("id")?,
                tenant_id: r.try_get("tenant_id")?,
                display_name: r.try_get("display_name")?,
                address: r.try_get("address")?,
                group_tag: r.try_get("group_tag")?,
            });
        }
        Ok(result)
    }

    async fn append_delivery_record(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (
                campaign_id, tenant_id, recipient_id, attempted_at_ms,
                status, message, error_detail
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.campaign_id)
        .bind(&record.tenant_id)
        .bind(record.recipient_id)
        .bind(to_millis(record.attempted_at))
        .bind(record.status.as_str())
        .bind(&record.message)
        .bind(&record.error_detail)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn list_delivery_records(&self, campaign_id: &str) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT campaign_id, tenant_id, recipient_id, attempted_at_ms,
                   status, message, error_detail
            FROM delivery_records
            WHERE campaign_id = ?1
            ORDER BY id
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for r in rows {
            let status: String = r.try_get("status")?;
            result.push(DeliveryRecord {
                campaign_id: r.try_get("campaign_id")?,
                tenant_id: r.try_get("tenant_id")?,
                recipient_id: r.try_get("recipient_id")?,
                attempted_at: from_millis(r.try_get("attempted_at_ms")?),
                status: status.parse::<DeliveryStatus>().map_err(decode_err)?,
                message: r.try_get("message")?,
                error_detail: r.try_get("error_detail")?,
            });
        }
        Ok(result)
    }

    async fn count_attempts_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt
            FROM delivery_records
            WHERE tenant_id = ?1 AND attempted_at_ms >= ?2 AND status IN ('sent', 'failed')
            "#,
        )
        .bind(tenant_id)
        .bind(to_millis(since))
        .fetch_one(&self.db_pool)
        .await?;
        let cnt: i64 = row.try_get("cnt")?;
        Ok(cnt.max(0) as u32)
    }

    async fn get_session(&self, tenant_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, status, serialized_state, last_link_challenge, updated_at_ms
            FROM channel_sessions
            WHERE tenant_id = ?1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.db_pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let challenge = record
            .last_link_challenge
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO channel_sessions (
                tenant_id, status, serialized_state, last_link_challenge, updated_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tenant_id) DO UPDATE SET
                status = excluded.status,
                serialized_state = excluded.serialized_state,
                last_link_challenge = excluded.last_link_challenge,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&record.tenant_id)
        .bind(record.status.as_str())
        .bind(&record.serialized_state)
        .bind(challenge)
        .bind(to_millis(record.updated_at))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, status, serialized_state, last_link_challenge, updated_at_ms
            FROM channel_sessions
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.db_pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}
