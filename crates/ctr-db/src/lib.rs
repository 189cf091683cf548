//! ctr-db
//!
//! Postgres-backed Audit Index. Appends take a per-subject advisory lock for
//! the length of the transaction, so the duplicate and gap checks see a
//! stable tail. `unique(confirmation_id)` and `unique(subject, seq)` back the
//! same rules at the schema level.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctr_audit::{AppendOutcome, AuditIndex, IndexError};
use ctr_schemas::{
    AccessEvent, ActorId, AuditRecord, ConfirmationId, ConsentEvent, ConsentState, ConsentView,
    Purpose, SubjectId,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

pub const ENV_DB_URL: &str = "CTR_DATABASE_URL";

/// Connect to Postgres using `url`.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using CTR_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_audit_events_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'audit_events'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_audit_events_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgAuditIndex {
    pool: PgPool,
}

fn unavailable(e: sqlx::Error) -> IndexError {
    IndexError::Unavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn seq_to_db(seq: u64) -> Result<i64, IndexError> {
    i64::try_from(seq).map_err(|_| IndexError::Unavailable(format!("seq {seq} out of range")))
}

fn seq_from_db(seq: i64) -> Result<u64, IndexError> {
    u64::try_from(seq).map_err(|_| IndexError::Unavailable(format!("stored seq {seq} is negative")))
}

fn decode(e: impl std::fmt::Display) -> IndexError {
    IndexError::Unavailable(format!("decode audit row: {e}"))
}

fn row_to_consent(row: &PgRow) -> Result<ConsentEvent, IndexError> {
    let state: String = row.try_get("state").map_err(unavailable)?;
    Ok(ConsentEvent {
        subject: SubjectId::parse(row.try_get::<&str, _>("subject").map_err(unavailable)?)
            .map_err(decode)?,
        state: ConsentState::parse(&state).ok_or_else(|| decode(format!("state {state}")))?,
        confirmation_id: ConfirmationId::new(
            row.try_get::<String, _>("confirmation_id")
                .map_err(unavailable)?,
        ),
        recorded_at: row
            .try_get::<DateTime<Utc>, _>("recorded_at")
            .map_err(unavailable)?,
        seq: seq_from_db(row.try_get("seq").map_err(unavailable)?)?,
    })
}

fn row_to_access(row: &PgRow) -> Result<AccessEvent, IndexError> {
    Ok(AccessEvent {
        subject: SubjectId::parse(row.try_get::<&str, _>("subject").map_err(unavailable)?)
            .map_err(decode)?,
        actor: ActorId::parse(row.try_get::<&str, _>("actor").map_err(unavailable)?)
            .map_err(decode)?,
        purpose: Purpose::parse(row.try_get::<&str, _>("purpose").map_err(unavailable)?)
            .map_err(decode)?,
        confirmation_id: ConfirmationId::new(
            row.try_get::<String, _>("confirmation_id")
                .map_err(unavailable)?,
        ),
        recorded_at: row
            .try_get::<DateTime<Utc>, _>("recorded_at")
            .map_err(unavailable)?,
        seq: seq_from_db(row.try_get("seq").map_err(unavailable)?)?,
    })
}

impl PgAuditIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn append(&self, rec: &AuditRecord) -> Result<AppendOutcome, IndexError> {
        let subject = rec.subject().as_str();
        let seq = seq_to_db(rec.seq())?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
            .bind(subject)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        let dup: Option<(i64,)> =
            sqlx::query_as("select seq from audit_events where confirmation_id = $1")
                .bind(rec.confirmation_id().as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        if dup.is_some() {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(AppendOutcome::DuplicateConfirmationId);
        }

        let (last,): (Option<i64>,) =
            sqlx::query_as("select max(seq) from audit_events where subject = $1")
                .bind(subject)
                .fetch_one(&mut *tx)
                .await
                .map_err(unavailable)?;
        let expected = last.unwrap_or(0) + 1;
        if seq != expected {
            tx.rollback().await.map_err(unavailable)?;
            return Err(IndexError::Gap {
                subject: rec.subject().clone(),
                expected: seq_from_db(expected)?,
                got: rec.seq(),
            });
        }

        let insert = match rec {
            AuditRecord::Consent(ev) => sqlx::query(
                r#"
                insert into audit_events (kind, subject, seq, confirmation_id, state, recorded_at)
                values ('consent', $1, $2, $3, $4, $5)
                "#,
            )
            .bind(subject)
            .bind(seq)
            .bind(ev.confirmation_id.as_str())
            .bind(ev.state.as_str())
            .bind(ev.recorded_at),
            AuditRecord::Access(ev) => sqlx::query(
                r#"
                insert into audit_events (kind, subject, seq, confirmation_id, actor, purpose, recorded_at)
                values ('access', $1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(subject)
            .bind(seq)
            .bind(ev.confirmation_id.as_str())
            .bind(ev.actor.as_str())
            .bind(ev.purpose.as_str())
            .bind(ev.recorded_at),
        };

        match insert.execute(&mut *tx).await {
            Ok(_) => {}
            // Same confirmation id committed concurrently under another subject's lock.
            Err(e) if is_unique_violation(&e) => {
                warn!(confirmation_id = %rec.confirmation_id(), "concurrent duplicate absorbed");
                tx.rollback().await.map_err(unavailable)?;
                return Ok(AppendOutcome::DuplicateConfirmationId);
            }
            Err(e) => return Err(unavailable(e)),
        }

        tx.commit().await.map_err(unavailable)?;
        debug!(subject, seq, "audit row appended");
        Ok(AppendOutcome::Appended)
    }
}

#[async_trait]
impl AuditIndex for PgAuditIndex {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn append_consent_event(&self, ev: &ConsentEvent) -> Result<AppendOutcome, IndexError> {
        self.append(&AuditRecord::Consent(ev.clone())).await
    }

    async fn append_access_event(&self, ev: &AccessEvent) -> Result<AppendOutcome, IndexError> {
        self.append(&AuditRecord::Access(ev.clone())).await
    }

    async fn latest_consent_state(&self, subject: &SubjectId) -> Result<ConsentView, IndexError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            select state from audit_events
            where subject = $1 and kind = 'consent'
            order by seq desc
            limit 1
            "#,
        )
        .bind(subject.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            None => Ok(ConsentView::Unknown),
            Some((s,)) => ConsentState::parse(&s)
                .map(ConsentView::from)
                .ok_or_else(|| decode(format!("state {s}"))),
        }
    }

    async fn list_access_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<AccessEvent>, IndexError> {
        let rows = sqlx::query(
            r#"
            select subject, actor, purpose, confirmation_id, recorded_at, seq
            from audit_events
            where subject = $1 and kind = 'access' and seq > $2
            order by seq asc
            "#,
        )
        .bind(subject.as_str())
        .bind(seq_to_db(since.unwrap_or(0))?)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(row_to_access).collect()
    }

    async fn list_consent_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<ConsentEvent>, IndexError> {
        let rows = sqlx::query(
            r#"
            select subject, state, confirmation_id, recorded_at, seq
            from audit_events
            where subject = $1 and kind = 'consent' and seq > $2
            order by seq asc
            "#,
        )
        .bind(subject.as_str())
        .bind(seq_to_db(since.unwrap_or(0))?)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(row_to_consent).collect()
    }

    async fn last_seq(&self, subject: &SubjectId) -> Result<u64, IndexError> {
        let (last,): (Option<i64>,) =
            sqlx::query_as("select max(seq) from audit_events where subject = $1")
                .bind(subject.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;
        seq_from_db(last.unwrap_or(0))
    }

    async fn subjects(&self) -> Result<Vec<SubjectId>, IndexError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("select distinct subject from audit_events order by subject")
                .fetch_all(&self.pool)
                .await
                .map_err(unavailable)?;
        rows.into_iter()
            .map(|(s,)| SubjectId::parse(&s).map_err(decode))
            .collect()
    }
}
