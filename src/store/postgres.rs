use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::error::EngineError;
use crate::identity::ParticipantKey;
use crate::policy::{PollDefinition, PollSettings};
use crate::store::{StoredVote, VoteStore};

pub type DbPool = Pool<Postgres>;

/// Postgres-backed store. Every vote write takes its `write_seq` from the
/// global `vote_write_seq` sequence, which is the monotonic counter the
/// reconciliation engine orders events by.
#[derive(Clone)]
pub struct PgVoteStore {
    pool: DbPool,
}

impl PgVoteStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .max_lifetime(Duration::from_secs(30 * 60))
            .idle_timeout(Duration::from_secs(10 * 60))
            .connect(database_url)
            .await?;

        init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

async fn init_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS polls (
            id UUID PRIMARY KEY,
            question VARCHAR(255) NOT NULL,
            options JSONB NOT NULL,
            settings JSONB NOT NULL,
            created_by UUID,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
            ends_at TIMESTAMP WITH TIME ZONE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE SEQUENCE IF NOT EXISTS vote_write_seq
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            id UUID PRIMARY KEY,
            poll_id UUID NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
            user_id UUID,
            anon_id VARCHAR(64),
            selected_options JSONB NOT NULL,
            write_seq BIGINT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK ((user_id IS NULL) <> (anon_id IS NULL)),
            UNIQUE (poll_id, user_id),
            UNIQUE (poll_id, anon_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_votes_poll_id ON votes(poll_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_polls_created_at ON polls(created_at)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn poll_from_row(row: &sqlx::postgres::PgRow) -> PollDefinition {
    let options: Json<Vec<String>> = row.get("options");
    let settings: Json<PollSettings> = row.get("settings");
    PollDefinition {
        id: row.get("id"),
        question: row.get("question"),
        options: options.0,
        settings: settings.0,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        ends_at: row.get("ends_at"),
    }
}

fn vote_from_row(poll_id: Uuid, row: &sqlx::postgres::PgRow) -> StoredVote {
    let selected: Json<Vec<u32>> = row.get("selected_options");
    StoredVote {
        poll_id,
        user_id: row.get("user_id"),
        anon_id: row.get("anon_id"),
        selected_options: selected.0,
        write_seq: row.get("write_seq"),
    }
}

fn participant_columns(participant: &ParticipantKey) -> (Option<Uuid>, Option<String>) {
    match participant {
        ParticipantKey::Authenticated(user_id) => (Some(*user_id), None),
        ParticipantKey::Anonymous(anon_id) => (None, Some(anon_id.clone())),
    }
}

#[async_trait]
impl VoteStore for PgVoteStore {
    async fn create_poll(&self, poll: &PollDefinition) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, question, options, settings, created_by, created_at, ends_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(poll.id)
        .bind(&poll.question)
        .bind(Json(&poll.options))
        .bind(Json(&poll.settings))
        .bind(poll.created_by)
        .bind(poll.created_at)
        .bind(poll.ends_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_polls(&self) -> Result<Vec<PollDefinition>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, question, options, settings, created_by, created_at, ends_at \
             FROM polls ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(poll_from_row).collect())
    }

    async fn fetch_poll(&self, poll_id: Uuid) -> Result<Option<PollDefinition>, EngineError> {
        let row = sqlx::query(
            "SELECT id, question, options, settings, created_by, created_at, ends_at \
             FROM polls WHERE id = $1",
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(poll_from_row))
    }

    async fn update_poll(&self, poll: &PollDefinition) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE polls SET question = $1, options = $2, settings = $3, ends_at = $4 WHERE id = $5",
        )
        .bind(&poll.question)
        .bind(Json(&poll.options))
        .bind(Json(&poll.settings))
        .bind(poll.ends_at)
        .bind(poll.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_all_votes(&self, poll_id: Uuid) -> Result<Vec<StoredVote>, EngineError> {
        let rows = sqlx::query(
            "SELECT user_id, anon_id, selected_options, write_seq FROM votes WHERE poll_id = $1",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| vote_from_row(poll_id, row)).collect())
    }

    async fn fetch_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<Option<StoredVote>, EngineError> {
        let (user_id, anon_id) = participant_columns(participant);
        let row = sqlx::query(
            "SELECT user_id, anon_id, selected_options, write_seq FROM votes \
             WHERE poll_id = $1 AND (user_id = $2 OR anon_id = $3)",
        )
        .bind(poll_id)
        .bind(user_id)
        .bind(anon_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(|row| vote_from_row(poll_id, row)))
    }

    async fn insert_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError> {
        let (user_id, anon_id) = participant_columns(participant);
        let row = sqlx::query(
            r#"
            INSERT INTO votes (id, poll_id, user_id, anon_id, selected_options, write_seq)
            VALUES ($1, $2, $3, $4, $5, nextval('vote_write_seq'))
            RETURNING write_seq
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(poll_id)
        .bind(user_id)
        .bind(&anon_id)
        .bind(Json(selected))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            // Two concurrent first votes from one participant both pass the
            // pre-write existence check; the loser trips the per-participant
            // unique constraint.
            if error
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                EngineError::DuplicateVote
            } else {
                EngineError::from(error)
            }
        })?;

        Ok(StoredVote {
            poll_id,
            user_id,
            anon_id,
            selected_options: selected.to_vec(),
            write_seq: row.get("write_seq"),
        })
    }

    async fn update_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError> {
        let (user_id, anon_id) = participant_columns(participant);
        let row = sqlx::query(
            r#"
            UPDATE votes SET selected_options = $1, write_seq = nextval('vote_write_seq')
            WHERE poll_id = $2 AND (user_id = $3 OR anon_id = $4)
            RETURNING write_seq
            "#,
        )
        .bind(Json(selected))
        .bind(poll_id)
        .bind(user_id)
        .bind(&anon_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredVote {
            poll_id,
            user_id,
            anon_id,
            selected_options: selected.to_vec(),
            write_seq: row.get("write_seq"),
        })
    }

    async fn delete_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<u64, EngineError> {
        let (user_id, anon_id) = participant_columns(participant);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM votes WHERE poll_id = $1 AND (user_id = $2 OR anon_id = $3)")
            .bind(poll_id)
            .bind(user_id)
            .bind(&anon_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query("SELECT nextval('vote_write_seq') AS seq")
            .fetch_one(&mut *tx)
            .await?;
        let seq: i64 = row.get("seq");

        tx.commit().await?;
        Ok(seq.max(0) as u64)
    }
}
