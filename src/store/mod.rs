pub mod postgres;

#[cfg(test)]
pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::identity::ParticipantKey;
use crate::policy::PollDefinition;

pub use postgres::PgVoteStore;

/// One current-vote row as held by the external store. Exactly one of
/// `user_id` / `anon_id` is set; rows violating that are rejected at the
/// boundary instead of being trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVote {
    pub poll_id: Uuid,
    pub user_id: Option<Uuid>,
    pub anon_id: Option<String>,
    pub selected_options: Vec<u32>,
    pub write_seq: i64,
}

impl StoredVote {
    pub fn participant(&self) -> Result<ParticipantKey, EngineError> {
        match (self.user_id, &self.anon_id) {
            (Some(user_id), None) => Ok(ParticipantKey::Authenticated(user_id)),
            (None, Some(anon_id)) => Ok(ParticipantKey::Anonymous(anon_id.clone())),
            _ => Err(EngineError::MalformedEvent(
                "vote row must carry exactly one of user_id and anon_id".to_string(),
            )),
        }
    }

    pub fn selection(&self) -> BTreeSet<usize> {
        self.selected_options.iter().map(|&i| i as usize).collect()
    }

    pub fn seq(&self) -> u64 {
        self.write_seq.max(0) as u64
    }
}

/// Collaborator contract for the persistent store. The engine only reads
/// (`fetch_poll`, `fetch_all_votes`); the HTTP layer also writes. Write
/// failures are surfaced to the caller and never silently retried, so a
/// submission cannot be duplicated behind the user's back.
#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn create_poll(&self, poll: &PollDefinition) -> Result<(), EngineError>;

    async fn list_polls(&self) -> Result<Vec<PollDefinition>, EngineError>;

    async fn fetch_poll(&self, poll_id: Uuid) -> Result<Option<PollDefinition>, EngineError>;

    /// Replace a poll's definition; the id addresses the row to update.
    async fn update_poll(&self, poll: &PollDefinition) -> Result<(), EngineError>;

    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), EngineError>;

    /// Full point-in-time snapshot of all current votes for a poll.
    async fn fetch_all_votes(&self, poll_id: Uuid) -> Result<Vec<StoredVote>, EngineError>;

    async fn fetch_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<Option<StoredVote>, EngineError>;

    async fn insert_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError>;

    async fn update_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError>;

    /// Removes the participant's vote and returns the write sequence assigned
    /// to the deletion.
    async fn delete_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<u64, EngineError>;
}
