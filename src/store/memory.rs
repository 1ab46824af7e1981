//! In-memory store used by the engine tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::identity::ParticipantKey;
use crate::policy::PollDefinition;
use crate::store::{StoredVote, VoteStore};

#[derive(Default)]
pub struct MemoryVoteStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    polls: HashMap<Uuid, PollDefinition>,
    votes: HashMap<(Uuid, ParticipantKey), StoredVote>,
    next_seq: i64,
}

impl Inner {
    fn bump_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl MemoryVoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a vote row directly, bypassing the write path, as if it had been
    /// written before the session started.
    pub fn seed_vote(&self, participant: &ParticipantKey, vote: StoredVote) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .votes
            .insert((vote.poll_id, participant.clone()), vote);
    }
}

#[async_trait]
impl VoteStore for MemoryVoteStore {
    async fn create_poll(&self, poll: &PollDefinition) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls.insert(poll.id, poll.clone());
        Ok(())
    }

    async fn list_polls(&self) -> Result<Vec<PollDefinition>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.polls.values().cloned().collect())
    }

    async fn fetch_poll(&self, poll_id: Uuid) -> Result<Option<PollDefinition>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.polls.get(&poll_id).cloned())
    }

    async fn update_poll(&self, poll: &PollDefinition) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls.insert(poll.id, poll.clone());
        Ok(())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls.remove(&poll_id);
        inner.votes.retain(|(id, _), _| *id != poll_id);
        Ok(())
    }

    async fn fetch_all_votes(&self, poll_id: Uuid) -> Result<Vec<StoredVote>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .votes
            .iter()
            .filter(|((id, _), _)| *id == poll_id)
            .map(|(_, vote)| vote.clone())
            .collect())
    }

    async fn fetch_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<Option<StoredVote>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.votes.get(&(poll_id, participant.clone())).cloned())
    }

    async fn insert_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.bump_seq();
        let (user_id, anon_id) = match participant {
            ParticipantKey::Authenticated(user_id) => (Some(*user_id), None),
            ParticipantKey::Anonymous(anon_id) => (None, Some(anon_id.clone())),
        };
        let vote = StoredVote {
            poll_id,
            user_id,
            anon_id,
            selected_options: selected.to_vec(),
            write_seq: seq,
        };
        inner
            .votes
            .insert((poll_id, participant.clone()), vote.clone());
        Ok(vote)
    }

    async fn update_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
        selected: &[u32],
    ) -> Result<StoredVote, EngineError> {
        self.insert_vote(poll_id, participant, selected).await
    }

    async fn delete_vote(
        &self,
        poll_id: Uuid,
        participant: &ParticipantKey,
    ) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.votes.remove(&(poll_id, participant.clone()));
        Ok(inner.bump_seq().max(0) as u64)
    }
}
