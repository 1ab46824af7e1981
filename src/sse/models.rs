use uuid::Uuid;

use crate::error::EngineError;
use crate::ledger::VoteEvent;
use crate::store::StoredVote;

/// A vote mutation as broadcast on the live transport: the raw store row,
/// tagged by kind. Delivery is at-least-once and may be out of order relative
/// to the snapshot fetch; consumers reconcile by `write_seq`.
#[derive(Debug, Clone)]
pub enum VoteChange {
    Inserted(StoredVote),
    Updated(StoredVote),
    Deleted {
        poll_id: Uuid,
        user_id: Option<Uuid>,
        anon_id: Option<String>,
        seq: u64,
    },
}

impl VoteChange {
    pub fn poll_id(&self) -> Uuid {
        match self {
            VoteChange::Inserted(vote) | VoteChange::Updated(vote) => vote.poll_id,
            VoteChange::Deleted { poll_id, .. } => *poll_id,
        }
    }

    /// Validate the raw row into a tagged ledger event. Malformed rows are
    /// rejected here, at the boundary, instead of being trusted downstream.
    pub fn into_event(self) -> Result<VoteEvent, EngineError> {
        match self {
            VoteChange::Inserted(vote) => Ok(VoteEvent::Insert {
                key: vote.participant()?,
                selected: vote.selection(),
                seq: vote.seq(),
            }),
            VoteChange::Updated(vote) => Ok(VoteEvent::Update {
                key: vote.participant()?,
                selected: vote.selection(),
                seq: vote.seq(),
            }),
            VoteChange::Deleted {
                poll_id,
                user_id,
                anon_id,
                seq,
            } => {
                let probe = StoredVote {
                    poll_id,
                    user_id,
                    anon_id,
                    selected_options: Vec::new(),
                    write_seq: 0,
                };
                Ok(VoteEvent::Delete {
                    key: probe.participant()?,
                    seq,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Join,
    Heartbeat,
    Leave,
}

/// Heartbeat/join/leave signal from one connected viewer of a poll.
#[derive(Debug, Clone)]
pub struct PresenceSignal {
    pub poll_id: Uuid,
    pub connection_id: String,
    pub kind: PresenceKind,
}

pub type ChangeSender = tokio::sync::broadcast::Sender<VoteChange>;
pub type PresenceSender = tokio::sync::broadcast::Sender<PresenceSignal>;
