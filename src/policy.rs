use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSettings {
    pub allow_multiple: bool,
    pub allow_vote_change: bool,
    pub show_results_before_voting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollDefinition {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl PollDefinition {
    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    pub fn is_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| now >= ends_at)
    }
}

/// Whether a participant may currently submit or modify a vote. Poll end is
/// terminal: once ended, no transition is accepted regardless of
/// `allow_vote_change`.
pub fn can_vote(poll: &PollDefinition, has_existing_vote: bool, now: DateTime<Utc>) -> bool {
    !poll.is_ended(now) && (!has_existing_vote || poll.settings.allow_vote_change)
}

/// Whether results are currently visible to a participant.
pub fn can_see_results(poll: &PollDefinition, has_existing_vote: bool, now: DateTime<Utc>) -> bool {
    poll.is_ended(now) || poll.settings.show_results_before_voting || has_existing_vote
}

/// Selection mutation rule: single-choice replaces the current selection,
/// multi-choice toggles membership. The result is sorted and deduplicated.
pub fn toggle_selection(settings: &PollSettings, current: &[usize], index: usize) -> Vec<usize> {
    if !settings.allow_multiple {
        return vec![index];
    }

    let mut selection: Vec<usize> = current.to_vec();
    if let Some(position) = selection.iter().position(|&i| i == index) {
        selection.remove(position);
    } else {
        selection.push(index);
    }
    selection.sort_unstable();
    selection.dedup();
    selection
}
