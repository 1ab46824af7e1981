use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_cookies::Cookies;
use tower_sessions::Session;
use uuid::Uuid;

use crate::engine::ledger_from_rows;
use crate::error::PollError;
use crate::identity::{self, CookieFingerprints, ParticipantKey};
use crate::ledger::TallySnapshot;
use crate::policy::{self, PollDefinition, PollSettings};
use crate::sse::models::VoteChange;
use crate::startup::AppState;
use crate::store::VoteStore;

const MAX_OPTIONS: usize = 10;

// Request/Response DTOs
#[derive(Debug, Deserialize)]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreatePollResponse {
    pub poll_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TallyView {
    pub counts: Vec<u64>,
    pub total: u64,
    pub percentages: Vec<f64>,
}

impl From<&TallySnapshot> for TallyView {
    fn from(tally: &TallySnapshot) -> Self {
        TallyView {
            counts: tally.counts().to_vec(),
            total: tally.total(),
            percentages: tally.percentages(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub ended: bool,
    pub my_vote: Option<Vec<u32>>,
    pub results: Option<TallyView>,
}

#[derive(Debug, Serialize)]
pub struct PollSummary {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub settings: PollSettings,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub ended: bool,
    pub total_votes: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitVoteRequest {
    pub selected_options: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct VoteResponse {
    pub success: bool,
    pub message: String,
}

// Helper function to extract user_id from session
async fn get_user_id_from_session(session: &Session) -> Result<Uuid, PollError> {
    session
        .get::<Uuid>("user_id")
        .await
        .map_err(|_| PollError::Unauthorized)?
        .ok_or(PollError::Unauthorized)
}

async fn resolve_participant(session: &Session, cookies: &Cookies) -> ParticipantKey {
    let auth_user = session.get::<Uuid>("user_id").await.ok().flatten();
    identity::resolve(auth_user, &CookieFingerprints::new(cookies))
}

/// Create a new poll (authenticated users only)
pub async fn create_poll(
    Extension(app_state): Extension<AppState>,
    session: Session,
    Json(payload): Json<CreatePollRequest>,
) -> Result<impl IntoResponse, PollError> {
    let user_id = get_user_id_from_session(&session).await?;

    let now = Utc::now();
    validate_poll_input(&payload.question, &payload.options, payload.ends_at, now)?;

    let poll = PollDefinition {
        id: Uuid::new_v4(),
        question: payload.question,
        options: payload.options,
        settings: payload.settings,
        created_by: Some(user_id),
        created_at: now,
        ends_at: payload.ends_at,
    };

    app_state.store.create_poll(&poll).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePollResponse { poll_id: poll.id }),
    ))
}

/// Edit a poll's question, options, settings, or end date (only creator)
pub async fn update_poll(
    Extension(app_state): Extension<AppState>,
    session: Session,
    Path(poll_id): Path<Uuid>,
    Json(payload): Json<UpdatePollRequest>,
) -> Result<impl IntoResponse, PollError> {
    let user_id = get_user_id_from_session(&session).await?;

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    if poll.created_by != Some(user_id) {
        return Err(PollError::Unauthorized);
    }

    let now = Utc::now();
    validate_poll_input(&payload.question, &payload.options, payload.ends_at, now)?;

    let updated = PollDefinition {
        id: poll.id,
        question: payload.question,
        options: payload.options,
        settings: payload.settings,
        created_by: poll.created_by,
        created_at: poll.created_at,
        ends_at: payload.ends_at,
    };

    app_state.store.update_poll(&updated).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Poll updated successfully"
        })),
    ))
}

/// Get all polls with their current total vote counts
pub async fn list_polls(
    Extension(app_state): Extension<AppState>,
) -> Result<impl IntoResponse, PollError> {
    let polls = app_state.store.list_polls().await?;
    let now = Utc::now();

    let mut summaries = Vec::new();
    for poll in polls {
        let votes = app_state.store.fetch_all_votes(poll.id).await?;
        let total_votes = votes
            .iter()
            .map(|vote| vote.selected_options.len() as u64)
            .sum();

        summaries.push(PollSummary {
            ended: poll.is_ended(now),
            id: poll.id,
            question: poll.question,
            options: poll.options,
            settings: poll.settings,
            created_at: poll.created_at,
            ends_at: poll.ends_at,
            total_votes,
        });
    }

    Ok((StatusCode::OK, Json(summaries)))
}

/// Get one poll, the caller's current vote, and the results when visible
pub async fn get_poll(
    Extension(app_state): Extension<AppState>,
    Extension(cookies): Extension<Cookies>,
    session: Session,
    Path(poll_id): Path<Uuid>,
) -> Result<impl IntoResponse, PollError> {
    let participant = resolve_participant(&session, &cookies).await;

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    let my_vote = app_state
        .store
        .fetch_vote(poll_id, &participant)
        .await?
        .map(|vote| vote.selected_options);

    let now = Utc::now();
    let results = if policy::can_see_results(&poll, my_vote.is_some(), now) {
        let rows = app_state.store.fetch_all_votes(poll_id).await?;
        let ledger = ledger_from_rows(poll.option_count(), rows);
        Some(TallyView::from(&ledger.tally()))
    } else {
        None
    };

    let response = PollResponse {
        ended: poll.is_ended(now),
        id: poll.id,
        question: poll.question,
        options: poll.options,
        settings: poll.settings,
        created_by: poll.created_by,
        created_at: poll.created_at,
        ends_at: poll.ends_at,
        my_vote,
        results,
    };

    Ok((StatusCode::OK, Json(response)))
}

/// Submit or change a vote. The policy check runs before any store write, so
/// a rejected submission never reaches the store.
pub async fn submit_vote(
    Extension(app_state): Extension<AppState>,
    Extension(cookies): Extension<Cookies>,
    session: Session,
    Path(poll_id): Path<Uuid>,
    Json(payload): Json<SubmitVoteRequest>,
) -> Result<impl IntoResponse, PollError> {
    let participant = resolve_participant(&session, &cookies).await;

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    let now = Utc::now();
    let existing = app_state.store.fetch_vote(poll_id, &participant).await?;
    if !policy::can_vote(&poll, existing.is_some(), now) {
        return Err(if poll.is_ended(now) {
            PollError::PollEnded
        } else {
            PollError::VoteChangeNotAllowed
        });
    }

    let selected = normalize_selection(&poll, &payload.selected_options)?;

    let change = if existing.is_some() {
        let row = app_state
            .store
            .update_vote(poll_id, &participant, &selected)
            .await?;
        VoteChange::Updated(row)
    } else {
        let row = app_state
            .store
            .insert_vote(poll_id, &participant, &selected)
            .await?;
        VoteChange::Inserted(row)
    };
    let _ = app_state.changes.send(change);

    Ok((
        StatusCode::OK,
        Json(VoteResponse {
            success: true,
            message: "Vote recorded successfully".to_string(),
        }),
    ))
}

/// Retract the caller's vote
pub async fn retract_vote(
    Extension(app_state): Extension<AppState>,
    Extension(cookies): Extension<Cookies>,
    session: Session,
    Path(poll_id): Path<Uuid>,
) -> Result<impl IntoResponse, PollError> {
    let participant = resolve_participant(&session, &cookies).await;

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    let now = Utc::now();
    if poll.is_ended(now) {
        return Err(PollError::PollEnded);
    }

    app_state
        .store
        .fetch_vote(poll_id, &participant)
        .await?
        .ok_or(PollError::NotVoted)?;

    let seq = app_state.store.delete_vote(poll_id, &participant).await?;

    let (user_id, anon_id) = match participant {
        ParticipantKey::Authenticated(user_id) => (Some(user_id), None),
        ParticipantKey::Anonymous(anon_id) => (None, Some(anon_id)),
    };
    let _ = app_state.changes.send(VoteChange::Deleted {
        poll_id,
        user_id,
        anon_id,
        seq,
    });

    Ok((
        StatusCode::OK,
        Json(VoteResponse {
            success: true,
            message: "Vote retracted".to_string(),
        }),
    ))
}

/// Delete a poll (only creator can delete)
pub async fn delete_poll(
    Extension(app_state): Extension<AppState>,
    session: Session,
    Path(poll_id): Path<Uuid>,
) -> Result<impl IntoResponse, PollError> {
    let user_id = get_user_id_from_session(&session).await?;

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    if poll.created_by != Some(user_id) {
        return Err(PollError::Unauthorized);
    }

    app_state.store.delete_poll(poll_id).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Poll deleted successfully"
        })),
    ))
}

fn validate_poll_input(
    question: &str,
    options: &[String],
    ends_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), PollError> {
    if question.trim().is_empty() {
        return Err(PollError::InvalidRequest);
    }
    if options.len() < 2 || options.len() > MAX_OPTIONS {
        return Err(PollError::InvalidRequest);
    }
    if options.iter().any(|option| option.trim().is_empty()) {
        return Err(PollError::InvalidRequest);
    }
    if ends_at.is_some_and(|ends_at| ends_at <= now) {
        return Err(PollError::InvalidRequest);
    }
    Ok(())
}

fn normalize_selection(poll: &PollDefinition, selected: &[u32]) -> Result<Vec<u32>, PollError> {
    if selected.is_empty() {
        return Err(PollError::InvalidRequest);
    }

    let mut requested: Vec<usize> = selected.iter().map(|&index| index as usize).collect();
    requested.sort_unstable();
    requested.dedup();

    if requested
        .iter()
        .any(|&index| index >= poll.option_count())
    {
        return Err(PollError::OptionOutOfRange);
    }
    if !poll.settings.allow_multiple && requested.len() > 1 {
        return Err(PollError::InvalidRequest);
    }

    // Build the stored selection through the same mutation rule the voting
    // UI applies one pick at a time.
    let mut selection = Vec::new();
    for index in requested {
        selection = policy::toggle_selection(&poll.settings, &selection, index);
    }

    Ok(selection.into_iter().map(|index| index as u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(allow_multiple: bool) -> PollDefinition {
        PollDefinition {
            id: Uuid::new_v4(),
            question: "Pick".to_string(),
            options: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            settings: PollSettings {
                allow_multiple,
                allow_vote_change: true,
                show_results_before_voting: false,
            },
            created_by: None,
            created_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn empty_selection_is_rejected() {
        assert!(matches!(
            normalize_selection(&poll(true), &[]),
            Err(PollError::InvalidRequest)
        ));
    }

    #[test]
    fn out_of_range_selection_is_rejected() {
        assert!(matches!(
            normalize_selection(&poll(true), &[3]),
            Err(PollError::OptionOutOfRange)
        ));
    }

    #[test]
    fn single_choice_rejects_multiple_selections() {
        assert!(matches!(
            normalize_selection(&poll(false), &[0, 1]),
            Err(PollError::InvalidRequest)
        ));
        assert_eq!(normalize_selection(&poll(false), &[1]).unwrap(), vec![1]);
    }

    #[test]
    fn multi_choice_is_sorted_and_deduplicated() {
        assert_eq!(
            normalize_selection(&poll(true), &[2, 0, 2]).unwrap(),
            vec![0, 2]
        );
    }

    #[test]
    fn poll_input_validation() {
        use chrono::TimeDelta;

        let now = Utc::now();
        let options = vec!["a".to_string(), "b".to_string()];

        assert!(validate_poll_input("Pick", &options, None, now).is_ok());
        assert!(validate_poll_input("Pick", &options, Some(now + TimeDelta::hours(1)), now).is_ok());

        assert!(matches!(
            validate_poll_input("  ", &options, None, now),
            Err(PollError::InvalidRequest)
        ));
        assert!(matches!(
            validate_poll_input("Pick", &options[..1], None, now),
            Err(PollError::InvalidRequest)
        ));
        assert!(matches!(
            validate_poll_input("Pick", &vec!["a".to_string(); MAX_OPTIONS + 1], None, now),
            Err(PollError::InvalidRequest)
        ));
        assert!(matches!(
            validate_poll_input("Pick", &options, Some(now - TimeDelta::minutes(1)), now),
            Err(PollError::InvalidRequest)
        ));
    }
}
