use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures inside the reconciliation core. None of these are fatal to the
/// process; they are scoped to one poll session.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("participant already has a vote")]
    DuplicateVote,
    #[error("transport disconnected")]
    TransportDisconnected,
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Poll not found")]
    PollNotFound,
    #[error("Selected option out of range")]
    OptionOutOfRange,
    #[error("Poll has ended")]
    PollEnded,
    #[error("Vote changes are not allowed on this poll")]
    VoteChangeNotAllowed,
    #[error("User already voted on this poll")]
    AlreadyVoted,
    #[error("No vote to retract")]
    NotVoted,
    #[error("Store error: {0}")]
    StoreUnavailable(String),
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            PollError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            PollError::InvalidRequest => (StatusCode::BAD_REQUEST, "Invalid request"),
            PollError::PollNotFound => (StatusCode::NOT_FOUND, "Poll not found"),
            PollError::OptionOutOfRange => {
                (StatusCode::BAD_REQUEST, "Selected option out of range")
            }
            PollError::PollEnded => (StatusCode::BAD_REQUEST, "Poll has ended"),
            PollError::VoteChangeNotAllowed => (
                StatusCode::CONFLICT,
                "Vote changes are not allowed on this poll",
            ),
            PollError::AlreadyVoted => (StatusCode::CONFLICT, "User already voted on this poll"),
            PollError::NotVoted => (StatusCode::NOT_FOUND, "No vote to retract"),
            PollError::StoreUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.as_str()),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        EngineError::StoreUnavailable(error.to_string())
    }
}

impl From<EngineError> for PollError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::MalformedEvent(_) => PollError::InvalidRequest,
            EngineError::DuplicateVote => PollError::AlreadyVoted,
            EngineError::StoreUnavailable(msg) => PollError::StoreUnavailable(msg),
            EngineError::TransportDisconnected => {
                PollError::StoreUnavailable("live transport disconnected".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_vote_surfaces_as_conflict() {
        let error = PollError::from(EngineError::DuplicateVote);
        assert!(matches!(error, PollError::AlreadyVoted));
        assert_eq!(error.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_failure_surfaces_as_service_unavailable() {
        let error = PollError::from(EngineError::StoreUnavailable("down".to_string()));
        assert_eq!(
            error.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
