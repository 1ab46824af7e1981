use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::Utc;
use futures::stream::Stream;
use serde_json::json;
use tower_cookies::Cookies;
use tower_sessions::Session;
use uuid::Uuid;

use crate::engine::PollSession;
use crate::error::PollError;
use crate::identity::{self, CookieFingerprints};
use crate::policy;
use crate::sse::models::{PresenceKind, PresenceSender, PresenceSignal};
use crate::startup::AppState;
use crate::store::VoteStore;

/// Broadcasts a leave signal when the SSE stream is dropped, so closed tabs
/// fall out of the viewer count without waiting for heartbeat expiry.
struct PresenceGuard {
    presence: PresenceSender,
    poll_id: Uuid,
    connection_id: String,
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        let _ = self.presence.send(PresenceSignal {
            poll_id: self.poll_id,
            connection_id: self.connection_id.clone(),
            kind: PresenceKind::Leave,
        });
    }
}

/// Live view of one poll. Each connection runs its own reconciliation
/// session and streams `init`, `tally`, `my_vote` and `viewers` events.
pub async fn poll_live_sse(
    Extension(app_state): Extension<AppState>,
    Extension(cookies): Extension<Cookies>,
    session: Session,
    Path(poll_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, PollError> {
    let auth_user = session.get::<Uuid>("user_id").await.ok().flatten();
    let me = identity::resolve(auth_user, &CookieFingerprints::new(&cookies));

    let poll = app_state
        .store
        .fetch_poll(poll_id)
        .await?
        .ok_or(PollError::PollNotFound)?;

    // Subscribe to both transports before the snapshot fetch inside start();
    // events racing the snapshot stay buffered and reconcile by seq.
    let handle = PollSession::start(
        app_state.store.clone(),
        poll.clone(),
        me,
        app_state.changes.subscribe(),
        app_state.presence.subscribe(),
        app_state.presence_config.clone(),
    )
    .await?;

    let connection_id = Uuid::new_v4().to_string();
    let presence = app_state.presence.clone();
    let heartbeat_period =
        (app_state.presence_config.heartbeat_timeout / 3).max(Duration::from_secs(1));

    let stream = async_stream::stream! {
        let guard = PresenceGuard {
            presence: presence.clone(),
            poll_id,
            connection_id: connection_id.clone(),
        };
        let _ = presence.send(PresenceSignal {
            poll_id,
            connection_id: connection_id.clone(),
            kind: PresenceKind::Join,
        });

        let mut tallies = handle.tallies();
        let mut viewers = handle.viewers();
        let mut my_selection = handle.my_selection();
        let mut heartbeat = tokio::time::interval(heartbeat_period);

        {
            let tally = tallies.borrow_and_update().clone();
            let selection = my_selection.borrow_and_update().clone();
            let visible = policy::can_see_results(&poll, selection.is_some(), Utc::now());
            yield Ok(Event::default()
                .event("init")
                .data(json!({
                    "poll": &poll,
                    "results": visible.then_some(&tally),
                    "total_votes": tally.total(),
                    "my_vote": selection,
                    "active_viewers": *viewers.borrow_and_update(),
                }).to_string()));
        }

        loop {
            tokio::select! {
                changed = tallies.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tally = tallies.borrow_and_update().clone();
                    let selection = my_selection.borrow().clone();
                    let visible = policy::can_see_results(&poll, selection.is_some(), Utc::now());
                    yield Ok(Event::default()
                        .event("tally")
                        .data(json!({
                            "results": visible.then_some(&tally),
                            "total_votes": tally.total(),
                        }).to_string()));
                }
                changed = my_selection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let selection = my_selection.borrow_and_update().clone();
                    yield Ok(Event::default()
                        .event("my_vote")
                        .data(json!({"my_vote": selection}).to_string()));
                }
                changed = viewers.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let count = *viewers.borrow_and_update();
                    yield Ok(Event::default()
                        .event("viewers")
                        .data(json!({"active_viewers": count}).to_string()));
                }
                _ = heartbeat.tick() => {
                    let _ = presence.send(PresenceSignal {
                        poll_id,
                        connection_id: connection_id.clone(),
                        kind: PresenceKind::Heartbeat,
                    });
                }
            }
        }

        drop(guard);
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    ))
}
