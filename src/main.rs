use crate::polls::{
    create_poll, delete_poll, get_poll, list_polls, retract_vote, submit_vote, update_poll,
};
use crate::presence::PresenceConfig;
use crate::sse::poll_live_sse;
use crate::startup::AppState;
use crate::store::PgVoteStore;
use axum::{
    Router,
    extract::Extension,
    http::{
        StatusCode,
        header::{ACCEPT, CONTENT_TYPE},
    },
    response::IntoResponse,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_cookies::CookieManagerLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_sessions::{
    Expiry, MemoryStore, SessionManagerLayer,
    cookie::{SameSite, time::Duration},
};

#[macro_use]
extern crate tracing;

mod engine;
mod error;
mod identity;
mod ledger;
mod policy;
mod polls;
mod presence;
mod sse;
mod startup;
mod store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "INFO");
        }
    }
    // initialize tracing
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgVoteStore::connect(&database_url)
        .await
        .expect("Unable to initialize the vote store");

    let app_state = AppState::new(Arc::new(store), PresenceConfig::from_env());

    let session_store = MemoryStore::default();

    // build our application with a route
    let app = Router::new()
        .route("/api/polls", post(create_poll).get(list_polls))
        .route(
            "/api/polls/:id",
            get(get_poll).put(update_poll).delete(delete_poll),
        )
        .route("/api/polls/:id/vote", post(submit_vote).delete(retract_vote))
        .route("/api/polls/:id/live", get(poll_live_sse))
        .layer(Extension(app_state))
        .layer(CookieManagerLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true)
                .allow_methods([
                    axum::http::Method::POST,
                    axum::http::Method::GET,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([CONTENT_TYPE, ACCEPT]),
        )
        .layer(
            SessionManagerLayer::new(session_store)
                .with_name("polldance")
                .with_same_site(SameSite::Lax)
                .with_secure(false) // TODO: change this to true when running on an HTTPS/production server instead of locally
                .with_expiry(Expiry::OnInactivity(Duration::seconds(3600))),
        )
        .fallback(handler_404);

    let addr = std::env::var("BIND_ADDR")
        .ok()
        .and_then(|raw| raw.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Unable to spawn tcp listener");

    axum::serve(listener, app).await.unwrap();
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "nothing to see here")
}
