use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use courier_api::middleware::require_auth;
use courier_api::{auth, chat, friends, users};
use courier_db::Database;
use courier_db::attachments::AttachmentStore;
use courier_gateway::bus::Bus;
use courier_gateway::presence::PresenceRegistry;
use courier_gateway::serialize;
use courier_gateway::session::{self, Gateway};

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub media_root: PathBuf,
    pub jwt_secret: String,
    pub public_scheme: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("COURIER_PORT")
                .unwrap_or_else(|_| "8000".into())
                .parse()?,
            db_path: std::env::var("COURIER_DB_PATH")
                .unwrap_or_else(|_| "courier.db".into())
                .into(),
            media_root: std::env::var("COURIER_MEDIA_ROOT")
                .unwrap_or_else(|_| "media".into())
                .into(),
            jwt_secret: std::env::var("COURIER_JWT_SECRET")
                .unwrap_or_else(|_| "dev-secret-change-me".into()),
            public_scheme: std::env::var("COURIER_PUBLIC_SCHEME")
                .unwrap_or_else(|_| "http".into()),
        })
    }
}

/// Build the router plus the realtime state behind it. Split from `main` so
/// integration tests can run the full stack on an ephemeral port.
pub fn build(config: &Config) -> anyhow::Result<(Router, Gateway)> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let store = Arc::new(AttachmentStore::open(&config.media_root)?);

    let gateway = Gateway {
        db,
        store,
        bus: Bus::new(),
        presence: PresenceRegistry::new(),
        jwt_secret: config.jwt_secret.clone(),
        public_scheme: config.public_scheme.clone(),
    };

    let public_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth::me_get).patch(auth::me_patch))
        .route("/api/auth/ws-token", post(auth::ws_token))
        .route("/api/users", get(users::directory))
        .route(
            "/api/friend-requests",
            get(friends::list_requests).post(friends::create_request),
        )
        .route("/api/friend-requests/{request_id}/respond", post(friends::respond))
        .route("/api/friend-requests/{request_id}", delete(friends::cancel))
        .route("/api/friends", get(friends::friends_list))
        .route("/api/chat/conversation/{user_id}", get(chat::conversation))
        .route("/api/chat/send", post(chat::send))
        .layer(middleware::from_fn_with_state(gateway.clone(), require_auth));

    let ws_route = Router::new().route("/realtime/conversation/{other_user_id}", get(ws_upgrade));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .nest_service("/media", ServeDir::new(&config.media_root))
        .with_state(gateway.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    Ok((app, gateway))
}

async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Path(other_user_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = serialize::origin_from_headers(&headers, &gateway.public_scheme);
    ws.on_upgrade(move |socket| {
        session::handle_socket(socket, gateway, other_user_id, params, origin)
    })
}
