use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::info;

use courier_db::models::{FriendRequestRow, parse_timestamp};
use courier_db::{Database, now_string};
use courier_gateway::bus::personal_group;
use courier_gateway::serialize;
use courier_types::api::{
    Claims, CreateFriendRequest, FriendRequestView, FriendRequestsResponse, RespondFriendRequest,
    UserSummary,
};
use courier_types::events::ServerEvent;

use crate::{AppState, blocking};

pub async fn list_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
) -> Result<Json<FriendRequestsResponse>, StatusCode> {
    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let me = claims.sub;

    let db = state.db.clone();
    let response = blocking(move || {
        let incoming = db
            .pending_incoming(me)?
            .iter()
            .map(|row| view(&db, row, &origin))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let outgoing = db
            .pending_outgoing(me)?
            .iter()
            .map(|row| view(&db, row, &origin))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(FriendRequestsResponse { incoming, outgoing })
    })
    .await?;

    Ok(Json(response))
}

/// Outcome of a create attempt, decided inside one blocking closure so the
/// existing-request checks and the mutation see the same state.
enum CreateOutcome {
    Created(FriendRequestRow),
    AutoAccepted(FriendRequestRow),
    AlreadyRelated,
    NoSuchUser,
}

/// Send a friend request. A pending request in the opposite direction is
/// auto-accepted instead of creating a duplicate; a previously declined
/// request is superseded by a fresh one.
pub async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateFriendRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let me = claims.sub;
    let to = req.to_user_id;
    if to == me {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let outcome = blocking(move || {
        if db.get_user_by_id(to)?.is_none() {
            return Ok(CreateOutcome::NoSuchUser);
        }
        match db.find_request_between(me, to)? {
            Some(existing) if existing.status == FriendRequestRow::ACCEPTED => {
                Ok(CreateOutcome::AlreadyRelated)
            }
            Some(existing)
                if existing.status == FriendRequestRow::PENDING && existing.from_user == me =>
            {
                Ok(CreateOutcome::AlreadyRelated)
            }
            Some(existing) if existing.status == FriendRequestRow::PENDING => {
                // They already asked us; sending back counts as accepting.
                let accepted = db
                    .set_request_status(existing.id, FriendRequestRow::ACCEPTED, &now_string())?
                    .ok_or_else(|| anyhow::anyhow!("request {} vanished", existing.id))?;
                Ok(CreateOutcome::AutoAccepted(accepted))
            }
            Some(declined) => {
                db.remove_request(declined.id)?;
                Ok(CreateOutcome::Created(db.create_friend_request(me, to, &now_string())?))
            }
            None => Ok(CreateOutcome::Created(db.create_friend_request(me, to, &now_string())?)),
        }
    })
    .await?;

    match outcome {
        CreateOutcome::NoSuchUser => Err(StatusCode::NOT_FOUND),
        CreateOutcome::AlreadyRelated => Err(StatusCode::BAD_REQUEST),
        CreateOutcome::AutoAccepted(row) => {
            info!("friend request between {} and {} auto-accepted", me, to);
            let view = load_view(&state, row, &headers).await?;
            Ok((StatusCode::OK, Json(view)))
        }
        CreateOutcome::Created(row) => {
            state
                .bus
                .publish(&personal_group(to), ServerEvent::FriendRequest { from_user: me })
                .await;
            let view = load_view(&state, row, &headers).await?;
            Ok((StatusCode::CREATED, Json(view)))
        }
    }
}

pub async fn respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RespondFriendRequest>,
) -> Result<Json<FriendRequestView>, StatusCode> {
    let status = match req.action.as_str() {
        "accept" => FriendRequestRow::ACCEPTED,
        "decline" => FriendRequestRow::DECLINED,
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    let me = claims.sub;
    let db = state.db.clone();
    let updated = blocking(move || {
        let request = match db.get_request_for_target(request_id, me)? {
            Some(r) => r,
            None => return Ok(None),
        };
        if request.status != FriendRequestRow::PENDING {
            return Ok(Some(Err(())));
        }
        let updated = db
            .set_request_status(request.id, status, &now_string())?
            .ok_or_else(|| anyhow::anyhow!("request {} vanished", request.id))?;
        Ok(Some(Ok(updated)))
    })
    .await?;

    match updated {
        None => Err(StatusCode::NOT_FOUND),
        Some(Err(())) => Err(StatusCode::BAD_REQUEST),
        Some(Ok(row)) => {
            let view = load_view(&state, row, &headers).await?;
            Ok(Json(view))
        }
    }
}

/// Withdraw a pending request the caller sent.
pub async fn cancel(
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let me = claims.sub;
    let db = state.db.clone();
    let deleted = blocking(move || db.delete_pending_request(request_id, me)).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

pub async fn friends_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<UserSummary>>, StatusCode> {
    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let me = claims.sub;

    let db = state.db.clone();
    let friends = blocking(move || {
        db.list_friends(me)?
            .iter()
            .map(|user| {
                let profile = db.get_profile(user.id)?;
                Ok(serialize::user_summary(user, profile.as_ref(), &origin))
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await?;

    Ok(Json(friends))
}

async fn load_view(
    state: &AppState,
    row: FriendRequestRow,
    headers: &HeaderMap,
) -> Result<FriendRequestView, StatusCode> {
    let origin = serialize::origin_from_headers(headers, &state.public_scheme);
    let db = state.db.clone();
    blocking(move || view(&db, &row, &origin)).await
}

fn view(db: &Database, row: &FriendRequestRow, origin: &str) -> anyhow::Result<FriendRequestView> {
    Ok(FriendRequestView {
        id: row.id,
        from_user: summary(db, row.from_user, origin)?,
        to_user: summary(db, row.to_user, origin)?,
        status: row.status.clone(),
        created_at: parse_timestamp(&row.created_at),
    })
}

fn summary(db: &Database, user_id: i64, origin: &str) -> anyhow::Result<UserSummary> {
    let user = db
        .get_user_by_id(user_id)?
        .ok_or_else(|| anyhow::anyhow!("user {} referenced by request is missing", user_id))?;
    let profile = db.get_profile(user_id)?;
    Ok(serialize::user_summary(&user, profile.as_ref(), origin))
}
