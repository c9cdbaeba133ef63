use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use courier_db::models::FriendRequestRow;
use courier_gateway::serialize;
use courier_types::api::{Claims, DirectoryEntry, FriendStatus};

use crate::{AppState, blocking};

/// Directory listing: every other user, annotated with the caller's
/// relationship to them so the client can render the right action button.
pub async fn directory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<DirectoryEntry>>, StatusCode> {
    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let me = claims.sub;

    let db = state.db.clone();
    let entries = blocking(move || {
        let mut entries = Vec::new();
        for user in db.list_users_except(me)? {
            let profile = db.get_profile(user.id)?;
            let summary = serialize::user_summary(&user, profile.as_ref(), &origin);
            let request = db.find_request_between(me, user.id)?;
            entries.push(DirectoryEntry {
                id: summary.id,
                username: summary.username,
                display_name: summary.display_name,
                avatar_url: summary.avatar_url,
                friend_status: relation(me, request.as_ref()),
            });
        }
        Ok(entries)
    })
    .await?;

    Ok(Json(entries))
}

fn relation(me: i64, request: Option<&FriendRequestRow>) -> FriendStatus {
    match request {
        None => FriendStatus::None,
        Some(req) if req.status == FriendRequestRow::ACCEPTED => FriendStatus::Friends,
        Some(req) if req.status == FriendRequestRow::DECLINED => FriendStatus::Declined,
        Some(req) if req.from_user == me => FriendStatus::Outgoing,
        Some(_) => FriendStatus::Incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(from: i64, to: i64, status: &str) -> FriendRequestRow {
        FriendRequestRow {
            id: 1,
            from_user: from,
            to_user: to,
            status: status.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn relation_covers_every_direction() {
        assert_eq!(relation(1, None), FriendStatus::None);
        assert_eq!(
            relation(1, Some(&req(1, 2, FriendRequestRow::ACCEPTED))),
            FriendStatus::Friends
        );
        assert_eq!(
            relation(2, Some(&req(1, 2, FriendRequestRow::ACCEPTED))),
            FriendStatus::Friends
        );
        assert_eq!(
            relation(1, Some(&req(1, 2, FriendRequestRow::PENDING))),
            FriendStatus::Outgoing
        );
        assert_eq!(
            relation(2, Some(&req(1, 2, FriendRequestRow::PENDING))),
            FriendStatus::Incoming
        );
        assert_eq!(
            relation(1, Some(&req(2, 1, FriendRequestRow::DECLINED))),
            FriendStatus::Declined
        );
    }
}
