use axum::{
    Extension, Json,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::error;

use courier_db::attachments::CHAT_ATTACHMENTS;
use courier_gateway::bus::{personal_group, room_for_users};
use courier_gateway::ops::{self, OpError};
use courier_gateway::serialize;
use courier_types::api::{Claims, MessageDocument};
use courier_types::events::ServerEvent;

use crate::auth::save_upload;
use crate::{AppState, blocking};

/// Full message history with one user, oldest first. Serializes through the
/// same projection as the realtime path.
pub async fn conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageDocument>>, StatusCode> {
    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let me = claims.sub;

    let db = state.db.clone();
    let documents = blocking(move || {
        if db.get_user_by_id(user_id)?.is_none() {
            return Ok(None);
        }
        if !db.are_friends(me, user_id)? {
            return Ok(Some(Err(())));
        }
        let rows = db.conversation(me, user_id)?;
        let docs = serialize::blocking_conversation_documents(&db, &rows, &origin)?;
        Ok(Some(Ok(docs)))
    })
    .await?;

    match documents {
        None => Err(StatusCode::NOT_FOUND),
        Some(Err(())) => Err(StatusCode::FORBIDDEN),
        Some(Ok(docs)) => Ok(Json(docs)),
    }
}

/// Send a message over HTTP. Multipart so an attachment can ride along with
/// the text; either part may be absent but not both.
pub async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, StatusCode> {
    let mut receiver: Option<i64> = None;
    let mut content = String::new();
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        match field.name().unwrap_or("") {
            "receiver" => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                receiver = Some(text.trim().parse().map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            "content" => {
                content = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            }
            "attachment" => {
                let name = field.file_name().unwrap_or("attachment").to_string();
                let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                upload = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let receiver = receiver.ok_or(StatusCode::BAD_REQUEST)?;
    let content = content.trim().to_string();
    if content.is_empty() && upload.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let me = claims.sub;
    let gate = {
        let db = state.db.clone();
        blocking(move || {
            if db.get_user_by_id(receiver)?.is_none() {
                return Ok(None);
            }
            Ok(Some(db.are_friends(me, receiver)?))
        })
        .await?
    };
    match gate {
        None => return Err(StatusCode::NOT_FOUND),
        Some(false) => return Err(StatusCode::FORBIDDEN),
        Some(true) => {}
    }

    let attachment = match upload {
        Some((original_name, bytes)) => {
            let stored =
                save_upload(state.store.clone(), CHAT_ATTACHMENTS, original_name.clone(), bytes)
                    .await?;
            Some((stored, original_name))
        }
        None => None,
    };

    let row = ops::create_message(&state.db, me, receiver, &content, attachment)
        .await
        .map_err(|e| match e {
            OpError::Validation => StatusCode::BAD_REQUEST,
            OpError::NotFound => StatusCode::NOT_FOUND,
            OpError::Forbidden => StatusCode::FORBIDDEN,
            OpError::Storage(err) => {
                error!("failed to store message: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let doc = serialize::message_document(&state.db, row, origin)
        .await
        .map_err(|e| {
            error!("failed to project message: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state
        .bus
        .publish(&room_for_users(me, receiver), ServerEvent::Message { data: doc.clone() })
        .await;
    state
        .bus
        .publish(&personal_group(receiver), ServerEvent::Sidebar { data: doc.clone() })
        .await;

    Ok((StatusCode::CREATED, Json(doc)))
}
