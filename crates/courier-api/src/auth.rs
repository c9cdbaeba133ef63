use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info};

use courier_db::attachments::{AVATARS, AttachmentStore};
use courier_db::now_string;
use courier_gateway::auth::{WS_TOKEN_MAX_AGE_SECS, issue_ws_token};
use courier_gateway::serialize;
use courier_types::api::{
    AuthResponse, Claims, LoginRequest, ProfileResponse, RegisterRequest, WsTokenResponse,
};

use crate::{AppState, blocking};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let username = req.username.trim().to_string();
    if username.chars().count() < 3 || username.chars().count() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let taken = {
        let db = state.db.clone();
        let username = username.clone();
        let email = req.email.clone();
        blocking(move || {
            if db.get_user_by_handle(&username)?.is_some() {
                return Ok(true);
            }
            if !email.is_empty() && db.get_user_by_handle(&email)?.is_some() {
                return Ok(true);
            }
            Ok(false)
        })
        .await?
    };
    if taken {
        return Err(StatusCode::CONFLICT);
    }

    // Argon2id is deliberately slow; keep it off the async runtime.
    let password = req.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let user_id = {
        let db = state.db.clone();
        let username = username.clone();
        let email = req.email.clone();
        blocking(move || {
            let now = now_string();
            let id = db.create_user(&username, &email, &password_hash, &now)?;
            db.create_profile(id, &now)?;
            Ok(id)
        })
        .await?
    };

    info!("registered user {} ({})", username, user_id);

    let token = create_token(&state.jwt_secret, user_id, &username)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse { user_id, username, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let user = {
        let db = state.db.clone();
        let handle = req.username.clone();
        blocking(move || db.get_user_by_handle(&handle)).await?
    }
    .ok_or(StatusCode::UNAUTHORIZED)?;

    let password = req.password.clone();
    let stored_hash = user.password.clone();
    let verified = tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)?;
        Argon2::default().verify_password(password.as_bytes(), &parsed)?;
        Ok::<_, argon2::password_hash::Error>(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if verified.is_err() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let token = create_token(&state.jwt_secret, user.id, &user.username)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(AuthResponse {
        user_id: user.id,
        username: user.username,
        token,
    }))
}

pub async fn me_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ProfileResponse>, StatusCode> {
    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let profile = load_profile(&state, claims.sub, origin).await?;
    Ok(Json(profile))
}

/// Profile update is multipart so text fields and a new avatar can arrive in
/// one request. Absent fields are left untouched.
pub async fn me_patch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<Json<ProfileResponse>, StatusCode> {
    let mut display_name: Option<String> = None;
    let mut about: Option<String> = None;
    let mut phone: Option<String> = None;
    let mut avatar: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        match field.name().unwrap_or("") {
            "display_name" => {
                display_name = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            "about" => {
                about = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            "phone" => {
                phone = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            "avatar" => {
                let name = field.file_name().unwrap_or("avatar").to_string();
                let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                avatar = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let stored_avatar = match avatar {
        Some((name, bytes)) => {
            let store = state.store.clone();
            Some(save_upload(store, AVATARS, name, bytes).await?)
        }
        None => None,
    };

    {
        let db = state.db.clone();
        let user_id = claims.sub;
        blocking(move || {
            db.update_profile(
                user_id,
                display_name.as_deref(),
                about.as_deref(),
                phone.as_deref(),
            )?;
            if let Some(stored) = stored_avatar {
                db.set_avatar(user_id, &stored)?;
            }
            Ok(())
        })
        .await?;
    }

    let origin = serialize::origin_from_headers(&headers, &state.public_scheme);
    let profile = load_profile(&state, claims.sub, origin).await?;
    Ok(Json(profile))
}

/// Mint a short-lived handshake token for the WebSocket query string.
pub async fn ws_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<WsTokenResponse> {
    Json(WsTokenResponse {
        ws_token: issue_ws_token(&state.jwt_secret, claims.sub),
        expires_in_secs: WS_TOKEN_MAX_AGE_SECS,
    })
}

pub(crate) async fn save_upload(
    store: std::sync::Arc<AttachmentStore>,
    dir: &'static str,
    original_name: String,
    bytes: Vec<u8>,
) -> Result<String, StatusCode> {
    tokio::task::spawn_blocking(move || store.save(dir, &original_name, &bytes))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("failed to store upload: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn load_profile(
    state: &AppState,
    user_id: i64,
    origin: String,
) -> Result<ProfileResponse, StatusCode> {
    let db = state.db.clone();
    blocking(move || {
        let user = db
            .get_user_by_id(user_id)?
            .ok_or_else(|| anyhow::anyhow!("authenticated user {} is missing", user_id))?;
        let profile = db.get_profile(user_id)?;
        let summary = serialize::user_summary(&user, profile.as_ref(), &origin);
        let (about, phone) = profile
            .map(|p| (p.about, p.phone))
            .unwrap_or_default();
        Ok(ProfileResponse {
            id: user.id,
            username: user.username,
            email: user.email,
            display_name: summary.display_name,
            about,
            phone,
            avatar_url: summary.avatar_url,
        })
    })
    .await
}

fn create_token(secret: &str, user_id: i64, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
