use crate::error::ApiError;
use crate::models::{AuthResponse, LoginRequest, SignupRequest};
use crate::{db, AppState};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================
// Auth: bearer tokens over argon2-hashed passwords
// ============================================================

const TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub email: String,
    pub exp: i64,
}

/// Verified identity injected into authenticated requests.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hash failed: {}", e)))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub fn issue_token(secret: &str, user_id: Uuid, email: &str) -> Result<String, ApiError> {
    let claims = TokenClaims {
        sub: user_id.to_string(),
        email: email.to_string(),
        exp: chrono::Utc::now().timestamp() + TOKEN_LIFETIME_SECS,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("token encode failed: {}", e)))
}

pub fn decode_token(secret: &str, token: &str) -> Result<TokenClaims, ApiError> {
    decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}

// ============================================================
// Handlers
// ============================================================

/// POST /signup - Create a user and hand back a bearer token
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = payload.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ApiError::InvalidInput("a valid email is required".to_string()));
    }
    if payload.password.len() < 8 {
        return Err(ApiError::InvalidInput(
            "password must be at least 8 characters".to_string(),
        ));
    }
    if db::get_user_by_email(&state.db, &email).await?.is_some() {
        return Err(ApiError::InvalidInput("email already registered".to_string()));
    }

    let password_hash = hash_password(&payload.password)?;
    let user = db::create_user(&state.db, &email, &password_hash).await?;
    let token = issue_token(&state.jwt_secret, user.id, &user.email)?;

    tracing::info!(user_id = %user.id, "new signup");
    Ok(Json(AuthResponse { token, user: user.safe() }))
}

/// POST /login - Exchange credentials for a bearer token
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = db::get_user_by_email(&state.db, &payload.email)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !verify_password(&user.password_hash, &payload.password) {
        return Err(ApiError::Unauthorized);
    }

    let token = issue_token(&state.jwt_secret, user.id, &user.email)?;
    Ok(Json(AuthResponse { token, user: user.safe() }))
}

/// Middleware: verify the bearer token and attach `AuthUser`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = decode_token(&state.jwt_secret, token)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(request).await)
}

// ============================================================
// Tests
// ============================================================
