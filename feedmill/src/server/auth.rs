/*!
Bearer-token authentication: register/login/refresh/logout plus the
request guards the other route modules consume.

Access tokens are HS256 JWTs (~1 h); refresh tokens are opaque random
strings stored hashed with a ~30 day expiry.
*/

use chrono::{Duration, Utc};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header as JwtHeader, Validation};
use rand::rngs::OsRng;

use super::envelope::{ok, ApiError, ApiResult};
use super::AppState;
use crate::error::Error;
use crate::translate::hash_text;

const ACCESS_TOKEN_HOURS: i64 = 1;
const REFRESH_TOKEN_DAYS: i64 = 30;

/// JWT claims: subject is the user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub exp: usize,
    pub role: String,
}

fn jwt_secret() -> String {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".into())
}

pub fn create_access_token(user_id: i64, role: &str) -> Result<String, Error> {
    let exp = (Utc::now() + Duration::hours(ACCESS_TOKEN_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        exp,
        role: role.to_string(),
    };
    encode(
        &JwtHeader::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
    .map_err(|e| Error::Internal(anyhow::anyhow!("failed to sign token: {}", e)))
}

pub fn decode_access_token(token: &str) -> Option<Claims> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret().as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims)
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(anyhow::anyhow!("failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Authenticated caller, extracted from the Authorization header.
pub struct AuthUser {
    pub user_id: i64,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(header) = req.headers().get_one("Authorization") else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        match decode_access_token(token) {
            Some(claims) => Outcome::Success(AuthUser {
                user_id: claims.sub,
                role: claims.role,
            }),
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// Admin-only guard layered over AuthUser.
pub struct AdminUser(pub AuthUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AuthUser::from_request(req).await {
            Outcome::Success(user) if user.is_admin() => Outcome::Success(AdminUser(user)),
            Outcome::Success(_) => Outcome::Error((Status::Forbidden, ())),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Forward(f) => Outcome::Forward(f),
        }
    }
}

// ---- request/response bodies ----

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: i64,
    pub role: String,
}

/// Registration creates a pending user; an admin approves it later.
#[post("/api/auth/register", data = "<body>")]
pub async fn register(
    state: &State<AppState>,
    body: Json<RegisterRequest>,
) -> ApiResult<serde_json::Value> {
    if body.username.trim().is_empty() || body.password.len() < 4 {
        return Err(ApiError(Error::InvalidInput(
            "username and a password of at least 4 characters are required".into(),
        )));
    }
    let password_hash = hash_password(&body.password)?;
    let user_id = state
        .store
        .create_user(
            body.username.trim(),
            body.email.as_deref(),
            &password_hash,
            "user",
            "pending",
            &state.config.quota_defaults(),
        )
        .await?;
    Ok(ok(serde_json::json!({ "user_id": user_id, "status": "pending" })))
}

#[post("/api/auth/login", data = "<body>")]
pub async fn login(state: &State<AppState>, body: Json<LoginRequest>) -> ApiResult<TokenResponse> {
    let user = match state.store.user_by_username(body.username.trim()).await {
        Ok(user) => user,
        Err(Error::NotFound { .. }) => return Err(ApiError(Error::Unauthorized)),
        Err(e) => return Err(ApiError(e)),
    };
    let Some(stored_hash) = &user.password_hash else {
        return Err(ApiError(Error::Unauthorized));
    };
    if !verify_password(&body.password, stored_hash) {
        return Err(ApiError(Error::Unauthorized));
    }
    if user.status != "active" {
        return Err(ApiError(Error::Forbidden));
    }

    let access_token = create_access_token(user.id, &user.role)?;
    let refresh_token = uuid::Uuid::new_v4().to_string();
    let expires = Utc::now() + Duration::days(REFRESH_TOKEN_DAYS);
    state
        .store
        .create_session(user.id, &hash_text(&refresh_token), expires)
        .await?;
    state.store.touch_last_login(user.id).await?;

    Ok(ok(TokenResponse {
        access_token,
        refresh_token,
        user_id: user.id,
        role: user.role,
    }))
}

#[post("/api/auth/refresh", data = "<body>")]
pub async fn refresh(
    state: &State<AppState>,
    body: Json<RefreshRequest>,
) -> ApiResult<TokenResponse> {
    let token_hash = hash_text(&body.refresh_token);
    let Some(user_id) = state.store.session_user(&token_hash).await? else {
        return Err(ApiError(Error::Unauthorized));
    };
    let user = state.store.user_by_id(user_id).await?;
    if user.status != "active" {
        return Err(ApiError(Error::Forbidden));
    }
    let access_token = create_access_token(user.id, &user.role)?;
    Ok(ok(TokenResponse {
        access_token,
        refresh_token: body.refresh_token.clone(),
        user_id: user.id,
        role: user.role,
    }))
}

#[post("/api/auth/logout", data = "<body>")]
pub async fn logout(
    state: &State<AppState>,
    body: Json<RefreshRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .store
        .delete_session(&hash_text(&body.refresh_token))
        .await?;
    Ok(ok(serde_json::json!({ "logged_out": true })))
}

#[get("/api/auth/me")]
pub async fn me(state: &State<AppState>, user: AuthUser) -> ApiResult<crate::store::UserRow> {
    let row = state.store.user_by_id(user.user_id).await?;
    Ok(ok(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn token_round_trip_carries_role() {
        std::env::set_var("JWT_SECRET", "test-secret");
        let token = create_access_token(7, "admin").unwrap();
        let claims = decode_access_token(&token).expect("decode");
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.role, "admin");
        assert!(decode_access_token("garbage").is_none());
    }
}
