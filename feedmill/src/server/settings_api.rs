use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde_json::Value;

use super::auth::AuthUser;
use super::envelope::{ok, ApiResult};
use super::AppState;
use crate::error::Error;

#[get("/api/settings")]
pub async fn get_settings(state: &State<AppState>, user: AuthUser) -> ApiResult<Value> {
    Ok(ok(state.store.settings_for(user.user_id).await?))
}

/// Whole-object save (the client debounces). Plaintext secrets in known
/// locations are encrypted in place before the blob is stored.
#[post("/api/settings", data = "<body>")]
pub async fn save_settings(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<Value>,
) -> ApiResult<Value> {
    let mut settings = body.into_inner();
    if !settings.is_object() {
        return Err(Error::InvalidInput("settings must be a JSON object".into()).into());
    }

    encrypt_in_place(state, &mut settings, &["sync"], "password", "password_enc")?;
    encrypt_in_place(state, &mut settings, &["translate"], "deepl_key", "deepl_key_enc")?;

    state.store.save_settings(user.user_id, &settings).await?;
    Ok(ok(settings))
}

/// Replace `section.plain_key` (if present as a string) with
/// `section.enc_key` holding the encrypted value.
fn encrypt_in_place(
    state: &AppState,
    settings: &mut Value,
    section_path: &[&str],
    plain_key: &str,
    enc_key: &str,
) -> Result<(), Error> {
    let mut section = &mut *settings;
    for key in section_path {
        let Some(next) = section.get_mut(key) else {
            return Ok(());
        };
        section = next;
    }
    let Some(obj) = section.as_object_mut() else {
        return Ok(());
    };
    let Some(plain) = obj.get(plain_key).and_then(Value::as_str).map(str::to_string) else {
        return Ok(());
    };
    let enc = state.secrets.encrypt(&plain).map_err(Error::Internal)?;
    obj.remove(plain_key);
    obj.insert(enc_key.to_string(), Value::String(enc));
    Ok(())
}
