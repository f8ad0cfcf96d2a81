//! Bootstrap methods: first-run setup and boss-token verification.

use serde_json::{json, Value};

use hb_domain::time::validate_tz;
use hb_domain::{Error, Result};
use hb_store::config_keys;

use crate::rpc::auth;
use crate::rpc::handlers::{param_str, require_str};
use crate::state::AppState;

pub(super) fn check(state: &AppState) -> Result<Value> {
    Ok(json!({ "setup-completed": state.store.setup_completed()? }))
}

/// One-shot setup: store the hashed boss credential, name, and timezone.
/// Refused once setup has completed.
pub(super) fn execute(state: &AppState, params: &Value) -> Result<Value> {
    if state.store.setup_completed()? {
        return Err(Error::PermissionDenied(
            "setup has already completed".into(),
        ));
    }

    let boss_token = require_str(params, "boss-token")?;
    if boss_token.len() < 8 {
        return Err(Error::Validation(
            "boss token must be at least 8 characters".into(),
        ));
    }
    let boss_name = param_str(params, "boss-name").unwrap_or_else(|| "boss".to_string());
    let timezone = param_str(params, "boss-timezone").unwrap_or_else(|| "UTC".to_string());
    validate_tz(&timezone)?;

    state
        .store
        .set_config(config_keys::BOSS_TOKEN_HASH, &auth::hash_token(&boss_token))?;
    state.store.set_config(config_keys::BOSS_NAME, &boss_name)?;
    state.store.set_config(config_keys::BOSS_TIMEZONE, &timezone)?;
    if let Some(policy) = params.get("permission-policy") {
        if policy.is_object() {
            state
                .store
                .set_config(config_keys::PERMISSION_POLICY, &policy.to_string())?;
        }
    }
    state.store.set_config(config_keys::SETUP_COMPLETED, "true")?;

    tracing::info!(boss_name = %boss_name, timezone = %timezone, "setup completed");
    Ok(json!({ "setup-completed": true, "boss-name": boss_name, "boss-timezone": timezone }))
}

/// Always-available credential probe: `{valid: bool}`, never an error for a
/// wrong token.
pub(super) fn verify(state: &AppState, params: &Value) -> Result<Value> {
    let token = require_str(params, "token")?;
    Ok(json!({ "valid": auth::verify_boss(&state.store, &token)? }))
}
