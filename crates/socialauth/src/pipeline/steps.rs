//! Built-in pipeline steps.
//!
//! Each step reads what earlier steps left in the [`PipelineContext`] and
//! either contributes named results or updates the live user records.
//!
//! | step | reads | contributes |
//! |---|---|---|
//! | `social_details` | response | `details` |
//! | `social_uid` | response, details | `uid` |
//! | `auth_allowed` | response, details | - |
//! | `social_user` | uid | user, social, `is_new`, `new_association` |
//! | `get_username` | details, user | `username` |
//! | `create_user` | username, details | user, `is_new` |
//! | `associate_by_email` | details | user, `is_new` |
//! | `associate_user` | user, uid | social, `new_association` |
//! | `load_extra_data` | social, uid, response | - |
//! | `user_details` | user, details | - |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AuthError;
use crate::storage::{NewUser, clean_username};
use crate::AuthResult;

use super::context::{DETAILS_KEY, PipelineContext};
use super::{PipelineStep, StepOutput};

/// User fields filled by `create_user` unless `USER_FIELDS` says otherwise.
pub const USER_FIELDS: &[&str] = &["username", "email"];

/// User fields `user_details` never overwrites.
pub const DEFAULT_PROTECTED_USER_FIELDS: &[&str] = &[
    "username",
    "id",
    "pk",
    "email",
    "password",
    "is_active",
    "is_staff",
    "is_superuser",
];

/// Default length of the random suffix appended to taken usernames.
pub const DEFAULT_UUID_LENGTH: usize = 16;

/// Returns every built-in step.
#[must_use]
pub fn builtin() -> Vec<Arc<dyn PipelineStep>> {
    vec![
        Arc::new(SocialDetails),
        Arc::new(SocialUid),
        Arc::new(AuthAllowed),
        Arc::new(SocialUser),
        Arc::new(GetUsername),
        Arc::new(CreateUser),
        Arc::new(AssociateByEmail),
        Arc::new(AssociateUser),
        Arc::new(LoadExtraData),
        Arc::new(UserDetails),
    ]
}

fn detail_str<'a>(details: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    details
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Collects user details from the provider response.
///
/// Details already in the context win over the backend's.
pub struct SocialDetails;

#[async_trait]
impl PipelineStep for SocialDetails {
    fn name(&self) -> &str {
        "social_details"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let mut details = ctx.backend.user_details(&ctx.response());
        details.extend(ctx.details());
        Ok(StepOutput::single(DETAILS_KEY, Value::Object(details)))
    }
}

/// Reads the provider-side user id.
pub struct SocialUid;

#[async_trait]
impl PipelineStep for SocialUid {
    fn name(&self) -> &str {
        "social_uid"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let uid = ctx.backend.user_id(&ctx.details(), &ctx.response())?;
        Ok(StepOutput::single("uid", uid))
    }
}

/// Rejects identities the backend does not allow.
pub struct AuthAllowed;

#[async_trait]
impl PipelineStep for AuthAllowed {
    fn name(&self) -> &str {
        "auth_allowed"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        if !ctx.backend.auth_allowed(&ctx.response(), &ctx.details()) {
            tracing::warn!("Login not allowed for backend {}", ctx.backend.name());
            return Err(AuthError::Forbidden);
        }
        Ok(StepOutput::Continue)
    }
}

/// Finds the user already linked to this identity.
pub struct SocialUser;

#[async_trait]
impl PipelineStep for SocialUser {
    fn name(&self) -> &str {
        "social_user"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let uid = ctx.uid()?;
        let provider = ctx.backend.name().to_string();
        resolve_social_user(ctx, &provider, &uid).await
    }
}

async fn resolve_social_user(
    ctx: &mut PipelineContext,
    provider: &str,
    uid: &str,
) -> AuthResult<StepOutput> {
    let social = ctx.users.get_social_auth(provider, uid).await?;

    if let Some(social) = &social {
        match ctx.user.as_ref().map(|u| u.id) {
            Some(user_id) if user_id != social.user_id => {
                tracing::warn!("{} identity {} belongs to another user", provider, uid);
                return Err(AuthError::AlreadyAssociated);
            }
            Some(_) => {}
            None => ctx.user = ctx.users.get_user(social.user_id).await?,
        }
    }

    let new_association = social.is_none();
    ctx.social = social;

    let mut output = Map::new();
    output.insert("is_new".into(), Value::Bool(ctx.user.is_none()));
    output.insert("new_association".into(), Value::Bool(new_association));
    Ok(StepOutput::Merge(output))
}

/// Picks a free username for a user about to be created.
pub struct GetUsername;

#[async_trait]
impl PipelineStep for GetUsername {
    fn name(&self) -> &str {
        "get_username"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let fields: Vec<String> = ctx.setting_or("user_fields", owned(USER_FIELDS))?;
        if !fields.iter().any(|f| f == "username") {
            return Ok(StepOutput::Continue);
        }

        if let Some(user) = &ctx.user {
            return Ok(StepOutput::single("username", user.username.clone()));
        }

        let details = ctx.details();
        let email_as_username = ctx.setting_bool("username_is_full_email", false);
        let uuid_length: usize = ctx.setting_or("uuid_length", DEFAULT_UUID_LENGTH)?;
        let do_clean = ctx.setting_bool("clean_usernames", true);
        let max_length = ctx
            .setting_or::<Option<usize>>("username_max_length", None)?
            .or_else(|| ctx.users.username_max_length());
        if uuid_length == 0 {
            return Err(AuthError::configuration("UUID_LENGTH must be at least 1"));
        }
        if max_length == Some(0) {
            return Err(AuthError::configuration("USERNAME_MAX_LENGTH must be at least 1"));
        }

        let username = match (email_as_username, detail_str(&details, "email")) {
            (true, Some(email)) => email.to_string(),
            _ => detail_str(&details, "username")
                .map_or_else(|| random_hex(32), str::to_string),
        };

        let finalize = |candidate: &str| {
            let cut = truncate(candidate, max_length);
            if do_clean { clean_username(cut) } else { cut.to_string() }
        };

        let short = match max_length {
            Some(max) => truncate(&username, Some(max.saturating_sub(uuid_length))).to_string(),
            None => username.clone(),
        };

        let mut candidate = finalize(&username);
        while candidate.is_empty() || ctx.users.user_exists(&candidate).await? {
            let suffixed = format!("{short}{}", random_hex(uuid_length));
            candidate = finalize(&suffixed);
        }

        Ok(StepOutput::single("username", candidate))
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn random_hex(len: usize) -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    while hex.len() < len {
        hex.push_str(&Uuid::new_v4().simple().to_string());
    }
    hex.truncate(len);
    hex
}

fn truncate(value: &str, max_chars: Option<usize>) -> &str {
    match max_chars.and_then(|max| value.char_indices().nth(max)) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

/// Creates a local user when none was resolved.
pub struct CreateUser;

#[async_trait]
impl PipelineStep for CreateUser {
    fn name(&self) -> &str {
        "create_user"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        if ctx.user.is_some() {
            return Ok(StepOutput::single("is_new", false));
        }

        let fields: Vec<String> = ctx.setting_or("user_fields", owned(USER_FIELDS))?;
        if fields.is_empty() {
            return Ok(StepOutput::Continue);
        }

        let details = ctx.details();
        let value = |name: &str| -> Option<String> {
            if !fields.iter().any(|f| f == name) {
                return None;
            }
            ctx.get_str(name)
                .or_else(|| detail_str(&details, name))
                .map(str::to_string)
        };

        let Some(username) = value("username") else {
            return Ok(StepOutput::Continue);
        };
        let mut email = value("email");
        if ctx.setting_bool("force_email_lowercase", false) {
            email = email.map(|e| e.to_lowercase());
        }

        let new_user = NewUser {
            username,
            email,
            first_name: value("first_name"),
            last_name: value("last_name"),
        };
        let user = ctx.users.create_user(new_user).await?;
        tracing::info!("Created user {} via {}", user.username, ctx.backend.name());
        ctx.user = Some(user);

        Ok(StepOutput::single("is_new", true))
    }
}

/// Links the identity to an existing user with the same email.
///
/// Not part of the default pipeline: it trusts the provider to have verified
/// the address.
pub struct AssociateByEmail;

#[async_trait]
impl PipelineStep for AssociateByEmail {
    fn name(&self) -> &str {
        "associate_by_email"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        if ctx.user.is_some() {
            return Ok(StepOutput::Continue);
        }
        let details = ctx.details();
        let Some(email) = detail_str(&details, "email") else {
            return Ok(StepOutput::Continue);
        };

        let mut users = ctx.users.get_users_by_email(email).await?;
        match users.len() {
            0 => Ok(StepOutput::Continue),
            1 => {
                ctx.user = users.pop();
                Ok(StepOutput::single("is_new", false))
            }
            _ => Err(AuthError::failed(
                "The given email address is associated with another account",
            )),
        }
    }
}

/// Links the identity to the resolved user.
pub struct AssociateUser;

#[async_trait]
impl PipelineStep for AssociateUser {
    fn name(&self) -> &str {
        "associate_user"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let Some(user_id) = ctx.user.as_ref().map(|u| u.id) else {
            return Ok(StepOutput::Continue);
        };
        if ctx.social.is_some() {
            return Ok(StepOutput::Continue);
        }

        let uid = ctx.uid()?;
        let provider = ctx.backend.name().to_string();
        match ctx.users.create_social_auth(user_id, &uid, &provider).await {
            Ok(social) => {
                tracing::debug!("Linked {} identity {} to user {}", provider, uid, user_id);
                ctx.social = Some(social);
                Ok(StepOutput::single("new_association", true))
            }
            Err(err) => {
                // Another request may have linked the identity in the meantime.
                if ctx.users.get_social_auth(&provider, &uid).await?.is_none() {
                    return Err(err);
                }
                resolve_social_user(ctx, &provider, &uid).await
            }
        }
    }
}

/// Stores tokens and other provider data on the social account.
pub struct LoadExtraData;

#[async_trait]
impl PipelineStep for LoadExtraData {
    fn name(&self) -> &str {
        "load_extra_data"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        let uid = ctx.uid()?;
        if ctx.social.is_none() {
            ctx.social = ctx.users.get_social_auth(ctx.backend.name(), &uid).await?;
        }

        let extra = ctx
            .backend
            .extra_data(&ctx.response(), &uid, &ctx.details());
        if let Some(social) = ctx.social.as_mut() {
            social.extra_data.extend(extra);
            ctx.users
                .set_extra_data(social.id, social.extra_data.clone())
                .await?;
        }
        Ok(StepOutput::Continue)
    }
}

/// Copies changed details onto the user.
pub struct UserDetails;

#[async_trait]
impl PipelineStep for UserDetails {
    fn name(&self) -> &str {
        "user_details"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> AuthResult<StepOutput> {
        if ctx.user.is_none() {
            return Ok(StepOutput::Continue);
        }

        let mut protected: Vec<String> = if ctx.setting_bool("no_default_protected_user_fields", false) {
            Vec::new()
        } else {
            owned(DEFAULT_PROTECTED_USER_FIELDS)
        };
        protected.extend(ctx.setting_or::<Vec<String>>("protected_user_fields", Vec::new())?);
        let mapping: Map<String, Value> = ctx.setting_or("user_field_mapping", Map::new())?;
        let immutable: Vec<String> = ctx.setting_or("immutable_user_fields", Vec::new())?;
        let details = ctx.details();

        let Some(user) = ctx.user.as_mut() else {
            return Ok(StepOutput::Continue);
        };

        let mut changed = false;
        for (name, value) in &details {
            let Some(value) = value.as_str() else {
                continue;
            };
            let name = mapping.get(name).and_then(Value::as_str).unwrap_or(name);
            if protected.iter().any(|p| p == name) {
                continue;
            }
            let Some(current) = user.field(name) else {
                continue;
            };
            if current == Some(value) {
                continue;
            }
            if immutable.iter().any(|f| f == name) && current.is_some_and(|c| !c.is_empty()) {
                continue;
            }
            user.set_field(name, value);
            changed = true;
        }

        if changed {
            ctx.users.update_user(user).await?;
            tracing::debug!("Updated details of user {}", user.username);
        }
        Ok(StepOutput::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", Some(3)), "abc");
        assert_eq!(truncate("abc", Some(10)), "abc");
        assert_eq!(truncate("abc", None), "abc");
        assert_eq!(truncate("äöüß", Some(2)), "äö");
        assert_eq!(truncate("abc", Some(0)), "");
    }

    #[test]
    fn test_random_hex() {
        assert_eq!(random_hex(16).len(), 16);
        assert_eq!(random_hex(40).len(), 40);
        assert!(random_hex(40).chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let steps = builtin();
        let mut names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), steps.len());
    }

    #[test]
    fn test_detail_str() {
        let mut details = Map::new();
        details.insert("email".into(), Value::String(String::new()));
        details.insert("username".into(), Value::String("jdoe".into()));
        details.insert("first_name".into(), Value::Null);
        assert_eq!(detail_str(&details, "email"), None);
        assert_eq!(detail_str(&details, "username"), Some("jdoe"));
        assert_eq!(detail_str(&details, "first_name"), None);
    }
}
