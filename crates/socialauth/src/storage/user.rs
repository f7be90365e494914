//! User and social account storage.
//!
//! Pipeline steps resolve, create and update local users through [`UserStore`].
//! A user may have any number of [`SocialAccount`]s, each identified by the
//! pair (provider, uid).

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;

static USERNAME_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w.@+-]+").expect("Invalid username regex"));

/// Strips characters that are not allowed in usernames.
#[must_use]
pub fn clean_username(value: &str) -> String {
    USERNAME_DISALLOWED.replace_all(value, "").into_owned()
}

/// A local user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: Uuid,

    /// Login name, unique across users.
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    /// Whether the account may log in.
    pub is_active: bool,

    /// When the account was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// Creates an active user with a fresh id.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: None,
            first_name: None,
            last_name: None,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Returns the value of a named field, or `None` if the user has no such field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Option<&str>> {
        match name {
            "username" => Some(Some(self.username.as_str())),
            "email" => Some(self.email.as_deref()),
            "first_name" => Some(self.first_name.as_deref()),
            "last_name" => Some(self.last_name.as_deref()),
            _ => None,
        }
    }

    /// Sets a named field. Returns `false` if the user has no such field.
    pub fn set_field(&mut self, name: &str, value: &str) -> bool {
        match name {
            "username" => self.username = value.to_string(),
            "email" => self.email = Some(value.to_string()),
            "first_name" => self.first_name = Some(value.to_string()),
            "last_name" => self.last_name = Some(value.to_string()),
            _ => return false,
        }
        true
    }
}

/// Fields used to create a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl NewUser {
    /// Builds the user record.
    #[must_use]
    pub fn into_user(self) -> User {
        let mut user = User::new(self.username);
        user.email = self.email;
        user.first_name = self.first_name;
        user.last_name = self.last_name;
        user
    }
}

/// A provider identity linked to a local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialAccount {
    /// Unique identifier.
    pub id: Uuid,

    /// Local user the identity is linked to.
    pub user_id: Uuid,

    /// Backend name.
    pub provider: String,

    /// Provider-side user id.
    pub uid: String,

    /// Tokens and other provider data kept after login.
    #[serde(default)]
    pub extra_data: Map<String, Value>,

    /// When the link was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SocialAccount {
    /// Creates a link between `user_id` and the provider identity.
    #[must_use]
    pub fn new(user_id: Uuid, provider: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: provider.into(),
            uid: uid.into(),
            extra_data: Map::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Storage trait for users and their social accounts.
///
/// # Implementations
///
/// Implementations are provided in separate crates:
/// - `socialauth-memory` - in-memory storage backend
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Creates a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the username is taken or the storage operation fails.
    async fn create_user(&self, user: NewUser) -> AuthResult<User>;

    /// Finds a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_user(&self, id: Uuid) -> AuthResult<Option<User>>;

    /// Saves changes made to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist or the storage operation fails.
    async fn update_user(&self, user: &User) -> AuthResult<()>;

    /// Returns `true` if a user with this username exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn user_exists(&self, username: &str) -> AuthResult<bool>;

    /// Returns all active users with this email, compared case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_users_by_email(&self, email: &str) -> AuthResult<Vec<User>>;

    /// Finds the social account for a provider identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_social_auth(&self, provider: &str, uid: &str) -> AuthResult<Option<SocialAccount>>;

    /// Links a provider identity to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is already linked or the storage
    /// operation fails.
    async fn create_social_auth(&self, user_id: Uuid, uid: &str, provider: &str) -> AuthResult<SocialAccount>;

    /// Replaces the extra data of a social account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist or the storage operation fails.
    async fn set_extra_data(&self, social_id: Uuid, extra_data: Map<String, Value>) -> AuthResult<()>;

    /// Maximum username length, or `None` for no limit.
    fn username_max_length(&self) -> Option<usize> {
        Some(150)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_username() {
        assert_eq!(clean_username("john.doe@example.com"), "john.doe@example.com");
        assert_eq!(clean_username("john doe!"), "johndoe");
        assert_eq!(clean_username("a+b-c_d"), "a+b-c_d");
        assert_eq!(clean_username("!!!"), "");
    }

    #[test]
    fn test_user_fields() {
        let mut user = User::new("jdoe");
        assert_eq!(user.field("username"), Some(Some("jdoe")));
        assert_eq!(user.field("email"), Some(None));
        assert_eq!(user.field("is_staff"), None);

        assert!(user.set_field("first_name", "John"));
        assert_eq!(user.first_name.as_deref(), Some("John"));
        assert!(!user.set_field("is_staff", "true"));
    }

    #[test]
    fn test_new_user_into_user() {
        let user = NewUser {
            username: "jdoe".into(),
            email: Some("jdoe@example.com".into()),
            ..Default::default()
        }
        .into_user();
        assert_eq!(user.username, "jdoe");
        assert!(user.is_active);
        assert_eq!(user.email.as_deref(), Some("jdoe@example.com"));
    }
}
