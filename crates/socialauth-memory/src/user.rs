//! In-memory user and social account store.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use socialauth::storage::{NewUser, SocialAccount, User, UserStore};
use socialauth::{AuthError, AuthResult};
use uuid::Uuid;

/// Users keyed by id, with unique usernames and unique provider identities.
#[derive(Debug)]
pub struct MemoryUserStore {
    users: DashMap<Uuid, User>,
    usernames: DashMap<String, Uuid>,
    socials: DashMap<(String, String), SocialAccount>,
    max_username_length: Option<usize>,
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            usernames: DashMap::new(),
            socials: DashMap::new(),
            max_username_length: Some(150),
        }
    }
}

impl MemoryUserStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum username length reported to the pipeline.
    #[must_use]
    pub fn with_max_username_length(mut self, max: Option<usize>) -> Self {
        self.max_username_length = max;
        self
    }

    /// Number of users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Social accounts linked to `user_id`.
    #[must_use]
    pub fn social_accounts(&self, user_id: Uuid) -> Vec<SocialAccount> {
        self.socials
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, user: NewUser) -> AuthResult<User> {
        let user = user.into_user();
        match self.usernames.entry(user.username.clone()) {
            Entry::Occupied(_) => Err(AuthError::storage(format!(
                "username {} is already taken",
                user.username
            ))),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user.clone());
                Ok(user)
            }
        }
    }

    async fn get_user(&self, id: Uuid) -> AuthResult<Option<User>> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_user(&self, user: &User) -> AuthResult<()> {
        let previous = self
            .users
            .get(&user.id)
            .map(|entry| entry.username.clone())
            .ok_or_else(|| AuthError::storage(format!("user {} not found", user.id)))?;

        if previous != user.username {
            match self.usernames.entry(user.username.clone()) {
                Entry::Occupied(_) => {
                    return Err(AuthError::storage(format!(
                        "username {} is already taken",
                        user.username
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(user.id);
                }
            }
            self.usernames.remove(&previous);
        }

        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> AuthResult<bool> {
        Ok(self.usernames.contains_key(username))
    }

    async fn get_users_by_email(&self, email: &str) -> AuthResult<Vec<User>> {
        let email = email.to_lowercase();
        Ok(self
            .users
            .iter()
            .filter(|entry| {
                entry.is_active
                    && entry
                        .email
                        .as_deref()
                        .is_some_and(|e| e.to_lowercase() == email)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_social_auth(&self, provider: &str, uid: &str) -> AuthResult<Option<SocialAccount>> {
        Ok(self
            .socials
            .get(&(provider.to_string(), uid.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn create_social_auth(&self, user_id: Uuid, uid: &str, provider: &str) -> AuthResult<SocialAccount> {
        match self.socials.entry((provider.to_string(), uid.to_string())) {
            Entry::Occupied(_) => Err(AuthError::storage(format!(
                "{provider} identity {uid} is already linked"
            ))),
            Entry::Vacant(slot) => {
                let social = SocialAccount::new(user_id, provider, uid);
                slot.insert(social.clone());
                Ok(social)
            }
        }
    }

    async fn set_extra_data(&self, social_id: Uuid, extra_data: Map<String, Value>) -> AuthResult<()> {
        let mut entry = self
            .socials
            .iter_mut()
            .find(|entry| entry.id == social_id)
            .ok_or_else(|| AuthError::storage(format!("social account {social_id} not found")))?;
        entry.extra_data = extra_data;
        Ok(())
    }

    fn username_max_length(&self) -> Option<usize> {
        self.max_username_length
    }
}
