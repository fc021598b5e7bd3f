//! User identities and profiles.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::message::now_millis;

/// Maximum display name length, in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;

/// Opaque, stable user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("user_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    /// Registration time (ms since epoch).
    pub created_at: u64,
}

/// Registration request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl NewUser {
    #[must_use]
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }
}

/// Partial profile update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Directory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Display name failed validation.
    #[error("Invalid display name: {0}")]
    InvalidDisplayName(&'static str),

    /// No user with this id.
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),
}

fn validate_display_name(name: &str) -> Result<String, DirectoryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DirectoryError::InvalidDisplayName(
            "Display name cannot be empty",
        ));
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(DirectoryError::InvalidDisplayName("Display name too long"));
    }
    Ok(trimmed.to_string())
}

/// Empty strings clear optional profile fields.
fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Registry of user profiles. Users are never deleted.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<UserId, User>,
}

impl UserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new user with a generated id.
    ///
    /// # Errors
    ///
    /// Returns an error if the display name is empty or too long.
    pub fn register(&self, new_user: NewUser) -> Result<User, DirectoryError> {
        let user = User {
            id: UserId::generate(),
            display_name: validate_display_name(&new_user.display_name)?,
            avatar: normalize_optional(new_user.avatar),
            bio: normalize_optional(new_user.bio),
            created_at: now_millis(),
        };

        self.users.insert(user.id.clone(), user.clone());
        info!(user = %user.id, name = %user.display_name, "User registered");

        Ok(user)
    }

    /// Apply a profile update.
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist or the new display name is invalid.
    pub fn update_profile(&self, id: &UserId, update: ProfileUpdate) -> Result<User, DirectoryError> {
        let display_name = update
            .display_name
            .as_deref()
            .map(validate_display_name)
            .transpose()?;

        let mut entry = self
            .users
            .get_mut(id)
            .ok_or_else(|| DirectoryError::UnknownUser(id.clone()))?;

        if let Some(name) = display_name {
            entry.display_name = name;
        }
        if update.avatar.is_some() {
            entry.avatar = normalize_optional(update.avatar);
        }
        if update.bio.is_some() {
            entry.bio = normalize_optional(update.bio);
        }

        debug!(user = %id, "Profile updated");
        Ok(entry.clone())
    }

    #[must_use]
    pub fn get(&self, id: &UserId) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    #[must_use]
    pub fn contains(&self, id: &UserId) -> bool {
        self.users.contains_key(id)
    }

    /// Look up a user or fail with [`DirectoryError::UnknownUser`].
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist.
    pub fn require(&self, id: &UserId) -> Result<User, DirectoryError> {
        self.get(id)
            .ok_or_else(|| DirectoryError::UnknownUser(id.clone()))
    }

    /// All users, sorted by display name.
    #[must_use]
    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        users
    }

    /// Case-insensitive substring search over display names.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<User> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list();
        }
        self.list()
            .into_iter()
            .filter(|u| u.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
