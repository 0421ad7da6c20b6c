//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cache::Cacheable;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-fold a name for comparison.
///
/// Stored next to the original in `*_folded` columns, which carry the unique
/// indexes. SQLite's `LOWER()` folds ASCII only and is not used for names.
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

/// Cache key for a `(username, domain)` pair, case-folded
pub fn account_name_key(username: &str, domain: Option<&str>) -> String {
    format!(
        "name:{}@{}",
        fold_name(username),
        fold_name(domain.unwrap_or_default())
    )
}

// =============================================================================
// Account
// =============================================================================

/// A local or remote actor
///
/// `domain` is `None` for accounts hosted on this instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub domain: Option<String>,
    pub display_name: Option<String>,
    /// ActivityPub actor URI (globally unique)
    pub uri: String,
    /// Web profile URL
    pub url: Option<String>,
    pub inbox_uri: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }

    /// `user` for local accounts, `user@domain` for remote ones
    pub fn address(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.username, domain),
            None => self.username.clone(),
        }
    }
}

impl Cacheable for Account {
    fn cache_keys(&self) -> Vec<String> {
        let mut keys = vec![
            format!("id:{}", self.id),
            format!("uri:{}", self.uri),
            account_name_key(&self.username, self.domain.as_deref()),
        ];
        if let Some(url) = &self.url {
            keys.push(format!("url:{url}"));
        }
        keys
    }
}

// =============================================================================
// Status
// =============================================================================

/// A post
///
/// `tag_ids`, `emoji_ids` and `mention_ids` are not columns: they are
/// loaded from `status_to_tags`, `status_to_emojis` and `mentions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub url: Option<String>,
    /// HTML content
    pub content: String,
    /// true if authored on this instance
    pub local: bool,
    pub account_id: String,
    pub account_uri: String,
    pub in_reply_to_id: Option<String>,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    pub sensitive: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[sqlx(skip)]
    #[serde(default)]
    pub emoji_ids: Vec<String>,
    #[sqlx(skip)]
    #[serde(default)]
    pub mention_ids: Vec<String>,
}

impl Cacheable for Status {
    fn cache_keys(&self) -> Vec<String> {
        let mut keys = vec![format!("id:{}", self.id), format!("uri:{}", self.uri)];
        if let Some(url) = &self.url {
            keys.push(format!("url:{url}"));
        }
        keys
    }
}

/// Status visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }
}

// =============================================================================
// Mention
// =============================================================================

/// A status addressing a target account
///
/// Immutable once stored; removed only together with its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mention {
    pub id: String,
    pub status_id: String,
    pub origin_account_id: String,
    pub origin_account_uri: String,
    pub target_account_id: String,
    pub target_account_uri: String,
    pub target_account_url: Option<String>,
    /// The mention exactly as typed, e.g. "@Alice@example.org"
    pub name_string: String,
    /// Suppress the notification for this mention
    pub silent: bool,
    pub created_at: DateTime<Utc>,
}

impl Cacheable for Mention {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("id:{}", self.id)]
    }
}

// =============================================================================
// Tag
// =============================================================================

/// A hashtag, shared across statuses
///
/// `name` is stored case-folded and is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub url: String,
    pub first_seen_from_account_id: String,
    /// Whether new statuses may use this tag
    pub usable: bool,
    /// Whether this tag may appear in trends/directories
    pub listable: bool,
    pub last_status_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Emoji
// =============================================================================

/// A custom emoji, provisioned out-of-band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Emoji {
    pub id: String,
    pub shortcode: String,
    /// None for emoji hosted on this instance
    pub domain: Option<String>,
    pub uri: String,
    pub image_url: String,
    pub visible_in_picker: bool,
    pub disabled: bool,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification for account interactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    /// Type: mention, favourite, reblog, follow, follow_request
    pub notification_type: String,
    /// Who receives this notification
    pub target_account_id: String,
    /// Who triggered this notification
    pub origin_account_id: String,
    /// Related status (if applicable)
    pub status_id: Option<String>,
    /// Whether the target has seen this
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Cacheable for Notification {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("id:{}", self.id)]
    }
}

/// Notification types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    Mention,
    Favourite,
    Reblog,
    Follow,
    FollowRequest,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Favourite => "favourite",
            Self::Reblog => "reblog",
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
        }
    }
}

// =============================================================================
// Admin data
// =============================================================================

/// Blocked domain
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DomainBlock {
    pub id: String,
    /// Case-folded domain name
    pub domain: String,
    pub created_by_account_id: String,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Server-wide web session secrets
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    /// Base64-encoded authentication key
    pub auth_key: String,
    /// Base64-encoded encryption key
    pub crypt_key: String,
    pub created_at: DateTime<Utc>,
}
