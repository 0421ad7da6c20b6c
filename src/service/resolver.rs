//! Reference resolver
//!
//! Turns the raw tokens extracted from status content into entities:
//! mentions and emoji are looked up only, tags are created on first use.
//! Each procedure produces one [`Resolution`] per input token; the public
//! entry points keep the resolved ones in input order.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::ServerConfig;
use crate::data::{Context, Database, Emoji, EntityId, Mention, Tag, fold_name};
use crate::error::{DbError, Result};
use crate::metrics::REFERENCES_RESOLVED_TOTAL;

/// Outcome for a single token
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Resolved(T),
    Skipped(SkipReason),
}

impl<T> Resolution<T> {
    pub fn into_resolved(self) -> Option<T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            Resolution::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Resolution::Resolved(_) => None,
            Resolution::Skipped(reason) => Some(reason),
        }
    }
}

/// Why a well-formed token produced no entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No account with that username (and domain)
    AccountNotFound {
        username: String,
        domain: Option<String>,
    },
    /// The account is already mentioned earlier in the batch
    DuplicateMention(String),
    /// Empty, or holds characters other than letters, digits and `_`
    InvalidTagName(String),
    DuplicateTag(String),
    /// The tag exists but has been locked against use
    TagNotUsable(String),
    /// No usable emoji with that shortcode
    EmojiNotFound(String),
    DuplicateEmoji(String),
}

impl SkipReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AccountNotFound { .. } => "account_not_found",
            SkipReason::DuplicateMention(_) => "duplicate_mention",
            SkipReason::InvalidTagName(_) => "invalid_tag_name",
            SkipReason::DuplicateTag(_) => "duplicate_tag",
            SkipReason::TagNotUsable(_) => "tag_not_usable",
            SkipReason::EmojiNotFound(_) => "emoji_not_found",
            SkipReason::DuplicateEmoji(_) => "duplicate_emoji",
        }
    }
}

/// Resolves mentions, hashtags and custom emoji against the database
pub struct ReferenceResolver {
    db: Arc<Database>,
    base_url: String,
    local_domain: String,
}

impl ReferenceResolver {
    pub fn new(db: Arc<Database>, server: &ServerConfig) -> Self {
        Self {
            db,
            base_url: server.base_url(),
            local_domain: server.domain.to_ascii_lowercase(),
        }
    }

    /// Build (unsaved) mentions for the accounts named by `tokens`.
    ///
    /// # Errors
    /// - `Validation` if any token is not `@user` or `@user@domain`; the
    ///   whole batch is rejected
    /// - `NotFound` if the origin account does not exist
    pub async fn resolve_mentions(
        &self,
        ctx: &Context,
        tokens: &[String],
        origin_account_id: &str,
        status_id: &str,
    ) -> Result<Vec<Mention>> {
        let outcomes = self
            .resolve_mentions_outcomes(ctx, tokens, origin_account_id, status_id)
            .await?;
        Ok(project(outcomes))
    }

    pub async fn resolve_mentions_outcomes(
        &self,
        ctx: &Context,
        tokens: &[String],
        origin_account_id: &str,
        status_id: &str,
    ) -> Result<Vec<Resolution<Mention>>> {
        // Parse everything first so a bad token fails before any lookup
        let parsed = tokens
            .iter()
            .map(|token| parse_mention(token).map(|parts| (token, parts)))
            .collect::<Result<Vec<_>>>()?;

        let origin = self
            .db
            .accounts()
            .get_by_id(ctx, origin_account_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("origin account {origin_account_id}")))?;

        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(parsed.len());

        for (token, (username, domain)) in parsed {
            let domain = domain.filter(|d| !d.eq_ignore_ascii_case(&self.local_domain));
            let target = self
                .db
                .accounts()
                .get_by_username_domain(ctx, username, domain)
                .await?;

            let outcome = match target {
                None => {
                    tracing::debug!(
                        %username,
                        domain = domain.unwrap_or_default(),
                        "no account found for mention, skipping it"
                    );
                    Resolution::Skipped(SkipReason::AccountNotFound {
                        username: username.to_string(),
                        domain: domain.map(str::to_string),
                    })
                }
                Some(target) if !seen.insert(target.id.clone()) => {
                    Resolution::Skipped(SkipReason::DuplicateMention(token.clone()))
                }
                Some(target) => Resolution::Resolved(Mention {
                    id: EntityId::new().0,
                    status_id: status_id.to_string(),
                    origin_account_id: origin.id.clone(),
                    origin_account_uri: origin.uri.clone(),
                    target_account_id: target.id,
                    target_account_uri: target.uri,
                    target_account_url: target.url,
                    name_string: token.clone(),
                    silent: false,
                    created_at: Utc::now(),
                }),
            };
            record("mention", &outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Resolve hashtags, creating the ones never seen before.
    ///
    /// Every returned tag has had `last_status_at` bumped to now.
    pub async fn resolve_tags(
        &self,
        ctx: &Context,
        tokens: &[String],
        origin_account_id: &str,
    ) -> Result<Vec<Tag>> {
        let outcomes = self
            .resolve_tags_outcomes(ctx, tokens, origin_account_id)
            .await?;
        Ok(project(outcomes))
    }

    pub async fn resolve_tags_outcomes(
        &self,
        ctx: &Context,
        tokens: &[String],
        origin_account_id: &str,
    ) -> Result<Vec<Resolution<Tag>>> {
        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(tokens.len());

        for token in tokens {
            let outcome = match normalize_tag_name(token) {
                None => Resolution::Skipped(SkipReason::InvalidTagName(token.clone())),
                Some(name) if !seen.insert(name.clone()) => {
                    Resolution::Skipped(SkipReason::DuplicateTag(name))
                }
                Some(name) => self.resolve_tag(ctx, name, origin_account_id).await?,
            };
            record("tag", &outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn resolve_tag(
        &self,
        ctx: &Context,
        name: String,
        origin_account_id: &str,
    ) -> Result<Resolution<Tag>> {
        let tags = self.db.tags();

        let mut tag = match tags.get_by_name(ctx, &name).await? {
            Some(tag) => tag,
            None => {
                let now = Utc::now();
                let candidate = Tag {
                    id: EntityId::new().0,
                    url: format!("{}/tags/{}", self.base_url, name),
                    name,
                    first_seen_from_account_id: origin_account_id.to_string(),
                    usable: true,
                    listable: true,
                    last_status_at: now,
                    created_at: now,
                    updated_at: now,
                };
                let stored = tags.put_or_get(ctx, &candidate).await?;
                if stored.id == candidate.id {
                    tracing::debug!(tag = %stored.name, "created new tag");
                }
                stored
            }
        };

        if !tag.usable {
            return Ok(Resolution::Skipped(SkipReason::TagNotUsable(tag.name)));
        }

        let now = Utc::now();
        tags.touch(ctx, &tag.id, now).await?;
        tag.last_status_at = now;
        Ok(Resolution::Resolved(tag))
    }

    /// Resolve `:shortcode:` tokens to usable emoji; unknown ones are dropped
    pub async fn resolve_emoji(&self, ctx: &Context, tokens: &[String]) -> Result<Vec<Emoji>> {
        let outcomes = self.resolve_emoji_outcomes(ctx, tokens).await?;
        Ok(project(outcomes))
    }

    pub async fn resolve_emoji_outcomes(
        &self,
        ctx: &Context,
        tokens: &[String],
    ) -> Result<Vec<Resolution<Emoji>>> {
        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(tokens.len());

        for token in tokens {
            let shortcode = token.trim().trim_matches(':');

            let outcome = if shortcode.is_empty() {
                Resolution::Skipped(SkipReason::EmojiNotFound(token.clone()))
            } else if !seen.insert(shortcode.to_string()) {
                Resolution::Skipped(SkipReason::DuplicateEmoji(shortcode.to_string()))
            } else {
                match self.db.emojis().get_usable_by_shortcode(ctx, shortcode).await? {
                    Some(emoji) => Resolution::Resolved(emoji),
                    None => {
                        tracing::debug!(%shortcode, "no emoji found with shortcode, skipping it");
                        Resolution::Skipped(SkipReason::EmojiNotFound(shortcode.to_string()))
                    }
                }
            };
            record("emoji", &outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}

fn project<T>(outcomes: Vec<Resolution<T>>) -> Vec<T> {
    outcomes
        .into_iter()
        .filter_map(Resolution::into_resolved)
        .collect()
}

fn record<T>(kind: &str, outcome: &Resolution<T>) {
    let label = outcome.skip_reason().map_or("resolved", SkipReason::as_str);
    REFERENCES_RESOLVED_TOTAL
        .with_label_values(&[kind, label])
        .inc();
}

/// Split `@user` / `@user@domain` into its parts
pub(crate) fn parse_mention(token: &str) -> Result<(&str, Option<&str>)> {
    let invalid = || DbError::Validation(format!("mentioned account format '{token}' was not valid"));

    let rest = token.strip_prefix('@').ok_or_else(invalid)?;
    let mut parts = rest.split('@');
    let username = parts.next().unwrap_or_default();
    let domain = parts.next();
    if parts.next().is_some() {
        return Err(invalid());
    }

    if username.is_empty() || domain.is_some_and(str::is_empty) {
        return Err(DbError::Validation(format!(
            "username or domain for '{token}' was empty"
        )));
    }

    let username_ok = username
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'));
    let domain_ok = domain.is_none_or(|d| {
        d.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
    });
    if !username_ok || !domain_ok {
        return Err(invalid());
    }

    Ok((username, domain))
}

/// Case-folded tag name, or None when it is not a valid hashtag
pub(crate) fn normalize_tag_name(token: &str) -> Option<String> {
    let name = token.trim().trim_start_matches('#');
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(fold_name(name))
}
