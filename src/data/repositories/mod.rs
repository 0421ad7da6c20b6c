//! Repositories
//!
//! One repository per entity family. Each holds the shared [`DbConn`] and,
//! for the cached families, an [`EntityCache`] that is kept coherent on every
//! write issued through the repository.
//!
//! Conventions:
//! - gets return `Ok(None)` for absent rows
//! - targeted updates and deletes of absent rows return `DbError::NotFound`
//! - unique violations surface as `DbError::AlreadyExists`

mod account;
mod domain;
mod emoji;
mod mention;
mod notification;
mod session;
mod status;
mod tag;

pub use account::AccountRepository;
pub use domain::DomainRepository;
pub use emoji::EmojiRepository;
pub use mention::MentionRepository;
pub use notification::NotificationRepository;
pub use session::SessionRepository;
pub use status::StatusRepository;
pub use tag::TagRepository;

use std::future::Future;

use super::cache::{Cacheable, EntityCache};
use crate::error::Result;

/// Serve `key` from `cache`, falling back to `load` on a miss.
///
/// A hit whose entity no longer carries `key` (the entity moved to another
/// URI, say) is discarded and treated as a miss. A loaded value is only
/// cached if no write reached `cache` while it was being loaded.
pub(crate) async fn get_cached<V, Fut>(
    cache: &EntityCache<V>,
    key: String,
    load: Fut,
) -> Result<Option<V>>
where
    V: Cacheable + Clone,
    Fut: Future<Output = Result<Option<V>>>,
{
    if let Some(hit) = cache.get(&key).await {
        if hit.cache_keys().iter().any(|k| *k == key) {
            return Ok(Some((*hit).clone()));
        }
        cache.invalidate(&key).await;
    }

    let seen = cache.generation();
    match load.await? {
        Some(value) => match cache.fill_entity(value.clone(), seen).await {
            Some(stored) => Ok(Some((*stored).clone())),
            None => Ok(Some(value)),
        },
        None => Ok(None),
    }
}

/// `?, ?, ?` for `n` binds
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Sorted, de-duplicated copy of a list of ids
pub(crate) fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}
