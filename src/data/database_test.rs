//! Database tests

use super::*;
use crate::config::{AppConfig, CacheConfig, DatabaseConfig, LoggingConfig, ServerConfig};
use crate::error::DbError;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(temp_dir: &TempDir) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            domain: "example.org".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig::sqlite(
            temp_dir.path().join("test.db").to_string_lossy().to_string(),
        ),
        cache: CacheConfig::default(),
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(&Context::background(), &test_config(&temp_dir))
        .await
        .unwrap();
    (db, temp_dir)
}

fn account(username: &str, domain: Option<&str>) -> Account {
    let host = domain.unwrap_or("example.org");
    Account {
        id: EntityId::new().0,
        username: username.to_string(),
        domain: domain.map(str::to_string),
        display_name: Some(username.to_string()),
        uri: format!("https://{host}/users/{username}"),
        url: Some(format!("https://{host}/@{username}")),
        inbox_uri: Some(format!("https://{host}/users/{username}/inbox")),
        public_key_pem: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn status(author: &Account) -> Status {
    let id = EntityId::new().0;
    Status {
        uri: format!("{}/statuses/{}", author.uri, id),
        url: Some(format!("https://example.org/@{}/{}", author.username, id)),
        id,
        content: "<p>Hello, world!</p>".to_string(),
        local: author.is_local(),
        account_id: author.id.clone(),
        account_uri: author.uri.clone(),
        in_reply_to_id: None,
        visibility: Visibility::Public.as_str().to_string(),
        sensitive: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        tag_ids: Vec::new(),
        emoji_ids: Vec::new(),
        mention_ids: Vec::new(),
    }
}

fn mention(status: &Status, origin: &Account, target: &Account) -> Mention {
    Mention {
        id: EntityId::new().0,
        status_id: status.id.clone(),
        origin_account_id: origin.id.clone(),
        origin_account_uri: origin.uri.clone(),
        target_account_id: target.id.clone(),
        target_account_uri: target.uri.clone(),
        target_account_url: target.url.clone(),
        name_string: format!("@{}", target.address()),
        silent: false,
        created_at: Utc::now(),
    }
}

fn tag(name: &str, creator: &Account) -> Tag {
    Tag {
        id: EntityId::new().0,
        name: name.to_string(),
        url: format!("https://example.org/tags/{name}"),
        first_seen_from_account_id: creator.id.clone(),
        usable: true,
        listable: true,
        last_status_at: Utc::now() - ChronoDuration::days(1),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn emoji(shortcode: &str, domain: Option<&str>) -> Emoji {
    let host = domain.unwrap_or("example.org");
    Emoji {
        id: EntityId::new().0,
        shortcode: shortcode.to_string(),
        domain: domain.map(str::to_string),
        uri: format!("https://{host}/emoji/{shortcode}"),
        image_url: format!("https://{host}/emoji/{shortcode}.png"),
        visible_in_picker: true,
        disabled: false,
        category: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn notification(target: &Account, origin: &Account, status: Option<&Status>) -> Notification {
    Notification {
        id: EntityId::new().0,
        notification_type: NotificationType::Mention.as_str().to_string(),
        target_account_id: target.id.clone(),
        origin_account_id: origin.id.clone(),
        status_id: status.map(|s| s.id.clone()),
        read: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (db, _temp_dir) = create_test_db().await;
    assert_eq!(db.conn().dialect(), Dialect::Sqlite);
    db.conn().ping(&Context::background()).await.unwrap();
}

#[tokio::test]
async fn test_reopen_is_up_to_date() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let ctx = Context::background();

    let first = Database::open(&ctx, &config).await.unwrap();
    first.close().await;

    let conn = DbConn::open(&ctx, &config.database).await.unwrap();
    let outcome = run_migrations(&ctx, &conn).await.unwrap();
    assert_eq!(outcome, MigrationOutcome::UpToDate);
}

// =============================================================================
// Accounts
// =============================================================================

#[tokio::test]
async fn test_account_put_and_get_by_every_key() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);

    db.accounts().put(&ctx, &alice).await.unwrap();

    let by_id = db.accounts().get_by_id(&ctx, &alice.id).await.unwrap();
    assert_eq!(by_id.as_ref().map(|a| a.username.as_str()), Some("alice"));

    let by_uri = db.accounts().get_by_uri(&ctx, &alice.uri).await.unwrap();
    assert_eq!(by_uri.map(|a| a.id), Some(alice.id.clone()));

    let by_url = db
        .accounts()
        .get_by_url(&ctx, alice.url.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(by_url.map(|a| a.id), Some(alice.id.clone()));

    let by_name = db
        .accounts()
        .get_by_username_domain(&ctx, "ALICE", None)
        .await
        .unwrap();
    assert_eq!(by_name.map(|a| a.id), Some(alice.id.clone()));

    assert!(db.accounts().get_by_id(&ctx, "missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_name_lookup_ignores_remote_accounts() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let remote = account("bob", Some("remote.example"));
    db.accounts().put(&ctx, &remote).await.unwrap();

    assert!(
        db.accounts()
            .get_by_username_domain(&ctx, "bob", None)
            .await
            .unwrap()
            .is_none()
    );
    let found = db
        .accounts()
        .get_by_username_domain(&ctx, "Bob", Some("REMOTE.example"))
        .await
        .unwrap();
    assert_eq!(found.map(|a| a.id), Some(remote.id));
}

#[tokio::test]
async fn test_duplicate_local_username_is_rejected() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    db.accounts().put(&ctx, &account("alice", None)).await.unwrap();

    let mut twin = account("Alice", None);
    twin.uri = "https://example.org/users/alice-2".to_string();
    twin.url = None;
    let err = db.accounts().put(&ctx, &twin).await.unwrap_err();
    assert!(matches!(err, DbError::AlreadyExists(_)), "got {err:?}");

    // Same name on another domain is a different account
    db.accounts()
        .put(&ctx, &account("alice", Some("remote.example")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_username_uniqueness_folds_unicode() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let first = account("ärger", None);
    db.accounts().put(&ctx, &first).await.unwrap();

    let mut twin = account("Ärger", None);
    twin.uri = "https://example.org/users/aerger-2".to_string();
    twin.url = None;
    let err = db.accounts().put(&ctx, &twin).await.unwrap_err();
    assert!(matches!(err, DbError::AlreadyExists(_)), "got {err:?}");

    let found = db
        .accounts()
        .get_by_username_domain(&ctx, "ÄRGER", None)
        .await
        .unwrap();
    assert_eq!(found.map(|a| a.id), Some(first.id.clone()));

    // Remote domains fold the same way
    let remote = account("Émile", Some("Bücher.example"));
    db.accounts().put(&ctx, &remote).await.unwrap();
    let found = db
        .accounts()
        .get_by_username_domain(&ctx, "émile", Some("BÜCHER.example"))
        .await
        .unwrap();
    assert_eq!(found.map(|a| a.id), Some(remote.id));
}

#[tokio::test]
async fn test_username_change_moves_folded_name() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let mut alice = account("Ölga", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    alice.username = "olga".to_string();
    db.accounts().update(&ctx, &alice).await.unwrap();

    assert!(
        db.accounts()
            .get_by_username_domain(&ctx, "ölga", None)
            .await
            .unwrap()
            .is_none()
    );
    let found = db.accounts().get_by_username_domain(&ctx, "OLGA", None).await.unwrap();
    assert_eq!(found.map(|a| a.id), Some(alice.id.clone()));

    // The old name is free again
    db.accounts().put(&ctx, &account("ÖLGA", None)).await.unwrap();
}

#[tokio::test]
async fn test_account_update_is_visible_through_cache() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let mut alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    // Prime the cache under every key
    let old_url = alice.url.clone().unwrap();
    db.accounts().get_by_url(&ctx, &old_url).await.unwrap();

    alice.display_name = Some("Alice Liddell".to_string());
    alice.url = Some("https://example.org/profile/alice".to_string());
    alice.updated_at = Utc::now();
    db.accounts().update(&ctx, &alice).await.unwrap();

    let fetched = db.accounts().get_by_id(&ctx, &alice.id).await.unwrap().unwrap();
    assert_eq!(fetched.display_name.as_deref(), Some("Alice Liddell"));
    assert!(db.accounts().get_by_url(&ctx, &old_url).await.unwrap().is_none());
    assert!(
        db.accounts()
            .get_by_url(&ctx, "https://example.org/profile/alice")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_account_upsert_inserts_then_overwrites() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let mut remote = account("carol", Some("remote.example"));

    db.accounts().upsert(&ctx, &remote).await.unwrap();
    remote.display_name = Some("Carol".to_string());
    db.accounts().upsert(&ctx, &remote).await.unwrap();

    let fetched = db.accounts().get_by_uri(&ctx, &remote.uri).await.unwrap().unwrap();
    assert_eq!(fetched.display_name.as_deref(), Some("Carol"));
}

#[tokio::test]
async fn test_account_update_and_delete_missing() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let ghost = account("ghost", None);

    assert!(matches!(
        db.accounts().update(&ctx, &ghost).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        db.accounts().delete(&ctx, &ghost.id).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_account_delete_and_count_local() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &account("dave", None)).await.unwrap();
    db.accounts()
        .put(&ctx, &account("erin", Some("remote.example")))
        .await
        .unwrap();

    assert_eq!(db.accounts().count_local(&ctx).await.unwrap(), 2);

    db.accounts().get_by_id(&ctx, &alice.id).await.unwrap();
    db.accounts().delete(&ctx, &alice.id).await.unwrap();

    assert!(db.accounts().get_by_id(&ctx, &alice.id).await.unwrap().is_none());
    assert!(db.accounts().get_by_uri(&ctx, &alice.uri).await.unwrap().is_none());
    assert_eq!(db.accounts().count_local(&ctx).await.unwrap(), 1);
}

// =============================================================================
// Statuses and mentions
// =============================================================================

#[tokio::test]
async fn test_status_put_with_references() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    let bob = account("bob", Some("remote.example"));
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &bob).await.unwrap();

    let rust = db.tags().put_or_get(&ctx, &tag("rust", &alice)).await.unwrap();
    let blobcat = emoji("blobcat", None);
    db.emojis().put(&ctx, &blobcat).await.unwrap();

    let mut post = status(&alice);
    post.tag_ids = vec![rust.id.clone(), rust.id.clone()];
    post.emoji_ids = vec![blobcat.id.clone()];
    let mention = mention(&post, &alice, &bob);

    db.statuses()
        .put(&ctx, &post, std::slice::from_ref(&mention))
        .await
        .unwrap();

    let fetched = db.statuses().get_by_uri(&ctx, &post.uri).await.unwrap().unwrap();
    assert_eq!(fetched.tag_ids, vec![rust.id.clone()]);
    assert_eq!(fetched.emoji_ids, vec![blobcat.id.clone()]);
    assert_eq!(fetched.mention_ids, vec![mention.id.clone()]);

    let tags = db.tags().get_for_status(&ctx, &post.id).await.unwrap();
    assert_eq!(tags.len(), 1);
    let emojis = db.emojis().get_for_status(&ctx, &post.id).await.unwrap();
    assert_eq!(emojis[0].shortcode, "blobcat");

    let mentions = db.mentions().get_for_status(&ctx, &post.id).await.unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].target_account_id, bob.id);
    assert_eq!(
        db.mentions()
            .get_by_ids(&ctx, &[mention.id.clone(), "missing".to_string()])
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_status_put_rejects_foreign_mention() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    let post = status(&alice);
    let other = status(&alice);
    let stray = mention(&other, &alice, &alice);

    let err = db.statuses().put(&ctx, &post, &[stray]).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
    assert!(db.statuses().get_by_id(&ctx, &post.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_put_is_atomic() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    let mut post = status(&alice);
    post.tag_ids = vec!["no-such-tag".to_string()];

    assert!(db.statuses().put(&ctx, &post, &[]).await.is_err());
    assert!(db.statuses().get_by_id(&ctx, &post.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_update_replaces_tags() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    let first = db.tags().put_or_get(&ctx, &tag("first", &alice)).await.unwrap();
    let second = db.tags().put_or_get(&ctx, &tag("second", &alice)).await.unwrap();

    let mut post = status(&alice);
    post.tag_ids = vec![first.id.clone()];
    db.statuses().put(&ctx, &post, &[]).await.unwrap();
    db.statuses().get_by_id(&ctx, &post.id).await.unwrap();

    post.tag_ids = vec![second.id.clone()];
    post.content = "<p>edited</p>".to_string();
    db.statuses().update(&ctx, &post).await.unwrap();

    let fetched = db.statuses().get_by_id(&ctx, &post.id).await.unwrap().unwrap();
    assert_eq!(fetched.content, "<p>edited</p>");
    assert_eq!(fetched.tag_ids, vec![second.id.clone()]);

    let tags = db.tags().get_for_status(&ctx, &post.id).await.unwrap();
    assert_eq!(tags.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["second"]);

    let missing = status(&alice);
    assert!(matches!(
        db.statuses().update(&ctx, &missing).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_status_delete_cascades() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    let bob = account("bob", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &bob).await.unwrap();
    let news = db.tags().put_or_get(&ctx, &tag("news", &alice)).await.unwrap();

    let mut post = status(&alice);
    post.tag_ids = vec![news.id.clone()];
    let mention = mention(&post, &alice, &bob);
    db.statuses()
        .put(&ctx, &post, std::slice::from_ref(&mention))
        .await
        .unwrap();

    let notice = notification(&bob, &alice, Some(&post));
    db.notifications().put(&ctx, &notice).await.unwrap();

    // Prime caches
    assert!(db.mentions().get_by_id(&ctx, &mention.id).await.unwrap().is_some());
    assert!(db.notifications().get_by_id(&ctx, &notice.id).await.unwrap().is_some());

    db.statuses().delete(&ctx, &post.id).await.unwrap();

    assert!(db.statuses().get_by_id(&ctx, &post.id).await.unwrap().is_none());
    assert!(db.mentions().get_by_id(&ctx, &mention.id).await.unwrap().is_none());
    assert!(db.mentions().get_for_status(&ctx, &post.id).await.unwrap().is_empty());
    assert!(db.tags().get_for_status(&ctx, &post.id).await.unwrap().is_empty());
    assert!(db.notifications().get_by_id(&ctx, &notice.id).await.unwrap().is_none());

    // The tag itself outlives the status
    assert!(db.tags().get_by_id(&ctx, &news.id).await.unwrap().is_some());

    assert!(matches!(
        db.statuses().delete(&ctx, &post.id).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_account_delete_invalidates_cascaded_rows() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    let bob = account("bob", None);
    let carol = account("carol", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &bob).await.unwrap();
    db.accounts().put(&ctx, &carol).await.unwrap();

    // One of alice's statuses, mentioning bob
    let post = status(&alice);
    let mention = mention(&post, &alice, &bob);
    db.statuses()
        .put(&ctx, &post, std::slice::from_ref(&mention))
        .await
        .unwrap();

    // A notification about alice's status, and one addressed to alice
    let about_post = notification(&bob, &alice, Some(&post));
    let to_alice = notification(&alice, &carol, None);
    db.notifications().put(&ctx, &about_post).await.unwrap();
    db.notifications().put(&ctx, &to_alice).await.unwrap();

    // Carol's status survives
    let other = status(&carol);
    db.statuses().put(&ctx, &other, &[]).await.unwrap();

    // Prime every cache under every key
    assert!(db.statuses().get_by_id(&ctx, &post.id).await.unwrap().is_some());
    assert!(db.statuses().get_by_uri(&ctx, &post.uri).await.unwrap().is_some());
    assert!(db.mentions().get_by_id(&ctx, &mention.id).await.unwrap().is_some());
    assert!(db.notifications().get_by_id(&ctx, &about_post.id).await.unwrap().is_some());
    assert!(db.notifications().get_by_id(&ctx, &to_alice.id).await.unwrap().is_some());

    db.accounts().delete(&ctx, &alice.id).await.unwrap();

    assert!(db.accounts().get_by_id(&ctx, &alice.id).await.unwrap().is_none());
    assert!(db.statuses().get_by_id(&ctx, &post.id).await.unwrap().is_none());
    assert!(db.statuses().get_by_uri(&ctx, &post.uri).await.unwrap().is_none());
    assert!(
        db.statuses()
            .get_by_url(&ctx, post.url.as_deref().unwrap())
            .await
            .unwrap()
            .is_none()
    );
    assert!(db.mentions().get_by_id(&ctx, &mention.id).await.unwrap().is_none());
    assert!(db.notifications().get_by_id(&ctx, &about_post.id).await.unwrap().is_none());
    assert!(db.notifications().get_by_id(&ctx, &to_alice.id).await.unwrap().is_none());

    assert!(db.statuses().get_by_id(&ctx, &other.id).await.unwrap().is_some());
    assert!(db.accounts().get_by_id(&ctx, &bob.id).await.unwrap().is_some());

    assert!(matches!(
        db.accounts().delete(&ctx, &alice.id).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_account_statuses_page_backwards() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let post = status(&alice);
        db.statuses().put(&ctx, &post, &[]).await.unwrap();
        ids.push(post.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    ids.sort();

    let page = db
        .statuses()
        .get_account_statuses(&ctx, &alice.id, 2, None)
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        vec![ids[4].clone(), ids[3].clone()]
    );

    let next = db
        .statuses()
        .get_account_statuses(&ctx, &alice.id, 10, Some(&ids[3]))
        .await
        .unwrap();
    assert_eq!(next.len(), 3);
    assert!(next.iter().all(|s| s.id < ids[3]));
}

// =============================================================================
// Tags and emoji
// =============================================================================

#[tokio::test]
async fn test_tag_put_or_get_returns_existing_row() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    let first = db.tags().put_or_get(&ctx, &tag("rust", &alice)).await.unwrap();
    let second = db.tags().put_or_get(&ctx, &tag("rust", &alice)).await.unwrap();
    assert_eq!(first.id, second.id);

    let by_name = db.tags().get_by_name(&ctx, "RUST").await.unwrap().unwrap();
    assert_eq!(by_name.id, first.id);

    let err = db.tags().put(&ctx, &tag("Rust", &alice)).await.unwrap_err();
    assert!(matches!(err, DbError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_tag_names_fold_unicode() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();

    let first = db.tags().put_or_get(&ctx, &tag("ärger", &alice)).await.unwrap();
    let second = db.tags().put_or_get(&ctx, &tag("Ärger", &alice)).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "ärger");

    let err = db.tags().put(&ctx, &tag("ÄRGER", &alice)).await.unwrap_err();
    assert!(matches!(err, DbError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_tag_put_or_get_concurrent() {
    let (db, _temp_dir) = create_test_db().await;
    let db = Arc::new(db);
    let alice = account("alice", None);
    db.accounts().put(&Context::background(), &alice).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = Arc::clone(&db);
        let candidate = tag("race", &alice);
        handles.push(tokio::spawn(async move {
            db.tags()
                .put_or_get(&Context::background(), &candidate)
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_tag_touch_and_set_usable() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    let stored = db.tags().put_or_get(&ctx, &tag("news", &alice)).await.unwrap();

    let now = Utc::now();
    db.tags().touch(&ctx, &stored.id, now).await.unwrap();
    let touched = db.tags().get_by_id(&ctx, &stored.id).await.unwrap().unwrap();
    assert!(touched.last_status_at > stored.last_status_at);

    db.tags().set_usable(&ctx, &stored.id, false).await.unwrap();
    assert!(!db.tags().get_by_id(&ctx, &stored.id).await.unwrap().unwrap().usable);

    assert!(matches!(
        db.tags().touch(&ctx, "missing", now).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_usable_emoji_prefers_local() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();

    let remote = emoji("blobcat", Some("remote.example"));
    let local = emoji("blobcat", None);
    db.emojis().put(&ctx, &remote).await.unwrap();
    db.emojis().put(&ctx, &local).await.unwrap();

    let found = db
        .emojis()
        .get_usable_by_shortcode(&ctx, "blobcat")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, local.id);

    db.emojis().set_disabled(&ctx, &local.id, true).await.unwrap();
    let found = db
        .emojis()
        .get_usable_by_shortcode(&ctx, "blobcat")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, remote.id);

    let mut hidden = emoji("secret", None);
    hidden.visible_in_picker = false;
    db.emojis().put(&ctx, &hidden).await.unwrap();
    assert!(
        db.emojis()
            .get_usable_by_shortcode(&ctx, "secret")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        db.emojis()
            .get_by_shortcode_domain(&ctx, "secret", None)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_duplicate_emoji_shortcode_per_domain() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    db.emojis().put(&ctx, &emoji("wave", None)).await.unwrap();

    let mut twin = emoji("wave", None);
    twin.uri = "https://example.org/emoji/wave-2".to_string();
    assert!(matches!(
        db.emojis().put(&ctx, &twin).await,
        Err(DbError::AlreadyExists(_))
    ));
}

// =============================================================================
// Notifications, domains, sessions
// =============================================================================

#[tokio::test]
async fn test_notifications_unread_and_mark_read() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    let bob = account("bob", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &bob).await.unwrap();

    let first = notification(&alice, &bob, None);
    db.notifications().put(&ctx, &first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = notification(&alice, &bob, None);
    db.notifications().put(&ctx, &second).await.unwrap();

    db.notifications().mark_read(&ctx, &first.id).await.unwrap();
    let cached = db.notifications().get_by_id(&ctx, &first.id).await.unwrap().unwrap();
    assert!(cached.read);

    let unread = db
        .notifications()
        .get_for_account(&ctx, &alice.id, 10, None, true)
        .await
        .unwrap();
    assert_eq!(unread.iter().map(|n| n.id.clone()).collect::<Vec<_>>(), vec![second.id.clone()]);

    let all = db
        .notifications()
        .get_for_account(&ctx, &alice.id, 10, None, false)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id);

    db.notifications().delete(&ctx, &second.id).await.unwrap();
    assert!(matches!(
        db.notifications().delete(&ctx, &second.id).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_notifications_delete_for_status() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let alice = account("alice", None);
    let bob = account("bob", None);
    db.accounts().put(&ctx, &alice).await.unwrap();
    db.accounts().put(&ctx, &bob).await.unwrap();
    let post = status(&alice);
    db.statuses().put(&ctx, &post, &[]).await.unwrap();

    db.notifications()
        .put(&ctx, &notification(&alice, &bob, Some(&post)))
        .await
        .unwrap();
    db.notifications()
        .put(&ctx, &notification(&alice, &bob, None))
        .await
        .unwrap();

    let removed = db.notifications().delete_for_status(&ctx, &post.id).await.unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_domain_block_covers_subdomains() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();
    let admin = account("admin", None);
    db.accounts().put(&ctx, &admin).await.unwrap();

    let block = DomainBlock {
        id: EntityId::new().0,
        domain: "Spam.Example".to_string(),
        created_by_account_id: admin.id.clone(),
        private_comment: None,
        public_comment: Some("spam".to_string()),
        created_at: Utc::now(),
    };
    db.domains().create_block(&ctx, &block).await.unwrap();

    assert!(db.domains().is_domain_blocked(&ctx, "spam.example").await.unwrap());
    assert!(db.domains().is_domain_blocked(&ctx, "a.SPAM.example").await.unwrap());
    assert!(!db.domains().is_domain_blocked(&ctx, "example").await.unwrap());
    assert!(!db.domains().is_domain_blocked(&ctx, "").await.unwrap());

    let stored = db.domains().get_block(&ctx, "spam.example").await.unwrap().unwrap();
    assert_eq!(stored.domain, "spam.example");
    assert_eq!(db.domains().list_blocks(&ctx).await.unwrap().len(), 1);

    assert!(matches!(
        db.domains().create_block(&ctx, &block).await,
        Err(DbError::AlreadyExists(_))
    ));

    db.domains().delete_block(&ctx, "spam.example").await.unwrap();
    assert!(!db.domains().is_domain_blocked(&ctx, "a.spam.example").await.unwrap());
    assert!(matches!(
        db.domains().delete_block(&ctx, "spam.example").await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_session_is_created_once() {
    let (db, _temp_dir) = create_test_db().await;
    let ctx = Context::background();

    let first = db.sessions().get_or_create(&ctx).await.unwrap();
    let second = db.sessions().get_or_create(&ctx).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.auth_key, second.auth_key);
    assert_ne!(first.auth_key, first.crypt_key);
    assert_eq!(first.auth_key.len(), 43);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_context_releases_pool() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = account("alice", None);
    db.accounts().put(&Context::background(), &alice).await.unwrap();

    let (ctx, handle) = Context::cancellable();
    handle.cancel();

    // A fresh repository set has cold caches, so every call needs the pool
    let cold = Database::from_conn(Arc::clone(db.conn()), &CacheConfig::default());
    let err = cold.accounts().get_by_uri(&ctx, &alice.uri).await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled), "got {err:?}");
    assert_eq!(db.pool_stats().in_use(), 0);
}

const LONG_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 200000000) \
                          SELECT COUNT(*) FROM c";

async fn run_long_query(conn: &Arc<DbConn>, ctx: &Context) -> crate::error::Result<i64> {
    conn.run(ctx, "select", "-", async {
        Ok(connection::with_pool!(conn, pool => {
            sqlx::query_scalar::<_, i64>(LONG_QUERY).fetch_one(pool).await?
        }))
    })
    .await
}

/// Wait until every pooled connection is back, or give up after `limit`.
async fn pool_drains_within(db: &Database, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while db.pool_stats().in_use() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_deadline_interrupts_long_query() {
    let (db, _temp_dir) = create_test_db().await;
    let conn = Arc::clone(db.conn());
    let ctx = Context::background().with_timeout(Duration::from_millis(20));

    let started = std::time::Instant::now();
    let result = run_long_query(&conn, &ctx).await;

    assert!(matches!(result, Err(DbError::DeadlineExceeded)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // The statement is aborted on the worker, so its connection comes back
    assert!(
        pool_drains_within(&db, Duration::from_millis(500)).await,
        "connection still in use: {:?}",
        db.pool_stats()
    );
    conn.ping(&Context::background()).await.unwrap();
}

#[tokio::test]
async fn test_cancel_mid_query_frees_connection() {
    let (db, _temp_dir) = create_test_db().await;
    let conn = Arc::clone(db.conn());
    let (ctx, handle) = Context::cancellable();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let started = std::time::Instant::now();
    let result = run_long_query(&conn, &ctx).await;
    canceller.await.unwrap();

    assert!(matches!(result, Err(DbError::Cancelled)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(
        pool_drains_within(&db, Duration::from_millis(500)).await,
        "connection still in use: {:?}",
        db.pool_stats()
    );

    // The released connection serves the next caller normally
    let alice = account("alice", None);
    db.accounts().put(&Context::background(), &alice).await.unwrap();
    let fetched = db.accounts().get_by_id(&Context::background(), &alice.id).await.unwrap();
    assert_eq!(fetched.map(|a| a.id), Some(alice.id));
}
