//! Schema definition
//!
//! The ordered list of migrations that builds the persisted layout. Join
//! tables are ordinary tables with composite primary keys; nothing is
//! discovered from the models at runtime.
//!
//! Unique lookups that must be case-insensitive (account names, tag names)
//! go through `*_folded` columns written by the repositories with
//! [`fold_name`](super::models::fold_name). A local account has an empty
//! `domain_folded`, so two local rows still collide. Emoji shortcodes are
//! case-sensitive; their nullable `domain` is folded through
//! `COALESCE(..., '')` in the index.

use super::connection::Dialect;
use super::migrations::Migration;

/// Every migration, in ascending version order
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 20220101000001,
        name: "create_accounts_and_statuses",
        up: create_accounts_and_statuses,
    },
    Migration {
        version: 20220101000002,
        name: "create_tags_and_emojis",
        up: create_tags_and_emojis,
    },
    Migration {
        version: 20220101000003,
        name: "create_notifications",
        up: create_notifications,
    },
    Migration {
        version: 20220101000004,
        name: "create_admin_tables",
        up: create_admin_tables,
    },
];

fn create_accounts_and_statuses(dialect: Dialect) -> Vec<String> {
    let ts = dialect.timestamp_type();
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL,
                domain TEXT,
                username_folded TEXT NOT NULL,
                domain_folded TEXT NOT NULL,
                display_name TEXT,
                uri TEXT NOT NULL UNIQUE,
                url TEXT,
                inbox_uri TEXT,
                public_key_pem TEXT,
                created_at {ts} NOT NULL,
                updated_at {ts} NOT NULL
            )
            "#
        ),
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS accounts_username_domain_uniq
            ON accounts (username_folded, domain_folded)
        "#
        .to_string(),
        "CREATE INDEX IF NOT EXISTS accounts_url_idx ON accounts (url)".to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS statuses (
                id TEXT PRIMARY KEY NOT NULL,
                uri TEXT NOT NULL UNIQUE,
                url TEXT,
                content TEXT NOT NULL,
                local BOOLEAN NOT NULL,
                account_id TEXT NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
                account_uri TEXT NOT NULL,
                in_reply_to_id TEXT,
                visibility TEXT NOT NULL,
                sensitive BOOLEAN NOT NULL,
                created_at {ts} NOT NULL,
                updated_at {ts} NOT NULL
            )
            "#
        ),
        "CREATE INDEX IF NOT EXISTS statuses_account_id_idx ON statuses (account_id, id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS statuses_url_idx ON statuses (url)".to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS mentions (
                id TEXT PRIMARY KEY NOT NULL,
                status_id TEXT NOT NULL REFERENCES statuses (id) ON DELETE CASCADE,
                origin_account_id TEXT NOT NULL,
                origin_account_uri TEXT NOT NULL,
                target_account_id TEXT NOT NULL,
                target_account_uri TEXT NOT NULL,
                target_account_url TEXT,
                name_string TEXT NOT NULL,
                silent BOOLEAN NOT NULL,
                created_at {ts} NOT NULL,
                UNIQUE (status_id, target_account_id)
            )
            "#
        ),
        "CREATE INDEX IF NOT EXISTS mentions_target_account_id_idx ON mentions (target_account_id)"
            .to_string(),
    ]
}

fn create_tags_and_emojis(dialect: Dialect) -> Vec<String> {
    let ts = dialect.timestamp_type();
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                name_folded TEXT NOT NULL,
                url TEXT NOT NULL,
                first_seen_from_account_id TEXT NOT NULL,
                usable BOOLEAN NOT NULL,
                listable BOOLEAN NOT NULL,
                last_status_at {ts} NOT NULL,
                created_at {ts} NOT NULL,
                updated_at {ts} NOT NULL
            )
            "#
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS tags_name_uniq ON tags (name_folded)".to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS status_to_tags (
            status_id TEXT NOT NULL REFERENCES statuses (id) ON DELETE CASCADE,
            tag_id TEXT NOT NULL REFERENCES tags (id) ON DELETE CASCADE,
            PRIMARY KEY (status_id, tag_id)
        )
        "#
        .to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS emojis (
                id TEXT PRIMARY KEY NOT NULL,
                shortcode TEXT NOT NULL,
                domain TEXT,
                uri TEXT NOT NULL UNIQUE,
                image_url TEXT NOT NULL,
                visible_in_picker BOOLEAN NOT NULL,
                disabled BOOLEAN NOT NULL,
                category TEXT,
                created_at {ts} NOT NULL,
                updated_at {ts} NOT NULL
            )
            "#
        ),
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS emojis_shortcode_domain_uniq
            ON emojis (shortcode, (COALESCE(domain, '')))
        "#
        .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS status_to_emojis (
            status_id TEXT NOT NULL REFERENCES statuses (id) ON DELETE CASCADE,
            emoji_id TEXT NOT NULL REFERENCES emojis (id) ON DELETE CASCADE,
            PRIMARY KEY (status_id, emoji_id)
        )
        "#
        .to_string(),
    ]
}

fn create_notifications(dialect: Dialect) -> Vec<String> {
    let ts = dialect.timestamp_type();
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY NOT NULL,
                notification_type TEXT NOT NULL,
                target_account_id TEXT NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
                origin_account_id TEXT NOT NULL,
                status_id TEXT REFERENCES statuses (id) ON DELETE CASCADE,
                read BOOLEAN NOT NULL,
                created_at {ts} NOT NULL
            )
            "#
        ),
        r#"
        CREATE INDEX IF NOT EXISTS notifications_target_account_id_idx
            ON notifications (target_account_id, id)
        "#
        .to_string(),
    ]
}

fn create_admin_tables(dialect: Dialect) -> Vec<String> {
    let ts = dialect.timestamp_type();
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS domain_blocks (
                id TEXT PRIMARY KEY NOT NULL,
                domain TEXT NOT NULL UNIQUE,
                created_by_account_id TEXT NOT NULL,
                private_comment TEXT,
                public_comment TEXT,
                created_at {ts} NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY NOT NULL,
                auth_key TEXT NOT NULL,
                crypt_key TEXT NOT NULL,
                created_at {ts} NOT NULL
            )
            "#
        ),
    ]
}
