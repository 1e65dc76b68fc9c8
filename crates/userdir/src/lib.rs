// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SQLite-backed user directory and broadcast rule storage.
//!
//! The proxy core only ever sees the [`sip_registrar::DirectoryStore`]
//! contract; this crate carries the schema, the queries, and the admin-side
//! mutations used by the web UI.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sip_registrar::{DirectoryStore, DirectoryUser};
use smol_str::SmolStr;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub mod password;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A broadcast rule as persisted, with its ordered targets.
#[derive(Debug, Clone)]
pub struct StoredBroadcastRule {
    pub id: i64,
    pub address: String,
    pub description: String,
    pub targets: Vec<StoredBroadcastTarget>,
}

#[derive(Debug, Clone)]
pub struct StoredBroadcastTarget {
    pub id: i64,
    pub rule_id: i64,
    pub contact_uri: String,
    pub priority: i64,
}

/// Read/write access to the SQLite user directory.
#[derive(Clone)]
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    /// Opens an existing directory database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Connects to an arbitrary SQLite URL (`sqlite::memory:` in tests).
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the directory tables when they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), DirectoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT NOT NULL,
                 domain TEXT NOT NULL,
                 password_hash TEXT,
                 contact_uri TEXT,
                 UNIQUE(username, domain)
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS broadcast_rules (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 address TEXT NOT NULL UNIQUE,
                 description TEXT
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS broadcast_targets (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 rule_id INTEGER NOT NULL REFERENCES broadcast_rules(id) ON DELETE CASCADE,
                 contact_uri TEXT NOT NULL,
                 priority INTEGER NOT NULL DEFAULT 0
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup_user(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<DirectoryUser>, DirectoryError> {
        let row = sqlx::query(
            "SELECT username, domain, password_hash, contact_uri
             FROM users WHERE username = ? AND domain = ? LIMIT 1",
        )
        .bind(username)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| user_from_row(&row)).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT username, domain, password_hash, contact_uri
             FROM users ORDER BY domain, username",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn create_user(&self, user: &DirectoryUser) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO users (username, domain, password_hash, contact_uri)
             VALUES (?, ?, ?, ?)",
        )
        .bind(user.username.as_str())
        .bind(user.domain.as_str())
        .bind(&user.password_hash)
        .bind(&user.contact_uri)
        .execute(&self.pool)
        .await?;
        debug!(user = %user.username, domain = %user.domain, "directory user created");
        Ok(())
    }

    pub async fn delete_user(&self, username: &str, domain: &str) -> Result<(), DirectoryError> {
        let result = sqlx::query("DELETE FROM users WHERE username = ? AND domain = ?")
            .bind(username)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    pub async fn update_password(
        &self,
        username: &str,
        domain: &str,
        password_hash: &str,
    ) -> Result<(), DirectoryError> {
        let result =
            sqlx::query("UPDATE users SET password_hash = ? WHERE username = ? AND domain = ?")
                .bind(password_hash)
                .bind(username)
                .bind(domain)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    /// Returns every broadcast rule with its targets ordered by priority.
    pub async fn list_broadcast_rules(&self) -> Result<Vec<StoredBroadcastRule>, DirectoryError> {
        let rule_rows =
            sqlx::query("SELECT id, address, description FROM broadcast_rules ORDER BY address, id")
                .fetch_all(&self.pool)
                .await?;
        let mut rules = Vec::with_capacity(rule_rows.len());
        for row in rule_rows {
            let id: i64 = row.try_get("id")?;
            let target_rows = sqlx::query(
                "SELECT id, rule_id, contact_uri, priority
                 FROM broadcast_targets WHERE rule_id = ? ORDER BY priority, id",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
            let mut targets = Vec::with_capacity(target_rows.len());
            for target in target_rows {
                targets.push(StoredBroadcastTarget {
                    id: target.try_get("id")?,
                    rule_id: target.try_get("rule_id")?,
                    contact_uri: target.try_get("contact_uri")?,
                    priority: target.try_get("priority")?,
                });
            }
            rules.push(StoredBroadcastRule {
                id,
                address: row.try_get("address")?,
                description: row
                    .try_get::<Option<String>, _>("description")?
                    .unwrap_or_default(),
                targets,
            });
        }
        Ok(rules)
    }

    pub async fn create_broadcast_rule(
        &self,
        address: &str,
        description: &str,
        targets: &[String],
    ) -> Result<i64, DirectoryError> {
        let result = sqlx::query("INSERT INTO broadcast_rules (address, description) VALUES (?, ?)")
            .bind(address)
            .bind(description)
            .execute(&self.pool)
            .await?;
        let rule_id = result.last_insert_rowid();
        for (priority, target) in targets.iter().enumerate() {
            sqlx::query(
                "INSERT INTO broadcast_targets (rule_id, contact_uri, priority) VALUES (?, ?, ?)",
            )
            .bind(rule_id)
            .bind(target)
            .bind(priority as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(rule_id)
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DirectoryUser, DirectoryError> {
    Ok(DirectoryUser {
        username: SmolStr::new(row.try_get::<String, _>("username")?),
        domain: SmolStr::new(row.try_get::<String, _>("domain")?),
        password_hash: row
            .try_get::<Option<String>, _>("password_hash")?
            .unwrap_or_default(),
        contact_uri: row
            .try_get::<Option<String>, _>("contact_uri")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl DirectoryStore for SqliteDirectory {
    async fn lookup(&self, username: &str, domain: &str) -> Result<Option<DirectoryUser>> {
        Ok(self.lookup_user(username, domain).await?)
    }

    async fn all_users(&self) -> Result<Vec<DirectoryUser>> {
        Ok(self.list_users().await?)
    }
}
