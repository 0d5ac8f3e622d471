//! SQLite-based mail server storage with zstd-compressed message payloads

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::MailStore;
use crate::identity::Address;
use crate::models::{Alert, IdentityRecord, MessageKind, StoredMessage, Subscription, User};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                avatar TEXT NOT NULL,
                receiving INTEGER NOT NULL DEFAULT 1,
                registered_on TEXT NOT NULL
            );

            -- Signing addresses linked to users
            CREATE TABLE identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                address TEXT NOT NULL,  -- JSON
                FOREIGN KEY (owner) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_identities_fingerprint ON identities(fingerprint);

            CREATE TABLE subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                address TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_subscriptions_user ON subscriptions(user_id);

            CREATE TABLE alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                sender TEXT NOT NULL,
                name TEXT NOT NULL,
                location TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX idx_alerts_recipient ON alerts(recipient, timestamp);

            -- Published envelopes, zstd compressed
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                sender TEXT NOT NULL,
                kind TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data BLOB NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_name ON messages(sender, name);
            CREATE INDEX idx_messages_timestamp ON messages(sender, timestamp);

            CREATE TABLE message_recipients (
                message_id INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, position),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_message_recipients_fingerprint
                ON message_recipients(fingerprint);

            -- Opaque per-user values
            CREATE TABLE data (
                owner TEXT NOT NULL,
                key TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (owner, key)
            );
            "#,
        ),
    ])
}

const MESSAGE_COLUMNS: &str = "m.id, m.name, m.sender, m.kind, m.timestamp, m.data, m.version";

/// Message row before recipients are attached and the payload decompressed
struct MessageRow {
    id: i64,
    name: String,
    from: String,
    kind: String,
    timestamp: i64,
    data: Vec<u8>,
    version: i64,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            from: row.get(2)?,
            kind: row.get(3)?,
            timestamp: row.get(4)?,
            data: row.get(5)?,
            version: row.get(6)?,
        })
    }
}

/// SQLite-based mail server storage
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed during writes; NORMAL sync is safe under WAL.
        // foreign_keys is required for ON DELETE CASCADE.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_recipients(&self, conn: &Connection, message_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT fingerprint FROM message_recipients
             WHERE message_id = ?
             ORDER BY position",
        )?;

        let recipients = stmt
            .query_map([message_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recipients)
    }

    /// Run a message query (selecting [`MESSAGE_COLUMNS`]) and hydrate rows
    fn load_messages<P: Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|row| {
                let to = self.load_recipients(conn, row.id)?;
                let kind = MessageKind::parse(&row.kind)
                    .with_context(|| format!("Unknown message kind {:?}", row.kind))?;
                let data = zstd::decode_all(row.data.as_slice())
                    .with_context(|| format!("Failed to decompress message {}", row.id))?;
                Ok(StoredMessage {
                    id: row.id,
                    name: row.name,
                    from: row.from,
                    to,
                    kind,
                    timestamp: row.timestamp,
                    data,
                    version: row.version,
                })
            })
            .collect()
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, bool, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl MailStore for SqliteMailStore {
    fn insert_user(&self, user: User) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (name, avatar, receiving, registered_on) VALUES (?, ?, ?, ?)",
            params![
                user.name,
                user.avatar,
                user.receiving,
                user.registered_on.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET name = ?, avatar = ?, receiving = ? WHERE id = ?",
            params![user.name, user.avatar, user.receiving, user.id],
        )?;
        if updated == 0 {
            anyhow::bail!("user {} does not exist", user.id);
        }
        Ok(())
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, avatar, receiving, registered_on FROM users WHERE id = ?",
                [id],
                user_from_row,
            )
            .optional()?;

        Ok(row.map(|(id, name, avatar, receiving, registered_on)| User {
            id,
            name,
            avatar,
            receiving,
            registered_on: parse_timestamp(&registered_on),
        }))
    }

    fn insert_identity(&self, identity: IdentityRecord) -> Result<i64> {
        let address =
            serde_json::to_string(&identity.address).context("Failed to serialize address")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO identities (owner, fingerprint, address) VALUES (?, ?, ?)",
            params![identity.owner, identity.fingerprint, address],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn identities_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<IdentityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, owner, fingerprint, address FROM identities
             WHERE fingerprint = ? ORDER BY id",
        )?;

        let rows = stmt
            .query_map([fingerprint], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, owner, fingerprint, address)| {
                let address: Address =
                    serde_json::from_str(&address).context("Failed to parse stored address")?;
                Ok(IdentityRecord {
                    id,
                    owner,
                    fingerprint,
                    address,
                })
            })
            .collect()
    }

    fn insert_subscription(&self, subscription: Subscription) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subscriptions (user_id, address) VALUES (?, ?)",
            params![subscription.user_id, subscription.address],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn subscriptions_for_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, address FROM subscriptions WHERE user_id = ? ORDER BY id",
        )?;

        let subscriptions = stmt
            .query_map([user_id], |row| {
                Ok(Subscription {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    address: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(subscriptions)
    }

    fn insert_alert(&self, alert: Alert) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (recipient, sender, name, location, timestamp)
             VALUES (?, ?, ?, ?, ?)",
            params![alert.to, alert.from, alert.name, alert.location, alert.timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn alerts_since(&self, to: &str, since: i64) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, recipient, sender, name, location, timestamp FROM alerts
             WHERE recipient = ? AND timestamp > ?
             ORDER BY timestamp, id",
        )?;

        let alerts = stmt
            .query_map(params![to, since], |row| {
                Ok(Alert {
                    id: row.get(0)?,
                    to: row.get(1)?,
                    from: row.get(2)?,
                    name: row.get(3)?,
                    location: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(alerts)
    }

    fn insert_message(&self, message: StoredMessage) -> Result<i64> {
        // Level 3 = good balance of speed vs compression
        let compressed =
            zstd::encode_all(message.data.as_slice(), 3).context("Failed to compress message")?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO messages (name, sender, kind, timestamp, data, version)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                message.name,
                message.from,
                message.kind.as_str(),
                message.timestamp,
                compressed,
                message.version,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO message_recipients (message_id, fingerprint, position)
                 VALUES (?, ?, ?)",
            )?;
            for (i, fingerprint) in message.to.iter().enumerate() {
                stmt.execute(params![id, fingerprint, i as i64])?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    fn messages_with_name(&self, name: &str, author: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        self.load_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.name = ? AND m.sender = ? AND m.kind != ?
                 ORDER BY m.timestamp, m.id"
            ),
            params![name, author, MessageKind::Sent.as_str()],
        )
    }

    fn messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        self.load_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.sender = ? AND m.timestamp > ? AND m.kind != ?
                 ORDER BY m.timestamp, m.id"
            ),
            params![author, since, MessageKind::Sent.as_str()],
        )
    }

    fn sent_messages_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        self.load_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.sender = ? AND m.timestamp > ? AND m.kind = ?
                 ORDER BY m.timestamp, m.id"
            ),
            params![author, since, MessageKind::Sent.as_str()],
        )
    }

    fn public_messages_from_since(&self, author: &str, since: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        self.load_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.sender = ? AND m.timestamp > ? AND m.kind != ?
                   AND NOT EXISTS (SELECT 1 FROM message_recipients r WHERE r.message_id = m.id)
                 ORDER BY m.timestamp, m.id"
            ),
            params![author, since, MessageKind::Sent.as_str()],
        )
    }

    fn incoming_messages_since(&self, recipient: &str, since: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        self.load_messages(
            &conn,
            &format!(
                "SELECT DISTINCT {MESSAGE_COLUMNS} FROM messages m
                 JOIN message_recipients r ON r.message_id = m.id
                 WHERE r.fingerprint = ? AND m.timestamp > ? AND m.kind != ?
                 ORDER BY m.timestamp, m.id"
            ),
            params![recipient, since, MessageKind::Sent.as_str()],
        )
    }

    fn update_message_data(&self, id: i64, expected_version: i64, data: Vec<u8>) -> Result<bool> {
        let compressed =
            zstd::encode_all(data.as_slice(), 3).context("Failed to compress message")?;

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE messages SET data = ?, version = version + 1
             WHERE id = ? AND version = ?",
            params![compressed, id, expected_version],
        )?;
        Ok(updated == 1)
    }

    fn set_data(&self, owner: &str, key: &str, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO data (owner, key, data) VALUES (?, ?, ?)
             ON CONFLICT(owner, key) DO UPDATE SET data = excluded.data",
            params![owner, key, data],
        )?;
        Ok(())
    }

    fn get_data(&self, owner: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let data = conn
            .query_row(
                "SELECT data FROM data WHERE owner = ? AND key = ?",
                params![owner, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }
}
