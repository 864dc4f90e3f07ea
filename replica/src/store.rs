//! SQLite-backed accounts, messages and id sequences.
//!
//! Ids are `u64` in the API and `INTEGER` in SQLite; they never exceed
//! `i64::MAX` in practice since they are assigned one at a time from 1.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::{
    error::StoreError,
    msg::{ChatMessage, MessageId},
};

/// Name of the counter the leader draws message ids from.
pub const MESSAGE_ID_SEQUENCE: &str = "message_id";

const SCHEMA_SQL: &str = include_str!("schema.sql");

const INSERT_MESSAGE: &str = "INSERT OR IGNORE INTO messages
     (id, sender, recipient, body, timestamp, delivered)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const MESSAGE_COLUMNS: &str = "id, sender, recipient, body, timestamp, delivered";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password_digest: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub timestamp: i64,
    pub delivered: bool,
}

impl StoredMessage {
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get::<_, i64>(0)? as MessageId,
            sender: row.get(1)?,
            recipient: row.get(2)?,
            body: row.get(3)?,
            timestamp: row.get(4)?,
            delivered: row.get(5)?,
        })
    }
}

/// Full copy of a node's accounts and messages, as served by `GetState`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub accounts: Vec<Account>,
    pub messages: Vec<StoredMessage>,
}

/// Durable account, message and sequence tables.
///
/// Every mutation is a single statement or a single transaction: it either
/// lands completely or, on error, leaves the tables as they were.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(&path)?)?;
        tracing::debug!(
            "Opened store {}: {} accounts, {} messages",
            path.display(),
            store.account_count()?,
            store.message_ids()?.len()
        );
        Ok(store)
    }

    /// Store that is never written to disk.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Returns false, changing nothing, when the username is taken.
    pub fn insert_account(&mut self, username: &str, digest: &[u8]) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO accounts (username, password_digest) VALUES (?1, ?2)",
            params![username, digest],
        )?;
        Ok(inserted == 1)
    }

    pub fn has_account(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.password_digest(username)?.is_some())
    }

    pub fn password_digest(&self, username: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT password_digest FROM accounts WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn account_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Usernames containing `pattern`, sorted. Matching ignores ASCII case
    /// and treats `%` and `_` literally. An empty pattern matches all.
    pub fn usernames_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let escaped = pattern
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let mut stmt = self.conn.prepare(
            "SELECT username FROM accounts
             WHERE username LIKE ?1 ESCAPE '\\'
             ORDER BY username",
        )?;
        let names = stmt
            .query_map(params![format!("%{escaped}%")], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Deletes every message the user sent or received, then the account.
    /// Returns whether anything was removed.
    pub fn delete_account(&mut self, username: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let messages = tx.execute(
            "DELETE FROM messages WHERE sender = ?1 OR recipient = ?1",
            params![username],
        )?;
        let accounts = tx.execute(
            "DELETE FROM accounts WHERE username = ?1",
            params![username],
        )?;
        tx.commit()?;
        Ok(messages + accounts > 0)
    }

    /// Returns false, changing nothing, when the id is already present.
    pub fn insert_message(&mut self, message: &StoredMessage) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            INSERT_MESSAGE,
            params![
                message.id as i64,
                message.sender,
                message.recipient,
                message.body,
                message.timestamp,
                message.delivered,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn message(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id as i64],
                StoredMessage::from_row,
            )
            .optional()?)
    }

    /// Deletes the listed messages, but only those addressed to `recipient`.
    pub fn delete_messages(
        &mut self,
        recipient: &str,
        ids: &[MessageId],
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM messages WHERE id = ?1 AND recipient = ?2")?;
            for id in ids {
                removed += stmt.execute(params![*id as i64, recipient])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Full history for a recipient in id order.
    pub fn messages_for(&self, recipient: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE recipient = ?1 ORDER BY id"
        ))?;
        let messages = stmt
            .query_map(params![recipient], StoredMessage::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn undelivered_for(
        &self,
        recipient: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE recipient = ?1 AND delivered = 0
             ORDER BY id
             LIMIT ?2"
        ))?;
        let messages = stmt
            .query_map(params![recipient, limit as i64], StoredMessage::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn unread_count(&self, recipient: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND delivered = 0",
            params![recipient],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mark_delivered(&mut self, ids: &[MessageId]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET delivered = 1 WHERE id = ?1 AND delivered = 0")?;
            for id in ids {
                stmt.execute(params![*id as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn message_ids(&self) -> Result<Vec<MessageId>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM messages ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as MessageId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn max_message_id(&self) -> Result<Option<MessageId>, StoreError> {
        max_message_id(&self.conn)
    }

    pub fn sequence(&self, name: &str) -> Result<Option<u64>, StoreError> {
        sequence(&self.conn, name)
    }

    /// Draws the next message id and advances the counter past it.
    ///
    /// The counter holds the next id to hand out. It never yields an id that
    /// is already stored, even if messages arrived by replication while this
    /// node was a follower.
    pub fn next_message_id(&mut self) -> Result<MessageId, StoreError> {
        let tx = self.conn.transaction()?;
        let floor = max_message_id(&tx)?.map_or(1, |max| max + 1);
        let id = sequence(&tx, MESSAGE_ID_SEQUENCE)?.map_or(floor, |next| next.max(floor));
        set_sequence(&tx, MESSAGE_ID_SEQUENCE, id + 1)?;
        tx.commit()?;
        Ok(id)
    }

    /// Resets the message counter to one past the highest stored id.
    pub fn reset_message_sequence(&mut self) -> Result<MessageId, StoreError> {
        let tx = self.conn.transaction()?;
        let next = max_message_id(&tx)?.map_or(1, |max| max + 1);
        set_sequence(&tx, MESSAGE_ID_SEQUENCE, next)?;
        tx.commit()?;
        Ok(next)
    }

    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT username, password_digest FROM accounts ORDER BY username")?;
        let accounts = stmt
            .query_map([], |row| {
                Ok(Account {
                    username: row.get(0)?,
                    password_digest: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY id"))?;
        let messages = stmt
            .query_map([], StoredMessage::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Snapshot { accounts, messages })
    }

    /// Inserts every account and message that is not already present.
    /// Returns the number of accounts and messages imported.
    pub fn merge(&mut self, snapshot: &Snapshot) -> Result<(usize, usize), StoreError> {
        let tx = self.conn.transaction()?;
        let mut accounts = 0;
        let mut messages = 0;
        {
            let mut insert_account = tx.prepare(
                "INSERT OR IGNORE INTO accounts (username, password_digest) VALUES (?1, ?2)",
            )?;
            for account in &snapshot.accounts {
                accounts +=
                    insert_account.execute(params![account.username, account.password_digest])?;
            }
            let mut insert_message = tx.prepare(INSERT_MESSAGE)?;
            for message in &snapshot.messages {
                messages += insert_message.execute(params![
                    message.id as i64,
                    message.sender,
                    message.recipient,
                    message.body,
                    message.timestamp,
                    message.delivered,
                ])?;
            }
        }
        tx.commit()?;
        Ok((accounts, messages))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        Ok(self.conn.execute_batch(sql)?)
    }
}

fn max_message_id(conn: &Connection) -> Result<Option<MessageId>, StoreError> {
    let max: Option<i64> = conn.query_row("SELECT MAX(id) FROM messages", [], |row| row.get(0))?;
    Ok(max.map(|id| id as MessageId))
}

fn sequence(conn: &Connection, name: &str) -> Result<Option<u64>, StoreError> {
    let next: Option<i64> = conn
        .query_row(
            "SELECT next_value FROM sequences WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(next.map(|next| next as u64))
}

fn set_sequence(conn: &Connection, name: &str, next: u64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO sequences (name, next_value) VALUES (?1, ?2)",
        params![name, next as i64],
    )?;
    Ok(())
}
