//! SQLite-backed channel store.
//!
//! Layout:
//! - `store_meta`: schema version and the sampling granularity fixed at creation
//! - `channels`: one metadata row per channel
//! - `entries`: `(channel_id, ts)` keyed samples, one namespace per channel
//! - `credentials`: encrypted secrets, unrelated to channels
//!
//! Entries are upserted by timestamp (last write wins). Values of encrypted
//! channels and all credentials are sealed with the store password.

use std::cell::OnceCell;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{
    parse_value_type, validate_entry, validate_identifier, Channel, Entry, ValidationError, Value,
    ValueType,
};
use crate::encryption::{CipherKey, EncryptionError};
use crate::timestamp::{parse_granularity, Granularity, Timestamp, TimestampError};

const SCHEMA_VERSION: i64 = 1;
pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("store already exists at {path}")]
    AlreadyExists { path: PathBuf },
    #[error("no store at {path}")]
    NotFound { path: PathBuf },
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error(
        "channel {id} is registered as {existing_type} (encrypted={existing_encrypted}), \
         cannot re-register as {requested_type} (encrypted={requested_encrypted})"
    )]
    SchemaConflict {
        id: String,
        existing_type: ValueType,
        existing_encrypted: bool,
        requested_type: ValueType,
        requested_encrypted: bool,
    },
    #[error("{0} is encrypted but the store was opened without a password")]
    MissingPassword(String),
    #[error("password must be at least {min} characters long")]
    WeakPassword { min: usize },
    #[error("failed to decrypt {id}: wrong password or corrupted value")]
    Decryption { id: String },
    #[error("failed to encrypt {id}: {source}")]
    Encryption {
        id: String,
        source: EncryptionError,
    },
    #[error("store uses {stored} granularity but was opened with {requested}")]
    GranularityMismatch {
        stored: String,
        requested: Granularity,
    },
    #[error("unsupported store schema version {found}, expected {expected}")]
    UnsupportedSchema { found: i64, expected: i64 },
    #[error("corrupt store content: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    #[serde(flatten)]
    pub channel: Channel,
    pub entries: u64,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
}

pub struct ChannelStore {
    conn: Connection,
    granularity: Granularity,
    password: Option<String>,
    key: OnceCell<CipherKey>,
    active: HashSet<String>,
}

impl ChannelStore {
    /// Creates a new store file; refuses to touch an existing one.
    pub fn create(
        path: &Path,
        password: Option<&str>,
        granularity: Granularity,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let store = Self::open(path, password, granularity)?;
        info!(
            component = "store",
            event = "store.create",
            path = %path.display(),
            granularity = granularity.as_str()
        );
        Ok(store)
    }

    pub fn open(
        path: &Path,
        password: Option<&str>,
        granularity: Granularity,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = open_connection(path)?;
        let store = Self::from_connection(conn, password, granularity)?;
        store.log_open(path);
        Ok(store)
    }

    /// Opens an existing store at the granularity it was created with.
    ///
    /// `requested` only acts as a check: when given and different from the
    /// recorded granularity the open fails with `GranularityMismatch`.
    pub fn open_existing(
        path: &Path,
        password: Option<&str>,
        requested: Option<Granularity>,
    ) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let conn = open_connection(path)?;
        ensure_schema(&conn)?;
        let granularity = match (read_meta(&conn, "granularity")?, requested) {
            (Some(stored), _) => {
                let recorded = parse_granularity(&stored).map_err(|_| {
                    StoreError::Corrupt(format!("unknown stored granularity '{stored}'"))
                })?;
                // from_connection reports a disagreeing request as GranularityMismatch.
                requested.unwrap_or(recorded)
            }
            (None, Some(requested)) => requested,
            (None, None) => {
                return Err(StoreError::Corrupt(format!(
                    "{} records no granularity",
                    path.display()
                )))
            }
        };

        let store = Self::from_connection(conn, password, granularity)?;
        store.log_open(path);
        Ok(store)
    }

    fn log_open(&self, path: &Path) {
        info!(
            component = "store",
            event = "store.open",
            path = %path.display(),
            granularity = self.granularity.as_str(),
            password_supplied = self.password.is_some()
        );
    }

    pub fn open_in_memory(
        password: Option<&str>,
        granularity: Granularity,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, password, granularity)
    }

    fn from_connection(
        conn: Connection,
        password: Option<&str>,
        granularity: Granularity,
    ) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;

        match read_meta(&conn, "granularity")? {
            Some(stored) if stored != granularity.as_str() => {
                return Err(StoreError::GranularityMismatch {
                    stored,
                    requested: granularity,
                });
            }
            Some(_) => {}
            None => write_meta(&conn, "granularity", granularity.as_str())?,
        }

        Ok(Self {
            conn,
            granularity,
            password: password.map(str::to_string),
            key: OnceCell::new(),
            active: HashSet::new(),
        })
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Registers a channel if it is not known yet and marks it active for this handle.
    pub fn ensure_channel(&mut self, channel: &Channel) -> Result<(), StoreError> {
        channel.validate()?;

        match self.channel(&channel.id)? {
            Some(existing) => {
                if existing.value_type != channel.value_type
                    || existing.encrypted != channel.encrypted
                {
                    return Err(StoreError::SchemaConflict {
                        id: channel.id.clone(),
                        existing_type: existing.value_type,
                        existing_encrypted: existing.encrypted,
                        requested_type: channel.value_type,
                        requested_encrypted: channel.encrypted,
                    });
                }
                if existing.description != channel.description {
                    self.conn.execute(
                        "UPDATE channels SET description = ?2 WHERE id = ?1",
                        params![channel.id, channel.description],
                    )?;
                    debug!(
                        component = "store",
                        event = "store.channel.description_updated",
                        channel = %channel.id
                    );
                }
            }
            None => {
                self.conn.execute(
                    "
                    INSERT INTO channels (id, description, value_type, encrypted)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![
                        channel.id,
                        channel.description,
                        channel.value_type.as_str(),
                        channel.encrypted
                    ],
                )?;
                info!(
                    component = "store",
                    event = "store.channel.registered",
                    channel = %channel.id,
                    value_type = channel.value_type.as_str(),
                    encrypted = channel.encrypted
                );
            }
        }

        self.active.insert(channel.id.clone());
        Ok(())
    }

    pub fn channel(&self, id: &str) -> Result<Option<Channel>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, description, value_type, encrypted FROM channels WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, description, value_type, encrypted)| {
            channel_from_row(id, description, &value_type, encrypted)
        })
        .transpose()
    }

    fn require_channel(&self, id: &str) -> Result<Channel, StoreError> {
        self.channel(id)?
            .ok_or_else(|| StoreError::UnknownChannel(id.to_string()))
    }

    /// Upserts entries into a channel in one transaction and returns how many were written.
    pub fn add(&mut self, channel_id: &str, entries: &[Entry]) -> Result<usize, StoreError> {
        let channel = self.require_channel(channel_id)?;
        let key = if channel.encrypted {
            Some(self.cipher_key(&channel.id)?)
        } else {
            None
        };

        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            validate_entry(&channel, entry)?;
            let ts = Timestamp::new(entry.timestamp, self.granularity)?.epoch();
            let row = match (key, &entry.value) {
                (Some(key), value) => {
                    let sealed = key.encrypt(&value.to_string()).map_err(|source| {
                        StoreError::Encryption {
                            id: channel.id.clone(),
                            source,
                        }
                    })?;
                    (ts, None, Some(sealed))
                }
                (None, Value::Numeric(v)) => (ts, Some(*v), None),
                (None, Value::Text(text)) => (ts, None, Some(text.clone())),
            };
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO entries (channel_id, ts, num_value, text_value)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(channel_id, ts) DO UPDATE SET
                    num_value = excluded.num_value,
                    text_value = excluded.text_value
                ",
            )?;

            for (ts, num_value, text_value) in &rows {
                stmt.execute(params![channel.id, ts, num_value, text_value])?;
            }
        }
        tx.commit()?;

        debug!(
            component = "store",
            event = "store.add",
            channel = %channel.id,
            entries = rows.len()
        );
        Ok(rows.len())
    }

    /// All entries of a channel, ordered by timestamp and decrypted if needed.
    pub fn get(&self, channel_id: &str) -> Result<Vec<Entry>, StoreError> {
        let channel = self.require_channel(channel_id)?;
        self.query_entries(&channel, i64::MIN, i64::MAX)
    }

    /// Entries with `start <= timestamp <= end`.
    pub fn get_range(
        &self,
        channel_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Entry>, StoreError> {
        if end < start {
            return Err(ValidationError::InvalidInterval(format!(
                "range end {end} precedes start {start}"
            ))
            .into());
        }
        let channel = self.require_channel(channel_id)?;
        self.query_entries(&channel, start.epoch(), end.epoch())
    }

    /// Stored timestamps of a channel. Never decrypts, so no password is needed.
    pub fn timestamps(&self, channel_id: &str) -> Result<BTreeSet<Timestamp>, StoreError> {
        let channel = self.require_channel(channel_id)?;
        let mut stmt = self
            .conn
            .prepare("SELECT ts FROM entries WHERE channel_id = ?1")?;
        let mut rows = stmt.query(params![channel.id])?;

        let mut out = BTreeSet::new();
        while let Some(row) = rows.next()? {
            out.insert(Timestamp::from_epoch(row.get(0)?, self.granularity)?);
        }
        Ok(out)
    }

    pub fn entry_count(&self, channel_id: &str) -> Result<u64, StoreError> {
        let channel = self.require_channel(channel_id)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE channel_id = ?1",
            params![channel.id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Channel metadata ordered by id; `active_only` keeps channels registered through this handle.
    pub fn get_all_channels(&self, active_only: bool) -> Result<Vec<Channel>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, description, value_type, encrypted FROM channels ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            if active_only && !self.active.contains(&id) {
                continue;
            }
            let value_type: String = row.get(2)?;
            out.push(channel_from_row(id, row.get(1)?, &value_type, row.get(3)?)?);
        }
        Ok(out)
    }

    pub fn summary(&self) -> Result<Vec<ChannelSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                c.id,
                c.description,
                c.value_type,
                c.encrypted,
                COUNT(e.ts),
                MIN(e.ts),
                MAX(e.ts)
            FROM channels c
            LEFT JOIN entries e ON e.channel_id = c.id
            GROUP BY c.id
            ORDER BY c.id ASC
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let value_type: String = row.get(2)?;
            let channel = channel_from_row(row.get(0)?, row.get(1)?, &value_type, row.get(3)?)?;
            let count: i64 = row.get(4)?;
            let first: Option<i64> = row.get(5)?;
            let last: Option<i64> = row.get(6)?;

            out.push(ChannelSummary {
                channel,
                entries: count as u64,
                first: first
                    .map(|ts| Timestamp::from_epoch(ts, self.granularity))
                    .transpose()?,
                last: last
                    .map(|ts| Timestamp::from_epoch(ts, self.granularity))
                    .transpose()?,
            });
        }
        Ok(out)
    }

    pub fn add_credential(&mut self, id: &str, value: &str) -> Result<(), StoreError> {
        validate_identifier("credential id", id)?;
        let sealed = self
            .cipher_key(id)?
            .encrypt(value)
            .map_err(|source| StoreError::Encryption {
                id: id.to_string(),
                source,
            })?;

        self.conn.execute(
            "
            INSERT INTO credentials (id, value) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET value = excluded.value
            ",
            params![id, sealed],
        )?;
        debug!(
            component = "store",
            event = "store.credential.stored",
            credential = id
        );
        Ok(())
    }

    /// `Ok(None)` for an unknown id.
    pub fn get_credential(&self, id: &str) -> Result<Option<String>, StoreError> {
        let sealed: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM credentials WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let key = self.cipher_key(id)?;
        key.decrypt(&sealed).map(Some).map_err(|_| {
            warn!(
                component = "store",
                event = "store.credential.decrypt_failed",
                credential = id
            );
            StoreError::Decryption { id: id.to_string() }
        })
    }

    /// Flushes the write-ahead log into the main database file.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(FULL);")?;
        debug!(component = "store", event = "store.commit");
        Ok(())
    }

    fn cipher_key(&self, id: &str) -> Result<&CipherKey, StoreError> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| StoreError::MissingPassword(id.to_string()))?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(StoreError::WeakPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        Ok(self.key.get_or_init(|| CipherKey::derive(password)))
    }

    fn query_entries(
        &self,
        channel: &Channel,
        start_epoch: i64,
        end_epoch: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        let key = if channel.encrypted {
            Some(self.cipher_key(&channel.id)?)
        } else {
            None
        };

        let mut stmt = self.conn.prepare(
            "
            SELECT ts, num_value, text_value
            FROM entries
            WHERE channel_id = ?1
              AND ts >= ?2
              AND ts <= ?3
            ORDER BY ts ASC
            ",
        )?;
        let mut rows = stmt.query(params![channel.id, start_epoch, end_epoch])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp = Timestamp::from_epoch(row.get(0)?, self.granularity)?;
            let value = decode_value(channel, key, row.get(1)?, row.get(2)?)?;
            out.push(Entry { timestamp, value });
        }
        Ok(out)
    }
}

fn decode_value(
    channel: &Channel,
    key: Option<&CipherKey>,
    num_value: Option<f64>,
    text_value: Option<String>,
) -> Result<Value, StoreError> {
    let corrupt = || StoreError::Corrupt(format!("missing value in channel {}", channel.id));

    match (key, channel.value_type) {
        (Some(key), value_type) => {
            let sealed = text_value.ok_or_else(corrupt)?;
            let plain = key.decrypt(&sealed).map_err(|_| {
                warn!(
                    component = "store",
                    event = "store.entry.decrypt_failed",
                    channel = %channel.id
                );
                StoreError::Decryption {
                    id: channel.id.clone(),
                }
            })?;
            match value_type {
                ValueType::Text => Ok(Value::Text(plain)),
                ValueType::Numeric => plain.parse::<f64>().map(Value::Numeric).map_err(|_| {
                    StoreError::Corrupt(format!(
                        "encrypted numeric value in channel {} is not a number",
                        channel.id
                    ))
                }),
            }
        }
        (None, ValueType::Numeric) => num_value.map(Value::Numeric).ok_or_else(corrupt),
        (None, ValueType::Text) => text_value.map(Value::Text).ok_or_else(corrupt),
    }
}

fn channel_from_row(
    id: String,
    description: String,
    value_type: &str,
    encrypted: bool,
) -> Result<Channel, StoreError> {
    let value_type = parse_value_type(value_type).ok_or_else(|| {
        StoreError::Corrupt(format!("channel {id} has unknown value type '{value_type}'"))
    })?;
    Ok(Channel {
        id,
        description,
        value_type,
        encrypted,
    })
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            value_type TEXT NOT NULL,
            encrypted INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS entries (
            channel_id TEXT NOT NULL,
            ts INTEGER NOT NULL,
            num_value REAL,
            text_value TEXT,
            PRIMARY KEY(channel_id, ts)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    match read_meta(conn, "schema_version")? {
        None => write_meta(conn, "schema_version", &SCHEMA_VERSION.to_string())?,
        Some(raw) => {
            let found: i64 = raw
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("invalid schema version '{raw}'")))?;
            if found != SCHEMA_VERSION {
                return Err(StoreError::UnsupportedSchema {
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
        }
    }

    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "
        INSERT INTO store_meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        ",
        params![key, value],
    )?;
    Ok(())
}
