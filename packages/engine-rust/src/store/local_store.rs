//! The on-device record store.
//!
//! Records live in two places: a relational index (`store.db`, one table per
//! user type) and one payload file per record under
//! `store/<table>/<stem>.dat`. The index row carries the payload's SHA3-256
//! checksum, verified on every uncached read. Change-log transitions enroll
//! in the same transaction as the index write, so a crash can never separate
//! a record from its upload state.
//!
//! Write ordering: payloads are staged to a temp file in the final directory,
//! the index row commits, then the staged file is renamed into place. The
//! database commit is the linearization point for readers; a crash before it
//! leaves the old payload untouched, and a rename failure after it is an
//! invariant violation that latches the engine's fatal state.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use peersync_core::messages::codec;
use peersync_core::{table_name_for_type, ChangeState, ChangedInfo, JsonObject, ObjectKey};
use rusqlite::{params, Connection, OptionalExtension};
use sha3::{Digest, Sha3_256};
use tempfile::NamedTempFile;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::cache::{CachedPayload, PayloadCache};
use super::change_log::{self, version_from_db, version_to_db};
use super::emitter::{self, BroadcastEvent, DataEvent, StoreChange};
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};

/// Capacity of the per-store listener channel.
const LISTENER_CAPACITY: usize = 256;

/// Who initiated a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSource {
    /// A local mutation; bumps the version and enrolls an upload.
    Local,
    /// A relay-delivered change carrying its own version; clears the
    /// change-log entry instead of enrolling one.
    Remote { version: u64 },
}

/// Persistent record repository with integrity checking and change tracking.
///
/// All operations serialize on the database lock; reads that hit the payload
/// cache never touch the database. The store is `Send + Sync` and shared
/// between the facade worker and the sync tasks via `Arc`.
pub struct LocalStore {
    origin: u64,
    root: PathBuf,
    conn: Mutex<Connection>,
    table_names: Mutex<HashMap<String, String>>,
    cache: PayloadCache,
    listeners: broadcast::Sender<DataEvent>,
    sync_notifier: Mutex<Option<mpsc::UnboundedSender<ChangedInfo>>>,
}

impl LocalStore {
    /// Opens (or creates) the store under the configured root directory.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::StorageFailure`] if the directory or database
    /// cannot be created.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.local_dir)?;
        let conn = Connection::open(config.local_dir.join("store.db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        change_log::create_table(&conn)?;

        Ok(Self {
            origin: emitter::next_origin(),
            root: config.local_dir.clone(),
            conn: Mutex::new(conn),
            table_names: Mutex::new(HashMap::new()),
            cache: PayloadCache::new(config.cache_size),
            listeners: broadcast::channel(LISTENER_CAPACITY).0,
            sync_notifier: Mutex::new(None),
        })
    }

    /// Origin id identifying this instance on the process-wide emitter.
    #[must_use]
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Subscribes to this store's change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.listeners.subscribe()
    }

    /// Clone of the listener sender, for facades created later.
    pub(crate) fn listener_sender(&self) -> broadcast::Sender<DataEvent> {
        self.listeners.clone()
    }

    /// Installs the channel local mutations are announced on.
    pub(crate) fn set_sync_notifier(&self, notifier: Option<mpsc::UnboundedSender<ChangedInfo>>) {
        *self.sync_notifier.lock() = notifier;
    }

    // --- Read operations ---

    /// Number of records of a type; 0 if the type was never written.
    pub fn count(&self, type_name: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, type_name)? else {
            return Ok(0);
        };
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(Key) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// All ids of a type; empty if none.
    pub fn keys(&self, type_name: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, type_name)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&format!("SELECT Key FROM {table} ORDER BY Key"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every payload of a type, warming the cache with each one.
    pub fn load_all(&self, type_name: &str) -> Result<Vec<JsonObject>> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, type_name)? else {
            return Ok(Vec::new());
        };
        self.load_rows(&conn, &table, type_name, None)
    }

    /// Loads one payload, from cache when possible.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for absent keys, [`StoreError::Corrupted`]
    /// when the payload fails its checksum or cannot be decoded.
    pub fn load(&self, key: &ObjectKey) -> Result<JsonObject> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit.object.clone());
        }

        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, &key.type_name)? else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let row: Option<(String, Vec<u8>)> = conn
            .query_row(
                &format!("SELECT File, Checksum FROM {table} WHERE Key = ?1"),
                params![key.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stem, checksum)) = row else {
            return Err(StoreError::NotFound(key.clone()));
        };

        let (object, cost) = self.read_payload(&table, &stem, key, &checksum)?;
        let payload = Arc::new(CachedPayload {
            object: object.clone(),
            cost,
        });
        self.cache.insert(key.clone(), payload);
        Ok(object)
    }

    /// Glob search over ids: `*` matches any sequence, `?` one character.
    pub fn find(&self, type_name: &str, pattern: &str) -> Result<Vec<JsonObject>> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, type_name)? else {
            return Ok(Vec::new());
        };
        let like = glob_to_like(pattern);
        self.load_rows(&conn, &table, type_name, Some(&like))
    }

    /// Every type name that currently has a data table.
    pub fn type_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'data\\_%' ESCAPE '\\' ORDER BY name",
        )?;
        let tables = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for table in tables {
            if let Some(type_name) = peersync_core::type_name_for_table(&table?) {
                names.push(type_name);
            }
        }
        Ok(names)
    }

    /// Current version of a record, `None` if the key has no row.
    pub fn version(&self, key: &ObjectKey) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, &key.type_name)? else {
            return Ok(None);
        };
        let version: Option<i64> = conn
            .query_row(
                &format!("SELECT Version FROM {table} WHERE Key = ?1"),
                params![key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(version_from_db))
    }

    /// Reads the raw payload bytes and version of a record, for upload.
    ///
    /// # Errors
    ///
    /// Same contract as [`LocalStore::load`].
    pub fn load_raw(&self, key: &ObjectKey) -> Result<(u64, Vec<u8>)> {
        let conn = self.conn.lock();
        let Some(table) = self.existing_table(&conn, &key.type_name)? else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let row: Option<(i64, String, Vec<u8>)> = conn
            .query_row(
                &format!("SELECT Version, File, Checksum FROM {table} WHERE Key = ?1"),
                params![key.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((version, stem, checksum)) = row else {
            return Err(StoreError::NotFound(key.clone()));
        };

        let path = self.type_dir(&table).join(format!("{stem}.dat"));
        let bytes = fs::read(&path)?;
        verify_checksum(&bytes, &checksum, key, &path)?;
        Ok((version_from_db(version), bytes))
    }

    // --- Write operations ---

    /// Atomic create-or-update of a record from a local mutation.
    pub fn save(&self, key: &ObjectKey, data: &JsonObject) -> Result<()> {
        self.write_record(key, data, WriteSource::Local).map(|_| ())
    }

    /// Applies a relay-delivered record if it is strictly newer than the
    /// local copy (or the key is absent). Returns false for stale frames.
    pub fn apply_remote(&self, key: &ObjectKey, version: u64, data: &JsonObject) -> Result<bool> {
        Ok(self
            .write_record(key, data, WriteSource::Remote { version })?
            .is_some())
    }

    /// Removes a record from a local mutation. Returns true if a row existed.
    pub fn remove(&self, key: &ObjectKey) -> Result<bool> {
        self.remove_record(key, WriteSource::Local)
    }

    /// Applies a relay-delivered deletion if it is strictly newer than the
    /// local copy. Returns false for stale frames.
    pub fn remove_remote(&self, key: &ObjectKey, version: u64) -> Result<bool> {
        self.remove_record(key, WriteSource::Remote { version })
    }

    /// Drops a type's table and payload directory, enrolling a tombstone for
    /// every record so peers learn of the clear.
    pub fn clear(&self, type_name: &str) -> Result<()> {
        let tombstones;
        {
            let mut conn = self.conn.lock();
            let Some(table) = self.existing_table(&conn, type_name)? else {
                return Ok(());
            };

            let tx = conn.transaction()?;
            let rows: Vec<(String, i64)> = {
                let mut stmt = tx.prepare(&format!("SELECT Key, Version FROM {table}"))?;
                let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                mapped.collect::<rusqlite::Result<_>>()?
            };
            for (id, version) in &rows {
                change_log::enroll(
                    &tx,
                    &ObjectKey::new(type_name, id.clone()),
                    ChangeState::Deleted,
                    version_from_db(*version) + 1,
                )?;
            }
            tx.execute_batch(&format!("DROP TABLE {table}"))?;
            tx.commit()?;

            let dir = self.type_dir(&table);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }

            self.table_names.lock().remove(type_name);
            self.cache.clear();
            tombstones = rows;

            emitter::publish(BroadcastEvent {
                origin: self.origin,
                root: self.root.clone(),
                change: StoreChange::Resetted {
                    type_name: Some(type_name.to_string()),
                },
            });
        }

        self.emit(DataEvent::Resetted {
            type_name: Some(type_name.to_string()),
        });
        for (id, version) in tombstones {
            self.notify_sync(ChangedInfo {
                key: ObjectKey::new(type_name, id),
                state: ChangeState::Deleted,
                version: version_from_db(version) + 1,
            });
        }
        debug!(type_name, "cleared type");
        Ok(())
    }

    /// Drops every data table and the payload tree. Local only: the change
    /// log is left untouched and nothing propagates to the relay.
    pub fn reset(&self) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let tables: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'data\\_%' ESCAPE '\\'",
                )?;
                let mapped = stmt.query_map([], |row| row.get(0))?;
                mapped.collect::<rusqlite::Result<_>>()?
            };
            for table in &tables {
                tx.execute_batch(&format!("DROP TABLE {table}"))?;
            }
            tx.commit()?;

            let store_dir = self.root.join("store");
            if store_dir.exists() {
                fs::remove_dir_all(&store_dir)?;
            }

            self.table_names.lock().clear();
            self.cache.clear();

            emitter::publish(BroadcastEvent {
                origin: self.origin,
                root: self.root.clone(),
                change: StoreChange::Resetted { type_name: None },
            });
        }

        self.emit(DataEvent::Resetted { type_name: None });
        debug!("store reset");
        Ok(())
    }

    // --- Change-log operations ---

    /// Enumerates every pending upload.
    pub fn list_local_changes(&self) -> Result<Vec<ChangedInfo>> {
        let conn = self.conn.lock();
        Ok(change_log::list(&conn)?)
    }

    /// Sets or clears the change-log entry for one key.
    pub fn mark_changed(&self, key: &ObjectKey, state: ChangeState) -> Result<()> {
        let mut conn = self.conn.lock();
        let table = self.existing_table(&conn, &key.type_name)?;
        let tx = conn.transaction()?;
        let current = match &table {
            Some(table) => {
                let version: Option<i64> = tx
                    .query_row(
                        &format!("SELECT Version FROM {table} WHERE Key = ?1"),
                        params![key.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                version.map(version_from_db)
            }
            None => None,
        };
        let version = match state {
            // A manual tombstone points one past the last stored version.
            ChangeState::Deleted => current.unwrap_or(0) + 1,
            _ => current.unwrap_or(1),
        };
        change_log::enroll(&tx, key, state, version)?;
        tx.commit()?;
        Ok(())
    }

    /// Marks every record of a type, e.g. to force a full re-upload.
    pub fn mark_all_changed(&self, type_name: &str, state: ChangeState) -> Result<()> {
        let mut conn = self.conn.lock();
        let table = self.existing_table(&conn, type_name)?;
        let tx = conn.transaction()?;
        match table {
            Some(table) => change_log::mark_all(&tx, type_name, &table, state)?,
            // Without a data table there is nothing to seed, but Unchanged
            // must still clear stray entries.
            None => {
                if state == ChangeState::Unchanged {
                    change_log::mark_all(&tx, type_name, "", state)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Clears the change-log entry for a key if the acknowledged version is
    /// still current; a stale ack (the user overwrote in the meantime) leaves
    /// the entry pending. Returns whether the entry was cleared.
    pub fn acknowledge(&self, key: &ObjectKey, acked_version: u64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let table = self.existing_table(&conn, &key.type_name)?;
        let tx = conn.transaction()?;

        let Some((state, enrolled_version)) = change_log::entry(&tx, key)? else {
            return Ok(false);
        };
        let current = match (state, &table) {
            (ChangeState::Deleted, _) => enrolled_version,
            (_, Some(table)) => {
                let version: Option<i64> = tx
                    .query_row(
                        &format!("SELECT Version FROM {table} WHERE Key = ?1"),
                        params![key.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                version.map_or(enrolled_version, version_from_db)
            }
            (_, None) => enrolled_version,
        };

        if current != acked_version {
            debug!(%key, acked_version, current, "stale acknowledgement ignored");
            return Ok(false);
        }
        change_log::enroll(&tx, key, ChangeState::Unchanged, 0)?;
        tx.commit()?;
        Ok(true)
    }

    // --- Cache controls ---

    /// Current payload cache budget in bytes.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache.capacity()
    }

    /// Replaces the payload cache budget.
    pub fn set_cache_size(&self, bytes: u64) {
        self.cache.set_capacity(bytes);
    }

    /// Restores the configured cache budget.
    pub fn reset_cache_size(&self) {
        self.cache.reset_capacity();
    }

    // --- Cross-instance propagation ---

    /// Applies an event published by a sibling store on the same root:
    /// refreshes this instance's cache and re-emits on its listener stream.
    /// Own events are ignored.
    pub fn apply_broadcast(&self, event: &BroadcastEvent) {
        if event.origin == self.origin || event.root != self.root {
            return;
        }
        match &event.change {
            StoreChange::Changed { key, payload } => {
                match payload {
                    // Only refresh entries this instance already holds; cold
                    // keys stay cold until read.
                    Some(payload) => {
                        if self.cache.contains(key) {
                            self.cache.insert(key.clone(), Arc::clone(payload));
                        }
                    }
                    None => self.cache.remove(key),
                }
                self.emit(DataEvent::Changed {
                    type_name: key.type_name.clone(),
                    key: key.id.clone(),
                    was_deleted: payload.is_none(),
                });
            }
            StoreChange::Resetted { type_name } => {
                match type_name {
                    Some(type_name) => {
                        self.table_names.lock().remove(type_name);
                    }
                    None => self.table_names.lock().clear(),
                }
                self.cache.clear();
                self.emit(DataEvent::Resetted {
                    type_name: type_name.clone(),
                });
            }
        }
    }

    // --- Internals ---

    fn write_record(
        &self,
        key: &ObjectKey,
        data: &JsonObject,
        source: WriteSource,
    ) -> Result<Option<u64>> {
        let bytes = codec::encode_payload(data)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let digest = Sha3_256::digest(&bytes).to_vec();

        let mut conn = self.conn.lock();
        let table = self.ensure_table(&conn, &key.type_name)?;
        let dir = self.type_dir(&table);
        fs::create_dir_all(&dir)?;

        let tx = conn.transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                &format!("SELECT Version, File FROM {table} WHERE Key = ?1"),
                params![key.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (version, stem, is_insert) = match (&existing, source) {
            (Some((current, stem)), WriteSource::Local) => {
                (version_from_db(*current) + 1, stem.clone(), false)
            }
            (Some((current, stem)), WriteSource::Remote { version }) => {
                if version <= version_from_db(*current) {
                    return Ok(None);
                }
                (version, stem.clone(), false)
            }
            (None, WriteSource::Local) => (1, Uuid::new_v4().simple().to_string(), true),
            (None, WriteSource::Remote { version }) => {
                // A local tombstone newer than the incoming frame wins.
                if let Some((ChangeState::Deleted, tombstone)) = change_log::entry(&tx, key)? {
                    if version <= tombstone {
                        return Ok(None);
                    }
                }
                (version, Uuid::new_v4().simple().to_string(), true)
            }
        };

        let mut staged = NamedTempFile::new_in(&dir)?;
        staged.write_all(&bytes)?;
        staged.flush()?;

        if is_insert {
            tx.execute(
                &format!("INSERT INTO {table} (Key, Version, File, Checksum) VALUES (?1, ?2, ?3, ?4)"),
                params![key.id, version_to_db(version), stem, digest],
            )?;
        } else {
            tx.execute(
                &format!("UPDATE {table} SET Version = ?1, Checksum = ?2 WHERE Key = ?3"),
                params![version_to_db(version), digest, key.id],
            )?;
        }

        match source {
            WriteSource::Local => change_log::enroll(&tx, key, ChangeState::Changed, version)?,
            WriteSource::Remote { .. } => {
                change_log::enroll(&tx, key, ChangeState::Unchanged, 0)?;
            }
        }
        tx.commit()?;

        // The committed row now claims the new checksum; publish the bytes.
        let final_path = dir.join(format!("{stem}.dat"));
        staged.persist(&final_path).map_err(|err| {
            StoreError::Fatal(format!(
                "failed to publish payload file {}: {}",
                final_path.display(),
                err.error
            ))
        })?;

        let payload = Arc::new(CachedPayload {
            object: data.clone(),
            cost: byte_cost(&bytes),
        });
        self.cache.insert(key.clone(), Arc::clone(&payload));
        emitter::publish(BroadcastEvent {
            origin: self.origin,
            root: self.root.clone(),
            change: StoreChange::Changed {
                key: key.clone(),
                payload: Some(payload),
            },
        });
        drop(conn);

        self.emit(DataEvent::Changed {
            type_name: key.type_name.clone(),
            key: key.id.clone(),
            was_deleted: false,
        });
        if source == WriteSource::Local {
            self.notify_sync(ChangedInfo {
                key: key.clone(),
                state: ChangeState::Changed,
                version,
            });
        }
        debug!(%key, version, "record written");
        Ok(Some(version))
    }

    fn remove_record(&self, key: &ObjectKey, source: WriteSource) -> Result<bool> {
        let removed_version;
        {
            let mut conn = self.conn.lock();
            let Some(table) = self.existing_table(&conn, &key.type_name)? else {
                return match source {
                    WriteSource::Local => Ok(false),
                    // Nothing stored: the deletion is trivially applied.
                    WriteSource::Remote { .. } => {
                        let tx = conn.transaction()?;
                        change_log::enroll(&tx, key, ChangeState::Unchanged, 0)?;
                        tx.commit()?;
                        Ok(true)
                    }
                };
            };

            let tx = conn.transaction()?;
            let existing: Option<(i64, String)> = tx
                .query_row(
                    &format!("SELECT Version, File FROM {table} WHERE Key = ?1"),
                    params![key.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((current, stem)) = existing else {
                match source {
                    WriteSource::Local => return Ok(false),
                    WriteSource::Remote { version } => {
                        if let Some((ChangeState::Deleted, tombstone)) =
                            change_log::entry(&tx, key)?
                        {
                            if version <= tombstone {
                                return Ok(false);
                            }
                        }
                        change_log::enroll(&tx, key, ChangeState::Unchanged, 0)?;
                        tx.commit()?;
                        return Ok(true);
                    }
                }
            };
            let current = version_from_db(current);

            let version = match source {
                WriteSource::Local => current + 1,
                WriteSource::Remote { version } => {
                    if version <= current {
                        return Ok(false);
                    }
                    version
                }
            };

            tx.execute(
                &format!("DELETE FROM {table} WHERE Key = ?1"),
                params![key.id],
            )?;
            match source {
                WriteSource::Local => {
                    change_log::enroll(&tx, key, ChangeState::Deleted, version)?;
                }
                WriteSource::Remote { .. } => {
                    change_log::enroll(&tx, key, ChangeState::Unchanged, 0)?;
                }
            }

            // The payload must be gone before the row deletion becomes
            // visible; a file we cannot delete leaves storage inconsistent.
            let path = self.type_dir(&table).join(format!("{stem}.dat"));
            fs::remove_file(&path).map_err(|err| {
                StoreError::Fatal(format!(
                    "failed to delete payload file {}: {err}",
                    path.display()
                ))
            })?;
            tx.commit()?;

            self.cache.remove(key);
            emitter::publish(BroadcastEvent {
                origin: self.origin,
                root: self.root.clone(),
                change: StoreChange::Changed {
                    key: key.clone(),
                    payload: None,
                },
            });
            removed_version = version;
        }

        self.emit(DataEvent::Changed {
            type_name: key.type_name.clone(),
            key: key.id.clone(),
            was_deleted: true,
        });
        if source == WriteSource::Local {
            self.notify_sync(ChangedInfo {
                key: key.clone(),
                state: ChangeState::Deleted,
                version: removed_version,
            });
        }
        debug!(%key, version = removed_version, "record removed");
        Ok(true)
    }

    fn load_rows(
        &self,
        conn: &Connection,
        table: &str,
        type_name: &str,
        like: Option<&str>,
    ) -> Result<Vec<JsonObject>> {
        let sql = match like {
            Some(_) => format!("SELECT Key, File, Checksum FROM {table} WHERE Key LIKE ?1 ORDER BY Key"),
            None => format!("SELECT Key, File, Checksum FROM {table} ORDER BY Key"),
        };
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        };
        let rows: Vec<(String, String, Vec<u8>)> = match like {
            Some(pattern) => stmt
                .query_map(params![pattern], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt.query_map([], map_row)?.collect::<rusqlite::Result<_>>()?,
        };

        let mut payloads = Vec::with_capacity(rows.len());
        for (id, stem, checksum) in rows {
            let key = ObjectKey::new(type_name, id);
            let (object, cost) = self.read_payload(table, &stem, &key, &checksum)?;
            self.cache.insert(
                key,
                Arc::new(CachedPayload {
                    object: object.clone(),
                    cost,
                }),
            );
            payloads.push(object);
        }
        Ok(payloads)
    }

    fn read_payload(
        &self,
        table: &str,
        stem: &str,
        key: &ObjectKey,
        checksum: &[u8],
    ) -> Result<(JsonObject, u64)> {
        let path = self.type_dir(table).join(format!("{stem}.dat"));
        let bytes = fs::read(&path)?;
        verify_checksum(&bytes, checksum, key, &path)?;
        let object = codec::decode_payload(&bytes).map_err(|err| StoreError::Corrupted {
            key: key.clone(),
            reason: format!("{}: {err}", path.display()),
        })?;
        Ok((object, byte_cost(&bytes)))
    }

    fn type_dir(&self, table: &str) -> PathBuf {
        self.root.join("store").join(table)
    }

    fn ensure_table(&self, conn: &Connection, type_name: &str) -> Result<String> {
        self.lookup_table(conn, type_name, true)?
            .ok_or_else(|| StoreError::StorageFailure("table creation failed".to_string()))
    }

    fn existing_table(&self, conn: &Connection, type_name: &str) -> Result<Option<String>> {
        self.lookup_table(conn, type_name, false)
    }

    fn lookup_table(
        &self,
        conn: &Connection,
        type_name: &str,
        create: bool,
    ) -> Result<Option<String>> {
        if let Some(table) = self.table_names.lock().get(type_name).cloned() {
            return Ok(Some(table));
        }

        let table = table_name_for_type(type_name);
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            if !create {
                return Ok(None);
            }
            conn.execute_batch(&format!(
                "CREATE TABLE {table} (
                    Key      TEXT    NOT NULL,
                    Version  INTEGER NOT NULL,
                    File     TEXT    NOT NULL,
                    Checksum BLOB    NOT NULL,
                    PRIMARY KEY (Key)
                );"
            ))?;
            fs::create_dir_all(self.type_dir(&table))?;
        }
        self.table_names
            .lock()
            .insert(type_name.to_string(), table.clone());
        Ok(Some(table))
    }

    fn emit(&self, event: DataEvent) {
        // No listeners is fine.
        let _ = self.listeners.send(event);
    }

    fn notify_sync(&self, info: ChangedInfo) {
        if let Some(notifier) = self.sync_notifier.lock().as_ref() {
            let _ = notifier.send(info);
        }
    }
}

fn verify_checksum(
    bytes: &[u8],
    checksum: &[u8],
    key: &ObjectKey,
    path: &std::path::Path,
) -> Result<()> {
    let digest = Sha3_256::digest(bytes);
    if digest.as_slice() == checksum {
        Ok(())
    } else {
        Err(StoreError::Corrupted {
            key: key.clone(),
            reason: format!(
                "checksum mismatch for {} (expected {}, got {})",
                path.display(),
                hex::encode(checksum),
                hex::encode(digest)
            ),
        })
    }
}

fn byte_cost(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

/// Translates a glob pattern to a SQL `LIKE` pattern.
fn glob_to_like(pattern: &str) -> String {
    pattern.replace('*', "%").replace('?', "_")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn test_store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&StorageConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    fn object(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    fn key(id: &str) -> ObjectKey {
        ObjectKey::new("Note", id)
    }

    #[test]
    fn save_then_load_roundtrip() {
        let (_dir, store) = test_store();
        let data = object(json!({"t": "hi"}));

        store.save(&key("a"), &data).unwrap();
        assert_eq!(store.load(&key("a")).unwrap(), data);
    }

    #[test]
    fn save_then_keys_and_count() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "hi"}))).unwrap();

        assert_eq!(store.keys("Note").unwrap(), vec!["a"]);
        assert_eq!(store.count("Note").unwrap(), 1);
    }

    #[test]
    fn unknown_type_reads_are_empty() {
        let (_dir, store) = test_store();
        assert_eq!(store.count("Never").unwrap(), 0);
        assert!(store.keys("Never").unwrap().is_empty());
        assert!(store.load_all("Never").unwrap().is_empty());
        assert!(store.find("Never", "*").unwrap().is_empty());
        assert!(matches!(
            store.load(&ObjectKey::new("Never", "x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn overwrite_increments_version() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.save(&key("a"), &object(json!({"v": 2}))).unwrap();

        assert_eq!(store.version(&key("a")).unwrap(), Some(2));
        assert_eq!(store.load(&key("a")).unwrap(), object(json!({"v": 2})));
        assert_eq!(store.count("Note").unwrap(), 1);
    }

    #[test]
    fn remove_makes_load_fail_with_not_found() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "x"}))).unwrap();

        assert!(store.remove(&key("a")).unwrap());
        assert!(matches!(
            store.load(&key("a")),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.keys("Note").unwrap().is_empty());

        // Removing again reports no row.
        assert!(!store.remove(&key("a")).unwrap());
        assert!(!store.remove(&ObjectKey::new("Never", "x")).unwrap());
    }

    #[test]
    fn remove_enrolls_a_tombstone_one_version_ahead() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "x"}))).unwrap();
        store.save(&key("a"), &object(json!({"t": "y"}))).unwrap();
        store.remove(&key("a")).unwrap();

        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, ChangeState::Deleted);
        assert_eq!(changes[0].version, 3);
    }

    #[test]
    fn find_translates_glob_patterns() {
        let (_dir, store) = test_store();
        for id in ["foo1", "foo2", "bar"] {
            store
                .save(&ObjectKey::new("T", id), &object(json!({"id": id})))
                .unwrap();
        }

        let hits = store.find("T", "foo?").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["id"], "foo1");
        assert_eq!(hits[1]["id"], "foo2");

        assert_eq!(store.find("T", "*").unwrap().len(), 3);
        assert_eq!(store.find("T", "bar").unwrap().len(), 1);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let (dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "hi"}))).unwrap();

        // Locate the payload file and flip a byte.
        let type_dir = dir.path().join("store").join("data_Note");
        let entry = fs::read_dir(&type_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "dat"))
            .unwrap();
        let mut bytes = fs::read(&entry).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&entry, &bytes).unwrap();

        // Cached copy still serves; evict it to force the file read.
        store.set_cache_size(1024);
        assert!(matches!(
            store.load(&key("a")),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn load_all_and_load_agree() {
        let (_dir, store) = test_store();
        for i in 0..5 {
            store
                .save(&key(&format!("k{i}")), &object(json!({"i": i})))
                .unwrap();
        }

        let all = store.load_all("Note").unwrap();
        assert_eq!(all.len(), 5);
        for (i, payload) in all.iter().enumerate() {
            assert_eq!(&store.load(&key(&format!("k{i}"))).unwrap(), payload);
        }
    }

    #[test]
    fn save_enrolls_exactly_one_change() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();

        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, key("a"));
        assert_eq!(changes[0].state, ChangeState::Changed);
        assert_eq!(changes[0].version, 1);

        // Overwrite replaces the entry instead of adding one.
        store.save(&key("a"), &object(json!({"v": 2}))).unwrap();
        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version, 2);
    }

    #[test]
    fn acknowledge_gates_on_current_version() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.save(&key("a"), &object(json!({"v": 2}))).unwrap();

        // Ack for the overwritten version must not clear the entry.
        assert!(!store.acknowledge(&key("a"), 1).unwrap());
        assert_eq!(store.list_local_changes().unwrap().len(), 1);

        assert!(store.acknowledge(&key("a"), 2).unwrap());
        assert!(store.list_local_changes().unwrap().is_empty());

        // Acking without a pending entry reports false.
        assert!(!store.acknowledge(&key("a"), 2).unwrap());
    }

    #[test]
    fn acknowledge_clears_tombstones_by_enrolled_version() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "x"}))).unwrap();
        store.remove(&key("a")).unwrap();

        assert!(!store.acknowledge(&key("a"), 1).unwrap());
        assert!(store.acknowledge(&key("a"), 2).unwrap());
        assert!(store.list_local_changes().unwrap().is_empty());
    }

    #[test]
    fn apply_remote_takes_strictly_newer_versions() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": "local"}))).unwrap();

        assert!(store
            .apply_remote(&key("a"), 5, &object(json!({"v": "remote"})))
            .unwrap());
        assert_eq!(store.version(&key("a")).unwrap(), Some(5));
        assert_eq!(store.load(&key("a")).unwrap(), object(json!({"v": "remote"})));
        // Relay-delivered data is not pending upload.
        assert!(store.list_local_changes().unwrap().is_empty());

        // Stale frame is ignored.
        assert!(!store
            .apply_remote(&key("a"), 3, &object(json!({"v": "stale"})))
            .unwrap());
        assert_eq!(store.version(&key("a")).unwrap(), Some(5));
    }

    #[test]
    fn apply_remote_respects_newer_local_tombstone() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"t": "x"}))).unwrap();
        store.remove(&key("a")).unwrap(); // tombstone at version 2

        assert!(!store
            .apply_remote(&key("a"), 2, &object(json!({"t": "old"})))
            .unwrap());
        assert!(store
            .apply_remote(&key("a"), 3, &object(json!({"t": "new"})))
            .unwrap());
        assert_eq!(store.version(&key("a")).unwrap(), Some(3));
    }

    #[test]
    fn remove_remote_gates_on_version() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.save(&key("a"), &object(json!({"v": 2}))).unwrap();

        assert!(!store.remove_remote(&key("a"), 2).unwrap());
        assert_eq!(store.count("Note").unwrap(), 1);

        assert!(store.remove_remote(&key("a"), 3).unwrap());
        assert_eq!(store.count("Note").unwrap(), 0);
        assert!(store.list_local_changes().unwrap().is_empty());
    }

    #[test]
    fn remove_remote_of_absent_key_is_applied() {
        let (_dir, store) = test_store();
        assert!(store.remove_remote(&key("ghost"), 4).unwrap());
    }

    #[test]
    fn clear_drops_data_and_enrolls_tombstones() {
        let (dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.save(&key("b"), &object(json!({"v": 1}))).unwrap();
        store.acknowledge(&key("a"), 1).unwrap();
        store.acknowledge(&key("b"), 1).unwrap();

        store.clear("Note").unwrap();

        assert_eq!(store.count("Note").unwrap(), 0);
        assert!(!dir.path().join("store").join("data_Note").exists());

        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| c.state == ChangeState::Deleted && c.version == 2));
    }

    #[test]
    fn reset_leaves_the_change_log_alone() {
        let (dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store
            .save(&ObjectKey::new("Task", "t"), &object(json!({"v": 1})))
            .unwrap();

        store.reset().unwrap();

        assert_eq!(store.count("Note").unwrap(), 0);
        assert_eq!(store.count("Task").unwrap(), 0);
        assert!(!dir.path().join("store").exists());
        // Local-only: pending uploads survive a reset.
        assert_eq!(store.list_local_changes().unwrap().len(), 2);

        // The store stays usable afterwards.
        store.save(&key("again"), &object(json!({"v": 2}))).unwrap();
        assert_eq!(store.count("Note").unwrap(), 1);
    }

    #[test]
    fn failed_write_rolls_back_row_and_change_log() {
        let (dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();

        // Sabotage the payload directory so staging fails mid-save.
        let type_dir = dir.path().join("store").join("data_Note");
        fs::remove_dir_all(&type_dir).unwrap();
        fs::write(&type_dir, b"not a directory").unwrap();

        assert!(store.save(&key("b"), &object(json!({"v": 1}))).is_err());

        assert_eq!(store.keys("Note").unwrap(), vec!["a"]);
        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, key("a"));
    }

    #[test]
    fn interrupted_staging_leaves_old_payload_intact() {
        let (dir, store) = test_store();
        let data = object(json!({"t": "original"}));
        store.save(&key("a"), &data).unwrap();

        // A crash between staging and commit leaves only an orphaned temp
        // file behind; the committed payload must stay readable.
        let type_dir = dir.path().join("store").join("data_Note");
        let staged = NamedTempFile::new_in(&type_dir).unwrap();
        staged.as_file().sync_all().ok();
        drop(store);

        let store = LocalStore::open(&StorageConfig::new(dir.path())).unwrap();
        assert_eq!(store.load(&key("a")).unwrap(), data);
        assert_eq!(store.list_local_changes().unwrap().len(), 1);
    }

    #[test]
    fn load_raw_returns_version_and_decodable_bytes() {
        let (_dir, store) = test_store();
        let data = object(json!({"t": "raw"}));
        store.save(&key("a"), &data).unwrap();
        store.save(&key("a"), &data).unwrap();

        let (version, bytes) = store.load_raw(&key("a")).unwrap();
        assert_eq!(version, 2);
        assert_eq!(codec::decode_payload(&bytes).unwrap(), data);
    }

    #[test]
    fn mark_all_changed_seeds_every_record() {
        let (_dir, store) = test_store();
        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.save(&key("b"), &object(json!({"v": 1}))).unwrap();
        store.acknowledge(&key("a"), 1).unwrap();
        store.acknowledge(&key("b"), 1).unwrap();
        assert!(store.list_local_changes().unwrap().is_empty());

        store.mark_all_changed("Note", ChangeState::Changed).unwrap();
        let changes = store.list_local_changes().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.state == ChangeState::Changed));

        store
            .mark_all_changed("Note", ChangeState::Unchanged)
            .unwrap();
        assert!(store.list_local_changes().unwrap().is_empty());
    }

    #[test]
    fn listeners_observe_saves_and_removes() {
        let (_dir, store) = test_store();
        let mut events = store.subscribe();

        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store.remove(&key("a")).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            DataEvent::Changed {
                type_name: "Note".to_string(),
                key: "a".to_string(),
                was_deleted: false,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            DataEvent::Changed {
                type_name: "Note".to_string(),
                key: "a".to_string(),
                was_deleted: true,
            }
        );
    }

    #[test]
    fn sync_notifier_sees_local_mutations_only() {
        let (_dir, store) = test_store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_sync_notifier(Some(tx));

        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store
            .apply_remote(&key("b"), 1, &object(json!({"v": 1})))
            .unwrap();
        store.remove(&key("a")).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.state, ChangeState::Changed);
        assert_eq!(first.key, key("a"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.state, ChangeState::Deleted);
        assert_eq!(second.version, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sibling_stores_fan_out_changes() {
        let (dir, store_a) = test_store();
        let store_b = LocalStore::open(&StorageConfig::new(dir.path())).unwrap();

        let mut emitter_rx = emitter::subscribe();
        let mut events_b = store_b.subscribe();

        store_a.save(&key("a"), &object(json!({"t": "hi"}))).unwrap();

        // Drain the global stream until store A's event shows up (other
        // tests share the channel), then hand it to store B.
        loop {
            let event = emitter_rx.try_recv().expect("broadcast delivered");
            if event.origin == store_a.origin() {
                store_b.apply_broadcast(&event);
                break;
            }
        }

        assert_eq!(
            events_b.try_recv().unwrap(),
            DataEvent::Changed {
                type_name: "Note".to_string(),
                key: "a".to_string(),
                was_deleted: false,
            }
        );
        // Own events are ignored by the originating store.
        assert!(events_b.try_recv().is_err());

        // The record itself is visible through the shared database.
        assert_eq!(
            store_b.load(&key("a")).unwrap(),
            object(json!({"t": "hi"}))
        );
    }

    #[test]
    fn type_names_lists_written_types() {
        let (_dir, store) = test_store();
        assert!(store.type_names().unwrap().is_empty());

        store.save(&key("a"), &object(json!({"v": 1}))).unwrap();
        store
            .save(&ObjectKey::new("Task", "t"), &object(json!({"v": 1})))
            .unwrap();

        assert_eq!(store.type_names().unwrap(), vec!["Note", "Task"]);
    }

    #[test]
    fn glob_translation() {
        assert_eq!(glob_to_like("foo?"), "foo_");
        assert_eq!(glob_to_like("*bar*"), "%bar%");
        assert_eq!(glob_to_like("plain"), "plain");
    }
}
