//! Persistent change log: which records still need uploading.
//!
//! One row per dirty record, living in the same database as the data tables
//! so a record write and its change-log transition commit atomically. A row's
//! absence means the relay is up to date for that key; `Unchanged` therefore
//! deletes the row instead of storing a state.

use peersync_core::{ChangeState, ChangedInfo, ObjectKey};
use rusqlite::{params, Connection, OptionalExtension};

/// Creates the change-log table if missing. Idempotent.
pub(crate) fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_state (
            Type    TEXT    NOT NULL,
            Key     TEXT    NOT NULL,
            State   INTEGER NOT NULL,
            Version INTEGER NOT NULL,
            PRIMARY KEY (Type, Key)
        );",
    )
}

/// Versions are stored as SQLite integers; the column is only ever written
/// from u64 counters that started at 1, so the conversions are lossless in
/// practice.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn version_to_db(version: u64) -> i64 {
    version as i64
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn version_from_db(version: i64) -> u64 {
    version as u64
}

/// Sets or clears the entry for a key. `Unchanged` removes the row.
///
/// Call inside the transaction that performs the corresponding data write.
pub(crate) fn enroll(
    conn: &Connection,
    key: &ObjectKey,
    state: ChangeState,
    version: u64,
) -> rusqlite::Result<()> {
    if state == ChangeState::Unchanged {
        conn.execute(
            "DELETE FROM sync_state WHERE Type = ?1 AND Key = ?2",
            params![key.type_name, key.id],
        )?;
    } else {
        conn.execute(
            "INSERT INTO sync_state (Type, Key, State, Version) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (Type, Key) DO UPDATE SET State = excluded.State, Version = excluded.Version",
            params![key.type_name, key.id, state.as_raw(), version_to_db(version)],
        )?;
    }
    Ok(())
}

/// Reads the entry for a key, if any.
pub(crate) fn entry(
    conn: &Connection,
    key: &ObjectKey,
) -> rusqlite::Result<Option<(ChangeState, u64)>> {
    let row: Option<(u8, i64)> = conn
        .query_row(
            "SELECT State, Version FROM sync_state WHERE Type = ?1 AND Key = ?2",
            params![key.type_name, key.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.and_then(|(state, version)| {
        ChangeState::from_raw(state).map(|state| (state, version_from_db(version)))
    }))
}

/// Marks every record of a type, pulling current versions from its data
/// table. `Unchanged` instead clears all of the type's entries.
pub(crate) fn mark_all(
    conn: &Connection,
    type_name: &str,
    data_table: &str,
    state: ChangeState,
) -> rusqlite::Result<()> {
    if state == ChangeState::Unchanged {
        conn.execute(
            "DELETE FROM sync_state WHERE Type = ?1",
            params![type_name],
        )?;
    } else {
        conn.execute(
            &format!(
                "INSERT INTO sync_state (Type, Key, State, Version)
                 SELECT ?1, Key, ?2, Version FROM {data_table} WHERE true
                 ON CONFLICT (Type, Key) DO UPDATE SET State = excluded.State, Version = excluded.Version"
            ),
            params![type_name, state.as_raw()],
        )?;
    }
    Ok(())
}

/// Enumerates every pending entry. Used at connect time and after reconnect.
pub(crate) fn list(conn: &Connection) -> rusqlite::Result<Vec<ChangedInfo>> {
    let mut stmt =
        conn.prepare("SELECT Type, Key, State, Version FROM sync_state ORDER BY Type, Key")?;
    let rows = stmt.query_map([], |row| {
        let type_name: String = row.get(0)?;
        let id: String = row.get(1)?;
        let state: u8 = row.get(2)?;
        let version: i64 = row.get(3)?;
        Ok((type_name, id, state, version))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (type_name, id, state, version) = row?;
        // Unknown state values would indicate a newer schema; skip them.
        if let Some(state) = ChangeState::from_raw(state) {
            entries.push(ChangedInfo {
                key: ObjectKey::new(type_name, id),
                state,
                version: version_from_db(version),
            });
        }
    }
    Ok(entries)
}
