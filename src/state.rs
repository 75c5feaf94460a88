//! Durable per-process state.
//!
//! Each `(domain, resolution, process)` triple tracks the wall-clock upper
//! bound of its last completed run plus an opaque scratch string in the
//! configuration database's `state` table. Connections are opened per
//! operation; reads use read-only connections.

use crate::config::{now, DbCfg};
use crate::error::{ProcError, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub struct State {
    domain: String,
    resolution: String,
    name: String,
    dbcfg: DbCfg,
    domain_id: i64,
    resolution_id: i64,
    /// Last-processed wall-clock upper bound; `None` until first write.
    pub time: Option<NaiveDateTime>,
    /// Opaque scratch value; empty when unset.
    pub csv: String,
}

impl State {
    /// Binds a state handle to a `(domain, resolution, name)` key, resolving
    /// the domain and resolution ids.
    ///
    /// # Errors
    /// `Config` if the domain or resolution is not defined in the
    /// configuration database.
    pub fn new(domain: &str, resolution: &str, name: &str, dbcfg: &DbCfg) -> Result<State> {
        let conn = dbcfg.open_ro()?;
        let domain_id = lookup_id(&conn, "domain", domain)?;
        let resolution_id = lookup_id(&conn, "resolution", resolution)?;
        Ok(State {
            domain: domain.to_string(),
            resolution: resolution.to_string(),
            name: name.to_string(),
            dbcfg: dbcfg.clone(),
            domain_id,
            resolution_id,
            time: None,
            csv: String::new(),
        })
    }

    /// Loads `time` and `csv`, or clears them when no entry exists.
    pub fn get(&mut self) -> Result<()> {
        let conn = self.dbcfg.open_ro()?;
        let row = conn
            .query_row(
                "SELECT time, csv FROM state \
                 WHERE name = ?1 AND domain_id = ?2 AND resolution_id = ?3",
                params![self.name, self.domain_id, self.resolution_id],
                |row| {
                    Ok((
                        row.get::<_, NaiveDateTime>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((time, csv)) => {
                self.time = Some(time);
                self.csv = csv.unwrap_or_default();
            }
            None => {
                self.time = None;
                self.csv = String::new();
            }
        }
        Ok(())
    }

    /// Stamps `time = now()` and upserts the entry.
    pub fn write(&mut self) -> Result<()> {
        self.time = Some(now());
        let conn = self.dbcfg.open_rw()?;
        conn.execute(
            "INSERT INTO state (domain_id, resolution_id, name, time, csv) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (domain_id, resolution_id, name) \
             DO UPDATE SET time = excluded.time, csv = excluded.csv",
            params![
                self.domain_id,
                self.resolution_id,
                self.name,
                self.time,
                self.csv
            ],
        )?;
        Ok(())
    }

    /// Deletes the entry if present and clears the loaded values.
    pub fn remove(&mut self) -> Result<()> {
        let conn = self.dbcfg.open_rw()?;
        conn.execute(
            "DELETE FROM state WHERE name = ?1 AND domain_id = ?2 AND resolution_id = ?3",
            params![self.name, self.domain_id, self.resolution_id],
        )?;
        self.time = None;
        self.csv = String::new();
        Ok(())
    }

    pub fn entry_exists(&self) -> Result<bool> {
        let conn = self.dbcfg.open_ro()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM state \
             WHERE name = ?1 AND domain_id = ?2 AND resolution_id = ?3",
            params![self.name, self.domain_id, self.resolution_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn lookup_id(conn: &Connection, table: &str, name: &str) -> Result<i64> {
    // table is one of two literals owned by this module
    let mut stmt = conn.prepare(&format!("SELECT id FROM {table} WHERE name = ?1"))?;
    let mut rows: Vec<i64> = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    match rows.len() {
        1 => Ok(rows.pop().expect("one row")),
        0 => Err(ProcError::Config(format!(
            "no rows obtained querying {table} for '{name}'"
        ))),
        _ => Err(ProcError::Invariant(format!(
            "multiple rows obtained querying {table} for '{name}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_db() -> (tempfile::TempDir, DbCfg) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path: PathBuf = dir.path().join("conf.db");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE domain (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE resolution (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE state (
                 domain_id INTEGER, resolution_id INTEGER, name TEXT,
                 time TEXT, csv TEXT,
                 PRIMARY KEY (domain_id, resolution_id, name));
             INSERT INTO domain (id, name) VALUES (1, 'uswc');
             INSERT INTO resolution (id, name) VALUES (2, '6km');",
        )
        .expect("schema");
        (
            dir,
            DbCfg {
                path,
                login_timeout_s: 5,
            },
        )
    }

    #[test]
    fn get_on_missing_entry_is_empty() {
        let (_dir, dbcfg) = test_db();
        let mut state = State::new("uswc", "6km", "rtv", &dbcfg).expect("state");
        state.get().expect("get");
        assert!(state.time.is_none());
        assert!(state.csv.is_empty());
        assert!(!state.entry_exists().expect("exists"));
    }

    #[test]
    fn write_then_get_round_trips() {
        let (_dir, dbcfg) = test_db();
        let mut state = State::new("uswc", "6km", "rtv", &dbcfg).expect("state");
        state.csv = "a,b,c".to_string();
        state.write().expect("write");
        let written = state.time.expect("time set");

        let mut other = State::new("uswc", "6km", "rtv", &dbcfg).expect("state");
        other.get().expect("get");
        assert_eq!(other.time, Some(written));
        assert_eq!(other.csv, "a,b,c");

        // second write updates in place
        other.csv.clear();
        other.write().expect("rewrite");
        state.get().expect("reload");
        assert!(state.csv.is_empty());

        state.remove().expect("remove");
        assert!(!state.entry_exists().expect("exists"));
    }

    #[test]
    fn unknown_domain_is_config_error() {
        let (_dir, dbcfg) = test_db();
        assert!(matches!(
            State::new("nowhere", "6km", "rtv", &dbcfg),
            Err(ProcError::Config(_))
        ));
    }
}
