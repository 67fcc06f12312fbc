//! The catalog store.
//!
//! Owns the SQLite database, schema versioning, transactions and the typed
//! entity operations in the submodules. Every thread that touches the catalog
//! owns its own [`Db`] handle; statements are cached per handle.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Context, bail};
use color_eyre::Section;
use color_eyre::Result;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use strum::{Display, EnumString, FromRepr};

use crate::conf::Config;
use crate::listener;
use crate::util;

pub mod directories;
pub mod files;
pub mod groups;
pub mod maps;
pub mod playlists;
pub mod query;
pub mod queue;
pub mod schema;
pub mod speakers;
pub mod spotify;
pub mod upgrade;
pub mod watch;

/// Rating range stored in `files.rating`.
pub const RATING_MAX: u32 = 100;

/// Magic id for queue items that do not reference a row in `files`.
pub const NON_PERSISTENT_ID: u32 = 9999999;

/// `disabled` value for rows disabled by something that was not an inotify
/// event. Real rename cookies are 32 bits, so this can never collide.
pub const DISABLED_FAKE_COOKIE: i64 = 1 << 32;

pub mod admin_keys {
    pub const SCHEMA_VERSION_MAJOR: &str = "schema_version_major";
    pub const SCHEMA_VERSION_MINOR: &str = "schema_version_minor";
    pub const QUEUE_VERSION: &str = "queue_version";
    pub const DB_UPDATE: &str = "db_update";
    pub const DB_MODIFIED: &str = "db_modified";
    pub const START_TIME: &str = "start_time";
    pub const LASTFM_SESSION_KEY: &str = "lastfm_sk";
    pub const SPOTIFY_REFRESH_TOKEN: &str = "spotify_refresh_token";
    pub const LISTENBRAINZ_TOKEN: &str = "listenbrainz_token";
}

/// Which kind of data a library item points at.
#[derive(Debug, Default, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum DataKind {
    #[default]
    File = 0,
    /// network stream (radio)
    Http = 1,
    Spotify = 2,
    Pipe = 3,
}

/// Media classification, same values as the remotes expect.
#[derive(Debug, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum MediaKind {
    Music = 1,
    Movie = 2,
    Podcast = 4,
    Audiobook = 8,
    Musicvideo = 32,
    Tvshow = 64,
}

/// Which library source owns a row. Scopes purges and rescans.
#[derive(Debug, Default, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum ScanKind {
    #[default]
    Unknown = 0,
    Files = 1,
    Spotify = 2,
    Rss = 3,
}

#[derive(Debug, Default, Display, EnumString, FromRepr, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum PlType {
    Special = 0,
    Folder = 1,
    Smart = 2,
    #[default]
    Plain = 3,
    Rss = 4,
}

/// User marked status on a track, bitwise enumerable.
pub mod usermark {
    pub const NA: u32 = 0;
    pub const DELETE: u32 = 1;
    pub const REXCODE: u32 = 2;
    pub const REVIEW: u32 = 4;
}

/// Whether disable operations should strip the parent path off the stored
/// path, so a later enable-by-cookie can prepend the new parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strip {
    None,
    Path,
}

pub struct Db {
    pub(crate) conn: Connection,
    pub(crate) cfg: Arc<Config>,
    in_txn: Cell<bool>,
}

impl Db {
    /// Open (and if needed create or upgrade) the catalog database.
    pub fn open(cfg: Arc<Config>) -> Result<Db> {
        let path = cfg.db_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err("Could not create database directory")
                .with_note(|| format!("path: {parent}"))?;
        }
        let conn = Connection::open(&path)
            .wrap_err("Could not open database")
            .with_note(|| format!("path: {path}"))?;

        Self::from_connection(conn, cfg)
    }

    pub(crate) fn from_connection(conn: Connection, cfg: Arc<Config>) -> Result<Db> {
        conn.busy_timeout(Duration::from_secs(30))?;
        register_extensions(&conn)?;
        apply_pragmas(&conn, &cfg)?;

        let db = Db {
            conn,
            cfg,
            in_txn: Cell::new(false),
        };

        schema::init(&db)?;
        db.admin_set_int64(admin_keys::START_TIME, util::now_secs())?;

        Ok(db)
    }

    /// In-memory handle with a fresh schema, for tests.
    #[cfg(test)]
    pub fn open_test() -> Db {
        let conn = Connection::open_in_memory().unwrap();
        Self::from_connection(conn, Arc::new(Config::default())).unwrap()
    }

    // ------------------------------ Transactions -----------------------------

    pub fn transaction_begin(&self) -> Result<()> {
        debug_assert!(!self.in_txn.get(), "transactions must not nest");
        self.conn
            .execute_batch("BEGIN TRANSACTION;")
            .wrap_err("Could not begin transaction")?;
        self.in_txn.set(true);
        Ok(())
    }

    pub fn transaction_end(&self) -> Result<()> {
        self.in_txn.set(false);
        self.conn
            .execute_batch("END TRANSACTION;")
            .wrap_err("Could not end transaction")
    }

    pub fn transaction_rollback(&self) -> Result<()> {
        self.in_txn.set(false);
        self.conn
            .execute_batch("ROLLBACK TRANSACTION;")
            .wrap_err("Could not rollback transaction")
    }

    /// Run `f` inside a transaction, rolling back if it errors.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        self.transaction_begin()?;
        match f(self) {
            Ok(v) => {
                self.transaction_end()?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback) = self.transaction_rollback() {
                    tracing::error!("Rollback failed after error: {rollback:#}");
                }
                Err(e)
            }
        }
    }

    // --------------------------------- Helpers -------------------------------

    /// Run a single statement, returning the number of changed rows. Errors
    /// are logged here, callers own any surrounding transaction.
    pub fn query_run(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql).inspect_err(|e| {
            tracing::error!("Could not prepare '{sql}': {e}");
        })?;
        stmt.execute(params)
            .inspect_err(|e| tracing::error!("Error running '{sql}': {e}"))
            .wrap_err("Query failed")
    }

    /// One integer out of a query, `None` when there is no row.
    pub fn get_one_int(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<i64>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let value = stmt
            .query_row(params, |row| row.get::<_, i64>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value)
    }

    // ---------------------------------- Admin --------------------------------

    pub fn admin_set(&self, key: &str, value: &str) -> Result<()> {
        self.query_run(
            "INSERT OR REPLACE INTO admin (key, value) VALUES (?1, ?2);",
            (key, value),
        )?;
        Ok(())
    }

    pub fn admin_set_int(&self, key: &str, value: i32) -> Result<()> {
        self.admin_set(key, &value.to_string())
    }

    pub fn admin_set_int64(&self, key: &str, value: i64) -> Result<()> {
        self.admin_set(key, &value.to_string())
    }

    pub fn admin_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM admin a WHERE a.key = ?1;")?;
        let value = stmt
            .query_row((key,), |row| row.get::<_, String>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value)
    }

    pub fn admin_get_int(&self, key: &str) -> Result<Option<i32>> {
        Ok(self.admin_get(key)?.map(|v| util::parse_or_zero(&v)))
    }

    pub fn admin_get_int64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.admin_get(key)?.map(|v| util::parse_or_zero(&v)))
    }

    pub fn admin_delete(&self, key: &str) -> Result<()> {
        self.query_run("DELETE FROM admin WHERE key = ?1;", (key,))?;
        Ok(())
    }

    // ------------------------------- Maintenance ------------------------------

    /// Post-scan hygiene, currently just ANALYZE so the query planner keeps up
    /// with the new table sizes.
    pub fn hook_post_scan(&self) -> Result<()> {
        tracing::debug!("Running post scan ANALYZE");
        self.conn.execute_batch("ANALYZE;")?;
        Ok(())
    }

    /// Delete every row whose `db_timestamp` predates `ref_time`: playlist
    /// items first (by playlist, then by file), then playlists, files and
    /// non-reserved directories. One transaction.
    pub fn purge_cruft(&self, ref_time: i64) -> Result<()> {
        self.purge_cruft_impl(ref_time, None)
    }

    /// Same as [`Db::purge_cruft`] but only rows owned by `scan_kind`.
    pub fn purge_cruft_bysource(&self, ref_time: i64, scan_kind: ScanKind) -> Result<()> {
        self.purge_cruft_impl(ref_time, Some(scan_kind))
    }

    fn purge_cruft_impl(&self, ref_time: i64, scan_kind: Option<ScanKind>) -> Result<()> {
        let scan_filter = match scan_kind {
            Some(kind) => format!("AND scan_kind = {}", kind as u32),
            None => String::new(),
        };
        let special = PlType::Special as u32;
        let dir_max = directories::DIR_MAX;

        let queries = [
            format!(
                "DELETE FROM playlistitems WHERE playlistid IN \
                 (SELECT p.id FROM playlists p WHERE p.type <> {special} AND p.db_timestamp < {ref_time} {scan_filter});"
            ),
            format!(
                "DELETE FROM playlistitems WHERE filepath IN \
                 (SELECT f.path FROM files f WHERE f.db_timestamp < {ref_time} {scan_filter});"
            ),
            format!(
                "DELETE FROM playlists WHERE type <> {special} AND db_timestamp < {ref_time} {scan_filter};"
            ),
            format!("DELETE FROM files WHERE db_timestamp < {ref_time} {scan_filter};"),
            format!(
                "DELETE FROM directories WHERE id >= {dir_max} AND db_timestamp < {ref_time} {scan_filter};"
            ),
        ];

        self.with_transaction(|db| {
            for query in &queries {
                let purged = db.query_run(query, [])?;
                tracing::debug!("Purged {purged} rows");
            }
            Ok(())
        })?;
        listener::notify_event(listener::Event::Database);
        Ok(())
    }

    /// Wipe all library content (not the queue, not admin).
    pub fn purge_all(&self) -> Result<()> {
        let special = PlType::Special as u32;
        let dir_max = directories::DIR_MAX;
        for query in [
            "DELETE FROM inotify;".to_string(),
            "DELETE FROM playlistitems;".to_string(),
            "DELETE FROM files;".to_string(),
            "DELETE FROM groups;".to_string(),
            format!("DELETE FROM playlists WHERE type <> {special};"),
            format!("DELETE FROM directories WHERE id >= {dir_max};"),
        ] {
            let purged = self.query_run(&query, [])?;
            tracing::debug!("Purged {purged} rows");
        }
        Ok(())
    }

    /// Full online backup to `general.db_backup_path`, one step.
    pub fn backup(&self) -> Result<()> {
        let Some(backup_path) = self.cfg.general.db_backup_path.clone() else {
            tracing::info!("Backup not enabled, general.db_backup_path is unset");
            return Ok(());
        };
        let live_path = self.cfg.db_path()?;
        if backup_path == live_path {
            bail!("Backup path is the same as the live database path");
        }

        backup_to(&self.conn, &backup_path)
    }
}

fn backup_to(conn: &Connection, dest: &Utf8PathBuf) -> Result<()> {
    let mut target = Connection::open(dest)
        .wrap_err("Could not open backup database")
        .with_note(|| format!("path: {dest}"))?;
    let backup = rusqlite::backup::Backup::new(conn, &mut target)?;
    backup
        .run_to_completion(-1, Duration::from_millis(0), None)
        .wrap_err("Database backup failed")?;
    tracing::info!("Database backup to {dest} complete");
    Ok(())
}

/// The collation and scalar functions the schema and the update statements
/// rely on. Must be registered on every connection before anything else runs.
fn register_extensions(conn: &Connection) -> Result<()> {
    conn.create_collation("DAAP", |a, b| a.to_lowercase().cmp(&b.to_lowercase()))?;

    conn.create_scalar_function(
        "daap_no_zero",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_UTF8,
        |ctx| {
            let new: i64 = ctx.get::<Option<i64>>(0)?.unwrap_or(0);
            let old: i64 = ctx.get::<Option<i64>>(1)?.unwrap_or(0);
            Ok(if new != 0 { new } else { old })
        },
    )?;

    conn.create_scalar_function(
        "daap_songalbumid",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_UTF8,
        |ctx| {
            let a: Option<String> = ctx.get(0)?;
            let b: Option<String> = ctx.get(1)?;
            Ok(util::two_str_hash(a.as_deref(), b.as_deref()))
        },
    )?;

    Ok(())
}

fn apply_pragmas(conn: &Connection, cfg: &Config) -> Result<()> {
    if let Some(cache_size) = cfg.sqlite.pragma_cache_size_library {
        conn.pragma_update(None, "cache_size", cache_size)?;
    }
    if let Some(journal_mode) = &cfg.sqlite.pragma_journal_mode {
        conn.pragma_update(None, "journal_mode", journal_mode)?;
    }
    if let Some(synchronous) = cfg.sqlite.pragma_synchronous {
        conn.pragma_update(None, "synchronous", synchronous)?;
    }
    if let Some(mmap_size) = cfg.sqlite.pragma_mmap_size_library {
        conn.pragma_update(None, "mmap_size", mmap_size)?;
    }
    Ok(())
}

/// Escape a string for interpolation into a single-quoted SQL literal. Only
/// for the query fragments that are assembled as text; everything else binds
/// parameters.
pub fn sql_quote(s: &str) -> String {
    s.replace('\'', "''")
}
