//! Schema creation and version verification.
//!
//! A fresh database is created directly at the code version. Databases from
//! older builds are brought up by `upgrade`; anything newer than the code or
//! older than [`MIN_SUPPORTED_MAJOR`] is refused.

use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::db::maps;
use crate::db::{Db, admin_keys, files, playlists, queue, upgrade};
use crate::util;

pub const CODE_MAJOR: i32 = 22;
pub const CODE_MINOR: i32 = 0;
pub const MIN_SUPPORTED_MAJOR: i32 = 17;

/// Table DDL, column order mirroring the entity maps.
pub const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS admin (
       key   VARCHAR(32) PRIMARY KEY NOT NULL,
       value VARCHAR(32) NOT NULL
     );",
    "CREATE TABLE IF NOT EXISTS files (
       id                 INTEGER PRIMARY KEY NOT NULL,
       path               VARCHAR(4096) NOT NULL,
       virtual_path       VARCHAR(4096) DEFAULT NULL,
       fname              VARCHAR(255) NOT NULL,
       directory_id       INTEGER DEFAULT 0,
       title              VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       artist             VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       album              VARCHAR(1024) NOT NULL COLLATE DAAP,
       album_artist       VARCHAR(1024) NOT NULL COLLATE DAAP,
       genre              VARCHAR(255) DEFAULT NULL COLLATE DAAP,
       comment            VARCHAR(4096) DEFAULT NULL COLLATE DAAP,
       type               VARCHAR(255) DEFAULT NULL,
       composer           VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       orchestra          VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       conductor          VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       grouping           VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       url                VARCHAR(1024) DEFAULT NULL,
       bitrate            INTEGER DEFAULT 0,
       samplerate         INTEGER DEFAULT 0,
       song_length        INTEGER DEFAULT 0,
       file_size          INTEGER DEFAULT 0,
       year               INTEGER DEFAULT 0,
       date_released      INTEGER DEFAULT 0,
       track              INTEGER DEFAULT 0,
       total_tracks       INTEGER DEFAULT 0,
       disc               INTEGER DEFAULT 0,
       total_discs        INTEGER DEFAULT 0,
       bpm                INTEGER DEFAULT 0,
       compilation        INTEGER DEFAULT 0,
       artwork            INTEGER DEFAULT 0,
       rating             INTEGER DEFAULT 0,
       play_count         INTEGER DEFAULT 0,
       skip_count         INTEGER DEFAULT 0,
       seek               INTEGER DEFAULT 0,
       data_kind          INTEGER DEFAULT 0,
       media_kind         INTEGER DEFAULT 0,
       item_kind          INTEGER DEFAULT 0,
       description        VARCHAR(4096) DEFAULT NULL,
       db_timestamp       INTEGER DEFAULT 0,
       time_added         INTEGER DEFAULT 0,
       time_modified      INTEGER DEFAULT 0,
       time_played        INTEGER DEFAULT 0,
       time_skipped       INTEGER DEFAULT 0,
       disabled           INTEGER DEFAULT 0,
       sample_count       INTEGER DEFAULT 0,
       codectype          VARCHAR(5) DEFAULT NULL,
       idx                INTEGER NOT NULL DEFAULT 0,
       has_video          INTEGER DEFAULT 0,
       contentrating      INTEGER DEFAULT 0,
       bits_per_sample    INTEGER DEFAULT 0,
       tv_series_name     VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       tv_episode_num_str VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       tv_network_name    VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       tv_episode_sort    INTEGER NOT NULL DEFAULT 0,
       tv_season_num      INTEGER NOT NULL DEFAULT 0,
       songartistid       INTEGER DEFAULT 0,
       songalbumid        INTEGER DEFAULT 0,
       title_sort         VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       artist_sort        VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       album_sort         VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       album_artist_sort  VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       composer_sort      VARCHAR(1024) DEFAULT NULL COLLATE DAAP,
       channels           INTEGER DEFAULT 0,
       usermark           INTEGER DEFAULT 0,
       scan_kind          INTEGER DEFAULT 0,
       lyrics             TEXT DEFAULT NULL
     );",
    "CREATE TABLE IF NOT EXISTS playlists (
       id             INTEGER PRIMARY KEY NOT NULL,
       title          VARCHAR(255) NOT NULL COLLATE DAAP,
       type           INTEGER NOT NULL,
       query          VARCHAR(1024),
       db_timestamp   INTEGER NOT NULL,
       disabled       INTEGER DEFAULT 0,
       path           VARCHAR(4096),
       idx            INTEGER NOT NULL,
       special_id     INTEGER DEFAULT 0,
       virtual_path   VARCHAR(4096),
       parent_id      INTEGER DEFAULT 0,
       directory_id   INTEGER DEFAULT 0,
       query_order    VARCHAR(1024),
       query_limit    INTEGER DEFAULT 0,
       media_kind     INTEGER DEFAULT 1,
       artwork_url    VARCHAR(4096) DEFAULT NULL,
       scan_kind      INTEGER DEFAULT 0
     );",
    "CREATE TABLE IF NOT EXISTS playlistitems (
       id          INTEGER PRIMARY KEY NOT NULL,
       playlistid  INTEGER NOT NULL,
       filepath    VARCHAR(4096) NOT NULL
     );",
    "CREATE TABLE IF NOT EXISTS groups (
       id            INTEGER PRIMARY KEY NOT NULL,
       type          INTEGER NOT NULL,
       name          VARCHAR(1024) NOT NULL COLLATE DAAP,
       persistentid  INTEGER NOT NULL,
       UNIQUE(type, persistentid)
     );",
    "CREATE TABLE IF NOT EXISTS inotify (
       wd      INTEGER PRIMARY KEY NOT NULL,
       cookie  INTEGER NOT NULL,
       path    VARCHAR(4096) NOT NULL
     );",
    "CREATE TABLE IF NOT EXISTS pairings (
       remote  VARCHAR(64) PRIMARY KEY NOT NULL,
       name    VARCHAR(255) NOT NULL,
       guid    VARCHAR(16) NOT NULL
     );",
    "CREATE TABLE IF NOT EXISTS speakers (
       id        INTEGER PRIMARY KEY NOT NULL,
       selected  INTEGER NOT NULL,
       volume    INTEGER NOT NULL,
       name      VARCHAR(255) DEFAULT NULL,
       auth_key  VARCHAR(2048) DEFAULT NULL,
       format    INTEGER DEFAULT 0
     );",
    "CREATE TABLE IF NOT EXISTS directories (
       id            INTEGER PRIMARY KEY NOT NULL,
       virtual_path  VARCHAR(4096) NOT NULL,
       path          VARCHAR(4096),
       db_timestamp  INTEGER DEFAULT 0,
       disabled      INTEGER DEFAULT 0,
       parent_id     INTEGER DEFAULT 0,
       scan_kind     INTEGER DEFAULT 0
     );",
    "CREATE TABLE IF NOT EXISTS queue (
       id                 INTEGER PRIMARY KEY AUTOINCREMENT,
       file_id            INTEGER NOT NULL,
       pos                INTEGER NOT NULL,
       shuffle_pos        INTEGER NOT NULL,
       data_kind          INTEGER NOT NULL,
       media_kind         INTEGER NOT NULL,
       song_length        INTEGER NOT NULL,
       path               VARCHAR(4096) NOT NULL,
       virtual_path       VARCHAR(4096),
       title              VARCHAR(1024),
       artist             VARCHAR(1024),
       album_artist       VARCHAR(1024),
       album              VARCHAR(1024),
       genre              VARCHAR(255),
       songalbumid        INTEGER NOT NULL,
       time_modified      INTEGER DEFAULT 0,
       artist_sort        VARCHAR(1024),
       album_sort         VARCHAR(1024),
       album_artist_sort  VARCHAR(1024),
       year               INTEGER DEFAULT 0,
       track              INTEGER DEFAULT 0,
       disc               INTEGER DEFAULT 0,
       artwork_url        VARCHAR(4096),
       queue_version      INTEGER DEFAULT 0,
       composer           VARCHAR(1024),
       songartistid       INTEGER DEFAULT 0,
       type               VARCHAR(255),
       bitrate            INTEGER DEFAULT 0,
       samplerate         INTEGER DEFAULT 0,
       channels           INTEGER DEFAULT 0
     );",
    "CREATE TABLE IF NOT EXISTS files_metadata (
       file_id        INTEGER NOT NULL,
       songalbumid    INTEGER DEFAULT 0,
       songartistid   INTEGER DEFAULT 0,
       metadata_kind  INTEGER NOT NULL,
       idx            INTEGER NOT NULL,
       value          TEXT,
       UNIQUE(file_id, metadata_kind, idx)
     );",
];

/// All index names start with `idx_` so upgrades can drop them wholesale.
pub const CREATE_INDICES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_filepath ON files(path);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_vpath ON files(virtual_path);",
    "CREATE INDEX IF NOT EXISTS idx_fname ON files(fname);",
    "CREATE INDEX IF NOT EXISTS idx_titlesort ON files(title_sort);",
    "CREATE INDEX IF NOT EXISTS idx_artistsort ON files(artist_sort);",
    "CREATE INDEX IF NOT EXISTS idx_albumsort ON files(album_sort);",
    "CREATE INDEX IF NOT EXISTS idx_songartistid ON files(songartistid);",
    "CREATE INDEX IF NOT EXISTS idx_songalbumid ON files(songalbumid);",
    "CREATE INDEX IF NOT EXISTS idx_albumartist ON files(album_artist, album);",
    "CREATE INDEX IF NOT EXISTS idx_state ON files(disabled, media_kind);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_pl_path ON playlists(path, idx);",
    "CREATE INDEX IF NOT EXISTS idx_pl_disabled ON playlists(disabled, type);",
    "CREATE INDEX IF NOT EXISTS idx_playlistid ON playlistitems(playlistid, filepath);",
    "CREATE INDEX IF NOT EXISTS idx_pl_filepath ON playlistitems(filepath);",
    "CREATE INDEX IF NOT EXISTS idx_groups_persistentid ON groups(persistentid);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_dir_vpath ON directories(virtual_path);",
    "CREATE INDEX IF NOT EXISTS idx_dir_parent ON directories(parent_id);",
    "CREATE INDEX IF NOT EXISTS idx_queue_pos ON queue(pos);",
    "CREATE INDEX IF NOT EXISTS idx_queue_shufflepos ON queue(shuffle_pos);",
    "CREATE INDEX IF NOT EXISTS idx_files_metadata ON files_metadata(file_id, metadata_kind, idx);",
];

/// Triggers keep `groups` consistent with `files` on every insert/update.
pub const CREATE_TRIGGERS: &[&str] = &[
    "CREATE TRIGGER IF NOT EXISTS update_groups_new_file AFTER INSERT ON files FOR EACH ROW
     BEGIN
       INSERT OR IGNORE INTO groups (type, name, persistentid) VALUES (1, NEW.album, NEW.songalbumid);
       INSERT OR IGNORE INTO groups (type, name, persistentid) VALUES (2, NEW.album_artist, NEW.songartistid);
     END;",
    "CREATE TRIGGER IF NOT EXISTS update_groups_update_file AFTER UPDATE OF songalbumid, songartistid ON files FOR EACH ROW
     BEGIN
       INSERT OR IGNORE INTO groups (type, name, persistentid) VALUES (1, NEW.album, NEW.songalbumid);
       INSERT OR IGNORE INTO groups (type, name, persistentid) VALUES (2, NEW.album_artist, NEW.songartistid);
     END;",
];

pub fn init(db: &Db) -> Result<()> {
    let major = db.admin_get_int(admin_keys::SCHEMA_VERSION_MAJOR)?;
    let minor = db.admin_get_int(admin_keys::SCHEMA_VERSION_MINOR)?;

    match (major, minor) {
        (None, _) => {
            tracing::info!("Database is empty, creating tables");
            create(db)?;
        }
        (Some(major), _) if major > CODE_MAJOR => {
            bail!(
                "Database schema v{major} is newer than this build supports (v{CODE_MAJOR}), refusing to open"
            );
        }
        (Some(major), _) if major < MIN_SUPPORTED_MAJOR => {
            bail!(
                "Database schema v{major} is too old to upgrade (minimum is v{MIN_SUPPORTED_MAJOR})"
            );
        }
        (Some(major), minor) => {
            let minor = minor.unwrap_or(0);
            if (major, minor) < (CODE_MAJOR, CODE_MINOR) {
                tracing::info!(
                    "Database schema v{major}.{minor:02} will be upgraded to v{CODE_MAJOR}.{CODE_MINOR:02}"
                );
                upgrade::run(db, major, minor)?;
            }
        }
    }

    verify_maps(db)?;
    Ok(())
}

fn create(db: &Db) -> Result<()> {
    db.with_transaction(|db| {
        for query in CREATE_TABLES {
            db.conn.execute_batch(query)?;
        }
        for query in CREATE_INDICES {
            db.conn.execute_batch(query)?;
        }
        for query in CREATE_TRIGGERS {
            db.conn.execute_batch(query)?;
        }
        insert_reserved_rows(db)?;

        db.admin_set_int(admin_keys::SCHEMA_VERSION_MAJOR, CODE_MAJOR)?;
        db.admin_set_int(admin_keys::SCHEMA_VERSION_MINOR, CODE_MINOR)?;
        db.admin_set_int64(admin_keys::QUEUE_VERSION, 0)?;
        db.admin_set_int64(admin_keys::DB_UPDATE, util::now_secs())?;
        db.admin_set_int64(admin_keys::DB_MODIFIED, util::now_secs())?;
        Ok(())
    })
}

/// Reserved directories and the special (DAAP) playlists.
pub fn insert_reserved_rows(db: &Db) -> Result<()> {
    let now = util::now_secs();
    let dirs: &[(u32, &str, i64, u32)] = &[
        (super::directories::DIR_ROOT, "/", 0, 0),
        (super::directories::DIR_FILE, "/file:", 0, 1),
        (super::directories::DIR_HTTP, "/http:", 0, 1),
        // Spotify appears once the external source announces itself
        (
            super::directories::DIR_SPOTIFY,
            "/spotify:",
            super::DISABLED_FAKE_COOKIE,
            1,
        ),
    ];
    for (id, vpath, disabled, parent) in dirs {
        db.query_run(
            "INSERT OR IGNORE INTO directories (id, virtual_path, path, db_timestamp, disabled, parent_id, scan_kind) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, 0);",
            (id, vpath, now, disabled, parent),
        )?;
    }

    let playlists: &[(u32, &str, &str, u32)] = &[
        (1, "Library", "1 = 1", 0),
        (2, "Music", "f.media_kind = 1", 6),
        (3, "Movies", "f.media_kind = 2", 4),
        (4, "TV Shows", "f.media_kind = 64", 5),
        (5, "Podcasts", "f.media_kind = 4", 8),
        (6, "Audiobooks", "f.media_kind = 8", 7),
    ];
    for (id, title, query, special_id) in playlists {
        db.query_run(
            "INSERT OR IGNORE INTO playlists (id, title, type, query, db_timestamp, idx, special_id) \
             VALUES (?1, ?2, 0, ?3, ?4, 0, ?5);",
            (id, title, query, now, special_id),
        )?;
    }
    Ok(())
}

/// The column maps, the row structs and the tables must be the same sequence.
fn verify_maps(db: &Db) -> Result<()> {
    maps::assert_map_matches_table(db, "files", files::MFI_COLS, 0)?;
    maps::assert_map_matches_table(
        db,
        "playlists",
        playlists::PLI_COLS,
        playlists::PLI_DERIVED_COLS,
    )?;
    maps::assert_map_matches_table(db, "queue", queue::QI_COLS, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fresh_db_is_at_code_version() {
        let db = Db::open_test();
        assert_eq!(
            db.admin_get_int(admin_keys::SCHEMA_VERSION_MAJOR).unwrap(),
            Some(CODE_MAJOR)
        );
        assert_eq!(
            db.admin_get_int(admin_keys::SCHEMA_VERSION_MINOR).unwrap(),
            Some(CODE_MINOR)
        );
        assert_eq!(db.queue_version().unwrap(), 0);
    }

    #[test]
    fn special_playlists_are_seeded() {
        let db = Db::open_test();
        let pli = db.pl_fetch_byid(1).unwrap().unwrap();
        assert_eq!(pli.title.as_deref(), Some("Library"));
        assert_eq!(pli.pl_type, crate::db::PlType::Special);
    }

    #[test]
    fn reopen_is_idempotent() {
        // Two inits against the same schema must not conflict
        let db = Db::open_test();
        super::init(&db).unwrap();
        assert_eq!(
            db.admin_get_int(admin_keys::SCHEMA_VERSION_MAJOR).unwrap(),
            Some(CODE_MAJOR)
        );
    }
}
