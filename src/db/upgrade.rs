//! Ordered schema upgrades.
//!
//! The whole upgrade runs inside one transaction: indices and triggers are
//! dropped first, every step from the stored version up to the code version
//! runs in order, then indices and triggers are re-created. Any failure rolls
//! the lot back and the open fails.

use color_eyre::Result;
use color_eyre::eyre::Context;

use crate::db::{Db, admin_keys, directories, schema};
use crate::util;

struct UpgradeStep {
    major: i32,
    minor: i32,
    desc: &'static str,
    queries: &'static [&'static str],
    /// Data-rewriting routine, run after `queries`
    rewrite: Option<fn(&Db) -> Result<()>>,
}

/// v17 -> v18: virtual_path backfill and the per-source ownership columns.
static UPGRADE_V18: &[&str] = &[
    "ALTER TABLE files ADD COLUMN usermark INTEGER DEFAULT 0;",
    "ALTER TABLE files ADD COLUMN scan_kind INTEGER DEFAULT 0;",
    "ALTER TABLE files ADD COLUMN lyrics TEXT DEFAULT NULL;",
    "ALTER TABLE playlists ADD COLUMN scan_kind INTEGER DEFAULT 0;",
    "UPDATE files SET virtual_path = '/file:' || path \
     WHERE (virtual_path IS NULL OR virtual_path = '') AND data_kind = 0;",
    "UPDATE files SET virtual_path = '/http:/' || path \
     WHERE (virtual_path IS NULL OR virtual_path = '') AND data_kind = 1;",
    "UPDATE files SET virtual_path = '/spotify:/' || path \
     WHERE (virtual_path IS NULL OR virtual_path = '') AND data_kind = 2;",
    "UPDATE files SET scan_kind = 2 WHERE path LIKE 'spotify:%';",
    "UPDATE files SET scan_kind = 3 WHERE path IN \
     (SELECT pi.filepath FROM playlistitems pi JOIN playlists p ON pi.playlistid = p.id WHERE p.type = 4);",
    "UPDATE files SET scan_kind = 1 WHERE scan_kind = 0 AND data_kind IN (0, 3);",
    "UPDATE playlists SET scan_kind = 2 WHERE virtual_path LIKE '/spotify:%';",
    "UPDATE playlists SET scan_kind = 3 WHERE type = 4;",
    "UPDATE playlists SET scan_kind = 1 WHERE scan_kind = 0 AND type <> 0;",
];

/// v18 -> v19: introduce the directories tree. The files table is rebuilt so
/// `directory_id` sits at its mapped position, then the tree is synthesized
/// from every virtual path.
static UPGRADE_V19: &[&str] = &[
    "CREATE TABLE directories (
       id            INTEGER PRIMARY KEY NOT NULL,
       virtual_path  VARCHAR(4096) NOT NULL,
       path          VARCHAR(4096),
       db_timestamp  INTEGER DEFAULT 0,
       disabled      INTEGER DEFAULT 0,
       parent_id     INTEGER DEFAULT 0,
       scan_kind     INTEGER DEFAULT 0
     );",
];

/// v19 -> v20: queue gets rebuilt with the version column.
static UPGRADE_V20: &[&str] = &[
    "DROP TABLE IF EXISTS queue;",
    // Recreated from the current DDL by the rewrite fn; a dropped queue is
    // acceptable loss on this upgrade
];

/// v20 -> v21: extended multi-valued metadata.
static UPGRADE_V21: &[&str] = &[
    "CREATE TABLE files_metadata (
       file_id        INTEGER NOT NULL,
       songalbumid    INTEGER DEFAULT 0,
       songartistid   INTEGER DEFAULT 0,
       metadata_kind  INTEGER NOT NULL,
       idx            INTEGER NOT NULL,
       value          TEXT,
       UNIQUE(file_id, metadata_kind, idx)
     );",
];

/// v21 -> v22: group id backfill for rows scanned before hashing existed,
/// and a full groups registry rebuild.
static UPGRADE_V22: &[&str] = &[
    "UPDATE files SET songartistid = daap_songalbumid(album_artist, NULL) WHERE songartistid = 0;",
    "UPDATE files SET songalbumid = daap_songalbumid(album_artist, album) + data_kind WHERE songalbumid = 0;",
    "INSERT OR IGNORE INTO groups (type, name, persistentid) \
     SELECT DISTINCT 1, album, songalbumid FROM files;",
    "INSERT OR IGNORE INTO groups (type, name, persistentid) \
     SELECT DISTINCT 2, album_artist, songartistid FROM files;",
];

static STEPS: &[UpgradeStep] = &[
    UpgradeStep {
        major: 18,
        minor: 0,
        desc: "virtual paths and scan kinds",
        queries: UPGRADE_V18,
        rewrite: None,
    },
    UpgradeStep {
        major: 19,
        minor: 0,
        desc: "directory tree",
        queries: UPGRADE_V19,
        rewrite: Some(upgrade_v19_directories),
    },
    UpgradeStep {
        major: 20,
        minor: 0,
        desc: "versioned queue",
        queries: UPGRADE_V20,
        rewrite: Some(upgrade_v20_queue),
    },
    UpgradeStep {
        major: 21,
        minor: 0,
        desc: "files_metadata",
        queries: UPGRADE_V21,
        rewrite: None,
    },
    UpgradeStep {
        major: 22,
        minor: 0,
        desc: "group registry rebuild",
        queries: UPGRADE_V22,
        rewrite: None,
    },
];

pub fn run(db: &Db, from_major: i32, from_minor: i32) -> Result<()> {
    db.with_transaction(|db| {
        drop_indices(db)?;
        drop_triggers(db)?;

        for step in STEPS {
            if (step.major, step.minor) <= (from_major, from_minor) {
                continue;
            }
            tracing::info!(
                "Upgrading database to v{}.{:02} ({})",
                step.major,
                step.minor,
                step.desc
            );
            for query in step.queries {
                db.conn
                    .execute_batch(query)
                    .wrap_err_with(|| format!("Upgrade query failed: {query}"))?;
            }
            if let Some(rewrite) = step.rewrite {
                rewrite(db)?;
            }
            db.admin_set_int(admin_keys::SCHEMA_VERSION_MAJOR, step.major)?;
            db.admin_set_int(admin_keys::SCHEMA_VERSION_MINOR, step.minor)?;
        }

        for query in schema::CREATE_INDICES {
            db.conn.execute_batch(query)?;
        }
        for query in schema::CREATE_TRIGGERS {
            db.conn.execute_batch(query)?;
        }
        Ok(())
    })?;

    if db.cfg.sqlite.vacuum {
        tracing::info!("Vacuuming database after upgrade");
        db.conn.execute_batch("VACUUM;")?;
    }
    Ok(())
}

fn drop_indices(db: &Db) -> Result<()> {
    let names: Vec<String> = {
        let mut stmt = db.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%';",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    for name in names {
        db.conn.execute_batch(&format!("DROP INDEX {name};"))?;
    }
    Ok(())
}

fn drop_triggers(db: &Db) -> Result<()> {
    let names: Vec<String> = {
        let mut stmt = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'trigger';")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };
    for name in names {
        db.conn.execute_batch(&format!("DROP TRIGGER {name};"))?;
    }
    Ok(())
}

/// Rebuild `files` with `directory_id` in column position, seed the reserved
/// directories and synthesize a directory row chain for the parent of every
/// file's virtual path.
fn upgrade_v19_directories(db: &Db) -> Result<()> {
    // The v18 files table lacks directory_id in the middle of the column
    // sequence, so a plain ALTER would leave the row shape out of sync with
    // the column map. Dump into a correctly shaped table instead.
    db.conn.execute_batch(
        "ALTER TABLE files RENAME TO files_v18;",
    )?;
    let create_files = schema::CREATE_TABLES
        .iter()
        .find(|q| q.contains("CREATE TABLE IF NOT EXISTS files ("))
        .expect("files DDL present");
    db.conn.execute_batch(create_files)?;
    db.conn.execute_batch(
        "INSERT INTO files SELECT \
           id, path, virtual_path, fname, 0, title, artist, album, album_artist, genre, comment, \
           type, composer, orchestra, conductor, grouping, url, bitrate, samplerate, song_length, \
           file_size, year, date_released, track, total_tracks, disc, total_discs, bpm, compilation, \
           artwork, rating, play_count, skip_count, seek, data_kind, media_kind, item_kind, \
           description, db_timestamp, time_added, time_modified, time_played, time_skipped, \
           disabled, sample_count, codectype, idx, has_video, contentrating, bits_per_sample, \
           tv_series_name, tv_episode_num_str, tv_network_name, tv_episode_sort, tv_season_num, \
           songartistid, songalbumid, title_sort, artist_sort, album_sort, album_artist_sort, \
           composer_sort, channels, usermark, scan_kind, lyrics \
         FROM files_v18;",
    )?;
    db.conn.execute_batch("DROP TABLE files_v18;")?;

    schema::insert_reserved_rows(db)?;

    let vpaths: Vec<String> = {
        let mut stmt = db.conn.prepare(
            "SELECT DISTINCT virtual_path FROM files WHERE virtual_path IS NOT NULL;",
        )?;
        let vpaths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        vpaths
    };

    for vpath in vpaths {
        let Some((parent, _fname)) = vpath.rsplit_once('/') else {
            continue;
        };
        let directory_id = ensure_directory_chain(db, parent)?;
        db.query_run(
            "UPDATE files SET directory_id = ?1 WHERE virtual_path = ?2;",
            (directory_id, &vpath),
        )?;
    }
    Ok(())
}

/// Insert (if missing) the directory row for `vpath` and all its ancestors,
/// returning its id.
fn ensure_directory_chain(db: &Db, vpath: &str) -> Result<u32> {
    match vpath {
        "" | "/" => return Ok(directories::DIR_ROOT),
        "/file:" => return Ok(directories::DIR_FILE),
        "/http:" => return Ok(directories::DIR_HTTP),
        "/spotify:" => return Ok(directories::DIR_SPOTIFY),
        _ => {}
    }

    if let Some(id) = db.directory_id_byvirtualpath(vpath)? {
        return Ok(id);
    }

    let parent_id = match vpath.rsplit_once('/') {
        Some((parent, _)) => ensure_directory_chain(db, parent)?,
        None => directories::DIR_ROOT,
    };

    let path = vpath.strip_prefix("/file:").map(str::to_owned);
    db.query_run(
        "INSERT INTO directories (virtual_path, path, db_timestamp, disabled, parent_id, scan_kind) \
         VALUES (?1, ?2, ?3, 0, ?4, 1);",
        (vpath, path, util::now_secs(), parent_id),
    )?;
    Ok(db.conn.last_insert_rowid() as u32)
}

/// Recreate the queue at its current shape. Queue contents do not survive
/// this upgrade.
fn upgrade_v20_queue(db: &Db) -> Result<()> {
    let create_queue = schema::CREATE_TABLES
        .iter()
        .find(|q| q.contains("CREATE TABLE IF NOT EXISTS queue ("))
        .expect("queue DDL present");
    db.conn.execute_batch(create_queue)?;
    db.admin_set_int64(admin_keys::QUEUE_VERSION, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rusqlite::Connection;

    use super::*;
    use crate::conf::Config;
    use crate::db::schema::{CODE_MAJOR, CODE_MINOR};

    /// A database the way a v17 build would have left it: no directories, no
    /// files_metadata, no scan_kind/usermark/lyrics, an unversioned queue.
    fn v17_database() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE admin (key VARCHAR(32) PRIMARY KEY NOT NULL, value VARCHAR(32) NOT NULL);
             CREATE TABLE files (
               id INTEGER PRIMARY KEY NOT NULL, path VARCHAR(4096) NOT NULL,
               virtual_path VARCHAR(4096) DEFAULT NULL, fname VARCHAR(255) NOT NULL,
               title VARCHAR(1024), artist VARCHAR(1024), album VARCHAR(1024),
               album_artist VARCHAR(1024), genre VARCHAR(255), comment VARCHAR(4096),
               type VARCHAR(255), composer VARCHAR(1024), orchestra VARCHAR(1024),
               conductor VARCHAR(1024), grouping VARCHAR(1024), url VARCHAR(1024),
               bitrate INTEGER DEFAULT 0, samplerate INTEGER DEFAULT 0,
               song_length INTEGER DEFAULT 0, file_size INTEGER DEFAULT 0,
               year INTEGER DEFAULT 0, date_released INTEGER DEFAULT 0,
               track INTEGER DEFAULT 0, total_tracks INTEGER DEFAULT 0,
               disc INTEGER DEFAULT 0, total_discs INTEGER DEFAULT 0, bpm INTEGER DEFAULT 0,
               compilation INTEGER DEFAULT 0, artwork INTEGER DEFAULT 0,
               rating INTEGER DEFAULT 0, play_count INTEGER DEFAULT 0,
               skip_count INTEGER DEFAULT 0, seek INTEGER DEFAULT 0,
               data_kind INTEGER DEFAULT 0, media_kind INTEGER DEFAULT 0,
               item_kind INTEGER DEFAULT 0, description VARCHAR(4096),
               db_timestamp INTEGER DEFAULT 0, time_added INTEGER DEFAULT 0,
               time_modified INTEGER DEFAULT 0, time_played INTEGER DEFAULT 0,
               time_skipped INTEGER DEFAULT 0, disabled INTEGER DEFAULT 0,
               sample_count INTEGER DEFAULT 0, codectype VARCHAR(5), idx INTEGER DEFAULT 0,
               has_video INTEGER DEFAULT 0, contentrating INTEGER DEFAULT 0,
               bits_per_sample INTEGER DEFAULT 0, tv_series_name VARCHAR(1024),
               tv_episode_num_str VARCHAR(1024), tv_network_name VARCHAR(1024),
               tv_episode_sort INTEGER DEFAULT 0, tv_season_num INTEGER DEFAULT 0,
               songartistid INTEGER DEFAULT 0, songalbumid INTEGER DEFAULT 0,
               title_sort VARCHAR(1024), artist_sort VARCHAR(1024), album_sort VARCHAR(1024),
               album_artist_sort VARCHAR(1024), composer_sort VARCHAR(1024),
               channels INTEGER DEFAULT 0
             );
             CREATE TABLE playlists (
               id INTEGER PRIMARY KEY NOT NULL, title VARCHAR(255) NOT NULL, type INTEGER NOT NULL,
               query VARCHAR(1024), db_timestamp INTEGER NOT NULL, disabled INTEGER DEFAULT 0,
               path VARCHAR(4096), idx INTEGER NOT NULL, special_id INTEGER DEFAULT 0,
               virtual_path VARCHAR(4096), parent_id INTEGER DEFAULT 0,
               directory_id INTEGER DEFAULT 0, query_order VARCHAR(1024),
               query_limit INTEGER DEFAULT 0, media_kind INTEGER DEFAULT 1,
               artwork_url VARCHAR(4096)
             );
             CREATE TABLE playlistitems (
               id INTEGER PRIMARY KEY NOT NULL, playlistid INTEGER NOT NULL,
               filepath VARCHAR(4096) NOT NULL
             );
             CREATE TABLE groups (
               id INTEGER PRIMARY KEY NOT NULL, type INTEGER NOT NULL,
               name VARCHAR(1024) NOT NULL, persistentid INTEGER NOT NULL,
               UNIQUE(type, persistentid)
             );
             CREATE TABLE inotify (wd INTEGER PRIMARY KEY NOT NULL, cookie INTEGER NOT NULL, path VARCHAR(4096) NOT NULL);
             CREATE TABLE pairings (remote VARCHAR(64) PRIMARY KEY NOT NULL, name VARCHAR(255) NOT NULL, guid VARCHAR(16) NOT NULL);
             CREATE TABLE speakers (id INTEGER PRIMARY KEY NOT NULL, selected INTEGER NOT NULL, volume INTEGER NOT NULL, name VARCHAR(255), auth_key VARCHAR(2048), format INTEGER DEFAULT 0);
             CREATE TABLE queue (
               id INTEGER PRIMARY KEY AUTOINCREMENT, file_id INTEGER NOT NULL,
               pos INTEGER NOT NULL, shuffle_pos INTEGER NOT NULL, path VARCHAR(4096) NOT NULL
             );
             INSERT INTO admin (key, value) VALUES ('schema_version_major', '17');
             INSERT INTO admin (key, value) VALUES ('schema_version_minor', '0');
             INSERT INTO files (path, virtual_path, fname, title, artist, album, album_artist, data_kind, db_timestamp)
               VALUES ('/m/album/a.mp3', NULL, 'a.mp3', 'Song A', 'A', 'X', 'A', 0, 1000);
             INSERT INTO files (path, virtual_path, fname, title, artist, album, album_artist, data_kind, db_timestamp)
               VALUES ('http://radio/1', NULL, '1', 'Radio', 'R', 'S', 'R', 1, 1000);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn v17_database_comes_up_to_date() {
        let conn = v17_database();
        let db = crate::db::Db::from_connection(conn, Arc::new(Config::default())).unwrap();

        assert_eq!(
            db.admin_get_int(admin_keys::SCHEMA_VERSION_MAJOR).unwrap(),
            Some(CODE_MAJOR)
        );
        assert_eq!(
            db.admin_get_int(admin_keys::SCHEMA_VERSION_MINOR).unwrap(),
            Some(CODE_MINOR)
        );

        // Reserved directories exist
        for (vpath, id) in [
            ("/", directories::DIR_ROOT),
            ("/file:", directories::DIR_FILE),
            ("/http:", directories::DIR_HTTP),
            ("/spotify:", directories::DIR_SPOTIFY),
        ] {
            assert_eq!(db.directory_id_byvirtualpath(vpath).unwrap(), Some(id));
        }

        // Every file has a namespaced virtual path and a directory
        let local = db.file_fetch_byid(1).unwrap().unwrap();
        assert_eq!(local.virtual_path.as_deref(), Some("/file:/m/album/a.mp3"));
        let album_dir = db
            .directory_id_byvirtualpath("/file:/m/album")
            .unwrap()
            .unwrap();
        assert_eq!(local.directory_id, album_dir);
        assert_eq!(local.scan_kind, crate::db::ScanKind::Files);

        let stream = db.file_fetch_byid(2).unwrap().unwrap();
        assert!(stream.virtual_path.as_deref().unwrap().starts_with("/http:/"));

        // Groups are populated for every file
        for mfi in [&local, &stream] {
            assert!(
                db.group_type_bypersistentid(mfi.songalbumid)
                    .unwrap()
                    .is_some()
            );
            assert!(
                db.group_type_bypersistentid(mfi.songartistid)
                    .unwrap()
                    .is_some()
            );
        }

        // The parent chain of the album directory reaches the reserved roots
        let children = db.directory_children(directories::DIR_FILE).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].virtual_path, "/file:/m");
    }

    #[test]
    fn too_new_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE admin (key VARCHAR(32) PRIMARY KEY NOT NULL, value VARCHAR(32) NOT NULL);
             INSERT INTO admin (key, value) VALUES ('schema_version_major', '99');
             INSERT INTO admin (key, value) VALUES ('schema_version_minor', '0');",
        )
        .unwrap();
        assert!(crate::db::Db::from_connection(conn, Arc::new(Config::default())).is_err());
    }

    #[test]
    fn too_old_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE admin (key VARCHAR(32) PRIMARY KEY NOT NULL, value VARCHAR(32) NOT NULL);
             INSERT INTO admin (key, value) VALUES ('schema_version_major', '15');
             INSERT INTO admin (key, value) VALUES ('schema_version_minor', '0');",
        )
        .unwrap();
        assert!(crate::db::Db::from_connection(conn, Arc::new(Config::default())).is_err());
    }
}
