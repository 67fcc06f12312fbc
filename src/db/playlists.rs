//! The `playlists` and `playlistitems` tables.

use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::conf;
use crate::db::maps::{self, Col, ColValue, Fixup, NO_BIND, col_int, col_text};
use crate::db::{Db, MediaKind, PlType, ScanKind, Strip};
use crate::util;

/// One row of `playlists` plus the derived item/stream counts.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Playlist {
    pub id: u32,
    pub title: Option<String>,
    pub pl_type: PlType,
    /// WHERE fragment for smart playlists
    pub query: Option<String>,
    pub db_timestamp: i64,
    pub disabled: i64,
    pub path: Option<String>,
    /// Index for paths carrying multiple playlists
    pub index: u32,
    /// iTunes marks certain playlists as special
    pub special_id: u32,
    pub virtual_path: Option<String>,
    pub parent_id: u32,
    pub directory_id: u32,
    /// ORDER BY fragment for smart playlists
    pub query_order: Option<String>,
    /// 0 = no limit
    pub query_limit: u32,
    pub media_kind: Option<MediaKind>,
    pub artwork_url: Option<String>,
    pub scan_kind: ScanKind,
    /// Derived by join, not persisted
    pub items: u32,
    /// Derived by join, not persisted
    pub streams: u32,
}

/// Column map for `playlists`. The two last entries are calculated fields,
/// so all retrieval goes through [`PL_SELECT`].
pub static PLI_COLS: &[Col<Playlist>] = &[
    col_int!(Playlist, "id", id, Fixup::Standard, NO_BIND),
    col_text!(Playlist, "title", title, Fixup::Title),
    Col::<Playlist> {
        name: "type",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.pl_type as i64),
        set: |r, v| r.pl_type = PlType::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    col_text!(Playlist, "query", query, Fixup::NoSanitize),
    col_int!(Playlist, "db_timestamp", db_timestamp),
    col_int!(Playlist, "disabled", disabled),
    col_text!(Playlist, "path", path, Fixup::NoSanitize),
    col_int!(Playlist, "idx", index),
    col_int!(Playlist, "special_id", special_id),
    col_text!(Playlist, "virtual_path", virtual_path, Fixup::NoSanitize),
    col_int!(Playlist, "parent_id", parent_id),
    col_int!(Playlist, "directory_id", directory_id),
    col_text!(Playlist, "query_order", query_order, Fixup::NoSanitize),
    col_int!(Playlist, "query_limit", query_limit),
    Col::<Playlist> {
        name: "media_kind",
        fixup: Fixup::MediaKind,
        flags: 0,
        get: |r| ColValue::Int(r.media_kind.map_or(0, |k| k as i64)),
        set: |r, v| r.media_kind = MediaKind::from_repr(v.as_int() as u32),
    },
    col_text!(Playlist, "artwork_url", artwork_url, Fixup::NoSanitize),
    Col::<Playlist> {
        name: "scan_kind",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.scan_kind as i64),
        set: |r, v| r.scan_kind = ScanKind::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    col_int!(Playlist, "items", items, Fixup::Standard, NO_BIND),
    col_int!(Playlist, "streams", streams, Fixup::Standard, NO_BIND),
];

/// Number of map entries that are not columns of the table.
pub const PLI_DERIVED_COLS: usize = 2;

/// The two last columns of [`Playlist`] are calculated, so every playlist
/// retrieval must use this query.
pub const PL_SELECT: &str = "SELECT f.*, COUNT(pi.id), SUM(pi.filepath NOT NULL AND pi.filepath LIKE 'http%') \
     FROM playlists f LEFT JOIN playlistitems pi ON (f.id = pi.playlistid)";

impl Playlist {
    pub fn fixup(&mut self, cfg: &conf::Library) {
        maps::fixup_tags(
            self,
            PLI_COLS,
            |rec, fx| rec.apply_default(fx, cfg),
            |_, _| {},
        );
    }

    fn apply_default(&mut self, fixup: Fixup, cfg: &conf::Library) {
        match fixup {
            Fixup::Title => {
                if self.title.is_none() {
                    self.title = match &self.path {
                        Some(path) => Some(path.clone()),
                        None => Some(cfg.name_unknown_title.clone()),
                    };
                }
            }
            Fixup::MediaKind => {
                if self.media_kind.is_none() {
                    self.media_kind = Some(MediaKind::Music);
                }
            }
            _ => {}
        }
    }
}

impl Db {
    pub fn pl_get_count(&self) -> Result<u32> {
        Ok(self
            .get_one_int("SELECT COUNT(*) FROM playlists p WHERE p.disabled = 0;", [])?
            .unwrap_or(0) as u32)
    }

    pub fn pl_ping(&self, id: u32) -> Result<()> {
        self.query_run(
            "UPDATE playlists SET db_timestamp = ?1 WHERE id = ?2;",
            (util::now_secs(), id),
        )?;
        Ok(())
    }

    pub fn pl_ping_bymatch(&self, path: &str, isdir: bool) -> Result<()> {
        let pattern = if isdir {
            format!("{path}/%")
        } else {
            format!("{path}%")
        };
        self.query_run(
            "UPDATE playlists SET db_timestamp = ?1 WHERE path LIKE ?2;",
            (util::now_secs(), pattern),
        )?;
        Ok(())
    }

    /// Ping the files of playlist `id` that live under `path`, so a feed or
    /// playlist refresh keeps its items alive past the next purge.
    pub fn pl_ping_items_bymatch(&self, path: &str, id: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET db_timestamp = ?1 WHERE path LIKE ?2 || '%' AND path IN \
             (SELECT filepath FROM playlistitems WHERE playlistid = ?3);",
            (util::now_secs(), path, id),
        )?;
        Ok(())
    }

    pub fn pl_id_bypath(&self, path: &str) -> Result<Option<u32>> {
        Ok(self
            .get_one_int("SELECT p.id FROM playlists p WHERE p.path = ?1;", (path,))?
            .map(|id| id as u32))
    }

    pub fn pl_fetch_byid(&self, id: u32) -> Result<Option<Playlist>> {
        self.pl_fetch(&format!("{PL_SELECT} WHERE f.id = ?1 GROUP BY f.id;"), (id,))
    }

    pub fn pl_fetch_bypath(&self, path: &str) -> Result<Option<Playlist>> {
        self.pl_fetch(&format!("{PL_SELECT} WHERE f.path = ?1 GROUP BY f.id;"), (path,))
    }

    pub fn pl_fetch_byvirtualpath(&self, virtual_path: &str) -> Result<Option<Playlist>> {
        self.pl_fetch(
            &format!("{PL_SELECT} WHERE f.virtual_path = ?1 GROUP BY f.id;"),
            (virtual_path,),
        )
    }

    pub fn pl_fetch_bytitlepath(&self, title: &str, path: &str) -> Result<Option<Playlist>> {
        self.pl_fetch(
            &format!("{PL_SELECT} WHERE f.title = ?1 AND f.path = ?2 GROUP BY f.id;"),
            (title, path),
        )
    }

    fn pl_fetch(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Playlist>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => {
                let pli: Playlist = maps::record_from_row(row, PLI_COLS)?;
                // The LEFT JOIN yields a row of NULLs for a missing id
                if pli.id == 0 {
                    return Ok(None);
                }
                Ok(Some(pli))
            }
            None => Ok(None),
        }
    }

    pub fn pl_add(&self, pli: &mut Playlist) -> Result<u32> {
        if pli.id != 0 {
            bail!("Adding playlist with non-zero id {}", pli.id);
        }
        if pli.db_timestamp == 0 {
            pli.db_timestamp = util::now_secs();
        }
        pli.fixup(&self.cfg.library);

        let sql = maps::insert_sql("playlists", PLI_COLS);
        let values = maps::bind_values(pli, PLI_COLS, None);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))?;

        pli.id = self.conn.last_insert_rowid() as u32;
        Ok(pli.id)
    }

    pub fn pl_update(&self, pli: &mut Playlist) -> Result<()> {
        if pli.id == 0 {
            bail!("Playlist update called with id 0");
        }
        pli.db_timestamp = util::now_secs();
        pli.fixup(&self.cfg.library);

        let sql = maps::update_sql("playlists", PLI_COLS);
        let values = maps::bind_values(pli, PLI_COLS, Some(pli.id as i64));
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))?;
        Ok(())
    }

    /// Append an item. The file does not have to be scanned yet; orphaned
    /// items are removed by purge.
    pub fn pl_add_item_bypath(&self, plid: u32, path: &str) -> Result<()> {
        self.query_run(
            "INSERT INTO playlistitems (playlistid, filepath) VALUES (?1, ?2);",
            (plid, path),
        )?;
        Ok(())
    }

    pub fn pl_add_item_byid(&self, plid: u32, file_id: u32) -> Result<()> {
        let changes = self.query_run(
            "INSERT INTO playlistitems (playlistid, filepath) \
             SELECT ?1, f.path FROM files f WHERE f.id = ?2;",
            (plid, file_id),
        )?;
        if changes == 0 {
            bail!("Cannot add file id {file_id} to playlist, no such file");
        }
        Ok(())
    }

    pub fn pl_clear_items(&self, id: u32) -> Result<()> {
        self.query_run("DELETE FROM playlistitems WHERE playlistid = ?1;", (id,))?;
        Ok(())
    }

    pub fn pl_delete(&self, id: u32) -> Result<()> {
        self.with_transaction(|db| {
            db.query_run("DELETE FROM playlists WHERE id = ?1;", (id,))?;
            db.pl_clear_items(id)
        })
    }

    pub fn pl_delete_bypath(&self, path: &str) -> Result<()> {
        let Some(id) = self.pl_id_bypath(path)? else {
            return Ok(());
        };
        self.pl_delete(id)
    }

    pub fn pl_disable_bypath(&self, path: &str, strip: Strip, cookie: i64) -> Result<()> {
        let prefix = match path.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        };
        let striplen = match strip {
            Strip::Path => prefix.len() as i64 + 1,
            Strip::None => 1,
        };
        let vpath_striplen = if striplen == 1 { 1 } else { striplen + 6 };
        self.query_run(
            "UPDATE playlists SET path = SUBSTR(path, ?1), virtual_path = SUBSTR(virtual_path, ?2), \
             disabled = ?3 WHERE path = ?4;",
            (striplen, vpath_striplen, cookie, path),
        )?;
        Ok(())
    }

    pub fn pl_disable_bymatch(&self, path: &str, strip: Strip, cookie: i64) -> Result<()> {
        let striplen = match strip {
            Strip::Path => path.len() as i64 + 1,
            Strip::None => 1,
        };
        let vpath_striplen = if striplen == 1 { 1 } else { striplen + 6 };
        self.query_run(
            "UPDATE playlists SET path = SUBSTR(path, ?1), virtual_path = SUBSTR(virtual_path, ?2), \
             disabled = ?3 WHERE path LIKE ?4 || '/%';",
            (striplen, vpath_striplen, cookie, path),
        )?;
        Ok(())
    }

    pub fn pl_enable_bycookie(&self, cookie: u32, path: &str) -> Result<usize> {
        self.query_run(
            "UPDATE playlists SET path = ?1 || path, virtual_path = '/file:' || ?1 || virtual_path, \
             disabled = 0 WHERE disabled = ?2;",
            (path, cookie as i64),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::files::tests::sample_mfi;

    pub(crate) fn sample_playlist(path: &str, pl_type: PlType) -> Playlist {
        Playlist {
            title: Some(format!("List {path}")),
            pl_type,
            path: Some(path.to_string()),
            virtual_path: Some(format!("/file:{path}")),
            directory_id: crate::db::directories::DIR_FILE,
            scan_kind: ScanKind::Files,
            ..Default::default()
        }
    }

    #[test]
    fn add_fetch_roundtrip_with_counts() {
        let db = Db::open_test();
        let mut file = sample_mfi("/m/a.mp3", "A", "X");
        db.file_add(&mut file).unwrap();
        let mut stream = sample_mfi("http://radio/1", "R", "S");
        db.file_add(&mut stream).unwrap();

        let mut pli = sample_playlist("/m/lists/p.m3u", PlType::Plain);
        let id = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(id, "/m/a.mp3").unwrap();
        db.pl_add_item_bypath(id, "http://radio/1").unwrap();

        let fetched = db.pl_fetch_byid(id).unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("List /m/lists/p.m3u"));
        assert_eq!(fetched.items, 2);
        assert_eq!(fetched.streams, 1);
        assert_eq!(db.pl_get_count().unwrap(), 1);
    }

    #[test]
    fn fetch_missing_returns_none() {
        let db = Db::open_test();
        assert_eq!(db.pl_fetch_byid(4711).unwrap(), None);
    }

    #[test]
    fn delete_removes_items_too() {
        let db = Db::open_test();
        let mut pli = sample_playlist("/m/lists/q.m3u", PlType::Plain);
        let id = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(id, "/m/a.mp3").unwrap();

        db.pl_delete(id).unwrap();
        let orphans = db
            .get_one_int(
                "SELECT COUNT(*) FROM playlistitems WHERE playlistid = ?1;",
                (id,),
            )
            .unwrap();
        assert_eq!(orphans, Some(0));
    }

    #[test]
    fn add_item_byid_requires_existing_file() {
        let db = Db::open_test();
        let mut pli = sample_playlist("/m/lists/r.m3u", PlType::Plain);
        let id = db.pl_add(&mut pli).unwrap();
        assert!(db.pl_add_item_byid(id, 98765).is_err());
    }

    #[test]
    fn ping_items_keeps_feed_items_alive() {
        let db = Db::open_test();
        let mut episode = sample_mfi("http://feed/ep1", "A", "Cast");
        episode.db_timestamp = 100;
        db.file_add(&mut episode).unwrap();

        let mut pli = sample_playlist("http://feed", PlType::Rss);
        let id = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(id, "http://feed/ep1").unwrap();

        db.pl_ping_items_bymatch("http://feed", id).unwrap();
        db.purge_cruft(200).unwrap();
        assert!(db.file_id_bypath("http://feed/ep1").unwrap().is_some());
    }
}
