//! The persistent play queue.
//!
//! Every user-visible change happens inside a version-bearing transaction:
//! the new version is `admin.queue_version + 1`, all touched rows are stamped
//! with it, and on commit it becomes the new `admin.queue_version` and a
//! queue event is emitted. `pos` and `shuffle_pos` each always form a
//! contiguous 0-based permutation.

use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::db::files::MediaFile;
use crate::db::maps::{self, Col, ColValue, Fixup, NO_BIND, col_int, col_text, col_text_req};
use crate::db::query::QueryParams;
use crate::db::{DataKind, Db, MediaKind, NON_PERSISTENT_ID};
use crate::listener;
use crate::util;

/// One row of `queue`. Field order matches the table and [`QI_COLS`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueItem {
    /// Stable across moves; the same file queued twice gets two ids
    pub id: u32,
    /// Reference into `files`, or [`NON_PERSISTENT_ID`]
    pub file_id: u32,
    pub pos: u32,
    pub shuffle_pos: u32,
    pub data_kind: DataKind,
    pub media_kind: Option<MediaKind>,
    /// ms
    pub song_length: u32,
    pub path: String,
    pub virtual_path: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub songalbumid: i64,
    pub time_modified: i64,
    pub artist_sort: Option<String>,
    pub album_sort: Option<String>,
    pub album_artist_sort: Option<String>,
    pub year: u32,
    pub track: u32,
    pub disc: u32,
    pub artwork_url: Option<String>,
    pub queue_version: i64,
    pub composer: Option<String>,
    pub songartistid: i64,
    pub format: Option<String>,
    pub bitrate: u32,
    pub samplerate: u32,
    pub channels: u32,
}

/// Column map for `queue`. Keep in sync with the table DDL, the struct and
/// [`QueueItem::from_media_file`].
pub static QI_COLS: &[Col<QueueItem>] = &[
    col_int!(QueueItem, "id", id, Fixup::Standard, NO_BIND),
    col_int!(QueueItem, "file_id", file_id),
    col_int!(QueueItem, "pos", pos),
    col_int!(QueueItem, "shuffle_pos", shuffle_pos),
    Col::<QueueItem> {
        name: "data_kind",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.data_kind as i64),
        set: |r, v| r.data_kind = DataKind::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    Col::<QueueItem> {
        name: "media_kind",
        fixup: Fixup::MediaKind,
        flags: 0,
        get: |r| ColValue::Int(r.media_kind.map_or(0, |k| k as i64)),
        set: |r, v| r.media_kind = MediaKind::from_repr(v.as_int() as u32),
    },
    col_int!(QueueItem, "song_length", song_length),
    col_text_req!(QueueItem, "path", path, Fixup::NoSanitize),
    col_text!(QueueItem, "virtual_path", virtual_path, Fixup::NoSanitize),
    col_text!(QueueItem, "title", title, Fixup::Title),
    col_text!(QueueItem, "artist", artist, Fixup::Artist),
    col_text!(QueueItem, "album_artist", album_artist, Fixup::AlbumArtist),
    col_text!(QueueItem, "album", album, Fixup::Album),
    col_text!(QueueItem, "genre", genre, Fixup::Genre),
    col_int!(QueueItem, "songalbumid", songalbumid),
    col_int!(QueueItem, "time_modified", time_modified),
    col_text!(QueueItem, "artist_sort", artist_sort, Fixup::ArtistSort),
    col_text!(QueueItem, "album_sort", album_sort, Fixup::AlbumSort),
    col_text!(
        QueueItem,
        "album_artist_sort",
        album_artist_sort,
        Fixup::AlbumArtistSort
    ),
    col_int!(QueueItem, "year", year),
    col_int!(QueueItem, "track", track),
    col_int!(QueueItem, "disc", disc),
    col_text!(QueueItem, "artwork_url", artwork_url, Fixup::NoSanitize),
    col_int!(QueueItem, "queue_version", queue_version),
    col_text!(QueueItem, "composer", composer, Fixup::Composer),
    col_int!(QueueItem, "songartistid", songartistid),
    col_text!(QueueItem, "type", format, Fixup::Codectype),
    col_int!(QueueItem, "bitrate", bitrate),
    col_int!(QueueItem, "samplerate", samplerate),
    col_int!(QueueItem, "channels", channels),
];

impl QueueItem {
    /// Copy the queue-relevant descriptor subset out of a media file.
    pub fn from_media_file(mfi: &MediaFile) -> QueueItem {
        QueueItem {
            id: 0,
            file_id: if mfi.id != 0 { mfi.id } else { NON_PERSISTENT_ID },
            pos: 0,
            shuffle_pos: 0,
            data_kind: mfi.data_kind,
            media_kind: mfi.media_kind,
            song_length: mfi.song_length,
            path: mfi.path.clone(),
            virtual_path: mfi.virtual_path.clone(),
            title: mfi.title.clone(),
            artist: mfi.artist.clone(),
            album_artist: mfi.album_artist.clone(),
            album: mfi.album.clone(),
            genre: mfi.genre.clone(),
            songalbumid: mfi.songalbumid,
            time_modified: mfi.time_modified,
            artist_sort: mfi.artist_sort.clone(),
            album_sort: mfi.album_sort.clone(),
            album_artist_sort: mfi.album_artist_sort.clone(),
            year: mfi.year,
            track: mfi.track,
            disc: mfi.disc,
            artwork_url: None,
            queue_version: 0,
            composer: mfi.composer.clone(),
            songartistid: mfi.songartistid,
            format: mfi.format.clone(),
            bitrate: mfi.bitrate,
            samplerate: mfi.samplerate,
            channels: mfi.channels,
        }
    }

    /// Queue item fixup, same passes as media files but on the queue fields.
    pub fn fixup(&mut self, cfg: &crate::conf::Library) {
        maps::fixup_tags(
            self,
            QI_COLS,
            |rec, fx| rec.apply_default(fx, cfg),
            |rec, fx| rec.apply_sort_key(fx),
        );
    }

    fn apply_default(&mut self, fixup: Fixup, cfg: &crate::conf::Library) {
        match fixup {
            Fixup::Title => {
                if self.title.is_none() {
                    self.title = Some(if self.path.is_empty() {
                        cfg.name_unknown_title.clone()
                    } else {
                        self.path.clone()
                    });
                }
            }
            Fixup::Artist => {
                if self.artist.is_none() {
                    self.artist = Some(cfg.name_unknown_artist.clone());
                }
            }
            Fixup::Album => {
                if self.album.is_none() {
                    self.album = Some(cfg.name_unknown_album.clone());
                }
            }
            Fixup::AlbumArtist => {
                if self.album_artist.is_none() {
                    self.album_artist = match &self.artist {
                        Some(artist) => Some(artist.clone()),
                        None => Some(cfg.name_unknown_artist.clone()),
                    };
                }
            }
            Fixup::Genre => {
                if self.genre.is_none() {
                    self.genre = Some(cfg.name_unknown_genre.clone());
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

    fn apply_sort_key(&mut self, fixup: Fixup) {
        match fixup {
            Fixup::ArtistSort => {
                maps::sort_tag_create(&mut self.artist_sort, self.artist.as_deref())
            }
            Fixup::AlbumSort => maps::sort_tag_create(&mut self.album_sort, self.album.as_deref()),
            Fixup::AlbumArtistSort => {
                maps::sort_tag_create(&mut self.album_artist_sort, self.album_artist.as_deref())
            }
            _ => {}
        }
    }
}

/// Result of a mass add.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueAddResult {
    pub count: u32,
    /// Queue item id of the first added item, 0 if none
    pub new_item_id: u32,
}

/// State of a streaming add between `queue_add_start` and `queue_add_end`.
#[derive(Debug)]
pub struct QueueAdd {
    queue_version: i64,
    start_pos: u32,
    pos: u32,
    shuffle_pos: u32,
    pub count: u32,
    pub new_item_id: u32,
}

enum PosKind {
    Pos,
    ShufflePos,
}

impl PosKind {
    fn column(&self) -> &'static str {
        match self {
            PosKind::Pos => "pos",
            PosKind::ShufflePos => "shuffle_pos",
        }
    }
}

/// Outcome of a queue transaction closure: whether subscribers must refresh.
pub enum QueueTx<T> {
    Changed(T),
    Unchanged(T),
}

impl Db {
    /// The current queue version subscribers cache against.
    pub fn queue_version(&self) -> Result<i64> {
        Ok(self
            .admin_get_int64(super::admin_keys::QUEUE_VERSION)?
            .unwrap_or(0))
    }

    /// Run `f` inside a queue transaction. `f` receives the version that all
    /// its writes must stamp rows with; on `Changed` commit the version is
    /// published to `admin` and a queue event fires. On error everything is
    /// rolled back and the stored version stays put.
    pub fn queue_transaction<T>(
        &self,
        f: impl FnOnce(&Db, i64) -> Result<QueueTx<T>>,
    ) -> Result<T> {
        self.transaction_begin()?;
        let version = match self.queue_version() {
            Ok(v) => v + 1,
            Err(e) => {
                let _ = self.transaction_rollback();
                return Err(e);
            }
        };

        match f(self, version) {
            Ok(QueueTx::Changed(value)) => {
                self.admin_set_int64(super::admin_keys::QUEUE_VERSION, version)?;
                self.transaction_end()?;
                listener::notify_event(listener::Event::Queue);
                Ok(value)
            }
            Ok(QueueTx::Unchanged(value)) => {
                self.transaction_end()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.transaction_rollback() {
                    tracing::error!("Queue rollback failed: {rollback:#}");
                }
                Err(e)
            }
        }
    }

    /// Bump the queue version without changing any rows.
    pub fn queue_inc_version(&self) -> Result<()> {
        self.queue_transaction(|_, _| Ok(QueueTx::Changed(())))
    }

    pub fn queue_get_count(&self) -> Result<u32> {
        Ok(self
            .get_one_int("SELECT COUNT(*) FROM queue;", [])?
            .unwrap_or(0) as u32)
    }

    pub fn queue_get_pos(&self, item_id: u32, shuffle: bool) -> Result<Option<u32>> {
        let column = if shuffle { "shuffle_pos" } else { "pos" };
        Ok(self
            .get_one_int(
                &format!("SELECT {column} FROM queue WHERE id = ?1;"),
                (item_id,),
            )?
            .map(|pos| pos as u32))
    }

    // -------------------------------- Fetching -------------------------------

    /// All queue items, ordered by the requested position space.
    pub fn queue_fetch_all(&self, shuffle: bool) -> Result<Vec<QueueItem>> {
        let column = if shuffle { "shuffle_pos" } else { "pos" };
        self.queue_fetch_vec(
            &format!("SELECT * FROM queue f ORDER BY {column};"),
            [],
        )
    }

    pub fn queue_fetch_byitemid(&self, item_id: u32) -> Result<Option<QueueItem>> {
        self.queue_fetch_one("SELECT * FROM queue f WHERE f.id = ?1;", (item_id,))
    }

    pub fn queue_fetch_byfileid(&self, file_id: u32) -> Result<Option<QueueItem>> {
        self.queue_fetch_one("SELECT * FROM queue f WHERE f.file_id = ?1;", (file_id,))
    }

    pub fn queue_fetch_bypos(&self, pos: u32, shuffle: bool) -> Result<Option<QueueItem>> {
        let column = if shuffle { "shuffle_pos" } else { "pos" };
        self.queue_fetch_one(
            &format!("SELECT * FROM queue f WHERE f.{column} = ?1;"),
            (pos,),
        )
    }

    /// Fetch the item `pos_offset` positions relative to `item_id`.
    pub fn queue_fetch_byposrelativetoitem(
        &self,
        pos_offset: i32,
        item_id: u32,
        shuffle: bool,
    ) -> Result<Option<QueueItem>> {
        let Some(base_pos) = self.queue_get_pos(item_id, shuffle)? else {
            return Ok(None);
        };
        let target = base_pos as i64 + pos_offset as i64;
        if target < 0 {
            return Ok(None);
        }
        self.queue_fetch_bypos(target as u32, shuffle)
    }

    pub fn queue_fetch_next(&self, item_id: u32, shuffle: bool) -> Result<Option<QueueItem>> {
        self.queue_fetch_byposrelativetoitem(1, item_id, shuffle)
    }

    pub fn queue_fetch_prev(&self, item_id: u32, shuffle: bool) -> Result<Option<QueueItem>> {
        self.queue_fetch_byposrelativetoitem(-1, item_id, shuffle)
    }

    fn queue_fetch_one(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<QueueItem>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(maps::record_from_row(row, QI_COLS)?)),
            None => Ok(None),
        }
    }

    fn queue_fetch_vec(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(maps::record_from_row(row, QI_COLS)?);
        }
        Ok(items)
    }

    // --------------------------------- Adding --------------------------------

    /// Insert one fixed-up item. Caller owns the transaction and has set
    /// pos/shuffle_pos/queue_version.
    fn queue_item_insert(&self, qi: &mut QueueItem) -> Result<u32> {
        qi.fixup(&self.cfg.library);
        self.queue_item_insert_raw(qi)
    }

    /// Insert without fixup: used when the fields come straight out of the
    /// files table and are known to be well-formed.
    fn queue_item_insert_raw(&self, qi: &QueueItem) -> Result<u32> {
        let sql = maps::insert_sql("queue", QI_COLS);
        let values = maps::bind_values(qi, QI_COLS, None);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))?;
        let id = self.conn.last_insert_rowid() as u32;
        if id == 0 {
            bail!("Successful queue item insert but no insert rowid");
        }
        Ok(id)
    }

    /// Update a queue item's stored fields (metadata changes, stream title
    /// updates). Runs fixup and bumps the queue version.
    pub fn queue_item_update(&self, qi: &mut QueueItem) -> Result<()> {
        qi.fixup(&self.cfg.library);
        self.queue_transaction(|db, version| {
            qi.queue_version = version;
            let sql = maps::update_sql("queue", QI_COLS);
            let values = maps::bind_values(qi, QI_COLS, Some(qi.id as i64));
            let mut stmt = db.conn.prepare_cached(&sql)?;
            stmt.execute(rusqlite::params_from_iter(values))?;
            Ok(QueueTx::Changed(()))
        })
    }

    /// Add everything matching `qp` to the queue.
    ///
    /// With `position < 0` or past the end the items are appended; otherwise
    /// existing rows at `pos >= position` are shifted up to make room. With
    /// `reshuffle` (and no explicit position) the shuffle order is rebuilt
    /// from `base_item_id` afterwards.
    pub fn queue_add_by_query(
        &self,
        qp: &mut QueryParams,
        reshuffle: bool,
        base_item_id: u32,
        position: i32,
    ) -> Result<QueueAddResult> {
        self.queue_transaction(|db, version| {
            let files = db.query_files(qp)?;
            tracing::debug!("Player queue query returned {} items", files.len());

            let queue_count = db.queue_get_count()?;
            if files.is_empty() {
                return Ok(QueueTx::Unchanged(QueueAddResult::default()));
            }

            let append_to_queue = position < 0 || position as u32 > queue_count;
            let mut pos;
            let mut shuffle_pos;
            if append_to_queue {
                pos = queue_count;
                shuffle_pos = queue_count;
            } else {
                pos = position as u32;
                shuffle_pos = position as u32;
                // Make room for the new items in both position spaces
                db.query_run(
                    "UPDATE queue SET pos = pos + ?1, queue_version = ?2 WHERE pos >= ?3;",
                    (files.len() as u32, version, pos),
                )?;
                db.query_run(
                    "UPDATE queue SET shuffle_pos = shuffle_pos + ?1, queue_version = ?2 \
                     WHERE shuffle_pos >= ?3;",
                    (files.len() as u32, version, pos),
                )?;
            }

            let mut result = QueueAddResult::default();
            for mfi in &files {
                let mut qi = QueueItem::from_media_file(mfi);
                qi.pos = pos;
                qi.shuffle_pos = shuffle_pos;
                qi.queue_version = version;
                let item_id = db.queue_item_insert_raw(&qi)?;

                if result.new_item_id == 0 {
                    result.new_item_id = item_id;
                }
                result.count += 1;
                pos += 1;
                shuffle_pos += 1;
            }

            // Reshuffling with an explicit position would invalidate an
            // 'add next' request, so only reshuffle appends
            if append_to_queue && reshuffle {
                db.queue_reshuffle_tx(base_item_id, version)?;
            }

            Ok(QueueTx::Changed(result))
        })
    }

    /// Add everything matching `qp` right after the item `item_id`.
    pub fn queue_add_by_query_after_itemid(
        &self,
        qp: &mut QueryParams,
        item_id: u32,
    ) -> Result<QueueAddResult> {
        let Some(pos) = self.queue_get_pos(item_id, false)? else {
            bail!("Can't add after item {item_id}, not in the queue");
        };
        self.queue_add_by_query(qp, false, 0, pos as i32 + 1)
    }

    /// Begin a streaming add of single items at `pos` (or append for < 0).
    pub fn queue_add_start(&self, pos: i32) -> Result<QueueAdd> {
        self.transaction_begin()?;
        let info = (|| -> Result<QueueAdd> {
            let queue_version = self.queue_version()? + 1;
            let queue_count = self.queue_get_count()?;
            let start = if pos >= 0 && (pos as u32) < queue_count {
                pos as u32
            } else {
                queue_count
            };
            Ok(QueueAdd {
                queue_version,
                start_pos: start,
                pos: start,
                shuffle_pos: queue_count,
                count: 0,
                new_item_id: 0,
            })
        })();

        match info {
            Ok(info) => Ok(info),
            Err(e) => {
                let _ = self.transaction_rollback();
                Err(e)
            }
        }
    }

    pub fn queue_add_next(&self, add: &mut QueueAdd, qi: &mut QueueItem) -> Result<u32> {
        qi.pos = add.pos;
        qi.shuffle_pos = add.shuffle_pos;
        qi.queue_version = add.queue_version;

        let item_id = self.queue_item_insert(qi)?;
        add.pos += 1;
        add.shuffle_pos += 1;
        add.count += 1;
        if add.new_item_id == 0 {
            add.new_item_id = item_id;
        }
        Ok(item_id)
    }

    /// Finish a streaming add: shift the pre-existing rows out of the way,
    /// optionally reshuffle, commit and publish the version.
    pub fn queue_add_end(
        &self,
        add: &mut QueueAdd,
        reshuffle: bool,
        base_item_id: u32,
        result: Result<()>,
    ) -> Result<QueueAddResult> {
        let finish = result.and_then(|()| {
            self.query_run(
                "UPDATE queue SET pos = pos + ?1, queue_version = ?2 \
                 WHERE pos >= ?3 AND queue_version < ?2;",
                (add.count, add.queue_version, add.start_pos),
            )?;
            if reshuffle {
                self.queue_reshuffle_tx(base_item_id, add.queue_version)?;
            }
            Ok(())
        });

        match finish {
            Ok(()) => {
                self.admin_set_int64(super::admin_keys::QUEUE_VERSION, add.queue_version)?;
                self.transaction_end()?;
                listener::notify_event(listener::Event::Queue);
                Ok(QueueAddResult {
                    count: add.count,
                    new_item_id: add.new_item_id,
                })
            }
            Err(e) => {
                if let Err(rollback) = self.transaction_rollback() {
                    tracing::error!("Queue rollback failed: {rollback:#}");
                }
                Err(e)
            }
        }
    }

    // -------------------------------- Deleting -------------------------------

    pub fn queue_clear(&self, keep_item_id: u32) -> Result<()> {
        self.queue_transaction(|db, version| {
            db.query_run("DELETE FROM queue WHERE id <> ?1;", (keep_item_id,))?;
            if keep_item_id != 0 {
                db.query_run(
                    "UPDATE queue SET pos = 0, shuffle_pos = 0, queue_version = ?1 WHERE id = ?2;",
                    (version, keep_item_id),
                )?;
            }
            Ok(QueueTx::Changed(()))
        })
    }

    pub fn queue_delete_byitemid(&self, item_id: u32) -> Result<()> {
        self.queue_transaction(|db, version| {
            let Some(qi) = db.queue_fetch_byitemid(item_id)? else {
                return Ok(QueueTx::Unchanged(()));
            };
            db.queue_delete_item(&qi, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    /// Delete a contiguous range of the normal position space.
    pub fn queue_delete_bypos(&self, pos: u32, count: u32) -> Result<()> {
        self.queue_transaction(|db, version| {
            db.query_run(
                "DELETE FROM queue WHERE pos >= ?1 AND pos < ?2;",
                (pos, pos + count),
            )?;
            db.queue_fix_pos(PosKind::Pos, version)?;
            db.queue_fix_pos(PosKind::ShufflePos, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    pub fn queue_delete_byposrelativetoitem(
        &self,
        pos: u32,
        item_id: u32,
        shuffle: bool,
    ) -> Result<()> {
        self.queue_transaction(|db, version| {
            let Some(qi) = db.queue_fetch_byposrelativetoitem(pos as i32, item_id, shuffle)?
            else {
                return Ok(QueueTx::Unchanged(()));
            };
            db.queue_delete_item(&qi, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    fn queue_delete_item(&self, qi: &QueueItem, version: i64) -> Result<()> {
        self.query_run("DELETE FROM queue WHERE id = ?1;", (qi.id,))?;
        self.query_run(
            "UPDATE queue SET pos = pos - 1, queue_version = ?1 WHERE pos > ?2;",
            (version, qi.pos),
        )?;
        self.query_run(
            "UPDATE queue SET shuffle_pos = shuffle_pos - 1, queue_version = ?1 WHERE shuffle_pos > ?2;",
            (version, qi.shuffle_pos),
        )?;
        Ok(())
    }

    /// Remove items whose file is gone or disabled, then re-pack both
    /// position spaces.
    pub fn queue_cleanup(&self) -> Result<()> {
        self.queue_transaction(|db, version| {
            let deleted = db.query_run(
                "DELETE FROM queue WHERE NOT file_id IN (SELECT id FROM files WHERE disabled = 0);",
                [],
            )?;
            if deleted == 0 {
                return Ok(QueueTx::Unchanged(()));
            }
            db.queue_fix_pos(PosKind::Pos, version)?;
            db.queue_fix_pos(PosKind::ShufflePos, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    /// Re-establish the contiguous 0-based permutation in one position space.
    fn queue_fix_pos(&self, kind: PosKind, version: i64) -> Result<()> {
        let column = kind.column();
        let rows: Vec<(u32, u32)> = {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT id, {column} FROM queue ORDER BY {column};"
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (expected, (id, stored)) in rows.into_iter().enumerate() {
            let expected = expected as u32;
            if stored != expected {
                self.query_run(
                    &format!(
                        "UPDATE queue SET {column} = ?1, queue_version = ?2 WHERE id = ?3;"
                    ),
                    (expected, version, id),
                )?;
            }
        }
        Ok(())
    }

    // --------------------------------- Moving --------------------------------

    /// Move one item to `pos_to` in the chosen position space.
    pub fn queue_move_byitemid(&self, item_id: u32, pos_to: u32, shuffle: bool) -> Result<()> {
        self.queue_transaction(|db, version| {
            let Some(pos_from) = db.queue_get_pos(item_id, shuffle)? else {
                bail!("Can't move item {item_id}, not in the queue");
            };
            db.queue_move_item(item_id, pos_from, pos_to, shuffle, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    pub fn queue_move_bypos(&self, pos_from: u32, pos_to: u32) -> Result<()> {
        self.queue_transaction(|db, version| {
            let Some(qi) = db.queue_fetch_bypos(pos_from, false)? else {
                return Ok(QueueTx::Unchanged(()));
            };
            db.queue_move_item(qi.id, qi.pos, pos_to, false, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    fn queue_move_item(
        &self,
        item_id: u32,
        pos_from: u32,
        pos_to: u32,
        shuffle: bool,
        version: i64,
    ) -> Result<()> {
        let column = if shuffle { "shuffle_pos" } else { "pos" };
        self.query_run(
            &format!(
                "UPDATE queue SET {column} = {column} - 1, queue_version = ?1 WHERE {column} > ?2;"
            ),
            (version, pos_from),
        )?;
        self.query_run(
            &format!(
                "UPDATE queue SET {column} = {column} + 1, queue_version = ?1 WHERE {column} >= ?2;"
            ),
            (version, pos_to),
        )?;
        self.query_run(
            &format!("UPDATE queue SET {column} = ?1, queue_version = ?2 WHERE id = ?3;"),
            (pos_to, version, item_id),
        )?;
        Ok(())
    }

    /// Move the range `[range_begin, range_end)` within the normal position
    /// space. Moving towards the back, `pos_to` names the final position of
    /// the range's last item; towards the front, the final position of its
    /// first item.
    ///
    /// A naive two-step move would leave the permutation non-contiguous
    /// between statements, so this is one conditional UPDATE: rows in front
    /// of the cut-off shift up, the rest shift down.
    pub fn queue_move_bypos_range(
        &self,
        range_begin: u32,
        range_end: u32,
        pos_to: u32,
    ) -> Result<()> {
        if range_end <= range_begin {
            return Ok(());
        }
        self.queue_transaction(|db, version| {
            let count = range_end - range_begin;

            let (cut_off, offset_up, offset_down, update_begin, update_end) =
                if range_begin < pos_to {
                    // Down the list; no-op when pos_to still falls inside
                    let offset_up = (pos_to + 1).saturating_sub(range_end);
                    (range_end, offset_up, count, range_begin, pos_to + 1)
                } else {
                    (range_begin, count, range_begin - pos_to, pos_to, range_end)
                };

            db.query_run(
                "UPDATE queue SET pos = CASE WHEN pos < ?1 THEN pos + ?2 ELSE pos - ?3 END, \
                 queue_version = ?4 WHERE pos >= ?5 AND pos < ?6;",
                (cut_off, offset_up, offset_down, version, update_begin, update_end),
            )?;
            Ok(QueueTx::Changed(()))
        })
    }

    /// Move the item `from_pos` positions after `item_id` to `to_offset`
    /// positions after it.
    pub fn queue_move_byposrelativetoitem(
        &self,
        from_pos: u32,
        to_offset: u32,
        item_id: u32,
        shuffle: bool,
    ) -> Result<()> {
        self.queue_transaction(|db, version| {
            let Some(base) = db.queue_fetch_byitemid(item_id)? else {
                return Ok(QueueTx::Unchanged(()));
            };
            let base_pos = if shuffle { base.shuffle_pos } else { base.pos };
            let pos_move_from = base_pos + from_pos;
            let mut pos_move_to = base_pos + to_offset;
            // Moving to an earlier position arrives with an offset that is
            // one too high
            if pos_move_to < pos_move_from {
                pos_move_to += 1;
            }

            let Some(qi) = db.queue_fetch_bypos(pos_move_from, shuffle)? else {
                return Ok(QueueTx::Unchanged(()));
            };
            db.queue_move_item(qi.id, pos_move_from, pos_move_to, shuffle, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    // ------------------------------- Shuffling -------------------------------

    /// Rebuild the shuffle order. With `base_item_id == 0` the whole queue is
    /// shuffled; otherwise only the rows strictly after the base item's
    /// position.
    pub fn queue_reshuffle(&self, base_item_id: u32) -> Result<()> {
        self.queue_transaction(|db, version| {
            db.queue_reshuffle_tx(base_item_id, version)?;
            Ok(QueueTx::Changed(()))
        })
    }

    fn queue_reshuffle_tx(&self, base_item_id: u32, version: i64) -> Result<()> {
        tracing::debug!("Reshuffle queue after item with item-id {base_item_id}");

        // Reset the shuffled order and mark all items as changed
        self.query_run(
            "UPDATE queue SET shuffle_pos = pos, queue_version = ?1;",
            (version,),
        )?;

        let start = if base_item_id > 0 {
            match self.queue_get_pos(base_item_id, false)? {
                Some(pos) => pos + 1, // do not reshuffle the base item
                None => bail!("Can't reshuffle from item {base_item_id}, not in the queue"),
            }
        } else {
            0
        };

        let count = self.queue_get_count()?;
        if start >= count {
            return Ok(());
        }

        let mut shuffle_positions: Vec<u32> = (start..count).collect();
        util::rng_shuffle(&mut shuffle_positions);

        let ids: Vec<u32> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT id FROM queue WHERE pos >= ?1 ORDER BY pos;")?;
            let ids = stmt
                .query_map((start,), |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        for (id, shuffle_pos) in ids.into_iter().zip(shuffle_positions) {
            self.query_run(
                "UPDATE queue SET shuffle_pos = ?1 WHERE id = ?2;",
                (shuffle_pos, id),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Strip;
    use crate::db::files::tests::sample_mfi;

    fn add_files(db: &Db, n: u32) -> Vec<u32> {
        (0..n)
            .map(|i| {
                let mut mfi = sample_mfi(&format!("/m/{i}.mp3"), "A", "X");
                mfi.track = i + 1;
                db.file_add(&mut mfi).unwrap();
                mfi.id
            })
            .collect()
    }

    fn enqueue_all(db: &Db) -> QueueAddResult {
        let mut qp = QueryParams {
            sort: crate::db::query::SortType::Track,
            ..Default::default()
        };
        db.queue_add_by_query(&mut qp, false, 0, -1).unwrap()
    }

    fn positions(db: &Db, shuffle: bool) -> Vec<u32> {
        db.queue_fetch_all(shuffle)
            .unwrap()
            .iter()
            .map(|qi| if shuffle { qi.shuffle_pos } else { qi.pos })
            .collect()
    }

    fn paths_in_pos_order(db: &Db) -> Vec<String> {
        db.queue_fetch_all(false)
            .unwrap()
            .into_iter()
            .map(|qi| qi.path)
            .collect()
    }

    fn assert_contiguous(db: &Db) {
        let count = db.queue_get_count().unwrap();
        for shuffle in [false, true] {
            let set: HashSet<u32> = positions(db, shuffle).into_iter().collect();
            assert_eq!(set, (0..count).collect::<HashSet<u32>>());
        }
    }

    #[test]
    fn add_by_query_appends_and_versions() {
        let db = Db::open_test();
        add_files(&db, 3);

        let v0 = db.queue_version().unwrap();
        let result = enqueue_all(&db);
        assert_eq!(result.count, 3);
        assert!(result.new_item_id > 0);

        let v1 = db.queue_version().unwrap();
        assert_eq!(v1, v0 + 1);
        assert_contiguous(&db);

        // The published version equals the max row version written
        let max_row_version = db
            .get_one_int("SELECT MAX(queue_version) FROM queue;", [])
            .unwrap()
            .unwrap();
        assert_eq!(v1, max_row_version);
    }

    #[test]
    fn add_by_query_at_position_shifts() {
        let db = Db::open_test();
        add_files(&db, 3);
        enqueue_all(&db);

        // Queue the first file again, at position 1
        let mut qp = QueryParams {
            filter: Some("f.path = '/m/0.mp3'".into()),
            ..Default::default()
        };
        let result = db.queue_add_by_query(&mut qp, false, 0, 1).unwrap();
        assert_eq!(result.count, 1);

        assert_eq!(
            paths_in_pos_order(&db),
            vec!["/m/0.mp3", "/m/0.mp3", "/m/1.mp3", "/m/2.mp3"]
        );
        assert_contiguous(&db);
    }

    #[test]
    fn empty_add_leaves_version_alone() {
        let db = Db::open_test();
        let before = db.queue_version().unwrap();
        let mut qp = QueryParams {
            filter: Some("f.path = '/nope'".into()),
            ..Default::default()
        };
        let result = db.queue_add_by_query(&mut qp, false, 0, -1).unwrap();
        assert_eq!(result.count, 0);
        assert_eq!(db.queue_version().unwrap(), before);
    }

    #[test]
    fn reshuffle_from_base_keeps_base() {
        let db = Db::open_test();
        add_files(&db, 3);
        let result = enqueue_all(&db);
        let first = db.queue_fetch_byitemid(result.new_item_id).unwrap().unwrap();
        assert_eq!(first.pos, 0);

        db.queue_reshuffle(result.new_item_id).unwrap();

        let first = db.queue_fetch_byitemid(result.new_item_id).unwrap().unwrap();
        assert_eq!(first.shuffle_pos, 0);
        assert_contiguous(&db);
    }

    #[test]
    fn reshuffle_all_permutes_everything() {
        let db = Db::open_test();
        add_files(&db, 8);
        enqueue_all(&db);

        db.queue_reshuffle(0).unwrap();
        assert_contiguous(&db);
    }

    #[test]
    fn move_range_past_other_items() {
        let db = Db::open_test();
        add_files(&db, 5); // A B C D E at pos 0..4
        enqueue_all(&db);

        // Move {B, C} past D and E to the end
        db.queue_move_bypos_range(1, 3, 4).unwrap();

        assert_eq!(
            paths_in_pos_order(&db),
            vec!["/m/0.mp3", "/m/3.mp3", "/m/4.mp3", "/m/1.mp3", "/m/2.mp3"]
        );
        assert_contiguous(&db);
    }

    #[test]
    fn move_and_inverse_is_identity() {
        let db = Db::open_test();
        add_files(&db, 5);
        enqueue_all(&db);
        let before = paths_in_pos_order(&db);

        db.queue_move_bypos(1, 3).unwrap();
        db.queue_move_bypos(3, 1).unwrap();

        assert_eq!(paths_in_pos_order(&db), before);
        assert_contiguous(&db);
    }

    #[test]
    fn delete_range_repacks() {
        let db = Db::open_test();
        add_files(&db, 5);
        enqueue_all(&db);

        db.queue_delete_bypos(1, 2).unwrap();
        assert_eq!(db.queue_get_count().unwrap(), 3);
        assert_eq!(
            paths_in_pos_order(&db),
            vec!["/m/0.mp3", "/m/3.mp3", "/m/4.mp3"]
        );
        assert_contiguous(&db);
    }

    #[test]
    fn clear_keeps_one_item_at_zero() {
        let db = Db::open_test();
        add_files(&db, 3);
        enqueue_all(&db);
        let keep = db.queue_fetch_bypos(2, false).unwrap().unwrap();

        db.queue_clear(keep.id).unwrap();
        assert_eq!(db.queue_get_count().unwrap(), 1);
        let survivor = db.queue_fetch_byitemid(keep.id).unwrap().unwrap();
        assert_eq!((survivor.pos, survivor.shuffle_pos), (0, 0));
    }

    #[test]
    fn cleanup_drops_disabled_files() {
        let db = Db::open_test();
        add_files(&db, 3);
        enqueue_all(&db);

        db.file_disable_bypath("/m/1.mp3", Strip::None, 1 << 32)
            .unwrap();
        db.queue_cleanup().unwrap();

        assert_eq!(db.queue_get_count().unwrap(), 2);
        assert_contiguous(&db);
    }

    #[test]
    fn fetch_next_prev_walk_both_spaces() {
        let db = Db::open_test();
        add_files(&db, 3);
        enqueue_all(&db);
        let first = db.queue_fetch_bypos(0, false).unwrap().unwrap();

        let next = db.queue_fetch_next(first.id, false).unwrap().unwrap();
        assert_eq!(next.pos, 1);
        assert_eq!(db.queue_fetch_prev(first.id, false).unwrap(), None);
    }

    #[test]
    fn item_update_bumps_version() {
        let db = Db::open_test();
        add_files(&db, 1);
        enqueue_all(&db);
        let mut qi = db.queue_fetch_bypos(0, false).unwrap().unwrap();
        let before = db.queue_version().unwrap();

        qi.title = Some("Renamed".into());
        db.queue_item_update(&mut qi).unwrap();

        assert_eq!(db.queue_version().unwrap(), before + 1);
        let stored = db.queue_fetch_byitemid(qi.id).unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Renamed"));
        assert_eq!(stored.queue_version, before + 1);
    }

    #[test]
    fn streaming_add_commits_once() {
        let db = Db::open_test();
        let before = db.queue_version().unwrap();

        let mut add = db.queue_add_start(-1).unwrap();
        for i in 0..3 {
            let mut qi = QueueItem {
                path: format!("http://stream/{i}"),
                data_kind: DataKind::Http,
                ..Default::default()
            };
            db.queue_add_next(&mut add, &mut qi).unwrap();
        }
        let result = db.queue_add_end(&mut add, false, 0, Ok(())).unwrap();

        assert_eq!(result.count, 3);
        assert_eq!(db.queue_version().unwrap(), before + 1);
        assert_contiguous(&db);
    }

    #[test]
    fn non_persistent_file_id_sentinel() {
        let mfi = MediaFile::default();
        let qi = QueueItem::from_media_file(&mfi);
        assert_eq!(qi.file_id, NON_PERSISTENT_ID);
    }
}
