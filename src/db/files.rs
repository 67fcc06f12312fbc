//! The `files` table: media items and their extended metadata.

use color_eyre::Result;
use color_eyre::eyre::bail;
use strum::FromRepr;

use crate::conf;
use crate::db::maps::{
    self, Col, ColValue, Fixup, NO_BIND, NO_ZERO, col_int, col_text, col_text_req,
};
use crate::db::{DataKind, Db, MediaKind, ScanKind, Strip};
use crate::listener;
use crate::util;

/// Embedded artwork state as detected by the extractor.
#[derive(Debug, Default, FromRepr, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Artwork {
    #[default]
    Unknown = 0,
    None = 1,
    Embedded = 2,
}

/// One row of `files`. Field order matches the column order of the table and
/// the entries of [`MFI_COLS`]; all three must stay the same sequence.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MediaFile {
    pub id: u32,
    /// Opaque, source-dependent locator (fs path, URL, spotify uri)
    pub path: String,
    /// Canonical `/file:/…`, `/http:/…` or `/spotify:/…` key
    pub virtual_path: Option<String>,
    pub fname: String,
    pub directory_id: u32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
    /// File format as shown to remotes (daap.songformat)
    pub format: Option<String>,
    pub composer: Option<String>,
    pub orchestra: Option<String>,
    pub conductor: Option<String>,
    pub grouping: Option<String>,
    pub url: Option<String>,
    pub bitrate: u32,
    pub samplerate: u32,
    /// ms
    pub song_length: u32,
    /// bytes
    pub file_size: i64,
    pub year: u32,
    /// signed epoch seconds
    pub date_released: i64,
    pub track: u32,
    pub total_tracks: u32,
    pub disc: u32,
    pub total_discs: u32,
    pub bpm: u32,
    pub compilation: bool,
    pub artwork: Artwork,
    /// 0..100
    pub rating: u32,
    pub play_count: u32,
    pub skip_count: u32,
    pub seek: u32,
    pub data_kind: DataKind,
    pub media_kind: Option<MediaKind>,
    pub item_kind: u32,
    pub description: Option<String>,
    pub db_timestamp: i64,
    pub time_added: i64,
    pub time_modified: i64,
    pub time_played: i64,
    pub time_skipped: i64,
    /// 0 = visible, otherwise an inotify cookie or the fake cookie sentinel
    pub disabled: i64,
    pub sample_count: i64,
    /// 4 chars max, e.g. "mpeg", "flac", "mp4a"
    pub codectype: Option<String>,
    pub idx: u32,
    pub has_video: bool,
    pub contentrating: u32,
    pub bits_per_sample: u32,
    pub tv_series_name: Option<String>,
    pub tv_episode_num_str: Option<String>,
    pub tv_network_name: Option<String>,
    pub tv_episode_sort: u32,
    pub tv_season_num: u32,
    pub songartistid: i64,
    pub songalbumid: i64,
    pub title_sort: Option<String>,
    pub artist_sort: Option<String>,
    pub album_sort: Option<String>,
    pub album_artist_sort: Option<String>,
    pub composer_sort: Option<String>,
    pub channels: u32,
    pub usermark: u32,
    pub scan_kind: ScanKind,
    pub lyrics: Option<String>,
}

macro_rules! col_bool {
    ($name:literal, $field:ident) => {
        Col::<MediaFile> {
            name: $name,
            fixup: Fixup::Standard,
            flags: 0,
            get: |r| ColValue::Int(r.$field as i64),
            set: |r, v| r.$field = v.as_int() != 0,
        }
    };
}

/// Column map for `files`. Keep in sync with the table DDL and the struct.
/// `artist` must come before `album_artist`, the album artist default reads it.
pub static MFI_COLS: &[Col<MediaFile>] = &[
    col_int!(MediaFile, "id", id, Fixup::Standard, NO_BIND),
    col_text_req!(MediaFile, "path", path, Fixup::NoSanitize),
    col_text!(MediaFile, "virtual_path", virtual_path),
    col_text_req!(MediaFile, "fname", fname, Fixup::NoSanitize),
    col_int!(MediaFile, "directory_id", directory_id),
    col_text!(MediaFile, "title", title, Fixup::Title),
    col_text!(MediaFile, "artist", artist, Fixup::Artist),
    col_text!(MediaFile, "album", album, Fixup::Album),
    col_text!(MediaFile, "album_artist", album_artist, Fixup::AlbumArtist),
    col_text!(MediaFile, "genre", genre, Fixup::Genre),
    col_text!(MediaFile, "comment", comment),
    col_text!(MediaFile, "type", format, Fixup::Type),
    col_text!(MediaFile, "composer", composer, Fixup::Composer),
    col_text!(MediaFile, "orchestra", orchestra),
    col_text!(MediaFile, "conductor", conductor),
    col_text!(MediaFile, "grouping", grouping),
    col_text!(MediaFile, "url", url),
    col_int!(MediaFile, "bitrate", bitrate),
    col_int!(MediaFile, "samplerate", samplerate),
    col_int!(MediaFile, "song_length", song_length),
    col_int!(MediaFile, "file_size", file_size),
    col_int!(MediaFile, "year", year),
    col_int!(MediaFile, "date_released", date_released),
    col_int!(MediaFile, "track", track),
    col_int!(MediaFile, "total_tracks", total_tracks),
    col_int!(MediaFile, "disc", disc),
    col_int!(MediaFile, "total_discs", total_discs),
    col_int!(MediaFile, "bpm", bpm),
    col_bool!("compilation", compilation),
    Col::<MediaFile> {
        name: "artwork",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.artwork as i64),
        set: |r, v| r.artwork = Artwork::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    col_int!(MediaFile, "rating", rating, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "play_count", play_count, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "skip_count", skip_count, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "seek", seek, Fixup::Standard, NO_ZERO),
    Col::<MediaFile> {
        name: "data_kind",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.data_kind as i64),
        set: |r, v| r.data_kind = DataKind::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    Col::<MediaFile> {
        name: "media_kind",
        fixup: Fixup::MediaKind,
        flags: 0,
        get: |r| ColValue::Int(r.media_kind.map_or(0, |k| k as i64)),
        set: |r, v| r.media_kind = MediaKind::from_repr(v.as_int() as u32),
    },
    col_int!(MediaFile, "item_kind", item_kind, Fixup::ItemKind),
    col_text!(MediaFile, "description", description),
    col_int!(MediaFile, "db_timestamp", db_timestamp),
    col_int!(MediaFile, "time_added", time_added, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "time_modified", time_modified, Fixup::TimeModified),
    col_int!(MediaFile, "time_played", time_played, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "time_skipped", time_skipped, Fixup::Standard, NO_ZERO),
    col_int!(MediaFile, "disabled", disabled),
    col_int!(MediaFile, "sample_count", sample_count),
    col_text!(MediaFile, "codectype", codectype, Fixup::Codectype),
    col_int!(MediaFile, "idx", idx),
    col_bool!("has_video", has_video),
    col_int!(MediaFile, "contentrating", contentrating),
    col_int!(MediaFile, "bits_per_sample", bits_per_sample),
    col_text!(MediaFile, "tv_series_name", tv_series_name),
    col_text!(MediaFile, "tv_episode_num_str", tv_episode_num_str),
    col_text!(MediaFile, "tv_network_name", tv_network_name),
    col_int!(MediaFile, "tv_episode_sort", tv_episode_sort),
    col_int!(MediaFile, "tv_season_num", tv_season_num),
    col_int!(MediaFile, "songartistid", songartistid, Fixup::SongArtistId),
    col_int!(MediaFile, "songalbumid", songalbumid, Fixup::SongAlbumId),
    col_text!(MediaFile, "title_sort", title_sort, Fixup::TitleSort),
    col_text!(MediaFile, "artist_sort", artist_sort, Fixup::ArtistSort),
    col_text!(MediaFile, "album_sort", album_sort, Fixup::AlbumSort),
    col_text!(
        MediaFile,
        "album_artist_sort",
        album_artist_sort,
        Fixup::AlbumArtistSort
    ),
    col_text!(MediaFile, "composer_sort", composer_sort, Fixup::ComposerSort),
    col_int!(MediaFile, "channels", channels),
    col_int!(MediaFile, "usermark", usermark),
    Col::<MediaFile> {
        name: "scan_kind",
        fixup: Fixup::Standard,
        flags: 0,
        get: |r| ColValue::Int(r.scan_kind as i64),
        set: |r, v| r.scan_kind = ScanKind::from_repr(v.as_int() as u32).unwrap_or_default(),
    },
    col_text!(MediaFile, "lyrics", lyrics),
];

impl MediaFile {
    /// The three-pass tag fixup. Idempotent: running it on an already fixed
    /// record changes nothing.
    pub fn fixup(&mut self, cfg: &conf::Library) {
        maps::fixup_tags(
            self,
            MFI_COLS,
            |rec, fx| rec.apply_default(fx, cfg),
            |rec, fx| rec.apply_sort_key(fx),
        );
    }

    fn apply_default(&mut self, fixup: Fixup, cfg: &conf::Library) {
        match fixup {
            Fixup::Title => {
                if self.title.is_none() && !self.fname.is_empty() {
                    // fname is left untouched by sanitize, so ensure proper UTF-8
                    self.title = Some(crate::text_encoding::fixup_string(&self.fname));
                } else if self.title.is_none() {
                    self.title = Some(cfg.name_unknown_title.clone());
                }
            }
            Fixup::Artist => {
                if self.artist.is_some() {
                    return;
                }
                self.artist = if let Some(aa) = &self.album_artist {
                    Some(aa.clone())
                } else if let (Some(orchestra), Some(conductor)) =
                    (&self.orchestra, &self.conductor)
                {
                    Some(format!("{orchestra} - {conductor}"))
                } else if let Some(orchestra) = &self.orchestra {
                    Some(orchestra.clone())
                } else if let Some(conductor) = &self.conductor {
                    Some(conductor.clone())
                } else if let Some(series) = &self.tv_series_name {
                    Some(series.clone())
                } else {
                    Some(cfg.name_unknown_artist.clone())
                };
            }
            Fixup::Album => {
                if self.album.is_some() {
                    return;
                }
                self.album = match &self.tv_series_name {
                    Some(series) => Some(format!("{series}, Season {}", self.tv_season_num)),
                    None => Some(cfg.name_unknown_album.clone()),
                };
            }
            Fixup::AlbumArtist => {
                // Podcasts are grouped by album only, never by author
                if self.media_kind == Some(MediaKind::Podcast) {
                    self.album_artist = Some(String::new());
                }
                if self.compilation && cfg.compilation_artist.is_some() {
                    // An empty compilation_artist hides these from artist view
                    self.album_artist = cfg.compilation_artist.clone();
                }
                if self.album_artist.is_some() {
                    return;
                }
                self.album_artist = match &self.artist {
                    Some(artist) => Some(artist.clone()),
                    None => Some(cfg.name_unknown_artist.clone()),
                };
            }
            Fixup::Genre => {
                if self.genre.is_none() {
                    self.genre = Some(cfg.name_unknown_genre.clone());
                }
            }
            Fixup::MediaKind => {
                if self.tv_series_name.is_some() {
                    self.media_kind = Some(MediaKind::Tvshow);
                } else if self.media_kind.is_none() {
                    self.media_kind = Some(MediaKind::Music);
                }
            }
            Fixup::ItemKind => {
                if self.item_kind == 0 {
                    self.item_kind = 2; // music
                }
            }
            Fixup::TimeModified => {
                if self.time_modified == 0 {
                    self.time_modified = self.db_timestamp;
                }
            }
            Fixup::Codectype | Fixup::Type => {
                // Default to mpeg4 audio/video for unknown types so
                // DRM-afflicted files can still be streamed
                if self.codectype.as_deref() == Some("unkn") {
                    if self.has_video {
                        self.codectype = Some("mp4v".into());
                        self.format = Some("m4v".into());
                    } else {
                        self.codectype = Some("mp4a".into());
                        self.format = Some("m4a".into());
                    }
                }
            }
            Fixup::SongArtistId => {
                if self.songartistid == 0 {
                    self.songartistid = util::two_str_hash(self.album_artist.as_deref(), None);
                }
            }
            Fixup::SongAlbumId => {
                if self.songalbumid == 0 {
                    self.songalbumid =
                        util::two_str_hash(self.album_artist.as_deref(), self.album.as_deref())
                            + self.data_kind as i64;
                }
            }
            _ => {}
        }
    }

    fn apply_sort_key(&mut self, fixup: Fixup) {
        match fixup {
            Fixup::TitleSort => maps::sort_tag_create(&mut self.title_sort, self.title.as_deref()),
            Fixup::ArtistSort => {
                maps::sort_tag_create(&mut self.artist_sort, self.artist.as_deref())
            }
            Fixup::AlbumSort => maps::sort_tag_create(&mut self.album_sort, self.album.as_deref()),
            Fixup::AlbumArtistSort => {
                maps::sort_tag_create(&mut self.album_artist_sort, self.album_artist.as_deref())
            }
            Fixup::ComposerSort => {
                maps::sort_tag_create(&mut self.composer_sort, self.composer.as_deref())
            }
            _ => {}
        }
    }
}

/// Extended multi-valued metadata of a media file (`files_metadata`).
#[derive(Debug, Default, Clone, Copy, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum MetadataKind {
    #[default]
    Lyrics = 0,
    Genre = 1,
    MusicbrainzAlbumId = 2,
    MusicbrainzArtistId = 3,
    MusicbrainzAlbumArtistId = 4,
    Composer = 5,
}

impl MetadataKind {
    /// List kinds may have several rows per file, indexed by `idx`.
    pub fn is_list(self) -> bool {
        matches!(self, MetadataKind::Genre | MetadataKind::Composer)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub metadata_kind: MetadataKind,
    pub idx: u32,
    pub value: String,
}

impl Db {
    /// Insert a new media file. Runs fixup, stamps timestamps, assigns the id.
    pub fn file_add(&self, mfi: &mut MediaFile) -> Result<u32> {
        if mfi.id != 0 {
            bail!("Adding media file with non-zero id {}", mfi.id);
        }

        if mfi.db_timestamp == 0 {
            mfi.db_timestamp = util::now_secs();
        }
        if mfi.time_added == 0 {
            mfi.time_added = mfi.db_timestamp;
        }
        mfi.fixup(&self.cfg.library);

        let sql = maps::insert_sql("files", MFI_COLS);
        let values = maps::bind_values(mfi, MFI_COLS, None);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))?;

        mfi.id = self.conn.last_insert_rowid() as u32;
        self.admin_set_int64(super::admin_keys::DB_MODIFIED, util::now_secs())?;
        Ok(mfi.id)
    }

    /// Update an existing media file by id. Zero-valued counters keep their
    /// stored value via `daap_no_zero`.
    pub fn file_update(&self, mfi: &mut MediaFile) -> Result<()> {
        if mfi.id == 0 {
            bail!("Media file update called with id 0");
        }

        mfi.db_timestamp = util::now_secs();
        mfi.fixup(&self.cfg.library);

        let sql = maps::update_sql("files", MFI_COLS);
        let values = maps::bind_values(mfi, MFI_COLS, Some(mfi.id as i64));
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))?;

        self.admin_set_int64(super::admin_keys::DB_MODIFIED, util::now_secs())?;
        Ok(())
    }

    /// Keep a file alive past the next purge and clear its disabled state.
    pub fn file_ping(&self, id: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET db_timestamp = ?1, disabled = 0 WHERE id = ?2;",
            (util::now_secs(), id),
        )?;
        Ok(())
    }

    /// Ping by path, but only when the stored row is at least as new as
    /// `mtime_max`. Returns whether a row matched, so callers know if a
    /// rescan of the file is needed.
    pub fn file_ping_bypath(&self, path: &str, mtime_max: i64) -> Result<bool> {
        let changes = self.query_run(
            "UPDATE files SET db_timestamp = ?1, disabled = 0 WHERE path = ?2 AND db_timestamp >= ?3;",
            (util::now_secs(), path, mtime_max),
        )?;
        Ok(changes > 0)
    }

    /// Ping everything under a path prefix.
    pub fn file_ping_bymatch(&self, path: &str, isdir: bool) -> Result<()> {
        let pattern = if isdir {
            format!("{path}/%")
        } else {
            format!("{path}%")
        };
        self.query_run(
            "UPDATE files SET db_timestamp = ?1 WHERE path LIKE ?2;",
            (util::now_secs(), pattern),
        )?;
        Ok(())
    }

    pub fn file_path_byid(&self, id: u32) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT f.path FROM files f WHERE f.id = ?1;")?;
        let path = stmt
            .query_row((id,), |row| row.get(0))
            .map(Some)
            .or_else(no_rows_to_none)?;
        Ok(path)
    }

    pub fn file_id_exists(&self, id: u32) -> Result<bool> {
        Ok(self
            .get_one_int("SELECT f.id FROM files f WHERE f.id = ?1;", (id,))?
            .is_some())
    }

    pub fn file_id_bypath(&self, path: &str) -> Result<Option<u32>> {
        self.file_id_byquery("SELECT f.id FROM files f WHERE f.path = ?1;", (path,))
    }

    pub fn file_id_byfile(&self, fname: &str) -> Result<Option<u32>> {
        self.file_id_byquery("SELECT f.id FROM files f WHERE f.fname = ?1;", (fname,))
    }

    pub fn file_id_byurl(&self, url: &str) -> Result<Option<u32>> {
        self.file_id_byquery("SELECT f.id FROM files f WHERE f.url = ?1;", (url,))
    }

    pub fn file_id_byvirtualpath(&self, virtual_path: &str) -> Result<Option<u32>> {
        self.file_id_byquery(
            "SELECT f.id FROM files f WHERE f.virtual_path = ?1;",
            (virtual_path,),
        )
    }

    pub fn file_id_byvirtualpath_match(&self, virtual_path: &str) -> Result<Option<u32>> {
        self.file_id_byquery(
            "SELECT f.id FROM files f WHERE f.virtual_path LIKE '%' || ?1 || '%';",
            (virtual_path,),
        )
    }

    fn file_id_byquery(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<u32>> {
        Ok(self.get_one_int(sql, params)?.map(|id| id as u32))
    }

    /// All (id, path) pairs sharing a file name; used for suffix matching
    /// when reconciling foreign catalogs.
    pub fn file_ids_byfname(&self, fname: &str) -> Result<Vec<(u32, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT f.id, f.path FROM files f WHERE f.fname = ?1;")?;
        let rows = stmt
            .query_map((fname,), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn file_fetch_byid(&self, id: u32) -> Result<Option<MediaFile>> {
        self.file_fetch_byquery("SELECT f.* FROM files f WHERE f.id = ?1;", (id,))
    }

    pub fn file_fetch_byvirtualpath(&self, virtual_path: &str) -> Result<Option<MediaFile>> {
        self.file_fetch_byquery(
            "SELECT f.* FROM files f WHERE f.virtual_path = ?1;",
            (virtual_path,),
        )
    }

    fn file_fetch_byquery(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<MediaFile>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(maps::record_from_row(row, MFI_COLS)?)),
            None => Ok(None),
        }
    }

    pub fn file_seek_update(&self, id: u32, seek: u32) -> Result<()> {
        self.query_run("UPDATE files SET seek = ?1 WHERE id = ?2;", (seek, id))?;
        Ok(())
    }

    pub fn file_delete_bypath(&self, path: &str) -> Result<()> {
        self.query_run("DELETE FROM files WHERE path = ?1;", (path,))?;
        Ok(())
    }

    /// Soft-disable a file. With [`Strip::Path`] the parent directory prefix
    /// is cut off the stored path and virtual path, so an enable-by-cookie
    /// can splice in the post-rename parent.
    pub fn file_disable_bypath(&self, path: &str, strip: Strip, cookie: i64) -> Result<()> {
        let prefix = match path.rsplit_once('/') {
            Some((parent, _fname)) => parent,
            None => "",
        };
        let striplen = strip_len(prefix, strip);
        self.query_run(
            "UPDATE files SET path = SUBSTR(path, ?1), virtual_path = SUBSTR(virtual_path, ?2), \
             disabled = ?3 WHERE path = ?4;",
            (striplen, vpath_strip_len(striplen), cookie, path),
        )?;
        Ok(())
    }

    pub fn file_disable_bymatch(&self, path: &str, strip: Strip, cookie: i64) -> Result<()> {
        let striplen = strip_len(path, strip);
        self.query_run(
            "UPDATE files SET path = SUBSTR(path, ?1), virtual_path = SUBSTR(virtual_path, ?2), \
             disabled = ?3 WHERE path LIKE ?4 || '/%';",
            (striplen, vpath_strip_len(striplen), cookie, path),
        )?;
        Ok(())
    }

    /// Re-enable rows disabled with `cookie`, splicing the new parent path in
    /// front of the stored (stripped) remainder. Returns affected row count.
    pub fn file_enable_bycookie(&self, cookie: u32, path: &str, fname: Option<&str>) -> Result<usize> {
        let changes = match fname {
            Some(fname) => self.query_run(
                "UPDATE files SET path = ?1 || path, virtual_path = '/file:' || ?1 || virtual_path, \
                 fname = ?2, disabled = 0 WHERE disabled = ?3;",
                (path, fname, cookie as i64),
            )?,
            None => self.query_run(
                "UPDATE files SET path = ?1 || path, virtual_path = '/file:' || ?1 || virtual_path, \
                 disabled = 0 WHERE disabled = ?2;",
                (path, cookie as i64),
            )?,
        };
        Ok(changes)
    }

    pub fn file_update_directoryid(&self, path: &str, directory_id: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET directory_id = ?1 WHERE path = ?2;",
            (directory_id, path),
        )?;
        Ok(())
    }

    // ------------------------------- Counters --------------------------------

    pub fn file_inc_playcount(&self, id: u32) -> Result<()> {
        self.file_inc_playcount_byfilter(&format!("id = {id}"))
    }

    pub fn file_inc_playcount_byplid(&self, id: u32, only_unplayed: bool) -> Result<()> {
        let extra = if only_unplayed { "AND play_count = 0" } else { "" };
        self.file_inc_playcount_byfilter(&format!(
            "path IN (SELECT filepath FROM playlistitems WHERE playlistid = {id}) {extra}"
        ))
    }

    pub fn file_inc_playcount_bysongalbumid(&self, id: i64, only_unplayed: bool) -> Result<()> {
        let extra = if only_unplayed { "AND play_count = 0" } else { "" };
        self.file_inc_playcount_byfilter(&format!("songalbumid = {id} {extra}"))
    }

    /// Rating calculation is taken from the beets plugin "mpdstats" and
    /// adapted to the 0..100 range used here:
    ///
    ///   stable  = (play_count + 1) / (play_count + skip_count + 2) * 100
    ///   rolling = rating + (100 - rating) / 2   (played)
    ///   rolling = rating - rating / 2           (skipped)
    ///   new     = stable * 0.75 + rolling * 0.25
    fn file_inc_playcount_byfilter(&self, filter: &str) -> Result<()> {
        let now = util::now_secs();
        let query = if self.cfg.library.rating_updates {
            format!(
                "UPDATE files SET play_count = play_count + 1, time_played = {now}, seek = 0, \
                 rating = CAST(((play_count + 1.0) / (play_count + skip_count + 2.0) * 100 * 0.75) \
                 + ((rating + ((100.0 - rating) / 2.0)) * 0.25) AS INT) WHERE {filter};"
            )
        } else {
            format!(
                "UPDATE files SET play_count = play_count + 1, time_played = {now}, seek = 0 \
                 WHERE {filter};"
            )
        };
        self.query_run(&query, [])?;
        self.admin_set_int64(super::admin_keys::DB_MODIFIED, now)?;
        if self.cfg.library.rating_updates {
            listener::notify_event(listener::Event::Rating);
        }
        Ok(())
    }

    pub fn file_inc_skipcount(&self, id: u32) -> Result<()> {
        let now = util::now_secs();
        let query = if self.cfg.library.rating_updates {
            format!(
                "UPDATE files SET skip_count = skip_count + 1, time_skipped = {now}, seek = 0, \
                 rating = CAST(((play_count + 1.0) / (play_count + skip_count + 2.0) * 100 * 0.75) \
                 + ((rating - (rating / 2.0)) * 0.25) AS INT) WHERE id = {id};"
            )
        } else {
            format!(
                "UPDATE files SET skip_count = skip_count + 1, time_skipped = {now} WHERE id = {id};"
            )
        };
        self.query_run(&query, [])?;
        self.admin_set_int64(super::admin_keys::DB_MODIFIED, now)?;
        if self.cfg.library.rating_updates {
            listener::notify_event(listener::Event::Rating);
        }
        Ok(())
    }

    pub fn file_reset_playskip_count(&self, id: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET play_count = 0, skip_count = 0, time_played = 0, time_skipped = 0 \
             WHERE id = ?1;",
            (id,),
        )?;
        self.admin_set_int64(super::admin_keys::DB_MODIFIED, util::now_secs())?;
        Ok(())
    }

    pub fn file_rating_update(&self, id: u32, rating: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET rating = ?1 WHERE id = ?2;",
            (rating.min(super::RATING_MAX), id),
        )?;
        listener::notify_event(listener::Event::Rating);
        Ok(())
    }

    pub fn file_usermark_update(&self, id: u32, usermark: u32) -> Result<()> {
        self.query_run(
            "UPDATE files SET usermark = ?1 WHERE id = ?2;",
            (usermark, id),
        )?;
        Ok(())
    }

    /// Visible item and stream counts, optionally narrowed by a filter
    /// fragment.
    pub fn files_get_count(&self, filter: Option<&str>) -> Result<(u32, u32)> {
        let query = match filter {
            Some(filter) => format!(
                "SELECT COUNT(*), COALESCE(SUM(data_kind = 1), 0) FROM files f \
                 WHERE f.disabled = 0 AND {filter};"
            ),
            None => "SELECT COUNT(*), COALESCE(SUM(data_kind = 1), 0) FROM files f \
                     WHERE f.disabled = 0;"
                .to_string(),
        };
        let mut stmt = self.conn.prepare_cached(&query)?;
        let counts = stmt.query_row([], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?))
        })?;
        Ok(counts)
    }

    // --------------------------- Extended metadata ---------------------------

    pub fn file_metadata_add(
        &self,
        file_id: u32,
        songalbumid: i64,
        songartistid: i64,
        md: &FileMetadata,
    ) -> Result<()> {
        self.query_run(
            "INSERT INTO files_metadata (file_id, songalbumid, songartistid, metadata_kind, idx, value) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            (
                file_id,
                songalbumid,
                songartistid,
                md.metadata_kind as u32,
                md.idx,
                &md.value,
            ),
        )?;
        Ok(())
    }

    /// Replace the whole extended metadata set of a file.
    pub fn file_metadata_add_all(
        &self,
        file_id: u32,
        songalbumid: i64,
        songartistid: i64,
        metadata: &[FileMetadata],
    ) -> Result<()> {
        self.file_metadata_clear(file_id)?;
        for md in metadata {
            self.file_metadata_add(file_id, songalbumid, songartistid, md)?;
        }
        Ok(())
    }

    pub fn file_metadata_clear(&self, file_id: u32) -> Result<()> {
        self.query_run("DELETE FROM files_metadata WHERE file_id = ?1;", (file_id,))?;
        Ok(())
    }
}

fn no_rows_to_none<T>(e: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

/// 1-based SUBSTR start that drops `prefix` but keeps the following slash,
/// so enable-by-cookie can prepend a new parent directly.
fn strip_len(prefix: &str, strip: Strip) -> i64 {
    match strip {
        Strip::Path => prefix.len() as i64 + 1,
        Strip::None => 1,
    }
}

/// The virtual path carries a "/file:" prefix in front of the fs path.
fn vpath_strip_len(path_strip: i64) -> i64 {
    if path_strip == 1 { 1 } else { path_strip + 6 }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::DISABLED_FAKE_COOKIE;

    /// A minimal music file the way the filescanner would deliver it.
    pub(crate) fn sample_mfi(path: &str, artist: &str, album: &str) -> MediaFile {
        MediaFile {
            path: path.to_string(),
            virtual_path: Some(format!("/file:{path}")),
            fname: path.rsplit('/').next().unwrap().to_string(),
            directory_id: crate::db::directories::DIR_FILE,
            title: Some(format!("Title of {path}")),
            artist: Some(artist.to_string()),
            album_artist: Some(artist.to_string()),
            album: Some(album.to_string()),
            song_length: 180_000,
            data_kind: DataKind::File,
            media_kind: Some(MediaKind::Music),
            scan_kind: ScanKind::Files,
            ..Default::default()
        }
    }

    #[test]
    fn add_assigns_id_and_hashes() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/a.mp3", "A", "X");
        let id = db.file_add(&mut mfi).unwrap();
        assert!(id > 0);

        assert_eq!(mfi.songalbumid, util::two_str_hash(Some("a"), Some("x")));
        assert_eq!(mfi.songartistid, util::two_str_hash(Some("a"), None));
    }

    #[test]
    fn groups_are_trigger_consistent() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/a.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();

        let albums = db
            .get_one_int(
                "SELECT COUNT(*) FROM groups WHERE type = 1 AND persistentid = ?1;",
                (mfi.songalbumid,),
            )
            .unwrap();
        assert_eq!(albums, Some(1));

        let artists = db
            .get_one_int(
                "SELECT COUNT(*) FROM groups WHERE type = 2 AND persistentid = ?1;",
                (mfi.songartistid,),
            )
            .unwrap();
        assert_eq!(artists, Some(1));
    }

    #[test]
    fn fixup_is_idempotent_through_roundtrip() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/b.mp3", "Some Artist", "Some Album");
        db.file_add(&mut mfi).unwrap();

        let mut fetched = db.file_fetch_byid(mfi.id).unwrap().unwrap();
        let before = fetched.clone();
        fetched.fixup(&db.cfg.library);
        assert_eq!(before, fetched);
    }

    #[test]
    fn missing_title_falls_back_to_fname() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/nameless.mp3", "A", "X");
        mfi.title = None;
        db.file_add(&mut mfi).unwrap();
        assert_eq!(mfi.title.as_deref(), Some("nameless.mp3"));
    }

    #[test]
    fn podcast_album_artist_is_emptied() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("http://cast/ep1", "Author", "The Cast");
        mfi.media_kind = Some(MediaKind::Podcast);
        mfi.data_kind = DataKind::Http;
        db.file_add(&mut mfi).unwrap();
        assert_eq!(mfi.album_artist.as_deref(), Some(""));
        assert_eq!(
            mfi.songalbumid,
            util::two_str_hash(Some(""), Some("the cast")) + DataKind::Http as i64
        );
    }

    #[test]
    fn update_keeps_counters_on_zero() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/c.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();
        db.file_inc_playcount(mfi.id).unwrap();
        db.file_rating_update(mfi.id, 80).unwrap();

        // Rescan delivers a fresh record with zeroed counters
        let mut rescanned = sample_mfi("/m/c.mp3", "A", "X");
        rescanned.id = mfi.id;
        db.file_update(&mut rescanned).unwrap();

        let stored = db.file_fetch_byid(mfi.id).unwrap().unwrap();
        assert_eq!(stored.play_count, 1);
        assert_eq!(stored.rating, 80);
    }

    #[test]
    fn disable_enable_bycookie_rewrites_paths() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/old/d.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();

        db.file_disable_bymatch("/m/old", Strip::Path, 4711).unwrap();
        let gone = db.file_id_bypath("/m/old/d.mp3").unwrap();
        assert_eq!(gone, None);

        let enabled = db.file_enable_bycookie(4711, "/m/new", None).unwrap();
        assert_eq!(enabled, 1);

        let found = db.file_fetch_byid(mfi.id).unwrap().unwrap();
        assert_eq!(found.path, "/m/new/d.mp3");
        assert_eq!(found.virtual_path.as_deref(), Some("/file:/m/new/d.mp3"));
        assert_eq!(found.disabled, 0);
    }

    #[test]
    fn fake_cookie_never_matches_a_rename() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/e.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();

        db.file_disable_bypath("/m/e.mp3", Strip::None, DISABLED_FAKE_COOKIE)
            .unwrap();
        // A 32-bit cookie can never equal the sentinel
        let enabled = db.file_enable_bycookie(u32::MAX, "/x", None).unwrap();
        assert_eq!(enabled, 0);
    }

    #[test]
    fn playcount_drives_rolling_rating() {
        let db = {
            let mut cfg = crate::conf::Config::default();
            cfg.library.rating_updates = true;
            let conn = rusqlite::Connection::open_in_memory().unwrap();
            crate::db::Db::from_connection(conn, std::sync::Arc::new(cfg)).unwrap()
        };
        let mut mfi = sample_mfi("/m/f.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();

        db.file_inc_playcount(mfi.id).unwrap();
        let stored = db.file_fetch_byid(mfi.id).unwrap().unwrap();
        // stable = 1/2 * 100 = 50, rolling = 0 + 50 = 50 -> 50*0.75 + 50*0.25
        assert_eq!(stored.rating, 50);
        assert_eq!(stored.play_count, 1);
    }

    #[test]
    fn counts_split_out_streams() {
        let db = Db::open_test();
        let mut file = sample_mfi("/m/g.mp3", "A", "X");
        db.file_add(&mut file).unwrap();
        let mut stream = sample_mfi("http://radio/1", "R", "S");
        stream.data_kind = DataKind::Http;
        db.file_add(&mut stream).unwrap();

        let (nitems, nstreams) = db.files_get_count(None).unwrap();
        assert_eq!((nitems, nstreams), (2, 1));

        let (music_only, _) = db
            .files_get_count(Some("f.data_kind = 0"))
            .unwrap();
        assert_eq!(music_only, 1);
    }

    #[test]
    fn purge_cruft_respects_reference_time() {
        let db = Db::open_test();
        let mut old = sample_mfi("/m/old.mp3", "A", "X");
        old.db_timestamp = 1000;
        old.media_kind = Some(MediaKind::Podcast);
        db.file_add(&mut old).unwrap();
        let mut new = sample_mfi("/m/new.mp3", "A", "X");
        new.db_timestamp = 1500;
        new.media_kind = Some(MediaKind::Podcast);
        db.file_add(&mut new).unwrap();

        db.purge_cruft(1200).unwrap();

        let (nitems, _) = db.files_get_count(None).unwrap();
        assert_eq!(nitems, 1);
        assert_eq!(db.file_id_bypath("/m/new.mp3").unwrap(), Some(new.id));
    }

    #[test]
    fn purge_bysource_keeps_other_sources() {
        let db = Db::open_test();
        let mut files_row = sample_mfi("/m/h.mp3", "A", "X");
        files_row.db_timestamp = 1000;
        db.file_add(&mut files_row).unwrap();
        let mut rss_row = sample_mfi("http://feed/ep", "A", "Y");
        rss_row.db_timestamp = 1000;
        rss_row.scan_kind = ScanKind::Rss;
        db.file_add(&mut rss_row).unwrap();

        db.purge_cruft_bysource(2000, ScanKind::Rss).unwrap();

        assert!(db.file_id_bypath("/m/h.mp3").unwrap().is_some());
        assert!(db.file_id_bypath("http://feed/ep").unwrap().is_none());
    }

    #[test]
    fn metadata_is_additive_and_clearable() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/i.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();

        let genres = [
            FileMetadata {
                metadata_kind: MetadataKind::Genre,
                idx: 0,
                value: "Electronic".into(),
            },
            FileMetadata {
                metadata_kind: MetadataKind::Genre,
                idx: 1,
                value: "House".into(),
            },
        ];
        db.file_metadata_add_all(mfi.id, mfi.songalbumid, mfi.songartistid, &genres)
            .unwrap();

        let count = db
            .get_one_int(
                "SELECT COUNT(*) FROM files_metadata WHERE file_id = ?1;",
                (mfi.id,),
            )
            .unwrap();
        assert_eq!(count, Some(2));

        // The primary genre field is untouched
        let stored = db.file_fetch_byid(mfi.id).unwrap().unwrap();
        assert_eq!(stored.genre, mfi.genre);

        db.file_metadata_clear(mfi.id).unwrap();
        let count = db
            .get_one_int(
                "SELECT COUNT(*) FROM files_metadata WHERE file_id = ?1;",
                (mfi.id,),
            )
            .unwrap();
        assert_eq!(count, Some(0));
    }
}
