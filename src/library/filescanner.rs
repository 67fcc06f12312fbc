//! The local files source: directory walking, playlist files and tag
//! write-back.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use itertools::Itertools;
use jiff::Timestamp;

use crate::db::directories::DIR_FILE;
use crate::db::files::MediaFile;
use crate::db::queue::QueueAddResult;
use crate::db::query::QueryParams;
use crate::db::{DataKind, PlType, ScanKind};
use crate::library::{self, Library, LibrarySource};
use crate::scan::{self, http, writeback};
use crate::smartpl;
use crate::util;

pub struct FileScanner {
    /// Directory path to row id, rebuilt on every walk
    dir_ids: HashMap<Utf8PathBuf, u32>,
}

impl FileScanner {
    pub fn new() -> FileScanner {
        FileScanner {
            dir_ids: HashMap::new(),
        }
    }

    fn scan_all(&mut self, lib: &Library, force_meta: bool) -> Result<()> {
        let ref_time = util::now_secs();
        let dirs = lib.cfg.library.directories.clone();
        if dirs.is_empty() {
            tracing::warn!("No library directories configured, nothing to scan");
            return Ok(());
        }

        let mut counts = ScanCounts::default();
        for dir in &dirs {
            self.scan_directory(lib, dir, force_meta, &mut counts)?;
            if library::is_exiting() {
                tracing::info!("Scan of {dir} interrupted by shutdown");
                return Ok(());
            }
        }

        lib.db.purge_cruft_bysource(ref_time, ScanKind::Files)?;
        lib.db.groups_cleanup()?;
        tracing::info!(
            "File scan done: {} cached, {} added or updated, {} skipped",
            counts.cached,
            counts.scanned,
            counts.skipped
        );
        Ok(())
    }

    fn scan_directory(
        &mut self,
        lib: &Library,
        dir: &Utf8Path,
        force_meta: bool,
        counts: &mut ScanCounts,
    ) -> Result<()> {
        self.dir_ids.clear();

        let walker = walkdir::WalkDir::new(dir)
            .follow_links(lib.cfg.library.follow_symlinks)
            .into_iter();

        // Playlists are scanned after all media files, so their items can be
        // resolved against fresh rows.
        let mut playlists = Vec::new();

        for entry in walker {
            if library::is_exiting() {
                break;
            }
            let Ok(entry) = entry else {
                counts.skipped += 1;
                continue;
            };
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                tracing::warn!("Path is not valid UTF-8, skipping: {:?}", entry.path());
                counts.skipped += 1;
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                counts.skipped += 1;
                continue;
            };

            if meta.is_dir() {
                self.register_directory(lib, path)?;
                continue;
            }

            if self.should_ignore(lib, path) {
                counts.skipped += 1;
                continue;
            }

            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| Timestamp::try_from(t).ok())
                .map(|t| t.as_second())
                .unwrap_or(0);

            match path.extension().map(|e| e.to_ascii_lowercase()).as_deref() {
                Some(ext) if scan::is_media_extension(ext) => {
                    self.scan_media(lib, path, mtime, force_meta, counts)?;
                }
                Some("m3u") | Some("m3u8") | Some("pls") | Some("smartpl") => {
                    playlists.push((path.to_path_buf(), mtime));
                }
                Some("xml") if path.file_name() == Some("iTunes Music Library.xml") => {
                    playlists.push((path.to_path_buf(), mtime));
                }
                _ => counts.skipped += 1,
            }
        }

        for (path, mtime) in playlists {
            if library::is_exiting() {
                break;
            }
            let result = match path.extension().map(|e| e.to_ascii_lowercase()).as_deref() {
                Some("smartpl") => self.scan_smartpl(lib, &path),
                Some("xml") => super::itunes::scan_itunes_xml(lib, &path),
                _ => self.scan_playlist(lib, &path, mtime),
            };
            if let Err(e) = result {
                tracing::error!("Could not scan playlist {path}: {e:#}");
            }
        }

        Ok(())
    }

    fn should_ignore(&self, lib: &Library, path: &Utf8Path) -> bool {
        if path
            .file_name()
            .is_some_and(|name| name.starts_with('.') || name.starts_with("_"))
        {
            return true;
        }
        for suffix in &lib.cfg.library.filetypes_ignore {
            if path.as_str().ends_with(suffix.as_str()) {
                return true;
            }
        }
        for fragment in &lib.cfg.library.filepath_ignore {
            if path.as_str().contains(fragment.as_str()) {
                return true;
            }
        }
        false
    }

    /// Keep the `directories` tree in sync with the walk, chaining parents up
    /// to the `/file:` root.
    fn register_directory(&mut self, lib: &Library, path: &Utf8Path) -> Result<u32> {
        if let Some(id) = self.dir_ids.get(path) {
            return Ok(*id);
        }
        if let Some(id) = lib.db.directory_id_bypath(path.as_str())? {
            lib.db.directory_ping_bymatch(&format!("/file:{path}"))?;
            self.dir_ids.insert(path.to_path_buf(), id);
            return Ok(id);
        }

        let parent_id = match path.parent() {
            Some(parent) if parent.as_str() != "" && parent.as_str() != "/" => {
                self.register_directory(lib, parent)?
            }
            _ => DIR_FILE,
        };

        let id = lib.directory_save(
            &format!("/file:{path}"),
            Some(path.as_str()),
            0,
            parent_id,
            ScanKind::Files,
        )?;
        self.dir_ids.insert(path.to_path_buf(), id);
        Ok(id)
    }

    fn scan_media(
        &mut self,
        lib: &Library,
        path: &Utf8Path,
        mtime: i64,
        force_meta: bool,
        counts: &mut ScanCounts,
    ) -> Result<()> {
        // Unchanged files only get their timestamp refreshed
        if !force_meta && lib.db.file_ping_bypath(path.as_str(), mtime)? {
            counts.cached += 1;
            return Ok(());
        }

        let Some(mut out) = scan::scan_file(path) else {
            tracing::debug!("No scanner could read {path}");
            counts.skipped += 1;
            return Ok(());
        };

        let directory_id = match path.parent() {
            Some(parent) => self.register_directory(lib, parent)?,
            None => DIR_FILE,
        };

        out.mfi.id = lib.db.file_id_bypath(path.as_str())?.unwrap_or(0);
        out.mfi.path = path.to_string();
        out.mfi.virtual_path = Some(format!("/file:{path}"));
        out.mfi.fname = path.file_name().unwrap_or_default().to_string();
        out.mfi.directory_id = directory_id;
        out.mfi.data_kind = DataKind::File;
        out.mfi.scan_kind = ScanKind::Files;
        out.mfi.time_modified = mtime;
        out.mfi.db_timestamp = util::now_secs();

        if lib.cfg.library.only_first_genre
            && let Some(genre) = &out.mfi.genre
            && let Some((first, _)) = genre.split_once(';')
        {
            out.mfi.genre = Some(first.trim().to_string());
        }

        let id = lib.media_save(&mut out.mfi)?;
        lib.db
            .file_metadata_add_all(id, out.mfi.songalbumid, out.mfi.songartistid, &out.extra)?;
        counts.scanned += 1;
        Ok(())
    }

    /// M3U (with EXTINF) and PLS playlists.
    fn scan_playlist(&mut self, lib: &Library, path: &Utf8Path, mtime: i64) -> Result<()> {
        let existing = lib.db.pl_fetch_bypath(path.as_str())?;
        if let Some(pli) = &existing
            && pli.db_timestamp >= mtime
        {
            lib.db.pl_ping(pli.id)?;
            return Ok(());
        }

        let directory_id = match path.parent() {
            Some(parent) => self.register_directory(lib, parent)?,
            None => DIR_FILE,
        };

        let mut pli = existing.unwrap_or_default();
        pli.pl_type = PlType::Plain;
        pli.title = Some(
            path.file_stem()
                .unwrap_or("playlist")
                .to_string(),
        );
        pli.path = Some(path.to_string());
        pli.virtual_path = Some(format!("/file:{path}"));
        pli.directory_id = directory_id;
        pli.scan_kind = ScanKind::Files;
        pli.db_timestamp = util::now_secs();
        let plid = lib.playlist_save(&mut pli)?;
        lib.db.pl_clear_items(plid)?;

        let content = crate::text_encoding::decode_tag(&std::fs::read(path)?);
        let base = path.parent().unwrap_or(Utf8Path::new("/"));
        let is_pls = path.extension().map(|e| e.to_ascii_lowercase()).as_deref() == Some("pls");

        let mut extinf: Option<(Option<String>, Option<String>)> = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let entry = if is_pls {
                match line.split_once('=') {
                    Some((key, value)) if key.starts_with("File") => value.trim().to_string(),
                    _ => continue,
                }
            } else if let Some(info) = line.strip_prefix("#EXTINF:") {
                extinf = Some(parse_extinf(info));
                continue;
            } else if line.starts_with('#') {
                continue;
            } else {
                line.to_string()
            };

            let overrides = if lib.cfg.library.m3u_overrides {
                extinf.take()
            } else {
                extinf.take();
                None
            };
            if let Err(e) = self.add_playlist_entry(lib, plid, base, &entry, overrides) {
                tracing::debug!("Skipping playlist entry '{entry}': {e:#}");
            }
        }
        Ok(())
    }

    fn add_playlist_entry(
        &mut self,
        lib: &Library,
        plid: u32,
        base: &Utf8Path,
        entry: &str,
        overrides: Option<(Option<String>, Option<String>)>,
    ) -> Result<()> {
        if entry.starts_with("http://") || entry.starts_with("https://") {
            // Streams referenced from playlists become library items of their
            // own so the join on files.path works
            match lib.db.file_id_bypath(entry)? {
                None => {
                    let mut mfi = MediaFile {
                        path: entry.to_string(),
                        virtual_path: Some(format!("/http:/{entry}")),
                        fname: entry.rsplit('/').next().unwrap_or(entry).to_string(),
                        directory_id: crate::db::directories::DIR_HTTP,
                        data_kind: DataKind::Http,
                        scan_kind: ScanKind::Files,
                        ..Default::default()
                    };
                    if let Some((artist, title)) = overrides {
                        mfi.artist = artist;
                        mfi.title = title;
                    }
                    lib.media_save(&mut mfi)?;
                }
                Some(id) => lib.db.file_ping(id)?,
            }
            lib.db.pl_add_item_bypath(plid, entry)?;
            return Ok(());
        }

        let resolved = if entry.starts_with('/') {
            Utf8PathBuf::from(entry)
        } else {
            base.join(entry)
        };
        lib.db.pl_add_item_bypath(plid, resolved.as_str())?;
        Ok(())
    }

    fn scan_smartpl(&mut self, lib: &Library, path: &Utf8Path) -> Result<()> {
        let parsed = smartpl::parse_file(path)?;

        let mut pli = lib.db.pl_fetch_bypath(path.as_str())?.unwrap_or_default();
        pli.pl_type = PlType::Smart;
        pli.title = Some(parsed.title.clone());
        pli.query = Some(parsed.where_clause());
        pli.query_order = parsed.order_clause();
        pli.query_limit = parsed.limit;
        pli.path = Some(path.to_string());
        pli.virtual_path = Some(format!("/file:{path}"));
        pli.scan_kind = ScanKind::Files;
        pli.db_timestamp = util::now_secs();
        lib.playlist_save(&mut pli)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScanCounts {
    cached: u32,
    scanned: u32,
    skipped: u32,
}

/// `#EXTINF:123,Artist - Title` -> (artist, title)
fn parse_extinf(info: &str) -> (Option<String>, Option<String>) {
    let Some((_len, rest)) = info.split_once(',') else {
        return (None, None);
    };
    match rest.split_once(" - ") {
        Some((artist, title)) => (
            Some(artist.trim().to_string()),
            Some(title.trim().to_string()),
        ),
        None => (None, Some(rest.trim().to_string())),
    }
}

impl LibrarySource for FileScanner {
    fn scan_kind(&self) -> ScanKind {
        ScanKind::Files
    }

    fn rescan(&mut self, lib: &Library) -> Result<()> {
        self.scan_all(lib, false)
    }

    fn metarescan(&mut self, lib: &Library) -> Result<()> {
        self.scan_all(lib, true)
    }

    fn fullrescan(&mut self, lib: &Library) -> Result<()> {
        self.scan_all(lib, true)
    }

    fn write_metadata(&self, lib: &Library, mfi: &MediaFile) -> Result<()> {
        writeback::write_rating(mfi, lib.cfg.library.max_rating)
    }

    fn rescan_path(&mut self, lib: &Library, path: &Utf8Path) -> Result<bool> {
        if !lib
            .cfg
            .library
            .directories
            .iter()
            .any(|dir| path.starts_with(dir))
        {
            return Ok(false);
        }

        let mut counts = ScanCounts::default();
        if path.is_dir() {
            self.scan_directory(lib, path, false, &mut counts)?;
        } else if path.is_file() {
            let mtime = std::fs::metadata(path.as_std_path())
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| Timestamp::try_from(t).ok())
                .map(|t| t.as_second())
                .unwrap_or(0);
            self.scan_media(lib, path, mtime, false, &mut counts)?;
        } else {
            // Path is gone; disable now, purge catches it later
            lib.db.file_disable_bypath(
                path.as_str(),
                crate::db::Strip::None,
                crate::db::DISABLED_FAKE_COOKIE,
            )?;
            lib.db.file_disable_bymatch(
                path.as_str(),
                crate::db::Strip::None,
                crate::db::DISABLED_FAKE_COOKIE,
            )?;
            lib.db.pl_disable_bypath(
                path.as_str(),
                crate::db::Strip::None,
                crate::db::DISABLED_FAKE_COOKIE,
            )?;
        }
        Ok(true)
    }

    fn item_add(&mut self, lib: &Library, path: &str) -> Result<bool> {
        if path.starts_with("http://") || path.starts_with("https://") {
            let mut mfi = http::probe_stream(path)?;
            mfi.id = lib.db.file_id_bypath(path)?.unwrap_or(0);
            mfi.scan_kind = ScanKind::Files;
            mfi.db_timestamp = util::now_secs();
            lib.media_save(&mut mfi)?;
            return Ok(true);
        }

        let fs_path = Utf8Path::new(path);
        if !fs_path.is_file() {
            return Ok(false);
        }
        let mut counts = ScanCounts::default();
        let mtime = std::fs::metadata(fs_path.as_std_path())
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| Timestamp::try_from(t).ok())
            .map(|t| t.as_second())
            .unwrap_or(0);
        self.scan_media(lib, fs_path, mtime, true, &mut counts)?;
        Ok(true)
    }

    fn playlist_item_add(&mut self, lib: &Library, vp_playlist: &str, vp_item: &str) -> Result<bool> {
        let Some(pli) = lib.db.pl_fetch_byvirtualpath(vp_playlist)? else {
            return Ok(false);
        };
        let Some(item_id) = lib.db.file_id_byvirtualpath(vp_item)? else {
            return Ok(false);
        };
        let Some(pl_path) = &pli.path else {
            return Ok(false);
        };
        let Some(item_path) = lib.db.file_path_byid(item_id)? else {
            return Ok(false);
        };

        // Keep the playlist file on disk the source of truth
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(pl_path)?;
        writeln!(file, "{item_path}")?;

        lib.db.pl_add_item_byid(pli.id, item_id)?;
        lib.db.pl_ping(pli.id)?;
        Ok(true)
    }

    fn playlist_remove(&mut self, lib: &Library, virtual_path: &str) -> Result<bool> {
        let Some(pli) = lib.db.pl_fetch_byvirtualpath(virtual_path)? else {
            return Ok(false);
        };
        if pli.scan_kind != ScanKind::Files {
            return Ok(false);
        }
        if let Some(path) = &pli.path
            && let Err(e) = std::fs::remove_file(path)
        {
            tracing::warn!("Could not remove playlist file {path}: {e}");
        }
        lib.db.pl_delete(pli.id)?;
        Ok(true)
    }

    fn queue_save(&mut self, lib: &Library, virtual_path: &str) -> Result<bool> {
        let Some(path) = virtual_path.strip_prefix("/file:") else {
            return Ok(false);
        };
        let path = if path.ends_with(".m3u") {
            Utf8PathBuf::from(path)
        } else {
            Utf8PathBuf::from(format!("{path}.m3u"))
        };

        let items = lib.db.queue_fetch_all(false)?;
        let entries = items
            .iter()
            .map(|qi| match (&qi.artist, &qi.title) {
                (Some(artist), Some(title)) => format!(
                    "#EXTINF:{},{artist} - {title}\n{}",
                    qi.song_length / 1000,
                    qi.path
                ),
                _ => qi.path.clone(),
            })
            .join("\n");
        std::fs::write(&path, format!("#EXTM3U\n{entries}\n"))?;

        let mtime = util::now_secs();
        self.scan_playlist(lib, &path, mtime)?;
        Ok(true)
    }

    fn queue_item_add(
        &mut self,
        lib: &Library,
        path: &str,
        position: i32,
        reshuffle: bool,
        item_id: u32,
    ) -> Result<Option<QueueAddResult>> {
        if !self.item_add(lib, path)? {
            return Ok(None);
        }
        let Some(file_id) = lib.db.file_id_bypath(path)? else {
            return Ok(None);
        };

        let mut qp = QueryParams {
            filter: Some(format!("f.id = {file_id}")),
            ..Default::default()
        };
        let result = lib
            .db
            .queue_add_by_query(&mut qp, reshuffle, item_id, position)?;
        Ok(Some(result))
    }
}
