use camino::Utf8PathBuf;
use color_eyre::{Result, Section, eyre::Context};
use moosicbox_audiotags::{Error, Tag};

use crate::db::files::MediaFile;
use crate::scan::{FormatScanner, ScanOutput};

/// Fallback scanner for files the primary extractor cannot parse. Covers the
/// basic descriptive tags only.
pub struct Scanner;

impl Scanner {
    pub const fn new() -> Self {
        Scanner
    }
}

impl FormatScanner for Scanner {
    fn scan(&self, path: Utf8PathBuf) -> Result<Option<ScanOutput>> {
        let tag = match Tag::new().read_from_path(&path) {
            Ok(tag) => tag,
            Err(
                Error::UnknownFileExtension(_)
                | Error::UnsupportedFormat(_)
                | Error::UnsupportedMimeType(_),
            ) => return Ok(None),
            Err(other) => {
                return Err(other)
                    .wrap_err("Could not parse metadata")
                    .with_note(|| format!("path: {path}"));
            }
        };

        let mut mfi = MediaFile {
            title: tag.title().map(str::to_string),
            artist: tag.artist().map(str::to_string),
            album: tag.album().map(|album| album.title.to_string()),
            album_artist: tag.album_artist().map(str::to_string),
            genre: tag.genre().map(str::to_string),
            composer: tag.composer().map(str::to_string),
            year: tag.year().unwrap_or(0) as u32,
            track: tag.track_number().unwrap_or(0) as u32,
            total_tracks: tag.total_tracks().unwrap_or(0) as u32,
            disc: tag.disc_number().unwrap_or(0) as u32,
            total_discs: tag.total_discs().unwrap_or(0) as u32,
            song_length: tag
                .duration()
                .map(|secs| (secs * 1000.0) as u32)
                .unwrap_or(0),
            format: crate::scan::format_from_path(&path),
            ..Default::default()
        };

        if let Ok(fs_meta) = std::fs::metadata(&path) {
            mfi.file_size = fs_meta.len() as i64;
        }
        if mfi.bitrate == 0 {
            mfi.bitrate = crate::scan::bitrate_estimate(mfi.file_size, mfi.song_length);
        }

        Ok(Some(ScanOutput {
            mfi,
            extra: Vec::new(),
        }))
    }
}
