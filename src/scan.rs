//! Tag extraction from source media.
//!
//! Extraction only fills the descriptive and audio-property fields of a
//! [`MediaFile`]; locator fields (path, fname, virtual path, directory) and
//! ownership are the scanner's business. Normalization happens later in the
//! fixup passes when the record is saved.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;

use crate::db::files::{FileMetadata, MediaFile};

pub mod http;
mod lofty;
mod moosicbox_audiotags;
pub mod writeback;

/// Tags and audio properties extracted from one file, plus the multi-valued
/// extras destined for `files_metadata`.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub mfi: MediaFile,
    pub extra: Vec<FileMetadata>,
}

trait FormatScanner: Send + Sync {
    fn scan(&self, path: Utf8PathBuf) -> Result<Option<ScanOutput>>;
}

const SCANNERS: &[&dyn FormatScanner] =
    &[&lofty::Scanner::new(), &moosicbox_audiotags::Scanner::new()];

/// Run the format scanners over a file until one of them understands it.
/// `None` means no scanner could parse the file; the item is then skipped
/// and the scan continues.
pub fn scan_file(path: &Utf8Path) -> Option<ScanOutput> {
    SCANNERS
        .iter()
        .filter_map(|scanner| {
            scanner
                .scan(path.to_path_buf())
                .map_err(|e| tracing::debug!("Scanner failed on {path}: {e:#}"))
                .ok()
                .flatten()
        })
        .next()
}

/// daap.songformat, derived from the file extension.
pub fn format_from_path(path: &Utf8Path) -> Option<String> {
    path.extension().map(|ext| ext.to_ascii_lowercase())
}

/// Estimate the bitrate from size and duration when the container does not
/// state one.
pub fn bitrate_estimate(file_size: i64, song_length_ms: u32) -> u32 {
    if song_length_ms == 0 {
        return 0;
    }
    ((file_size as u64 * 8) / song_length_ms as u64) as u32
}

/// File extensions the filescanner considers audio/video media.
pub fn is_media_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "m4b" | "m4r" | "m4v" | "mp4" | "aac" | "flac" | "ogg" | "oga" | "opus"
            | "wav" | "aif" | "aiff" | "wma" | "ape" | "mpc" | "mkv" | "avi" | "mov" | "wv"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn bitrate_estimate_from_size() {
        // 1 MB over 60 s is about 133 kbit/s
        assert_eq!(bitrate_estimate(1_000_000, 60_000), 133);
        assert_eq!(bitrate_estimate(1_000_000, 0), 0);
    }

    #[test]
    fn format_is_lowercased_extension() {
        assert_eq!(
            format_from_path(Utf8Path::new("/m/A.MP3")).as_deref(),
            Some("mp3")
        );
        assert_eq!(format_from_path(Utf8Path::new("/m/noext")), None);
    }

    #[test]
    fn unknown_files_are_skipped() {
        assert!(scan_file(Utf8Path::new("/definitely/not/here.mp3")).is_none());
    }
}
