use camino::Utf8PathBuf;
use color_eyre::{Result, Section, eyre::Context};
use lofty::file::{AudioFile, FileType, TaggedFileExt};
use lofty::probe::read_from_path;
use lofty::tag::{Accessor, ItemKey, Tag};

use crate::db::files::{Artwork, FileMetadata, MediaFile, MetadataKind};
use crate::scan::{FormatScanner, ScanOutput, bitrate_estimate};

pub struct Scanner;

impl Scanner {
    pub const fn new() -> Self {
        Scanner
    }
}

impl FormatScanner for Scanner {
    fn scan(&self, path: Utf8PathBuf) -> Result<Option<ScanOutput>> {
        let tagged_file = read_from_path(&path)
            .wrap_err("Could not open file for reading metadata")
            .with_note(|| format!("path is: {path}"))?;

        let mut mfi = MediaFile::default();
        let mut extra = Vec::new();

        let properties = tagged_file.properties();
        mfi.song_length = properties.duration().as_millis() as u32;
        mfi.samplerate = properties.sample_rate().unwrap_or(0);
        mfi.bits_per_sample = properties.bit_depth().unwrap_or(0) as u32;
        mfi.channels = properties.channels().unwrap_or(0) as u32;
        mfi.bitrate = properties
            .audio_bitrate()
            .or(properties.overall_bitrate())
            .unwrap_or(0);
        mfi.codectype = Some(codectype(tagged_file.file_type()).to_string());
        mfi.format = crate::scan::format_from_path(&path);

        if let Ok(fs_meta) = std::fs::metadata(&path) {
            mfi.file_size = fs_meta.len() as i64;
        }
        if mfi.bitrate == 0 {
            mfi.bitrate = bitrate_estimate(mfi.file_size, mfi.song_length);
        }

        let Some(tag) = tagged_file.primary_tag().or(tagged_file.first_tag()) else {
            // Stream parameters alone still make a usable item
            mfi.artwork = Artwork::None;
            return Ok(Some(ScanOutput { mfi, extra }));
        };

        mfi.artwork = if tag.picture_count() > 0 {
            Artwork::Embedded
        } else {
            Artwork::None
        };

        mfi.title = tag.title().map(|v| v.to_string());
        mfi.artist = tag.artist().map(|v| v.to_string());
        mfi.album = tag.album().map(|v| v.to_string());
        mfi.genre = tag.genre().map(|v| v.to_string());
        mfi.comment = tag.comment().map(|v| v.to_string());
        mfi.track = tag.track().unwrap_or(0);
        mfi.total_tracks = tag.track_total().unwrap_or(0);
        mfi.disc = tag.disk().unwrap_or(0);
        mfi.total_discs = tag.disk_total().unwrap_or(0);
        mfi.year = tag.year().unwrap_or(0);

        mfi.album_artist = item_string(tag, &ItemKey::AlbumArtist);
        mfi.composer = item_string(tag, &ItemKey::Composer);
        mfi.conductor = item_string(tag, &ItemKey::Conductor);
        mfi.grouping = item_string(tag, &ItemKey::ContentGroup);
        mfi.lyrics = item_string(tag, &ItemKey::Lyrics);
        mfi.bpm = item_string(tag, &ItemKey::Bpm)
            .map(|v| crate::util::parse_or_zero(&v))
            .unwrap_or(0);
        mfi.compilation = item_string(tag, &ItemKey::FlagCompilation).as_deref() == Some("1");

        mfi.title_sort = item_string(tag, &ItemKey::TrackTitleSortOrder);
        mfi.artist_sort = item_string(tag, &ItemKey::TrackArtistSortOrder);
        mfi.album_sort = item_string(tag, &ItemKey::AlbumTitleSortOrder);
        mfi.album_artist_sort = item_string(tag, &ItemKey::AlbumArtistSortOrder);
        mfi.composer_sort = item_string(tag, &ItemKey::ComposerSortOrder);

        if let Some(date) = item_string(tag, &ItemKey::RecordingDate)
            .or_else(|| item_string(tag, &ItemKey::OriginalReleaseDate))
            && let Some((year, released)) = parse_release_date(&date)
        {
            mfi.date_released = released;
            if mfi.year == 0 {
                mfi.year = year;
            }
        }

        // Multi-valued tags go to files_metadata in addition to (never
        // instead of) the primary field.
        collect_extra(tag, &ItemKey::Genre, MetadataKind::Genre, &mut extra);
        collect_extra(tag, &ItemKey::Composer, MetadataKind::Composer, &mut extra);
        if let Some(lyrics) = &mfi.lyrics {
            extra.push(FileMetadata {
                metadata_kind: MetadataKind::Lyrics,
                idx: 0,
                value: lyrics.clone(),
            });
        }
        for (key, kind) in [
            (ItemKey::MusicBrainzReleaseId, MetadataKind::MusicbrainzAlbumId),
            (ItemKey::MusicBrainzArtistId, MetadataKind::MusicbrainzArtistId),
            (
                ItemKey::MusicBrainzReleaseArtistId,
                MetadataKind::MusicbrainzAlbumArtistId,
            ),
        ] {
            if let Some(value) = item_string(tag, &key) {
                extra.push(FileMetadata {
                    metadata_kind: kind,
                    idx: 0,
                    value,
                });
            }
        }

        Ok(Some(ScanOutput { mfi, extra }))
    }
}

fn item_string(tag: &Tag, key: &ItemKey) -> Option<String> {
    tag.get_string(key).map(|v| v.to_string())
}

fn collect_extra(tag: &Tag, key: &ItemKey, kind: MetadataKind, extra: &mut Vec<FileMetadata>) {
    for (idx, value) in tag.get_strings(key).enumerate() {
        extra.push(FileMetadata {
            metadata_kind: kind,
            idx: idx as u32,
            value: value.to_string(),
        });
    }
}

fn codectype(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Mpeg => "mpeg",
        FileType::Flac => "flac",
        FileType::Mp4 => "mp4a",
        FileType::Aac => "mp4a",
        FileType::Vorbis => "ogg",
        FileType::Opus => "opus",
        FileType::Wav => "pcm16",
        FileType::Aiff => "pcm16",
        FileType::Ape => "ape",
        FileType::WavPack => "wv",
        FileType::Speex => "ogg",
        _ => "unkn",
    }
}

/// "2004", "2004-06", "2004-06-01" and full timestamps all occur in the wild.
fn parse_release_date(date: &str) -> Option<(u32, i64)> {
    let date = date.trim();
    let year: u32 = date.get(0..4)?.parse().ok()?;
    if year == 0 {
        return None;
    }

    let month: i8 = date
        .get(5..7)
        .and_then(|m| m.parse().ok())
        .filter(|m| (1..=12).contains(m))
        .unwrap_or(1);
    let day: i8 = date
        .get(8..10)
        .and_then(|d| d.parse().ok())
        .filter(|d| (1..=31).contains(d))
        .unwrap_or(1);

    let civil = jiff::civil::Date::new(year as i16, month, day).ok()?;
    let released = civil
        .to_zoned(jiff::tz::TimeZone::UTC)
        .ok()?
        .timestamp()
        .as_second();
    Some((year, released))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn release_dates_in_the_wild() {
        let (year, epoch) = parse_release_date("1977-10-14").unwrap();
        assert_eq!(year, 1977);
        assert_eq!(epoch, 245635200);

        let (year, epoch) = parse_release_date("2004").unwrap();
        assert_eq!(year, 2004);
        assert_eq!(epoch, 1072915200);

        assert_eq!(parse_release_date("not a date"), None);
        assert_eq!(parse_release_date("0000"), None);
    }
}
