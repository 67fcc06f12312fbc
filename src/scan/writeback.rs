//! Writing ratings back into source media.
//!
//! Only mp3 and flac have a safe tag round-trip; every other container is an
//! error, never a silent no-op. The write happens on a copy which is renamed
//! over the original only after a successful save, so a failure mid-write
//! leaves the original untouched.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::bail;
use color_eyre::{Result, Section, eyre::Context};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::read_from_path;
use lofty::tag::{ItemKey, ItemValue, Tag, TagItem};

use crate::db::files::MediaFile;

/// The tag entry used for ratings, stored in the 0..max_rating scale the
/// user configured.
const RATING_KEY: &str = "RATING";

pub fn rating_key() -> ItemKey {
    ItemKey::Unknown(RATING_KEY.to_string())
}

/// Write the file's stored rating into its tags.
pub fn write_rating(mfi: &MediaFile, max_rating: u32) -> Result<()> {
    let path = Utf8Path::new(&mfi.path);
    match path.extension().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("mp3") | Some("flac") => {}
        other => {
            bail!(
                "Tag write-back is only supported for mp3 and flac, not {:?}",
                other.unwrap_or("(none)")
            );
        }
    }

    let file_rating = (mfi.rating * max_rating).div_ceil(crate::db::RATING_MAX);

    // Already at the target value, nothing to write
    let tagged = read_from_path(path)
        .wrap_err("Could not open file for tag write-back")
        .with_note(|| format!("path: {path}"))?;
    let current: Option<u32> = tagged
        .primary_tag()
        .and_then(|tag| tag.get_string(&rating_key()))
        .map(crate::util::parse_or_zero);
    if current == Some(file_rating) {
        tracing::debug!("Rating of {path} already {file_rating}, not writing");
        return Ok(());
    }

    let tmp = tmp_path(path);
    std::fs::copy(path, &tmp)
        .wrap_err("Could not copy file for tag write-back")
        .with_note(|| format!("path: {path}"))?;

    let result = write_rating_to(&tmp, tagged, file_rating)
        .and_then(|()| std::fs::rename(&tmp, path).wrap_err("Could not move updated file back"));

    if result.is_err() {
        // Fail closed: the original is untouched, just drop the copy
        if let Err(e) = std::fs::remove_file(&tmp) {
            tracing::error!("Could not remove temporary file {tmp}: {e}");
        }
    }
    result
}

fn write_rating_to(
    tmp: &Utf8Path,
    mut tagged: lofty::file::TaggedFile,
    file_rating: u32,
) -> Result<()> {
    let tag = match tagged.primary_tag_mut() {
        Some(tag) => tag,
        None => {
            let tag_type = tagged.primary_tag_type();
            tagged.insert_tag(Tag::new(tag_type));
            tagged.primary_tag_mut().expect("tag was just inserted")
        }
    };

    tag.insert(TagItem::new(
        rating_key(),
        ItemValue::Text(file_rating.to_string()),
    ));

    tagged
        .save_to_path(tmp, lofty::config::WriteOptions::default())
        .wrap_err("Could not write tags")
        .with_note(|| format!("path: {tmp}"))
}

fn tmp_path(path: &Utf8Path) -> Utf8PathBuf {
    let fname = path.file_name().unwrap_or("media");
    match path.parent() {
        Some(parent) => parent.join(format!(".{fname}.tag-tmp")),
        None => Utf8PathBuf::from(format!(".{fname}.tag-tmp")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unsupported_containers_error_out() {
        let mfi = MediaFile {
            path: "/m/a.ogg".into(),
            rating: 80,
            ..Default::default()
        };
        assert!(write_rating(&mfi, 100).is_err());

        let mfi = MediaFile {
            path: "/m/noext".into(),
            ..Default::default()
        };
        assert!(write_rating(&mfi, 100).is_err());
    }

    #[test]
    fn tmp_path_is_hidden_sibling() {
        assert_eq!(
            tmp_path(Utf8Path::new("/m/album/a.mp3")),
            Utf8Path::new("/m/album/.a.mp3.tag-tmp")
        );
    }

    #[test]
    fn rating_scales_to_configured_max() {
        // 80/100 in a 5-star world is 4
        assert_eq!((80u32 * 5).div_ceil(100), 4);
        assert_eq!((90u32 * 5).div_ceil(100), 5);
    }
}
