//! Import of an "iTunes Music Library.xml".
//!
//! The XML is an Apple plist; tracks are reconciled against already scanned
//! files by longest path suffix match, then the iTunes playlists are rebuilt
//! on top. iTunes metadata only overrides file tags when the user opted in.

use std::collections::HashMap;

use camino::Utf8Path;
use color_eyre::Result;
use color_eyre::eyre::bail;
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::db::{PlType, ScanKind};
use crate::library::Library;
use crate::util;

/// Playlists iTunes maintains by itself; importing them would duplicate the
/// special playlists.
const IGNORED_PLAYLISTS: &[&str] = &[
    "Library",
    "Music",
    "Movies",
    "TV Shows",
    "Podcasts",
    "Audiobooks",
    "Purchased",
    "Party Shuffle",
    "Genius",
    "Downloaded",
];

/// A parsed plist value. Only the shapes that occur in library exports.
#[derive(Debug, Clone, PartialEq)]
pub enum Plist {
    Dict(HashMap<String, Plist>),
    Array(Vec<Plist>),
    String(String),
    Integer(i64),
    Bool(bool),
}

impl Plist {
    fn as_dict(&self) -> Option<&HashMap<String, Plist>> {
        match self {
            Plist::Dict(d) => Some(d),
            _ => None,
        }
    }

    fn as_array(&self) -> Option<&[Plist]> {
        match self {
            Plist::Array(a) => Some(a),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Plist::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Plist::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// Event-driven plist reader. Strings, integers, booleans, dates (read as
/// strings), dicts and arrays.
pub fn parse_plist(xml: &str) -> Result<Plist> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    enum Frame {
        Dict(HashMap<String, Plist>, Option<String>),
        Array(Vec<Plist>),
    }

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Plist> = None;
    let mut text = String::new();

    fn push(stack: &mut Vec<Frame>, root: &mut Option<Plist>, value: Plist) {
        match stack.last_mut() {
            Some(Frame::Dict(map, key)) => {
                if let Some(key) = key.take() {
                    map.insert(key, value);
                }
            }
            Some(Frame::Array(items)) => items.push(value),
            None => *root = Some(value),
        }
    }

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                text.clear();
                match start.name().as_ref() {
                    b"dict" => stack.push(Frame::Dict(HashMap::new(), None)),
                    b"array" => stack.push(Frame::Array(Vec::new())),
                    _ => {}
                }
            }
            Event::Text(t) => {
                text.push_str(&t.unescape()?);
            }
            Event::End(end) => {
                let value = match end.name().as_ref() {
                    b"dict" => match stack.pop() {
                        Some(Frame::Dict(map, _)) => Some(Plist::Dict(map)),
                        _ => bail!("Unbalanced dict in plist"),
                    },
                    b"array" => match stack.pop() {
                        Some(Frame::Array(items)) => Some(Plist::Array(items)),
                        _ => bail!("Unbalanced array in plist"),
                    },
                    b"key" => {
                        if let Some(Frame::Dict(_, key)) = stack.last_mut() {
                            *key = Some(std::mem::take(&mut text));
                        }
                        None
                    }
                    b"string" | b"data" | b"date" => {
                        Some(Plist::String(std::mem::take(&mut text)))
                    }
                    b"integer" => Some(Plist::Integer(util::parse_or_zero(&text))),
                    _ => None,
                };
                if let Some(value) = value {
                    push(&mut stack, &mut root, value);
                }
                text.clear();
            }
            Event::Empty(empty) => {
                let value = match empty.name().as_ref() {
                    b"true" => Some(Plist::Bool(true)),
                    b"false" => Some(Plist::Bool(false)),
                    _ => None,
                };
                if let Some(value) = value {
                    push(&mut stack, &mut root, value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or_else(|| color_eyre::eyre::eyre!("Empty plist"))
}

pub fn scan_itunes_xml(lib: &Library, path: &Utf8Path) -> Result<()> {
    tracing::info!("Importing iTunes library {path}");
    let xml = std::fs::read_to_string(path)?;
    let plist = parse_plist(&xml)?;
    let Some(top) = plist.as_dict() else {
        bail!("iTunes library XML has no top-level dict");
    };

    let Some(tracks) = top.get("Tracks").and_then(Plist::as_dict) else {
        bail!("iTunes library XML has no Tracks dict");
    };

    // iTunes track id -> files.path
    let mut track_paths: HashMap<i64, String> = HashMap::new();
    let mut matched = 0usize;
    for (track_id, track) in tracks {
        let Some(track) = track.as_dict() else {
            continue;
        };
        let Some(location) = track.get("Location").and_then(Plist::as_str) else {
            continue;
        };
        let Some(decoded) = location_to_path(location) else {
            continue;
        };
        let Some((file_id, file_path)) = resolve_by_suffix(lib, &decoded)? else {
            tracing::debug!("No match in library for iTunes track {decoded}");
            continue;
        };

        matched += 1;
        track_paths.insert(util::parse_or_zero(track_id), file_path);

        if lib.cfg.library.itunes_overrides {
            apply_overrides(lib, file_id, track)?;
        }
    }
    tracing::info!("Matched {matched} of {} iTunes tracks", tracks.len());

    let Some(playlists) = top.get("Playlists").and_then(Plist::as_array) else {
        return Ok(());
    };

    for playlist in playlists {
        let Some(playlist) = playlist.as_dict() else {
            continue;
        };
        let Some(name) = playlist.get("Name").and_then(Plist::as_str) else {
            continue;
        };
        if IGNORED_PLAYLISTS.contains(&name)
            || playlist.contains_key("Distinguished Kind")
            || playlist.contains_key("Smart Info")
            || playlist.get("Master").is_some()
        {
            continue;
        }
        let Some(items) = playlist.get("Playlist Items").and_then(Plist::as_array) else {
            continue;
        };

        if let Err(e) = import_playlist(lib, path, name, items, &track_paths) {
            tracing::error!("Could not import iTunes playlist '{name}': {e:#}");
        }
    }
    Ok(())
}

fn import_playlist(
    lib: &Library,
    xml_path: &Utf8Path,
    name: &str,
    items: &[Plist],
    track_paths: &HashMap<i64, String>,
) -> Result<()> {
    let pl_path = format!("{xml_path}#{name}");
    let mut pli = lib.db.pl_fetch_bypath(&pl_path)?.unwrap_or_default();
    pli.pl_type = PlType::Plain;
    pli.title = Some(name.to_string());
    pli.path = Some(pl_path.clone());
    pli.virtual_path = Some(format!("/file:{pl_path}"));
    pli.scan_kind = ScanKind::Files;
    pli.db_timestamp = util::now_secs();
    let plid = lib.playlist_save(&mut pli)?;
    lib.db.pl_clear_items(plid)?;

    let mut added = 0;
    for item in items {
        let Some(track_id) = item
            .as_dict()
            .and_then(|d| d.get("Track ID"))
            .and_then(Plist::as_int)
        else {
            continue;
        };
        if let Some(path) = track_paths.get(&track_id) {
            lib.db.pl_add_item_bypath(plid, path)?;
            added += 1;
        }
    }
    tracing::info!("Imported iTunes playlist '{name}' with {added} items");
    Ok(())
}

/// `file://localhost/m/album/track.mp3` (percent-encoded) -> `/m/album/track.mp3`
fn location_to_path(location: &str) -> Option<String> {
    let rest = location
        .strip_prefix("file://localhost")
        .or_else(|| location.strip_prefix("file://"))?;
    Some(percent_decode(rest))
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16)
        {
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    crate::text_encoding::decode_tag(&out)
}

/// Find the library file whose path shares the longest trailing run with the
/// iTunes location. Exact match wins outright.
fn resolve_by_suffix(lib: &Library, decoded: &str) -> Result<Option<(u32, String)>> {
    if let Some(id) = lib.db.file_id_bypath(decoded)? {
        return Ok(Some((id, decoded.to_string())));
    }

    let Some(fname) = decoded.rsplit('/').next() else {
        return Ok(None);
    };
    let candidates = lib.db.file_ids_byfname(fname)?;

    let best = candidates
        .into_iter()
        .max_by_key(|(_, path)| common_suffix_len(path, decoded));
    Ok(best)
}

fn common_suffix_len(a: &str, b: &str) -> usize {
    a.bytes()
        .rev()
        .zip(b.bytes().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn apply_overrides(lib: &Library, file_id: u32, track: &HashMap<String, Plist>) -> Result<()> {
    if let Some(rating) = track.get("Rating").and_then(Plist::as_int) {
        lib.db.file_rating_update(file_id, rating.clamp(0, 100) as u32)?;
    }
    if let Some(play_count) = track.get("Play Count").and_then(Plist::as_int) {
        lib.db.query_run(
            "UPDATE files SET play_count = ?1 WHERE id = ?2;",
            (play_count, file_id),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::library::tests::test_library;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
  <key>Major Version</key><integer>1</integer>
  <key>Tracks</key>
  <dict>
    <key>1001</key>
    <dict>
      <key>Track ID</key><integer>1001</integer>
      <key>Name</key><string>Song A</string>
      <key>Rating</key><integer>80</integer>
      <key>Location</key><string>file://localhost/itunes/Music/album/a%20b.mp3</string>
    </dict>
    <key>1002</key>
    <dict>
      <key>Track ID</key><integer>1002</integer>
      <key>Name</key><string>Missing</string>
      <key>Location</key><string>file://localhost/somewhere/else.mp3</string>
    </dict>
  </dict>
  <key>Playlists</key>
  <array>
    <dict>
      <key>Name</key><string>Library</string>
      <key>Master</key><true/>
    </dict>
    <dict>
      <key>Name</key><string>Favourites</string>
      <key>Playlist Items</key>
      <array>
        <dict><key>Track ID</key><integer>1001</integer></dict>
        <dict><key>Track ID</key><integer>1002</integer></dict>
      </array>
    </dict>
  </array>
</dict>
</plist>"#;

    #[test]
    fn plist_shapes_parse() {
        let plist = parse_plist(SAMPLE).unwrap();
        let top = plist.as_dict().unwrap();
        assert_eq!(
            top.get("Major Version").and_then(Plist::as_int),
            Some(1)
        );
        let tracks = top.get("Tracks").and_then(Plist::as_dict).unwrap();
        assert_eq!(tracks.len(), 2);
        let track = tracks.get("1001").and_then(Plist::as_dict).unwrap();
        assert_eq!(
            track.get("Location").and_then(Plist::as_str),
            Some("file://localhost/itunes/Music/album/a%20b.mp3")
        );
    }

    #[test]
    fn location_decoding() {
        assert_eq!(
            location_to_path("file://localhost/m/a%20b.mp3").as_deref(),
            Some("/m/a b.mp3")
        );
        assert_eq!(
            location_to_path("file:///m/c.mp3").as_deref(),
            Some("/m/c.mp3")
        );
        assert_eq!(location_to_path("http://x"), None);
    }

    #[test]
    fn import_reconciles_by_suffix_and_rebuilds_playlists() {
        let lib = test_library();
        // Stored under a different mount point than the iTunes machine
        let mut mfi =
            crate::db::files::tests::sample_mfi("/srv/media/Music/album/a b.mp3", "A", "X");
        lib.db.file_add(&mut mfi).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let xml = Utf8Path::from_path(tmp.path())
            .unwrap()
            .join("iTunes Music Library.xml");
        std::fs::write(&xml, SAMPLE).unwrap();

        scan_itunes_xml(&lib, &xml).unwrap();

        let pl_path = format!("{xml}#Favourites");
        let pli = lib.db.pl_fetch_bypath(&pl_path).unwrap().unwrap();
        assert_eq!(pli.title.as_deref(), Some("Favourites"));
        // Only the reconciled track made it in
        assert_eq!(pli.items, 1);

        // The Master playlist was skipped
        assert_eq!(
            lib.db
                .pl_fetch_bypath(&format!("{xml}#Library"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn overrides_apply_rating() {
        let lib = {
            let mut lib = test_library();
            let mut cfg = crate::conf::Config::default();
            cfg.library.itunes_overrides = true;
            lib.cfg = std::sync::Arc::new(cfg);
            lib
        };
        let mut mfi =
            crate::db::files::tests::sample_mfi("/srv/media/Music/album/a b.mp3", "A", "X");
        lib.db.file_add(&mut mfi).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let xml = Utf8Path::from_path(tmp.path())
            .unwrap()
            .join("iTunes Music Library.xml");
        std::fs::write(&xml, SAMPLE).unwrap();
        scan_itunes_xml(&lib, &xml).unwrap();

        let stored = lib.db.file_fetch_byid(mfi.id).unwrap().unwrap();
        assert_eq!(stored.rating, 80);
    }
}
