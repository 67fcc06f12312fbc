//! The RSS/podcast source.
//!
//! Each feed is a playlist of type rss; its episodes are http files of media
//! kind podcast. Feeds deliver newest-first, so ingestion stops at the first
//! item that is already in the catalog. A periodic callback keeps feeds
//! fresh and pings their rows so they outlive the next purge.

use std::time::Duration;

use color_eyre::{Result, Section, eyre::Context};

use crate::db::directories::DIR_HTTP;
use crate::db::files::MediaFile;
use crate::db::playlists::Playlist;
use crate::db::query::{QueryKind, QueryParams, SortType};
use crate::db::{DataKind, MediaKind, PlType, ScanKind};
use crate::library::{self, CallbackAction, Library, LibrarySource, Worker};
use crate::util;

/// Episodes ingested when a feed is first added; later refreshes pick up
/// everything new.
const FIRST_ADD_LIMIT: u32 = 10;

pub struct RssScanner;

impl RssScanner {
    pub fn new() -> RssScanner {
        RssScanner
    }
}

/// Re-arm the periodic feed refresh on the library worker.
pub fn schedule_sync(worker: &mut Worker) {
    let period = Duration::from_secs(worker.lib.cfg.rss.sync_period);
    worker.callback_schedule("rss_sync", period, CallbackAction::AddOrReplace, |w| {
        if library::is_scanning() {
            tracing::debug!("Skipping feed refresh, scan in progress");
        } else {
            let mut scanner = RssScanner::new();
            if let Err(e) = scanner.rescan(&w.lib) {
                tracing::error!("Feed refresh failed: {e:#}");
            }
        }
        schedule_sync(w);
    });
}

impl LibrarySource for RssScanner {
    fn scan_kind(&self) -> ScanKind {
        ScanKind::Rss
    }

    fn rescan(&mut self, lib: &Library) -> Result<()> {
        tracing::info!("Refreshing RSS feeds");
        let mut qp = QueryParams {
            kind: QueryKind::Playlists,
            sort: SortType::Playlist,
            filter: Some(format!("f.type = {}", PlType::Rss as u32)),
            ..Default::default()
        };
        let feeds = lib.db.query_playlists(&mut qp)?;

        for feed in feeds {
            if library::is_exiting() {
                break;
            }
            if let Err(e) = refresh_feed(lib, &feed, 0) {
                // One bad feed must not stop the refresh of the others
                tracing::error!("Could not refresh feed {:?}: {e:#}", feed.path);
            }
        }
        Ok(())
    }

    fn fullrescan(&mut self, lib: &Library) -> Result<()> {
        self.rescan(lib)
    }

    fn item_add(&mut self, lib: &Library, path: &str) -> Result<bool> {
        if !(path.starts_with("http://") || path.starts_with("https://")) {
            return Ok(false);
        }
        if !looks_like_feed(path) {
            return Ok(false);
        }

        let mut pli = Playlist {
            pl_type: PlType::Rss,
            path: Some(path.to_string()),
            virtual_path: Some(format!("/http:/{path}")),
            directory_id: DIR_HTTP,
            scan_kind: ScanKind::Rss,
            ..Default::default()
        };

        match refresh_feed_into(lib, &mut pli, FIRST_ADD_LIMIT) {
            Ok(added) => {
                tracing::info!("Added feed {path} with {added} episodes");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("{path} is not a usable feed: {e:#}");
                Ok(false)
            }
        }
    }

    fn playlist_remove(&mut self, lib: &Library, virtual_path: &str) -> Result<bool> {
        let Some(pli) = lib.db.pl_fetch_byvirtualpath(virtual_path)? else {
            return Ok(false);
        };
        if pli.pl_type != PlType::Rss {
            return Ok(false);
        }
        lib.db.pl_delete(pli.id)?;
        Ok(true)
    }
}

fn looks_like_feed(url: &str) -> bool {
    url.contains("podcasts.apple.com")
        || url.ends_with(".rss")
        || url.ends_with(".xml")
        || url.contains("feed")
        || url.contains("rss")
}

/// Refresh one existing feed playlist. `limit` of 0 means everything new.
fn refresh_feed(lib: &Library, feed: &Playlist, limit: u32) -> Result<u32> {
    let mut pli = feed.clone();
    refresh_feed_into(lib, &mut pli, limit)
}

fn refresh_feed_into(lib: &Library, pli: &mut Playlist, limit: u32) -> Result<u32> {
    let Some(url) = pli.path.clone() else {
        color_eyre::eyre::bail!("Feed playlist has no url");
    };

    let feed_url = resolve_apple_podcast(&url)?;
    let channel = fetch_channel(&feed_url)?;

    pli.title = Some(channel.title().to_string());
    pli.media_kind = Some(MediaKind::Podcast);
    if let Some(image) = channel.image() {
        pli.artwork_url = Some(fetch_feed_image(lib, channel.title(), image.url()));
    }
    pli.db_timestamp = util::now_secs();
    let plid = lib.playlist_save(pli)?;

    let mut added = 0;
    for item in channel.items() {
        if library::is_exiting() {
            break;
        }
        let Some(enclosure_url) = item
            .enclosure()
            .map(|e| e.url().to_string())
            .or_else(|| item.link().map(str::to_string))
        else {
            continue;
        };

        // The feed is newest-first; once we hit a known item the rest is
        // already in the catalog
        if let Some(existing) = lib.db.file_id_bypath(&enclosure_url)? {
            lib.db.file_ping(existing)?;
            break;
        }

        let published = item
            .pub_date()
            .and_then(|date| {
                jiff::fmt::rfc2822::DateTimeParser::new()
                    .parse_timestamp(date)
                    .ok()
            })
            .map(|ts| ts.as_second())
            .unwrap_or_else(util::now_secs);

        let mut mfi = MediaFile {
            path: enclosure_url.clone(),
            virtual_path: Some(format!("/http:/{enclosure_url}")),
            fname: enclosure_url
                .rsplit('/')
                .next()
                .unwrap_or(&enclosure_url)
                .to_string(),
            directory_id: DIR_HTTP,
            title: item.title().map(str::to_string),
            artist: item
                .author()
                .or_else(|| item.itunes_ext().and_then(|ext| ext.author()))
                .map(str::to_string),
            album: Some(channel.title().to_string()),
            genre: Some("Podcast".to_string()),
            url: item.link().map(str::to_string),
            description: item.description().map(str::to_string),
            data_kind: DataKind::Http,
            media_kind: Some(MediaKind::Podcast),
            scan_kind: ScanKind::Rss,
            date_released: published,
            time_modified: published,
            ..Default::default()
        };
        lib.media_save(&mut mfi)?;
        lib.db.pl_add_item_bypath(plid, &enclosure_url)?;

        added += 1;
        if limit > 0 && added == limit {
            tracing::info!("Feed item limit reached, added {added} entries");
            break;
        }
    }

    // Keep the whole feed alive past the next purge
    lib.db.pl_ping(plid)?;
    lib.db.pl_ping_items_bymatch("http", plid)?;

    Ok(added)
}

/// Apple Podcasts pages are not feeds; the lookup endpoint reports the real
/// `feedUrl`.
fn resolve_apple_podcast(url: &str) -> Result<String> {
    if !url.contains("podcasts.apple.com") {
        return Ok(url.to_string());
    }

    let id = url
        .rsplit("/id")
        .next()
        .map(|tail| tail.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| color_eyre::eyre::eyre!("No podcast id in {url}"))?;

    let lookup = format!("https://itunes.apple.com/lookup?id={id}");
    let response: serde_json::Value = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?
        .get(&lookup)
        .send()
        .wrap_err("Apple podcast lookup failed")
        .with_note(|| format!("url: {lookup}"))?
        .json()?;

    response["results"][0]["feedUrl"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| color_eyre::eyre::eyre!("Lookup response for {url} has no feedUrl"))
}

fn fetch_channel(url: &str) -> Result<rss::Channel> {
    let bytes = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?
        .get(url)
        .send()
        .wrap_err("Could not fetch feed")
        .with_note(|| format!("url: {url}"))?
        .bytes()?;

    rss::Channel::read_from(&bytes[..])
        .wrap_err("Feed is not valid RSS")
        .with_note(|| format!("url: {url}"))
}

/// Download the feed image into the cache dir so artwork survives the feed
/// going away; fall back to the remote url.
fn fetch_feed_image(lib: &Library, title: &str, image_url: &str) -> String {
    let Some(cache_dir) = &lib.cfg.general.cache_dir else {
        return image_url.to_string();
    };

    let ext = image_url.rsplit('.').next().unwrap_or("jpg");
    let safe_title: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let target = cache_dir.join(format!("{safe_title}.{ext}"));

    let fetched = reqwest::blocking::get(image_url)
        .and_then(|response| response.bytes())
        .map_err(color_eyre::eyre::Report::from)
        .and_then(|bytes| std::fs::write(&target, &bytes).map_err(Into::into));
    match fetched {
        Ok(()) => target.to_string(),
        Err(e) => {
            tracing::debug!("Could not download feed image {image_url}: {e:#}");
            image_url.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::library::tests::test_library;

    fn feed_xml(items: &[(&str, &str, &str)]) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel>\
             <title>Test Cast</title><link>http://cast.example</link>\
             <description>d</description>",
        );
        for (title, url, date) in items {
            xml.push_str(&format!(
                "<item><title>{title}</title>\
                 <enclosure url=\"{url}\" length=\"1\" type=\"audio/mpeg\"/>\
                 <pubDate>{date}</pubDate></item>"
            ));
        }
        xml.push_str("</channel></rss>");
        xml
    }

    fn ingest(lib: &Library, xml: &str, pli: &mut Playlist) -> u32 {
        let channel = rss::Channel::read_from(xml.as_bytes()).unwrap();
        // Same path as refresh_feed_into, minus the network
        pli.title = Some(channel.title().to_string());
        pli.media_kind = Some(MediaKind::Podcast);
        pli.db_timestamp = util::now_secs();
        let plid = lib.playlist_save(pli).unwrap();

        let mut added = 0;
        for item in channel.items() {
            let url = item.enclosure().unwrap().url().to_string();
            if let Some(existing) = lib.db.file_id_bypath(&url).unwrap() {
                lib.db.file_ping(existing).unwrap();
                break;
            }
            let mut mfi = MediaFile {
                path: url.clone(),
                virtual_path: Some(format!("/http:/{url}")),
                fname: url.rsplit('/').next().unwrap().to_string(),
                title: item.title().map(str::to_string),
                album: Some(channel.title().to_string()),
                data_kind: DataKind::Http,
                media_kind: Some(MediaKind::Podcast),
                scan_kind: ScanKind::Rss,
                ..Default::default()
            };
            lib.media_save(&mut mfi).unwrap();
            lib.db.pl_add_item_bypath(plid, &url).unwrap();
            added += 1;
        }
        added
    }

    #[test]
    fn lifo_cutoff_stops_at_known_item() {
        let lib = test_library();
        let mut pli = Playlist {
            pl_type: PlType::Rss,
            path: Some("http://cast.example/feed".into()),
            scan_kind: ScanKind::Rss,
            ..Default::default()
        };

        let first = feed_xml(&[
            ("Ep 2", "http://cast.example/2.mp3", "Wed, 02 Jul 2025 10:00:00 GMT"),
            ("Ep 1", "http://cast.example/1.mp3", "Tue, 01 Jul 2025 10:00:00 GMT"),
        ]);
        assert_eq!(ingest(&lib, &first, &mut pli), 2);

        // Next refresh delivers one new episode on top
        let second = feed_xml(&[
            ("Ep 3", "http://cast.example/3.mp3", "Thu, 03 Jul 2025 10:00:00 GMT"),
            ("Ep 2", "http://cast.example/2.mp3", "Wed, 02 Jul 2025 10:00:00 GMT"),
            ("Ep 1", "http://cast.example/1.mp3", "Tue, 01 Jul 2025 10:00:00 GMT"),
        ]);
        assert_eq!(ingest(&lib, &second, &mut pli), 1);

        let pli = lib.db.pl_fetch_byid(pli.id).unwrap().unwrap();
        assert_eq!(pli.items, 3);
        assert_eq!(pli.pl_type, PlType::Rss);
    }

    #[test]
    fn apple_podcast_urls_are_detected() {
        assert!(looks_like_feed(
            "https://podcasts.apple.com/us/podcast/cgp-grey/id974722423"
        ));
        assert!(looks_like_feed("http://cgpgrey.libsyn.com/rss"));
        assert!(!looks_like_feed("http://example.com/song.mp3"));
    }

    #[test]
    fn pub_dates_parse_rfc2822() {
        let ts = jiff::fmt::rfc2822::DateTimeParser::new()
            .parse_timestamp("Tue, 01 Jul 2025 10:00:00 GMT")
            .unwrap();
        assert_eq!(ts.as_second(), 1751364000);
    }
}
