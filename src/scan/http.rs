//! Probing of HTTP streams (internet radio).
//!
//! Radio stations describe themselves through ICY response headers and, when
//! `Icy-MetaData: 1` is requested, inline `StreamTitle` blocks. The probe is
//! capped so a misbehaving endpoint cannot stall a scan.

use std::io::Read;
use std::time::Duration;

use color_eyre::{Result, Section, eyre::Context};

use crate::db::files::MediaFile;
use crate::db::{DataKind, MediaKind};

/// Probe cap. ICY metadata intervals are typically 8-16 KiB, so this covers
/// one full block with room to spare.
const PROBE_MAX: usize = 64 * 1024;

/// Fetch the stream headers (and a capped body prefix) and lift the ICY
/// fields into a media file record.
pub fn probe_stream(url: &str) -> Result<MediaFile> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()?;

    let response = client
        .get(url)
        .header("Icy-MetaData", "1")
        .send()
        .wrap_err("Could not connect to stream")
        .with_note(|| format!("url: {url}"))?;

    let mut mfi = MediaFile {
        path: url.to_string(),
        virtual_path: Some(format!("/http:/{url}")),
        fname: url.rsplit('/').next().unwrap_or(url).to_string(),
        data_kind: DataKind::Http,
        media_kind: Some(MediaKind::Music),
        url: Some(url.to_string()),
        ..Default::default()
    };

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    if let Some(name) = header("icy-name") {
        mfi.title = Some(name.clone());
        mfi.album = Some(name);
    }
    if let Some(genre) = header("icy-genre") {
        mfi.genre = Some(genre);
    }
    if let Some(description) = header("icy-description") {
        mfi.description = Some(description);
    }
    if let Some(bitrate) = header("icy-br") {
        mfi.bitrate = crate::util::parse_or_zero(&bitrate);
    }

    let metaint: usize = header("icy-metaint")
        .map(|v| crate::util::parse_or_zero(&v))
        .unwrap_or(0);

    if metaint > 0 && metaint < PROBE_MAX {
        let mut buf = vec![0u8; (metaint + 4081).min(PROBE_MAX)];
        let mut taken = response.take(buf.len() as u64);
        let got = read_fully(&mut taken, &mut buf)?;
        if let Some((artist, title)) = parse_stream_title(&buf[..got], metaint) {
            if !artist.is_empty() {
                mfi.artist = Some(artist);
            }
            if !title.is_empty() {
                mfi.title = Some(title);
            }
        }
    }

    Ok(mfi)
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0;
    loop {
        match reader.read(&mut buf[got..]) {
            Ok(0) => return Ok(got),
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).wrap_err("Error reading stream probe"),
        }
    }
}

/// The metadata block sits right after `metaint` audio bytes: one length
/// byte (x16) followed by `StreamTitle='...';` padding.
fn parse_stream_title(buf: &[u8], metaint: usize) -> Option<(String, String)> {
    let len = *buf.get(metaint)? as usize * 16;
    if len == 0 {
        return None;
    }
    let block = buf.get(metaint + 1..metaint + 1 + len)?;
    let text = String::from_utf8_lossy(block);

    let start = text.find("StreamTitle='")? + "StreamTitle='".len();
    let end = text[start..].find("';")? + start;
    let title = &text[start..end];

    match title.split_once(" - ") {
        Some((artist, title)) => Some((artist.trim().to_string(), title.trim().to_string())),
        None => Some((String::new(), title.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn icy_block(audio: usize, title: &str) -> Vec<u8> {
        let meta = format!("StreamTitle='{title}';");
        let padded_len = meta.len().div_ceil(16);
        let mut buf = vec![0u8; audio];
        buf.push(padded_len as u8);
        buf.extend_from_slice(meta.as_bytes());
        buf.resize(audio + 1 + padded_len * 16, 0);
        buf
    }

    #[test]
    fn stream_title_with_artist() {
        let buf = icy_block(32, "Daft Punk - Around the World");
        assert_eq!(
            parse_stream_title(&buf, 32),
            Some(("Daft Punk".to_string(), "Around the World".to_string()))
        );
    }

    #[test]
    fn stream_title_without_artist() {
        let buf = icy_block(16, "Morning Show");
        assert_eq!(
            parse_stream_title(&buf, 16),
            Some((String::new(), "Morning Show".to_string()))
        );
    }

    #[test]
    fn empty_metadata_block() {
        let buf = vec![0u8; 64];
        assert_eq!(parse_stream_title(&buf, 32), None);
    }
}
