//! Daemon configuration.
//!
//! Loaded once at startup from a TOML file merged with `DAAPHAJ_*`
//! environment overrides, then shared read-only with every thread.

use camino::Utf8PathBuf;
use color_eyre::Result;
use color_eyre::eyre::Context;
use etcetera::BaseStrategy;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub sqlite: Sqlite,
    pub library: Library,
    pub rss: Rss,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct General {
    /// Primary database file. Defaults to the platform cache dir.
    pub db_path: Option<Utf8PathBuf>,
    /// Online backup destination, skipped when equal to `db_path`.
    pub db_backup_path: Option<Utf8PathBuf>,
    pub cache_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sqlite {
    pub pragma_cache_size_library: Option<i64>,
    pub pragma_journal_mode: Option<String>,
    /// 0..3, passed straight to PRAGMA synchronous
    pub pragma_synchronous: Option<i64>,
    pub pragma_mmap_size_library: Option<i64>,
    /// Run VACUUM after a schema upgrade
    pub vacuum: bool,
}

impl Default for Sqlite {
    fn default() -> Self {
        Sqlite {
            pragma_cache_size_library: None,
            pragma_journal_mode: None,
            pragma_synchronous: None,
            pragma_mmap_size_library: None,
            vacuum: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Library {
    /// Root directories to scan
    pub directories: Vec<Utf8PathBuf>,
    pub follow_symlinks: bool,
    /// File extensions to skip, e.g. ".db"
    pub filetypes_ignore: Vec<String>,
    /// Path substrings to skip
    pub filepath_ignore: Vec<String>,
    /// iTunes metadata beats file metadata
    pub itunes_overrides: bool,
    /// M3U EXTINF beats file metadata
    pub m3u_overrides: bool,
    /// Drop everything after ';' in genre tags
    pub only_first_genre: bool,
    /// Override album_artist for compilations
    pub compilation_artist: Option<String>,
    /// Scale for externally supplied ratings, rescaled into 0..100
    pub max_rating: u32,
    /// Emit rating events when play/skip counters drive a rating recompute
    pub rating_updates: bool,
    /// Write ratings back into file tags (mp3/flac only)
    pub write_rating: bool,
    pub hide_singles: bool,
    pub radio_playlists: bool,
    pub artwork_basenames: Vec<String>,
    pub artwork_individual: bool,
    /// Delay before a scan-driven database event is sent, seconds
    pub update_delay: u64,
    /// Name used when a tag is missing entirely
    pub name_unknown_title: String,
    pub name_unknown_artist: String,
    pub name_unknown_album: String,
    pub name_unknown_genre: String,
}

impl Default for Library {
    fn default() -> Self {
        Library {
            directories: Vec::new(),
            follow_symlinks: false,
            filetypes_ignore: vec![
                ".db".into(),
                ".ini".into(),
                ".db-journal".into(),
                ".pdf".into(),
                ".metadata".into(),
            ],
            filepath_ignore: Vec::new(),
            itunes_overrides: false,
            m3u_overrides: false,
            only_first_genre: false,
            compilation_artist: None,
            max_rating: 100,
            rating_updates: false,
            write_rating: false,
            hide_singles: false,
            radio_playlists: false,
            artwork_basenames: vec!["artwork".into(), "cover".into(), "Folder".into()],
            artwork_individual: false,
            update_delay: 60,
            name_unknown_title: "Unknown title".into(),
            name_unknown_artist: "Unknown artist".into(),
            name_unknown_album: "Unknown album".into(),
            name_unknown_genre: "Unknown genre".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Rss {
    /// Feed refresh interval, clamped to a minimum of 60 seconds
    pub sync_period: u64,
}

impl Default for Rss {
    fn default() -> Self {
        Rss { sync_period: 3600 }
    }
}

impl Config {
    pub fn load(path: Option<&Utf8PathBuf>) -> Result<Config> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path.as_std_path()));
        }
        let mut config: Config = figment
            .merge(Env::prefixed("DAAPHAJ_").split("__"))
            .extract()
            .wrap_err("Could not load configuration")?;

        if config.rss.sync_period < 60 {
            tracing::warn!(
                "rss.sync_period of {}s is below the minimum, using 60s",
                config.rss.sync_period
            );
            config.rss.sync_period = 60;
        }

        // External collaborators expect a trailing slash on cache_dir
        if let Some(dir) = &config.general.cache_dir
            && !dir.as_str().ends_with('/')
        {
            config.general.cache_dir = Some(Utf8PathBuf::from(format!("{dir}/")));
        }

        Ok(config)
    }

    /// Resolved database path, falling back to the platform cache dir.
    pub fn db_path(&self) -> Result<Utf8PathBuf> {
        if let Some(path) = &self.general.db_path {
            return Ok(path.clone());
        }
        let dirs = etcetera::choose_base_strategy()?;
        let fallback = dirs.cache_dir().join("daaphaj").join("songs3.db");
        Utf8PathBuf::from_path_buf(fallback)
            .map_err(|p| color_eyre::eyre::eyre!("Cache dir is not valid UTF-8: {}", p.display()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.library.max_rating, 100);
        assert!(config.sqlite.vacuum);
        assert_eq!(config.rss.sync_period, 3600);
    }

    #[test]
    fn sync_period_is_clamped() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("daaphaj.toml", "[rss]\nsync_period = 5")?;
            let config = Config::load(Some(&Utf8PathBuf::from("daaphaj.toml"))).unwrap();
            assert_eq!(config.rss.sync_period, 60);
            Ok(())
        });
    }

    #[test]
    fn cache_dir_gets_trailing_slash() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("daaphaj.toml", "[general]\ncache_dir = \"/tmp/cache\"")?;
            let config = Config::load(Some(&Utf8PathBuf::from("daaphaj.toml"))).unwrap();
            assert_eq!(
                config.general.cache_dir,
                Some(Utf8PathBuf::from("/tmp/cache/"))
            );
            Ok(())
        });
    }
}
