//! Filesystem watcher feeding the library thread.
//!
//! Rename correlation uses the cookie machinery persisted in the `inotify`
//! table: the disappearing side stamps a cookie onto the affected rows, the
//! appearing side splices the new parent path back in. Events arrive
//! debounced so editors that write via temp files do not trigger storms.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use notify_debouncer_full::notify::event::{ModifyKind, RenameMode};
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer};

use crate::conf::Config;
use crate::db::{DISABLED_FAKE_COOKIE, Strip};
use crate::library::LibraryHandle;

const DEBOUNCE: Duration = Duration::from_secs(5);

/// Keeps the underlying watcher alive.
pub struct Watcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

pub fn start(cfg: &Config, handle: LibraryHandle) -> Result<Watcher> {
    let event_handle = handle.clone();
    let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                for event in events {
                    handle_event(&event_handle, &event);
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::error!("Watcher error: {e}");
                }
            }
        }
    })?;

    for dir in &cfg.library.directories {
        debouncer.watch(dir.as_std_path(), RecursiveMode::Recursive)?;
        tracing::info!("Watching {dir}");
    }

    Ok(Watcher {
        _debouncer: debouncer,
    })
}

fn handle_event(handle: &LibraryHandle, event: &DebouncedEvent) {
    let paths: Vec<Utf8PathBuf> = event
        .paths
        .iter()
        .filter_map(|p| Utf8Path::from_path(p).map(|p| p.to_path_buf()))
        .collect();
    if paths.is_empty() {
        return;
    }

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) => {
            for path in paths {
                let _ = handle.rescan_path(path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let from = paths[0].clone();
            let to = paths[1].clone();
            let cookie = rename_cookie(event);
            let _ = handle.exec_async(move |w| {
                if let Err(e) = handle_rename(w, &from, &to, cookie) {
                    tracing::error!("Rename handling of {from} -> {to} failed: {e:#}");
                }
            });
        }
        // A lone rename half behaves like a remove or an appearance
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in paths {
                let _ = handle.exec_async(move |w| {
                    if let Err(e) = handle_remove(w, &path) {
                        tracing::error!("Remove handling of {path} failed: {e:#}");
                    }
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in paths {
                let _ = handle.rescan_path(path);
            }
        }
        _ => {}
    }
}

/// 32-bit rename cookie. The fake-cookie sentinel lives above this range, so
/// a cookie can never collide with it.
fn rename_cookie(event: &DebouncedEvent) -> u32 {
    match event.event.attrs.tracker() {
        Some(tracker) if tracker != 0 => tracker as u32,
        _ => {
            let path = event.paths.first().map(|p| p.to_string_lossy().into_owned());
            (crate::util::murmur_hash64(path.unwrap_or_default().as_bytes(), 0) as u32).max(1)
        }
    }
}

fn handle_rename(
    w: &mut crate::library::Worker,
    from: &Utf8Path,
    to: &Utf8Path,
    cookie: u32,
) -> Result<()> {
    let db = &w.lib.db;

    if to.is_dir() {
        db.file_disable_bymatch(from.as_str(), Strip::Path, cookie as i64)?;
        db.pl_disable_bymatch(from.as_str(), Strip::Path, cookie as i64)?;
        db.directory_disable_bymatch(from.as_str(), Strip::Path, cookie as i64)?;
        db.watch_mark_bymatch(from.as_str(), Strip::Path, cookie)?;

        db.file_enable_bycookie(cookie, to.as_str(), None)?;
        db.pl_enable_bycookie(cookie, to.as_str())?;
        db.directory_enable_bycookie(cookie, to.as_str())?;
        db.watch_move_bycookie(cookie, to.as_str())?;
    } else {
        // Single files go through a plain disable + rescan, the new row gets
        // fresh metadata anyway
        db.file_disable_bypath(from.as_str(), Strip::None, DISABLED_FAKE_COOKIE)?;
        w.rescan_path(to);
    }
    w.update_trigger(crate::listener::Event::Database.bit() | crate::listener::Event::Update.bit());
    Ok(())
}

fn handle_remove(w: &mut crate::library::Worker, path: &Utf8Path) -> Result<()> {
    let db = &w.lib.db;
    db.file_disable_bypath(path.as_str(), Strip::None, DISABLED_FAKE_COOKIE)?;
    db.file_disable_bymatch(path.as_str(), Strip::None, DISABLED_FAKE_COOKIE)?;
    db.pl_disable_bypath(path.as_str(), Strip::None, DISABLED_FAKE_COOKIE)?;
    db.watch_delete_bypath(path.as_str())?;
    db.watch_delete_bymatch(path.as_str())?;
    w.update_trigger(crate::listener::Event::Database.bit() | crate::listener::Event::Update.bit());
    Ok(())
}
