//! The library: source registry, the worker thread and the save entry points
//! that every source feeds ingested records through.
//!
//! All library work runs on one dedicated worker thread that owns its own
//! catalog handle. Other threads talk to it through [`LibraryHandle`], which
//! enqueues closures; scheduled callbacks (scan-event coalescing, periodic
//! feed refresh) run on the same thread between commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::conf::Config;
use crate::db::files::MediaFile;
use crate::db::playlists::Playlist;
use crate::db::queue::QueueAddResult;
use crate::db::{Db, ScanKind};
use crate::listener::{self, Event};
use crate::util;

pub mod filescanner;
pub mod itunes;
pub mod rss;
pub mod watcher;

static SCANNING: AtomicBool = AtomicBool::new(false);
static EXITING: AtomicBool = AtomicBool::new(false);

/// True while a scan runs; a second scan request is short-circuited.
pub fn is_scanning() -> bool {
    SCANNING.load(Ordering::SeqCst)
}

pub fn set_scanning(scanning: bool) {
    SCANNING.store(scanning, Ordering::SeqCst);
}

/// True when shutdown has begun; long scans poll this between items and
/// surrender early.
pub fn is_exiting() -> bool {
    EXITING.load(Ordering::SeqCst)
}

/// Selected attributes a client may set on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryAttrib {
    Rating,
    Usermark,
    PlayCount,
    SkipCount,
    TimePlayed,
    TimeSkipped,
}

/// Context handed to sources: the worker's catalog handle plus config.
pub struct Library {
    pub db: Db,
    pub cfg: Arc<Config>,
}

impl Library {
    /// Adds the record if it has no id yet, otherwise updates.
    pub fn media_save(&self, mfi: &mut MediaFile) -> Result<u32> {
        if mfi.id == 0 {
            self.db.file_add(mfi)
        } else {
            self.db.file_update(mfi)?;
            Ok(mfi.id)
        }
    }

    /// Adds the playlist if it has no id yet, otherwise updates. Returns the
    /// playlist id.
    pub fn playlist_save(&self, pli: &mut Playlist) -> Result<u32> {
        if pli.id == 0 {
            self.db.pl_add(pli)
        } else {
            self.db.pl_update(pli)?;
            Ok(pli.id)
        }
    }

    /// Ensure a directory row exists for `virtual_path`, updating the stored
    /// state if it does. Returns the directory id.
    pub fn directory_save(
        &self,
        virtual_path: &str,
        path: Option<&str>,
        disabled: i64,
        parent_id: u32,
        scan_kind: ScanKind,
    ) -> Result<u32> {
        use crate::db::directories::Directory;

        match self.db.directory_id_byvirtualpath(virtual_path)? {
            Some(id) => {
                let mut di = Directory {
                    id,
                    virtual_path: virtual_path.to_string(),
                    path: path.map(str::to_string),
                    disabled,
                    parent_id,
                    scan_kind,
                    ..Default::default()
                };
                self.db.directory_update(&mut di)?;
                Ok(id)
            }
            None => {
                let mut di = Directory {
                    virtual_path: virtual_path.to_string(),
                    path: path.map(str::to_string),
                    disabled,
                    parent_id,
                    scan_kind,
                    ..Default::default()
                };
                self.db.directory_add(&mut di)
            }
        }
    }
}

/// A library source scans items of one scan kind into the catalog. Optional
/// entries default to "not handled" so the dispatcher tries the next source.
pub trait LibrarySource: Send {
    fn scan_kind(&self) -> ScanKind;

    fn disabled(&self) -> bool {
        false
    }

    fn init(&mut self, _lib: &Library) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) {}

    /// Initial scan after startup.
    fn initscan(&mut self, lib: &Library) -> Result<()> {
        self.rescan(lib)
    }

    /// Find new, update modified, remove deleted.
    fn rescan(&mut self, lib: &Library) -> Result<()>;

    /// Re-extract metadata even for unmodified items.
    fn metarescan(&mut self, lib: &Library) -> Result<()> {
        self.rescan(lib)
    }

    /// Scan from scratch; the orchestrator has already purged this source's
    /// rows.
    fn fullrescan(&mut self, lib: &Library) -> Result<()> {
        self.rescan(lib)
    }

    /// Write metadata (currently the rating) back into the source item.
    fn write_metadata(&self, _lib: &Library, _mfi: &MediaFile) -> Result<()> {
        bail!("Source does not support writing metadata")
    }

    /// Returns true when the path belongs to this source and was rescanned.
    fn rescan_path(&mut self, _lib: &Library, _path: &Utf8Path) -> Result<bool> {
        Ok(false)
    }

    /// Returns true when the item was added by this source.
    fn item_add(&mut self, _lib: &Library, _path: &str) -> Result<bool> {
        Ok(false)
    }

    fn playlist_item_add(&mut self, _lib: &Library, _vp_playlist: &str, _vp_item: &str) -> Result<bool> {
        Ok(false)
    }

    fn playlist_remove(&mut self, _lib: &Library, _virtual_path: &str) -> Result<bool> {
        Ok(false)
    }

    /// Save the current queue as a playlist under the given virtual path.
    fn queue_save(&mut self, _lib: &Library, _virtual_path: &str) -> Result<bool> {
        Ok(false)
    }

    /// Add the item at `path` to the queue.
    fn queue_item_add(
        &mut self,
        _lib: &Library,
        _path: &str,
        _position: i32,
        _reshuffle: bool,
        _item_id: u32,
    ) -> Result<Option<QueueAddResult>> {
        Ok(None)
    }
}

type Task = Box<dyn FnOnce(&mut Worker) + Send>;

/// What to do when a named callback is already scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Add,
    Replace,
    AddOrReplace,
    Delete,
}

struct Scheduled {
    name: &'static str,
    due: Instant,
    task: Task,
}

/// The library worker: sources, scheduled callbacks and pending events.
pub struct Worker {
    pub lib: Library,
    sources: Vec<Box<dyn LibrarySource>>,
    scheduled: Vec<Scheduled>,
    pending_events: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOp {
    Init,
    Rescan(Option<ScanKind>),
    MetaRescan(Option<ScanKind>),
    FullRescan,
}

impl Worker {
    /// Schedule (or cancel) a named callback to run on the worker thread
    /// after `delay`.
    pub fn callback_schedule(
        &mut self,
        name: &'static str,
        delay: Duration,
        action: CallbackAction,
        task: impl FnOnce(&mut Worker) + Send + 'static,
    ) {
        let exists = self.scheduled.iter().position(|s| s.name == name);
        match (action, exists) {
            (CallbackAction::Delete, Some(i)) => {
                self.scheduled.remove(i);
            }
            (CallbackAction::Delete, None) => {}
            (CallbackAction::Replace, None) => {}
            (CallbackAction::Add, _) | (CallbackAction::AddOrReplace, None) => {
                self.scheduled.push(Scheduled {
                    name,
                    due: Instant::now() + delay,
                    task: Box::new(task),
                });
            }
            (CallbackAction::Replace, Some(i)) | (CallbackAction::AddOrReplace, Some(i)) => {
                self.scheduled[i] = Scheduled {
                    name,
                    due: Instant::now() + delay,
                    task: Box::new(task),
                };
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.iter().map(|s| s.due).min()
    }

    fn run_due_callbacks(&mut self) {
        let now = Instant::now();
        while let Some(i) = self.scheduled.iter().position(|s| s.due <= now) {
            let scheduled = self.scheduled.remove(i);
            (scheduled.task)(self);
        }
    }

    /// Coalesce scan-driven events: the notification goes out after the
    /// configured delay, one message however many updates happened meanwhile.
    pub fn update_trigger(&mut self, events: u16) {
        self.pending_events |= events;
        let delay = Duration::from_secs(self.lib.cfg.library.update_delay);
        self.callback_schedule("library_update", delay, CallbackAction::AddOrReplace, |w| {
            let events = std::mem::take(&mut w.pending_events);
            if events != 0 {
                listener::notify(events);
            }
        });
    }

    fn run_scan(&mut self, op: ScanOp) {
        if is_scanning() {
            tracing::info!("Scan already running, ignoring {op:?}");
            return;
        }

        let started = Instant::now();
        set_scanning(true);

        if op == ScanOp::FullRescan {
            if let Err(e) = self.lib.db.purge_all() {
                tracing::error!("Purge before full rescan failed: {e:#}");
            }
        }

        for source in &mut self.sources {
            if source.disabled() {
                continue;
            }
            let kind_filter = match op {
                ScanOp::Rescan(kind) | ScanOp::MetaRescan(kind) => kind,
                _ => None,
            };
            if let Some(kind) = kind_filter
                && source.scan_kind() != kind
            {
                continue;
            }
            if is_exiting() {
                break;
            }

            let result = match op {
                ScanOp::Init => source.initscan(&self.lib),
                ScanOp::Rescan(_) => source.rescan(&self.lib),
                ScanOp::MetaRescan(_) => source.metarescan(&self.lib),
                ScanOp::FullRescan => source.fullrescan(&self.lib),
            };
            if let Err(e) = result {
                tracing::error!("{:?} scan failed: {e:#}", source.scan_kind());
            }
        }

        set_scanning(false);

        if let Err(e) = self.lib.db.hook_post_scan() {
            tracing::error!("Post scan hook failed: {e:#}");
        }
        if let Err(e) = self.lib.db.queue_cleanup() {
            tracing::error!("Queue cleanup after scan failed: {e:#}");
        }
        if let Err(e) = self
            .lib
            .db
            .admin_set_int64(crate::db::admin_keys::DB_UPDATE, util::now_secs())
        {
            tracing::error!("Could not stamp db_update: {e:#}");
        }

        tracing::info!("Scan completed in {:.1?}", started.elapsed());
        self.update_trigger(Event::Database.bit() | Event::Update.bit());
    }

    pub(crate) fn rescan_path(&mut self, path: &Utf8Path) {
        let mut handled = false;
        for source in &mut self.sources {
            match source.rescan_path(&self.lib, path) {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Rescan of {path} failed: {e:#}");
                    return;
                }
            }
        }
        if handled {
            self.update_trigger(Event::Database.bit() | Event::Update.bit());
        } else {
            tracing::warn!("No source claimed rescan of {path}");
        }
    }

    /// Set one attribute on an item. For ratings the value arrives in the
    /// externally configured scale and is normalized to 0..100 here; with
    /// `write_rating` the new rating is also pushed back into the file.
    pub fn item_attrib_save(&mut self, id: u32, attrib: LibraryAttrib, value: u32) {
        let result = self.item_attrib_save_impl(id, attrib, value);
        if let Err(e) = result {
            tracing::error!("Could not save attribute {attrib:?} on item {id}: {e:#}");
        }
    }

    fn item_attrib_save_impl(&mut self, id: u32, attrib: LibraryAttrib, value: u32) -> Result<()> {
        let db = &self.lib.db;
        match attrib {
            LibraryAttrib::Rating => {
                let max_rating = self.lib.cfg.library.max_rating.max(1);
                let rating = (value * crate::db::RATING_MAX / max_rating).min(crate::db::RATING_MAX);
                db.file_rating_update(id, rating)?;

                if self.lib.cfg.library.write_rating
                    && let Some(mfi) = db.file_fetch_byid(id)?
                {
                    let source = self
                        .sources
                        .iter()
                        .find(|s| s.scan_kind() == mfi.scan_kind);
                    match source {
                        Some(source) => source.write_metadata(&self.lib, &mfi)?,
                        None => tracing::debug!("No source to write rating for item {id}"),
                    }
                }
            }
            LibraryAttrib::Usermark => db.file_usermark_update(id, value)?,
            LibraryAttrib::PlayCount => {
                db.query_run("UPDATE files SET play_count = ?1 WHERE id = ?2;", (value, id))?;
            }
            LibraryAttrib::SkipCount => {
                db.query_run("UPDATE files SET skip_count = ?1 WHERE id = ?2;", (value, id))?;
            }
            LibraryAttrib::TimePlayed => {
                db.query_run("UPDATE files SET time_played = ?1 WHERE id = ?2;", (value, id))?;
            }
            LibraryAttrib::TimeSkipped => {
                db.query_run("UPDATE files SET time_skipped = ?1 WHERE id = ?2;", (value, id))?;
            }
        }
        Ok(())
    }
}

/// Handle for talking to the library thread.
#[derive(Clone)]
pub struct LibraryHandle {
    tx: mpsc::Sender<Task>,
}

impl LibraryHandle {
    /// Run `f` on the library thread.
    pub fn exec_async(&self, f: impl FnOnce(&mut Worker) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(f))
            .map_err(|_| color_eyre::eyre::eyre!("Library thread is gone"))
    }

    pub fn initscan(&self) -> Result<()> {
        self.exec_async(|w| w.run_scan(ScanOp::Init))
    }

    pub fn rescan(&self, kind: Option<ScanKind>) -> Result<()> {
        self.exec_async(move |w| w.run_scan(ScanOp::Rescan(kind)))
    }

    pub fn metarescan(&self, kind: Option<ScanKind>) -> Result<()> {
        self.exec_async(move |w| w.run_scan(ScanOp::MetaRescan(kind)))
    }

    pub fn fullrescan(&self) -> Result<()> {
        self.exec_async(|w| w.run_scan(ScanOp::FullRescan))
    }

    pub fn rescan_path(&self, path: Utf8PathBuf) -> Result<()> {
        self.exec_async(move |w| w.rescan_path(&path))
    }

    pub fn item_add(&self, path: String) -> Result<()> {
        self.exec_async(move |w| {
            let mut handled = false;
            for source in &mut w.sources {
                match source.item_add(&w.lib, &path) {
                    Ok(true) => {
                        handled = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("Adding item {path} failed: {e:#}");
                        return;
                    }
                }
            }
            if handled {
                w.update_trigger(Event::Database.bit() | Event::Update.bit());
            } else {
                tracing::warn!("No source could add item {path}");
            }
        })
    }

    pub fn playlist_item_add(&self, vp_playlist: String, vp_item: String) -> Result<()> {
        self.exec_async(move |w| {
            for source in &mut w.sources {
                match source.playlist_item_add(&w.lib, &vp_playlist, &vp_item) {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("Adding {vp_item} to {vp_playlist} failed: {e:#}");
                        return;
                    }
                }
            }
        })
    }

    pub fn playlist_remove(&self, virtual_path: String) -> Result<()> {
        self.exec_async(move |w| {
            for source in &mut w.sources {
                if matches!(source.playlist_remove(&w.lib, &virtual_path), Ok(true)) {
                    return;
                }
            }
        })
    }

    pub fn playlist_remove_byid(&self, plid: u32) -> Result<()> {
        self.exec_async(move |w| {
            if let Err(e) = w.lib.db.pl_delete(plid) {
                tracing::error!("Could not remove playlist {plid}: {e:#}");
            }
        })
    }

    pub fn queue_save(&self, virtual_path: String) -> Result<()> {
        self.exec_async(move |w| {
            for source in &mut w.sources {
                if matches!(source.queue_save(&w.lib, &virtual_path), Ok(true)) {
                    return;
                }
            }
        })
    }

    /// Synchronous: the caller (the player) needs the new item id.
    pub fn queue_item_add(
        &self,
        path: String,
        position: i32,
        reshuffle: bool,
        item_id: u32,
    ) -> Result<QueueAddResult> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.exec_async(move |w| {
            let mut result = Ok(None);
            for source in &mut w.sources {
                result = source.queue_item_add(&w.lib, &path, position, reshuffle, item_id);
                if !matches!(result, Ok(None)) {
                    break;
                }
            }
            let _ = reply_tx.send(result);
        })?;

        match reply_rx.recv() {
            Ok(Ok(Some(result))) => Ok(result),
            Ok(Ok(None)) => bail!("No source could queue this path"),
            Ok(Err(e)) => Err(e),
            Err(_) => bail!("Library thread is gone"),
        }
    }

    pub fn item_attrib_save(&self, id: u32, attrib: LibraryAttrib, value: u32) -> Result<()> {
        self.exec_async(move |w| w.item_attrib_save(id, attrib, value))
    }

    pub fn update_trigger(&self, events: u16) -> Result<()> {
        self.exec_async(move |w| w.update_trigger(events))
    }
}

/// Start the library thread with the built-in sources.
pub fn init(cfg: Arc<Config>) -> Result<(LibraryHandle, std::thread::JoinHandle<()>)> {
    let sources: Vec<Box<dyn LibrarySource>> = vec![
        Box::new(filescanner::FileScanner::new()),
        Box::new(rss::RssScanner::new()),
    ];
    init_with_sources(cfg, sources)
}

pub fn init_with_sources(
    cfg: Arc<Config>,
    sources: Vec<Box<dyn LibrarySource>>,
) -> Result<(LibraryHandle, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<Task>();
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread_cfg = Arc::clone(&cfg);
    let join = std::thread::Builder::new()
        .name("library".into())
        .spawn(move || worker_main(thread_cfg, sources, rx, ready_tx))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => bail!("Library thread died during startup"),
    }

    Ok((LibraryHandle { tx }, join))
}

/// Ask the library thread to exit and wait for it.
pub fn deinit(handle: LibraryHandle, join: std::thread::JoinHandle<()>) {
    EXITING.store(true, Ordering::SeqCst);
    // Wake the worker so it notices the flag
    let _ = handle.exec_async(|_| {});
    drop(handle);
    if join.join().is_err() {
        tracing::error!("Library thread panicked during shutdown");
    }
}

fn worker_main(
    cfg: Arc<Config>,
    mut sources: Vec<Box<dyn LibrarySource>>,
    rx: mpsc::Receiver<Task>,
    ready_tx: mpsc::Sender<Result<()>>,
) {
    let db = match Db::open(Arc::clone(&cfg)) {
        Ok(db) => db,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let lib = Library { db, cfg };
    for source in &mut sources {
        if let Err(e) = source.init(&lib) {
            tracing::error!("Source {:?} failed to init: {e:#}", source.scan_kind());
        }
    }

    let mut worker = Worker {
        lib,
        sources,
        scheduled: Vec::new(),
        pending_events: 0,
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        if is_exiting() {
            break;
        }
        let timeout = worker
            .next_deadline()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        match rx.recv_timeout(timeout) {
            Ok(task) => task(&mut worker),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        worker.run_due_callbacks();
    }

    for source in &mut worker.sources {
        source.deinit();
    }
    tracing::info!("Library thread exiting");
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn test_library() -> Library {
        Library {
            db: Db::open_test(),
            cfg: Arc::new(Config::default()),
        }
    }

    #[test]
    fn media_save_add_then_update() {
        let lib = test_library();
        let mut mfi = crate::db::files::tests::sample_mfi("/m/a.mp3", "A", "X");
        let id = lib.media_save(&mut mfi).unwrap();
        assert!(id > 0);

        mfi.title = Some("New Title".into());
        let same_id = lib.media_save(&mut mfi).unwrap();
        assert_eq!(same_id, id);

        let stored = lib.db.file_fetch_byid(id).unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("New Title"));
    }

    #[test]
    fn directory_save_reuses_existing_rows() {
        let lib = test_library();
        let first = lib
            .directory_save("/file:/m", Some("/m"), 0, crate::db::directories::DIR_FILE, ScanKind::Files)
            .unwrap();
        let second = lib
            .directory_save("/file:/m", Some("/m"), 0, crate::db::directories::DIR_FILE, ScanKind::Files)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rating_is_rescaled_from_external_maximum() {
        let mut cfg = Config::default();
        cfg.library.max_rating = 5;
        let lib = Library {
            db: {
                let conn = rusqlite::Connection::open_in_memory().unwrap();
                Db::from_connection(conn, Arc::new(cfg.clone())).unwrap()
            },
            cfg: Arc::new(cfg),
        };
        let mut mfi = crate::db::files::tests::sample_mfi("/m/a.mp3", "A", "X");
        lib.db.file_add(&mut mfi).unwrap();

        let mut worker = Worker {
            lib,
            sources: Vec::new(),
            scheduled: Vec::new(),
            pending_events: 0,
        };
        worker.item_attrib_save(mfi.id, LibraryAttrib::Rating, 4);

        let stored = worker.lib.db.file_fetch_byid(mfi.id).unwrap().unwrap();
        assert_eq!(stored.rating, 80);
    }

    #[test]
    fn callback_replace_semantics() {
        let lib = test_library();
        let mut worker = Worker {
            lib,
            sources: Vec::new(),
            scheduled: Vec::new(),
            pending_events: 0,
        };

        worker.callback_schedule("x", Duration::from_secs(60), CallbackAction::Add, |_| {});
        worker.callback_schedule("x", Duration::from_secs(1), CallbackAction::AddOrReplace, |_| {});
        assert_eq!(worker.scheduled.len(), 1);

        // Replace without an existing entry is a no-op
        worker.callback_schedule("y", Duration::from_secs(1), CallbackAction::Replace, |_| {});
        assert_eq!(worker.scheduled.len(), 1);

        worker.callback_schedule("x", Duration::ZERO, CallbackAction::Delete, |_| {});
        assert!(worker.scheduled.is_empty());
    }
}
