//! The `inotify` table: persisted watch descriptors and rename cookies.
//!
//! Rename correlation works across process restarts because the cookie/path
//! pairs live here rather than in the watcher's memory.

use color_eyre::Result;

use crate::db::{Db, Strip};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchInfo {
    pub wd: i32,
    pub cookie: u32,
    pub path: String,
}

impl Db {
    pub fn watch_clear(&self) -> Result<()> {
        self.query_run("DELETE FROM inotify;", [])?;
        Ok(())
    }

    pub fn watch_add(&self, wi: &WatchInfo) -> Result<()> {
        self.query_run(
            "INSERT OR REPLACE INTO inotify (wd, cookie, path) VALUES (?1, ?2, ?3);",
            (wi.wd, wi.cookie, &wi.path),
        )?;
        Ok(())
    }

    pub fn watch_delete_bywd(&self, wd: i32) -> Result<()> {
        self.query_run("DELETE FROM inotify WHERE wd = ?1;", (wd,))?;
        Ok(())
    }

    pub fn watch_delete_bypath(&self, path: &str) -> Result<()> {
        self.query_run("DELETE FROM inotify WHERE path = ?1;", (path,))?;
        Ok(())
    }

    pub fn watch_delete_bymatch(&self, path: &str) -> Result<()> {
        self.query_run("DELETE FROM inotify WHERE path LIKE ?1 || '/%';", (path,))?;
        Ok(())
    }

    pub fn watch_delete_bycookie(&self, cookie: u32) -> Result<()> {
        self.query_run("DELETE FROM inotify WHERE cookie = ?1;", (cookie,))?;
        Ok(())
    }

    pub fn watch_get_bywd(&self, wd: i32) -> Result<Option<WatchInfo>> {
        self.watch_get("SELECT wd, cookie, path FROM inotify WHERE wd = ?1;", (wd,))
    }

    pub fn watch_get_bypath(&self, path: &str) -> Result<Option<WatchInfo>> {
        self.watch_get(
            "SELECT wd, cookie, path FROM inotify WHERE path = ?1;",
            (path,),
        )
    }

    fn watch_get(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<WatchInfo>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let wi = stmt
            .query_row(params, |row| {
                Ok(WatchInfo {
                    wd: row.get(0)?,
                    cookie: row.get(1)?,
                    path: row.get(2)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(wi)
    }

    /// Stamp a rename cookie onto a watch, optionally stripping the moved
    /// parent off the stored path so the move target can be spliced in.
    pub fn watch_mark_bypath(&self, path: &str, strip: Strip, cookie: u32) -> Result<()> {
        let striplen = match strip {
            Strip::Path => path.len() as i64 + 1,
            Strip::None => 1,
        };
        self.query_run(
            "UPDATE inotify SET path = SUBSTR(path, ?1), cookie = ?2 WHERE path = ?3;",
            (striplen, cookie, path),
        )?;
        Ok(())
    }

    pub fn watch_mark_bymatch(&self, path: &str, strip: Strip, cookie: u32) -> Result<()> {
        let striplen = match strip {
            Strip::Path => path.len() as i64 + 1,
            Strip::None => 1,
        };
        self.query_run(
            "UPDATE inotify SET path = SUBSTR(path, ?1), cookie = ?2 WHERE path LIKE ?3 || '/%';",
            (striplen, cookie, path),
        )?;
        Ok(())
    }

    /// Complete a rename: prepend the new parent to every path marked with
    /// `cookie` and clear the cookie.
    pub fn watch_move_bycookie(&self, cookie: u32, path: &str) -> Result<()> {
        self.query_run(
            "UPDATE inotify SET path = ?1 || path, cookie = 0 WHERE cookie = ?2;",
            (path, cookie),
        )?;
        Ok(())
    }

    pub fn watch_cookie_known(&self, cookie: u32) -> Result<bool> {
        Ok(self
            .get_one_int("SELECT 1 FROM inotify WHERE cookie = ?1;", (cookie,))?
            .is_some())
    }

    /// Watch descriptors marked with `cookie`, or matching a path prefix.
    pub fn watch_enum_bycookie(&self, cookie: u32) -> Result<Vec<i32>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT wd FROM inotify WHERE cookie = ?1;")?;
        let wds = stmt
            .query_map((cookie,), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(wds)
    }

    pub fn watch_enum_bymatch(&self, path: &str) -> Result<Vec<i32>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT wd FROM inotify WHERE path LIKE ?1 || '/%';")?;
        let wds = stmt
            .query_map((path,), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(wds)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rename_correlation_roundtrip() {
        let db = Db::open_test();
        db.watch_add(&WatchInfo {
            wd: 7,
            cookie: 0,
            path: "/m/old/sub".into(),
        })
        .unwrap();

        db.watch_mark_bymatch("/m/old", Strip::Path, 1234).unwrap();
        assert!(db.watch_cookie_known(1234).unwrap());
        assert_eq!(db.watch_enum_bycookie(1234).unwrap(), vec![7]);

        db.watch_move_bycookie(1234, "/m/new").unwrap();
        let wi = db.watch_get_bywd(7).unwrap().unwrap();
        assert_eq!(wi.path, "/m/new/sub");
        assert_eq!(wi.cookie, 0);
        assert!(!db.watch_cookie_known(1234).unwrap());
    }

    #[test]
    fn delete_variants() {
        let db = Db::open_test();
        for (wd, path) in [(1, "/a"), (2, "/a/b"), (3, "/c")] {
            db.watch_add(&WatchInfo {
                wd,
                cookie: 0,
                path: path.into(),
            })
            .unwrap();
        }

        db.watch_delete_bymatch("/a").unwrap();
        assert!(db.watch_get_bywd(2).unwrap().is_none());
        assert!(db.watch_get_bywd(1).unwrap().is_some());

        db.watch_delete_bypath("/a").unwrap();
        assert!(db.watch_get_bywd(1).unwrap().is_none());

        db.watch_clear().unwrap();
        assert!(db.watch_get_bywd(3).unwrap().is_none());
    }
}
