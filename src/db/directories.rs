//! The `directories` table: the virtual directory tree shown to clients.

use color_eyre::Result;
use rusqlite::Row;

use crate::db::{Db, ScanKind, Strip};
use crate::util;

/// Reserved directory ids. Everything at or above [`DIR_MAX`] is scanned
/// content and may be purged.
pub const DIR_ROOT: u32 = 1;
pub const DIR_FILE: u32 = 2;
pub const DIR_HTTP: u32 = 3;
pub const DIR_SPOTIFY: u32 = 4;
pub const DIR_MAX: u32 = 5;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Directory {
    pub id: u32,
    pub virtual_path: String,
    pub path: Option<String>,
    pub db_timestamp: i64,
    pub disabled: i64,
    pub parent_id: u32,
    pub scan_kind: ScanKind,
}

fn directory_from_row(row: &Row) -> rusqlite::Result<Directory> {
    Ok(Directory {
        id: row.get(0)?,
        virtual_path: row.get(1)?,
        path: row.get(2)?,
        db_timestamp: row.get(3)?,
        disabled: row.get(4)?,
        parent_id: row.get(5)?,
        scan_kind: ScanKind::from_repr(row.get(6)?).unwrap_or_default(),
    })
}

impl Db {
    pub fn directory_id_byvirtualpath(&self, virtual_path: &str) -> Result<Option<u32>> {
        Ok(self
            .get_one_int(
                "SELECT d.id FROM directories d WHERE d.virtual_path = ?1;",
                (virtual_path,),
            )?
            .map(|id| id as u32))
    }

    pub fn directory_id_bypath(&self, path: &str) -> Result<Option<u32>> {
        Ok(self
            .get_one_int("SELECT d.id FROM directories d WHERE d.path = ?1;", (path,))?
            .map(|id| id as u32))
    }

    /// All enabled children of a directory.
    pub fn directory_children(&self, parent_id: u32) -> Result<Vec<Directory>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, virtual_path, path, db_timestamp, disabled, parent_id, scan_kind \
             FROM directories WHERE disabled = 0 AND parent_id = ?1;",
        )?;
        let dirs = stmt
            .query_map((parent_id,), directory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dirs)
    }

    pub fn directory_add(&self, di: &mut Directory) -> Result<u32> {
        if di.db_timestamp == 0 {
            di.db_timestamp = util::now_secs();
        }
        self.query_run(
            "INSERT INTO directories (virtual_path, path, db_timestamp, disabled, parent_id, scan_kind) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            (
                &di.virtual_path,
                &di.path,
                di.db_timestamp,
                di.disabled,
                di.parent_id,
                di.scan_kind as u32,
            ),
        )?;
        di.id = self.conn.last_insert_rowid() as u32;
        Ok(di.id)
    }

    pub fn directory_update(&self, di: &mut Directory) -> Result<()> {
        di.db_timestamp = util::now_secs();
        self.query_run(
            "UPDATE directories SET virtual_path = ?1, path = ?2, db_timestamp = ?3, disabled = ?4, \
             parent_id = ?5, scan_kind = ?6 WHERE id = ?7;",
            (
                &di.virtual_path,
                &di.path,
                di.db_timestamp,
                di.disabled,
                di.parent_id,
                di.scan_kind as u32,
                di.id,
            ),
        )?;
        Ok(())
    }

    pub fn directory_ping_bymatch(&self, virtual_path: &str) -> Result<()> {
        self.query_run(
            "UPDATE directories SET db_timestamp = ?1 WHERE virtual_path = ?2 OR virtual_path LIKE ?2 || '/%';",
            (util::now_secs(), virtual_path),
        )?;
        Ok(())
    }

    pub fn directory_disable_bymatch(&self, path: &str, strip: Strip, cookie: i64) -> Result<()> {
        let striplen = match strip {
            Strip::Path => path.len() as i64 + 1,
            Strip::None => 1,
        };
        let vpath_striplen = if striplen == 1 { 1 } else { striplen + 6 };
        self.query_run(
            "UPDATE directories SET virtual_path = SUBSTR(virtual_path, ?1), path = SUBSTR(path, ?2), \
             disabled = ?3 WHERE virtual_path = '/file:' || ?4 OR virtual_path LIKE '/file:' || ?4 || '/%';",
            (vpath_striplen, striplen, cookie, path),
        )?;
        Ok(())
    }

    pub fn directory_enable_bycookie(&self, cookie: u32, path: &str) -> Result<usize> {
        self.query_run(
            "UPDATE directories SET virtual_path = '/file:' || ?1 || virtual_path, \
             path = ?1 || path, disabled = 0 WHERE disabled = ?2;",
            (path, cookie as i64),
        )
    }

    pub fn directory_enable_bypath(&self, path: &str) -> Result<usize> {
        self.query_run(
            "UPDATE directories SET disabled = 0 WHERE path = ?1;",
            (path,),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reserved_rows_exist_after_open() {
        let db = Db::open_test();
        assert_eq!(db.directory_id_byvirtualpath("/").unwrap(), Some(DIR_ROOT));
        assert_eq!(db.directory_id_byvirtualpath("/file:").unwrap(), Some(DIR_FILE));
        assert_eq!(db.directory_id_byvirtualpath("/http:").unwrap(), Some(DIR_HTTP));
        assert_eq!(
            db.directory_id_byvirtualpath("/spotify:").unwrap(),
            Some(DIR_SPOTIFY)
        );
    }

    #[test]
    fn add_and_enumerate_children() {
        let db = Db::open_test();
        let mut di = Directory {
            virtual_path: "/file:/music".into(),
            path: Some("/music".into()),
            parent_id: DIR_FILE,
            scan_kind: ScanKind::Files,
            ..Default::default()
        };
        let id = db.directory_add(&mut di).unwrap();
        assert!(id >= DIR_MAX);

        let children = db.directory_children(DIR_FILE).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].virtual_path, "/file:/music");
    }

    #[test]
    fn disable_enable_bycookie_roundtrip() {
        let db = Db::open_test();
        let mut di = Directory {
            virtual_path: "/file:/old/sub".into(),
            path: Some("/old/sub".into()),
            parent_id: DIR_FILE,
            scan_kind: ScanKind::Files,
            ..Default::default()
        };
        db.directory_add(&mut di).unwrap();

        db.directory_disable_bymatch("/old", Strip::Path, 99).unwrap();
        assert_eq!(db.directory_id_byvirtualpath("/file:/old/sub").unwrap(), None);

        let enabled = db.directory_enable_bycookie(99, "/new").unwrap();
        assert_eq!(enabled, 1);
        assert_eq!(
            db.directory_id_byvirtualpath("/file:/new/sub").unwrap(),
            Some(di.id)
        );
    }
}
