//! The `groups` table: album and artist groups keyed by persistent hash.
//!
//! Rows are inserted by triggers on `files` (see the schema), so the only
//! write operation here is garbage collection.

use color_eyre::Result;
use strum::FromRepr;

use crate::db::Db;

#[derive(Debug, FromRepr, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GroupType {
    Albums = 1,
    Artists = 2,
}

impl Db {
    /// Remove groups no longer referenced by any visible file.
    pub fn groups_cleanup(&self) -> Result<usize> {
        self.with_transaction(|db| {
            let albums = db.query_run(
                "DELETE FROM groups WHERE type = 1 AND NOT persistentid IN \
                 (SELECT songalbumid FROM files WHERE disabled = 0);",
                [],
            )?;
            let artists = db.query_run(
                "DELETE FROM groups WHERE type = 2 AND NOT persistentid IN \
                 (SELECT songartistid FROM files WHERE disabled = 0);",
                [],
            )?;
            tracing::debug!("Removed {albums} album groups and {artists} artist groups");
            Ok(albums + artists)
        })
    }

    pub fn group_persistentid_byid(&self, id: u32) -> Result<Option<i64>> {
        self.get_one_int(
            "SELECT g.persistentid FROM groups g WHERE g.id = ?1;",
            (id,),
        )
    }

    pub fn group_type_bypersistentid(&self, persistentid: i64) -> Result<Option<GroupType>> {
        let group_type = self
            .get_one_int(
                "SELECT g.type FROM groups g WHERE g.persistentid = ?1;",
                (persistentid,),
            )?
            .and_then(|t| GroupType::from_repr(t as u32));
        Ok(group_type)
    }
}
