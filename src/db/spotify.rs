//! Row management for the external Spotify source.
//!
//! The source itself runs out-of-process; the catalog only has to honor its
//! purge protocol so a logout or re-sync leaves no stale rows behind.

use color_eyre::Result;

use crate::db::{DISABLED_FAKE_COOKIE, Db};

impl Db {
    /// Delete every Spotify row, then park the `/spotify:` directory behind
    /// the fake-cookie sentinel until the source re-announces itself.
    pub fn spotify_purge(&self) -> Result<()> {
        self.with_transaction(|db| {
            db.query_run("DELETE FROM files WHERE path LIKE 'spotify:%';", [])?;
            db.query_run(
                "DELETE FROM playlistitems WHERE filepath LIKE 'spotify:%';",
                [],
            )?;
            db.query_run(
                "DELETE FROM playlists WHERE virtual_path LIKE '/spotify:/%';",
                [],
            )?;
            db.query_run(
                "DELETE FROM directories WHERE virtual_path LIKE '/spotify:/%';",
                [],
            )?;
            db.query_run(
                "UPDATE directories SET disabled = ?1 WHERE virtual_path = '/spotify:';",
                (DISABLED_FAKE_COOKIE,),
            )?;
            Ok(())
        })?;
        crate::listener::notify_event(crate::listener::Event::Spotify);
        Ok(())
    }

    /// Delete one Spotify playlist and its items.
    pub fn spotify_pl_delete(&self, id: u32) -> Result<()> {
        self.with_transaction(|db| {
            db.query_run(
                "DELETE FROM playlists WHERE id = ?1 AND virtual_path LIKE '/spotify:/%';",
                (id,),
            )?;
            db.query_run("DELETE FROM playlistitems WHERE playlistid = ?1;", (id,))?;
            Ok(())
        })
    }

    /// Delete Spotify files that are no longer referenced by any playlist.
    pub fn spotify_files_delete(&self) -> Result<()> {
        self.query_run(
            "DELETE FROM files WHERE path LIKE 'spotify:%' \
             AND NOT path IN (SELECT filepath FROM playlistitems);",
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::files::tests::sample_mfi;
    use crate::db::playlists::tests::sample_playlist;
    use crate::db::{DataKind, PlType, ScanKind};

    fn spotify_track(db: &Db, uri: &str) -> u32 {
        let mut mfi = sample_mfi(uri, "A", "X");
        mfi.virtual_path = Some(format!("/spotify:/{uri}"));
        mfi.data_kind = DataKind::Spotify;
        mfi.scan_kind = ScanKind::Spotify;
        db.file_add(&mut mfi).unwrap()
    }

    #[test]
    fn purge_wipes_all_spotify_rows() {
        let db = Db::open_test();
        spotify_track(&db, "spotify:track:1");
        let mut local = sample_mfi("/m/a.mp3", "A", "X");
        db.file_add(&mut local).unwrap();

        let mut pli = sample_playlist("spotify:playlist:9", PlType::Plain);
        pli.virtual_path = Some("/spotify:/playlist 9".into());
        let plid = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(plid, "spotify:track:1").unwrap();

        db.spotify_purge().unwrap();

        assert_eq!(db.file_id_bypath("spotify:track:1").unwrap(), None);
        assert!(db.file_id_bypath("/m/a.mp3").unwrap().is_some());
        assert_eq!(db.pl_fetch_byid(plid).unwrap(), None);

        let disabled = db
            .get_one_int(
                "SELECT disabled FROM directories WHERE virtual_path = '/spotify:';",
                [],
            )
            .unwrap();
        assert_eq!(disabled, Some(DISABLED_FAKE_COOKIE));
    }

    #[test]
    fn files_delete_only_drops_orphans() {
        let db = Db::open_test();
        spotify_track(&db, "spotify:track:kept");
        spotify_track(&db, "spotify:track:orphan");

        let mut pli = sample_playlist("spotify:playlist:1", PlType::Plain);
        pli.virtual_path = Some("/spotify:/playlist 1".into());
        let plid = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(plid, "spotify:track:kept").unwrap();

        db.spotify_files_delete().unwrap();

        assert!(db.file_id_bypath("spotify:track:kept").unwrap().is_some());
        assert_eq!(db.file_id_bypath("spotify:track:orphan").unwrap(), None);
    }
}
