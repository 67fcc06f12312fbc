//! Persisted output device state (`speakers`) and remote pairings.

use color_eyre::Result;

use crate::db::Db;

/// The per-device state worth remembering across restarts.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Speaker {
    pub id: u64,
    pub selected: bool,
    pub volume: i32,
    pub name: Option<String>,
    pub auth_key: Option<String>,
    pub format: i32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PairingInfo {
    pub remote_id: String,
    pub name: String,
    pub guid: String,
}

impl Db {
    pub fn speaker_save(&self, speaker: &Speaker) -> Result<()> {
        self.query_run(
            "INSERT OR REPLACE INTO speakers (id, selected, volume, name, auth_key, format) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            (
                speaker.id as i64,
                speaker.selected,
                speaker.volume,
                &speaker.name,
                &speaker.auth_key,
                speaker.format,
            ),
        )?;
        Ok(())
    }

    pub fn speaker_get(&self, id: u64) -> Result<Option<Speaker>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, selected, volume, name, auth_key, format FROM speakers WHERE id = ?1;",
        )?;
        let speaker = stmt
            .query_row((id as i64,), |row| {
                Ok(Speaker {
                    id: row.get::<_, i64>(0)? as u64,
                    selected: row.get(1)?,
                    volume: row.get(2)?,
                    name: row.get(3)?,
                    auth_key: row.get(4)?,
                    format: row.get(5)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(speaker)
    }

    pub fn pairing_add(&self, pairing: &PairingInfo) -> Result<()> {
        self.query_run(
            "INSERT OR REPLACE INTO pairings (remote, name, guid) VALUES (?1, ?2, ?3);",
            (&pairing.remote_id, &pairing.name, &pairing.guid),
        )?;
        crate::listener::notify_event(crate::listener::Event::Pairing);
        Ok(())
    }

    pub fn pairing_fetch_byguid(&self, guid: &str) -> Result<Option<PairingInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT remote, name, guid FROM pairings WHERE guid = ?1;")?;
        let pairing = stmt
            .query_row((guid,), |row| {
                Ok(PairingInfo {
                    remote_id: row.get(0)?,
                    name: row.get(1)?,
                    guid: row.get(2)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(pairing)
    }
}
