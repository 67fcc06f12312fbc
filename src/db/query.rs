//! The query/browse engine.
//!
//! Callers describe what they want in [`QueryParams`]; the builder emits the
//! matching SQL (always preceded by a COUNT over the same WHERE/JOIN so
//! paging can be combined with totals) and decodes rows into typed records.

use color_eyre::Result;
use color_eyre::eyre::bail;
use rusqlite::Row;

use crate::db::files::{FileMetadata, MediaFile, MetadataKind, MFI_COLS};
use crate::db::groups::GroupType;
use crate::db::maps;
use crate::db::playlists::{PL_SELECT, PLI_COLS, Playlist};
use crate::db::{DataKind, Db, MediaKind, PlType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IdxType {
    #[default]
    None,
    First,
    Last,
    Sub,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    #[default]
    None,
    Name,
    Album,
    Artist,
    Playlist,
    Year,
    Genre,
    Composer,
    Disc,
    Track,
    VPath,
    Pos,
    ShufflePos,
    DateReleased,
    MdValue,
}

impl SortType {
    pub fn clause(self) -> &'static str {
        match self {
            SortType::None => "",
            SortType::Name => "f.title_sort",
            SortType::Album => "f.album_sort, f.disc, f.track",
            SortType::Artist => "f.album_artist_sort, f.album_sort, f.disc, f.track",
            SortType::Playlist => "f.type, f.parent_id, f.special_id, f.title",
            SortType::Year => "f.year",
            SortType::Genre => "f.genre",
            SortType::Composer => "f.composer_sort",
            SortType::Disc => "f.disc",
            SortType::Track => "f.track",
            SortType::VPath => "f.virtual_path COLLATE NOCASE",
            SortType::Pos => "pos",
            SortType::ShufflePos => "shuffle_pos",
            SortType::DateReleased => "f.date_released DESC, f.title_sort DESC",
            SortType::MdValue => "m.value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseType {
    Artists,
    Albums,
    Genres,
    Composers,
    Years,
    Discs,
    Tracks,
    VPath,
    Path,
    GenresMd,
    ComposersMd,
}

struct BrowseClause {
    select: &'static str,
    from: &'static str,
    cond: &'static str,
    group: &'static str,
}

impl BrowseType {
    fn clause(self) -> BrowseClause {
        match self {
            BrowseType::Artists => BrowseClause {
                select: "f.album_artist, f.album_artist_sort",
                from: "",
                cond: "f.album_artist",
                group: "f.album_artist_sort, f.album_artist",
            },
            BrowseType::Albums => BrowseClause {
                select: "f.album, f.album_sort",
                from: "",
                cond: "f.album",
                group: "f.album_sort, f.album",
            },
            BrowseType::Genres => BrowseClause {
                select: "f.genre, f.genre",
                from: "",
                cond: "f.genre",
                group: "f.genre",
            },
            BrowseType::Composers => BrowseClause {
                select: "f.composer, f.composer_sort",
                from: "",
                cond: "f.composer",
                group: "f.composer_sort, f.composer",
            },
            BrowseType::Years => BrowseClause {
                select: "f.year, f.year",
                from: "",
                cond: "f.year",
                group: "f.year",
            },
            BrowseType::Discs => BrowseClause {
                select: "f.disc, f.disc",
                from: "",
                cond: "f.disc",
                group: "f.disc",
            },
            BrowseType::Tracks => BrowseClause {
                select: "f.track, f.track",
                from: "",
                cond: "f.track",
                group: "f.track",
            },
            BrowseType::VPath => BrowseClause {
                select: "f.virtual_path, f.virtual_path",
                from: "",
                cond: "f.virtual_path",
                group: "f.virtual_path",
            },
            BrowseType::Path => BrowseClause {
                select: "f.path, f.path",
                from: "",
                cond: "f.path",
                group: "f.path",
            },
            BrowseType::GenresMd => BrowseClause {
                select: "m.value, m.value",
                from: "JOIN files_metadata m ON f.id = m.file_id",
                cond: "m.metadata_kind = 1 AND m.value",
                group: "m.value",
            },
            BrowseType::ComposersMd => BrowseClause {
                select: "m.value, m.value",
                from: "JOIN files_metadata m ON f.id = m.file_id",
                cond: "m.metadata_kind = 5 AND m.value",
                group: "m.value",
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    #[default]
    Items,
    Playlists,
    FindPlaylists,
    PlaylistItems,
    GroupAlbums,
    GroupArtists,
    GroupItems,
    GroupDirs,
    CountItems,
    FileMetadata,
    Browse(BrowseType),
}

#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pub kind: QueryKind,
    pub idx_type: IdxType,
    pub sort: SortType,
    pub id: u32,
    pub persistentid: i64,
    pub offset: u32,
    pub limit: u32,
    pub having: Option<String>,
    pub order: Option<String>,
    pub group: Option<String>,
    pub join: Option<String>,
    /// A WHERE predicate fragment, owned by the caller
    pub filter: Option<String>,
    pub with_disabled: bool,
    /// Total matching rows, filled in when the query is built
    pub results: i64,
}

/// Decoded row of a Group* query.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupInfo {
    pub id: u32,
    pub persistentid: i64,
    pub itemname: Option<String>,
    pub itemname_sort: Option<String>,
    pub itemcount: u32,
    pub groupalbumcount: u32,
    pub songalbumartist: Option<String>,
    pub songartistid: i64,
    pub song_length: i64,
    pub data_kind: DataKind,
    pub media_kind: Option<MediaKind>,
    pub year: u32,
    pub date_released: i64,
    pub time_added: i64,
    pub time_played: i64,
    pub seek: u32,
}

/// Decoded row of a browse query.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BrowseInfo {
    pub itemname: Option<String>,
    pub itemname_sort: Option<String>,
    pub track_count: u32,
    pub album_count: u32,
    pub artist_count: u32,
    pub song_length: i64,
    pub data_kind: DataKind,
    pub media_kind: Option<MediaKind>,
    pub year: u32,
    pub date_released: i64,
    pub time_added: i64,
    pub time_played: i64,
    pub seek: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileCountInfo {
    pub count: u32,
    /// Summed song_length, ms
    pub length: u64,
    pub artist_count: u32,
    pub album_count: u32,
    pub file_size: u64,
}

struct QueryClause {
    join: String,
    cond: String,
    group: String,
    having: String,
    order: String,
    index: String,
}

pub(crate) struct BuiltQuery {
    pub count: Option<String>,
    pub query: String,
}

fn build_clause(qp: &QueryParams) -> QueryClause {
    let group = if let QueryKind::Browse(browse) = qp.kind {
        format!("GROUP BY {}", browse.clause().group)
    } else if let Some(group) = &qp.group {
        format!("GROUP BY {group}")
    } else {
        String::new()
    };

    let cond = match (&qp.filter, qp.with_disabled) {
        (Some(filter), false) => format!("WHERE f.disabled = 0 AND {filter}"),
        (None, false) => "WHERE f.disabled = 0".to_string(),
        (Some(filter), true) => format!("WHERE {filter}"),
        (None, true) => String::new(),
    };

    let having = match &qp.having {
        Some(having)
            if matches!(qp.kind, QueryKind::GroupAlbums | QueryKind::GroupArtists) =>
        {
            format!("HAVING {having}")
        }
        _ => String::new(),
    };

    let order = if let Some(order) = &qp.order {
        format!("ORDER BY {order}")
    } else if qp.sort != SortType::None {
        format!("ORDER BY {}", qp.sort.clause())
    } else if let QueryKind::Browse(browse) = qp.kind {
        format!("ORDER BY {}", browse.clause().group)
    } else {
        String::new()
    };

    let join = qp.join.clone().unwrap_or_default();

    let index = match qp.idx_type {
        IdxType::First if qp.limit != 0 => format!("LIMIT {}", qp.limit),
        IdxType::First | IdxType::None => String::new(),
        IdxType::Last => format!("LIMIT -1 OFFSET {}", qp.results - qp.limit as i64),
        IdxType::Sub if qp.limit != 0 => format!("LIMIT {} OFFSET {}", qp.limit, qp.offset),
        IdxType::Sub => format!("LIMIT -1 OFFSET {}", qp.offset),
    };

    QueryClause {
        join,
        cond,
        group,
        having,
        order,
        index,
    }
}

impl Db {
    /// Build the SQL for `qp` and run the COUNT, filling `qp.results`.
    pub(crate) fn build_query(&self, qp: &mut QueryParams) -> Result<BuiltQuery> {
        // I_LAST needs the total before its OFFSET clause can be emitted
        if qp.idx_type == IdxType::Last {
            let mut probe = qp.clone();
            probe.idx_type = IdxType::None;
            self.build_query_inner(&mut probe)?;
            qp.results = probe.results;
        }

        self.build_query_inner(qp)
    }

    fn build_query_inner(&self, qp: &mut QueryParams) -> Result<BuiltQuery> {
        let qc = build_clause(qp);

        let built = match qp.kind {
            QueryKind::Items => build_items(qp, &qc),
            QueryKind::Playlists => build_pls(&qc),
            QueryKind::FindPlaylists => build_find_pls(qp)?,
            QueryKind::PlaylistItems => self.build_plitems(qp, &qc)?,
            QueryKind::GroupAlbums => build_group_albums(&qc),
            QueryKind::GroupArtists => build_group_artists(&qc),
            QueryKind::GroupItems => self.build_group_items(qp, &qc)?,
            QueryKind::GroupDirs => self.build_group_dirs(qp, &qc)?,
            QueryKind::CountItems => build_count_items(&qc),
            QueryKind::FileMetadata => build_file_metadata(qp, &qc),
            QueryKind::Browse(browse) => build_browse(browse, &qc),
        };

        match &built.count {
            Some(count) => {
                qp.results = self.get_one_int(count, [])?.unwrap_or(0);
            }
            None => qp.results = 1,
        }

        Ok(built)
    }

    /// Run an Items/PlaylistItems/GroupItems query and decode the rows.
    pub fn query_files(&self, qp: &mut QueryParams) -> Result<Vec<MediaFile>> {
        if !matches!(
            qp.kind,
            QueryKind::Items | QueryKind::PlaylistItems | QueryKind::GroupItems
        ) {
            bail!("Bug! File fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let mut rows = stmt.query([])?;
        let mut files = Vec::new();
        while let Some(row) = rows.next()? {
            files.push(maps::record_from_row(row, MFI_COLS)?);
        }
        Ok(files)
    }

    pub fn query_playlists(&self, qp: &mut QueryParams) -> Result<Vec<Playlist>> {
        if !matches!(qp.kind, QueryKind::Playlists | QueryKind::FindPlaylists) {
            bail!("Bug! Playlist fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let mut rows = stmt.query([])?;
        let mut playlists = Vec::new();
        while let Some(row) = rows.next()? {
            let pli: Playlist = maps::record_from_row(row, PLI_COLS)?;
            if pli.id != 0 {
                playlists.push(pli);
            }
        }
        Ok(playlists)
    }

    pub fn query_groups(&self, qp: &mut QueryParams) -> Result<Vec<GroupInfo>> {
        if !matches!(qp.kind, QueryKind::GroupAlbums | QueryKind::GroupArtists) {
            bail!("Bug! Group fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    pub fn query_browse(&self, qp: &mut QueryParams) -> Result<Vec<BrowseInfo>> {
        let QueryKind::Browse(_) = qp.kind else {
            bail!("Bug! Browse fetch on query kind {:?}", qp.kind);
        };
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let rows = stmt
            .query_map([], browse_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The distinct value strings of a browse or group-dirs query, with the
    /// sort string when the query provides one.
    pub fn query_strings(&self, qp: &mut QueryParams) -> Result<Vec<(String, Option<String>)>> {
        if !matches!(qp.kind, QueryKind::Browse(_) | QueryKind::GroupDirs) {
            bail!("Bug! String fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let mut rows = stmt.query([])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            let value: Option<String> = row.get(0)?;
            let sort: Option<String> = if row.as_ref().column_count() > 1 {
                row.get(1).unwrap_or(None)
            } else {
                None
            };
            if let Some(value) = value {
                values.push((value, sort));
            }
        }
        Ok(values)
    }

    pub fn query_count(&self, qp: &mut QueryParams) -> Result<FileCountInfo> {
        if qp.kind != QueryKind::CountItems {
            bail!("Bug! Count fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let fci = stmt.query_row([], |row| {
            Ok(FileCountInfo {
                count: row.get(0)?,
                length: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                artist_count: row.get(2)?,
                album_count: row.get(3)?,
                file_size: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
            })
        })?;
        Ok(fci)
    }

    pub fn query_file_metadata(&self, qp: &mut QueryParams) -> Result<Vec<FileMetadata>> {
        if qp.kind != QueryKind::FileMetadata {
            bail!("Bug! File metadata fetch on query kind {:?}", qp.kind);
        }
        let built = self.build_query(qp)?;
        let mut stmt = self.conn.prepare(&built.query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FileMetadata {
                    metadata_kind: MetadataKind::from_repr(row.get(3)?).unwrap_or_default(),
                    idx: row.get(4)?,
                    value: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Item counts for an arbitrary filter, without paging.
    pub fn filecount_get(&self, qp: &mut QueryParams) -> Result<FileCountInfo> {
        let mut count_qp = qp.clone();
        count_qp.kind = QueryKind::CountItems;
        self.query_count(&mut count_qp)
    }

    fn build_plitems(&self, qp: &mut QueryParams, qc: &QueryClause) -> Result<BuiltQuery> {
        if qp.id == 0 {
            bail!("No playlist id specified in playlist items query");
        }
        let Some(pli) = self.pl_fetch_byid(qp.id)? else {
            bail!("Playlist {} not found for playlist items query", qp.id);
        };

        match pli.pl_type {
            PlType::Special | PlType::Smart => self.build_plitems_smart(qp, &pli),
            PlType::Rss | PlType::Plain | PlType::Folder => Ok(build_plitems_plain(qp, qc)),
        }
    }

    fn build_plitems_smart(&self, qp: &mut QueryParams, pli: &Playlist) -> Result<BuiltQuery> {
        let Some(pl_query) = &pli.query else {
            bail!("Smart playlist {} has no query", pli.id);
        };

        // The playlist's own limit and order apply unless the caller already
        // paged or sorted.
        if pli.query_limit > 0 {
            match qp.idx_type {
                IdxType::Sub => {
                    if pli.query_limit > qp.offset + qp.limit {
                        qp.limit = pli.query_limit;
                    }
                }
                IdxType::None => {
                    qp.idx_type = IdxType::Sub;
                    qp.limit = pli.query_limit;
                    qp.offset = 0;
                }
                _ => {
                    tracing::warn!(
                        "Cannot append limit from smart playlist '{:?}' to query",
                        pli.path
                    );
                }
            }
        }

        let borrowed_order = if pli.query_order.is_some() {
            if qp.order.is_none() && qp.sort == SortType::None {
                qp.order = pli.query_order.clone();
                true
            } else {
                tracing::warn!(
                    "Cannot append order by from smart playlist '{:?}' to query",
                    pli.path
                );
                false
            }
        } else {
            false
        };

        let qc = build_clause(qp);
        if borrowed_order {
            qp.order = None;
        }

        let limit = if pli.query_limit > 0 {
            pli.query_limit as i64
        } else {
            -1
        };
        let count = format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM files f {} AND ({pl_query}) LIMIT {limit});",
            qc.cond
        );
        let query = format!(
            "SELECT f.* FROM files f {} AND ({pl_query}) {} {};",
            qc.cond, qc.order, qc.index
        );
        Ok(BuiltQuery {
            count: Some(count),
            query,
        })
    }

    fn build_group_items(&self, qp: &QueryParams, qc: &QueryClause) -> Result<BuiltQuery> {
        let id_col = match self.group_type_bypersistentid(qp.persistentid)? {
            Some(GroupType::Albums) => "songalbumid",
            Some(GroupType::Artists) => "songartistid",
            None => bail!(
                "Unsupported group type for group id {}",
                qp.persistentid
            ),
        };
        let count = format!(
            "SELECT COUNT(*) FROM files f {} AND f.{id_col} = {};",
            qc.cond, qp.persistentid
        );
        let query = format!(
            "SELECT f.* FROM files f {} AND f.{id_col} = {} {} {};",
            qc.cond, qp.persistentid, qc.order, qc.index
        );
        Ok(BuiltQuery {
            count: Some(count),
            query,
        })
    }

    fn build_group_dirs(&self, qp: &QueryParams, qc: &QueryClause) -> Result<BuiltQuery> {
        let id_col = match self.group_type_bypersistentid(qp.persistentid)? {
            Some(GroupType::Albums) => "songalbumid",
            Some(GroupType::Artists) => "songartistid",
            None => bail!(
                "Unsupported group type for group id {}",
                qp.persistentid
            ),
        };
        let dir_expr = "DISTINCT(SUBSTR(f.path, 1, LENGTH(f.path) - LENGTH(f.fname) - 1))";
        let count = format!(
            "SELECT COUNT({dir_expr}) FROM files f {} AND f.{id_col} = {};",
            qc.cond, qp.persistentid
        );
        let query = format!(
            "SELECT {dir_expr} FROM files f {} AND f.{id_col} = {} {} {};",
            qc.cond, qp.persistentid, qc.order, qc.index
        );
        Ok(BuiltQuery {
            count: Some(count),
            query,
        })
    }
}

fn build_items(qp: &QueryParams, qc: &QueryClause) -> BuiltQuery {
    let (count, query) = if qp.id == 0 {
        (
            format!("SELECT COUNT(*) FROM files f {};", qc.cond),
            format!(
                "SELECT f.* FROM files f {} {} {} {};",
                qc.cond, qc.group, qc.order, qc.index
            ),
        )
    } else if qc.cond.is_empty() {
        (
            format!("SELECT COUNT(*) FROM files f WHERE f.id = {};", qp.id),
            format!(
                "SELECT f.* FROM files f WHERE f.id = {} {} {} {};",
                qp.id, qc.group, qc.order, qc.index
            ),
        )
    } else {
        (
            format!("SELECT COUNT(*) FROM files f {} AND f.id = {};", qc.cond, qp.id),
            format!(
                "SELECT f.* FROM files f {} AND f.id = {} {} {} {};",
                qc.cond, qp.id, qc.group, qc.order, qc.index
            ),
        )
    };
    BuiltQuery {
        count: Some(count),
        query,
    }
}

fn build_pls(qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: Some(format!("SELECT COUNT(*) FROM playlists f {};", qc.cond)),
        query: format!(
            "{PL_SELECT} {} GROUP BY f.id {} {};",
            qc.cond, qc.order, qc.index
        ),
    }
}

fn build_find_pls(qp: &mut QueryParams) -> Result<BuiltQuery> {
    let Some(filter) = &qp.filter else {
        bail!("Bug! Playlist find called without search criteria");
    };
    // qc.cond carries f.disabled which is not a column of playlistitems
    let cond = format!(
        "WHERE f.id IN (SELECT playlistid FROM playlistitems WHERE {filter})"
    );
    let order = match (&qp.order, qp.sort) {
        (Some(order), _) => format!("ORDER BY {order}"),
        (None, SortType::None) => String::new(),
        (None, sort) => format!("ORDER BY {}", sort.clause()),
    };
    Ok(BuiltQuery {
        count: Some(format!("SELECT COUNT(*) FROM playlists f {cond};")),
        query: format!("{PL_SELECT} {cond} GROUP BY f.id {order};"),
    })
}

fn build_plitems_plain(qp: &QueryParams, qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: Some(format!(
            "SELECT COUNT(*) FROM files f JOIN playlistitems pi ON f.path = pi.filepath \
             {} AND pi.playlistid = {};",
            qc.cond, qp.id
        )),
        query: format!(
            "SELECT f.* FROM files f JOIN playlistitems pi ON f.path = pi.filepath \
             {} AND pi.playlistid = {} ORDER BY pi.id ASC {};",
            qc.cond, qp.id, qc.index
        ),
    }
}

const GROUP_AGGREGATES: &str =
    " SUM(f.song_length) AS song_length, MIN(f.data_kind) AS data_kind, MIN(f.media_kind) AS media_kind,\
     MAX(f.year) AS year, MAX(f.date_released) AS date_released,\
     MAX(f.time_added) AS time_added, MAX(f.time_played) AS time_played, MAX(f.seek) AS seek ";

fn build_group_albums(qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: Some(format!(
            "SELECT COUNT(DISTINCT f.songalbumid) FROM files f {} {};",
            qc.join, qc.cond
        )),
        query: format!(
            "SELECT g.id, g.persistentid, f.album, f.album_sort, COUNT(f.id) AS track_count, \
             1 AS album_count, f.album_artist, f.songartistid,{GROUP_AGGREGATES}\
             FROM files f JOIN groups g ON f.songalbumid = g.persistentid {} {} \
             GROUP BY f.songalbumid {} {} {};",
            qc.join, qc.cond, qc.having, qc.order, qc.index
        ),
    }
}

fn build_group_artists(qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: Some(format!(
            "SELECT COUNT(DISTINCT f.songartistid) FROM files f {};",
            qc.cond
        )),
        query: format!(
            "SELECT g.id, g.persistentid, f.album_artist, f.album_artist_sort, COUNT(f.id) AS track_count, \
             COUNT(DISTINCT f.songalbumid) AS album_count, f.album_artist, f.songartistid,{GROUP_AGGREGATES}\
             FROM files f JOIN groups g ON f.songartistid = g.persistentid {} \
             GROUP BY f.songartistid {} {} {};",
            qc.cond, qc.having, qc.order, qc.index
        ),
    }
}

fn build_count_items(qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: None,
        query: format!(
            "SELECT COUNT(*), SUM(song_length), COUNT(DISTINCT songartistid), \
             COUNT(DISTINCT songalbumid), SUM(file_size) FROM files f {};",
            qc.cond
        ),
    }
}

fn build_file_metadata(qp: &QueryParams, qc: &QueryClause) -> BuiltQuery {
    BuiltQuery {
        count: Some(format!(
            "SELECT COUNT(*) FROM files_metadata fm JOIN files f ON fm.file_id = f.id \
             {} AND fm.file_id = {};",
            qc.cond, qp.id
        )),
        query: format!(
            "SELECT fm.* FROM files_metadata fm JOIN files f ON fm.file_id = f.id \
             {} AND fm.file_id = {} ORDER BY fm.metadata_kind ASC, fm.idx ASC {};",
            qc.cond, qp.id, qc.index
        ),
    }
}

fn build_browse(browse: BrowseType, qc: &QueryClause) -> BuiltQuery {
    let bc = browse.clause();
    let cond = if qc.cond.is_empty() {
        format!("WHERE {} != ''", bc.cond)
    } else {
        format!("{} AND {} != ''", qc.cond, bc.cond)
    };
    BuiltQuery {
        count: Some(format!(
            "SELECT COUNT(*) FROM (SELECT {} FROM files f {} {cond} {});",
            bc.select, bc.from, qc.group
        )),
        query: format!(
            "SELECT {}, COUNT(f.id) AS track_count, COUNT(DISTINCT f.songalbumid) AS album_count, \
             COUNT(DISTINCT f.songartistid) AS artist_count,{GROUP_AGGREGATES}\
             FROM files f {} {cond} {} {} {};",
            bc.select, bc.from, qc.group, qc.order, qc.index
        ),
    }
}

fn group_from_row(row: &Row) -> rusqlite::Result<GroupInfo> {
    Ok(GroupInfo {
        id: row.get(0)?,
        persistentid: row.get(1)?,
        itemname: row.get(2)?,
        itemname_sort: row.get(3)?,
        itemcount: row.get(4)?,
        groupalbumcount: row.get(5)?,
        songalbumartist: row.get(6)?,
        songartistid: row.get(7)?,
        song_length: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        data_kind: DataKind::from_repr(row.get(9)?).unwrap_or_default(),
        media_kind: MediaKind::from_repr(row.get(10)?),
        year: row.get(11)?,
        date_released: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        time_added: row.get(13)?,
        time_played: row.get(14)?,
        seek: row.get(15)?,
    })
}

fn browse_from_row(row: &Row) -> rusqlite::Result<BrowseInfo> {
    Ok(BrowseInfo {
        itemname: row.get::<_, Option<String>>(0).or_else(|_| {
            row.get::<_, Option<i64>>(0).map(|v| v.map(|v| v.to_string()))
        })?,
        itemname_sort: row.get::<_, Option<String>>(1).or_else(|_| {
            row.get::<_, Option<i64>>(1).map(|v| v.map(|v| v.to_string()))
        })?,
        track_count: row.get(2)?,
        album_count: row.get(3)?,
        artist_count: row.get(4)?,
        song_length: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        data_kind: DataKind::from_repr(row.get(6)?).unwrap_or_default(),
        media_kind: MediaKind::from_repr(row.get(7)?),
        year: row.get(8)?,
        date_released: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        time_added: row.get(10)?,
        time_played: row.get(11)?,
        seek: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::files::tests::sample_mfi;
    use crate::db::playlists::tests::sample_playlist;
    use crate::util;

    #[test]
    fn empty_filter_still_hides_disabled() {
        let db = Db::open_test();
        let mut qp = QueryParams::default();
        let built = db.build_query(&mut qp).unwrap();
        assert_eq!(
            built.query,
            "SELECT f.* FROM files f WHERE f.disabled = 0   ;"
        );
    }

    #[test]
    fn with_disabled_and_filter() {
        let db = Db::open_test();
        let mut qp = QueryParams {
            filter: Some("f.media_kind = 1".into()),
            with_disabled: true,
            ..Default::default()
        };
        let built = db.build_query(&mut qp).unwrap();
        assert!(built.query.contains("WHERE f.media_kind = 1"));
        assert!(!built.query.contains("disabled"));
    }

    #[test]
    fn items_query_returns_each_visible_file_once() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/a.mp3", "A", "X");
        mfi.song_length = 1000;
        db.file_add(&mut mfi).unwrap();

        let mut qp = QueryParams::default();
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(qp.results, 1);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].songalbumid, util::two_str_hash(Some("a"), Some("x")));

        db.file_disable_bypath("/m/a.mp3", crate::db::Strip::None, 1 << 32)
            .unwrap();
        let mut qp = QueryParams::default();
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 0);
    }

    #[test]
    fn idx_paging_shapes() {
        let db = Db::open_test();
        for i in 0..5 {
            let mut mfi = sample_mfi(&format!("/m/{i}.mp3"), "A", "X");
            mfi.track = i + 1;
            db.file_add(&mut mfi).unwrap();
        }

        let mut qp = QueryParams {
            idx_type: IdxType::First,
            sort: SortType::Track,
            limit: 2,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(qp.results, 5);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].track, 1);

        let mut qp = QueryParams {
            idx_type: IdxType::Last,
            sort: SortType::Track,
            limit: 2,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].track, 4);

        // limit >= results returns everything
        let mut qp = QueryParams {
            idx_type: IdxType::Last,
            sort: SortType::Track,
            limit: 10,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 5);

        let mut qp = QueryParams {
            idx_type: IdxType::Sub,
            sort: SortType::Track,
            limit: 2,
            offset: 2,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].track, 3);
    }

    #[test]
    fn group_albums_aggregate() {
        let db = Db::open_test();
        for (path, len) in [("/m/a1.mp3", 1000), ("/m/a2.mp3", 2000)] {
            let mut mfi = sample_mfi(path, "A", "X");
            mfi.song_length = len;
            db.file_add(&mut mfi).unwrap();
        }
        let mut other = sample_mfi("/m/b1.mp3", "B", "Y");
        other.song_length = 500;
        db.file_add(&mut other).unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::GroupAlbums,
            ..Default::default()
        };
        let groups = db.query_groups(&mut qp).unwrap();
        assert_eq!(qp.results, 2);
        assert_eq!(groups.len(), 2);

        let album_x = groups
            .iter()
            .find(|g| g.itemname.as_deref() == Some("X"))
            .unwrap();
        assert_eq!(album_x.itemcount, 2);
        assert_eq!(album_x.song_length, 3000);
        assert_eq!(
            album_x.persistentid,
            util::two_str_hash(Some("a"), Some("x"))
        );
    }

    #[test]
    fn group_artists_count_albums() {
        let db = Db::open_test();
        for (path, album) in [("/m/1.mp3", "X"), ("/m/2.mp3", "Y"), ("/m/3.mp3", "Y")] {
            let mut mfi = sample_mfi(path, "A", album);
            db.file_add(&mut mfi).unwrap();
        }

        let mut qp = QueryParams {
            kind: QueryKind::GroupArtists,
            ..Default::default()
        };
        let groups = db.query_groups(&mut qp).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].groupalbumcount, 2);
        assert_eq!(groups[0].itemcount, 3);
    }

    #[test]
    fn browse_genres_excludes_empty() {
        let db = Db::open_test();
        let mut with_genre = sample_mfi("/m/a.mp3", "A", "X");
        with_genre.genre = Some("House".into());
        db.file_add(&mut with_genre).unwrap();
        let mut also_house = sample_mfi("/m/b.mp3", "B", "Y");
        also_house.genre = Some("House".into());
        db.file_add(&mut also_house).unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::Browse(BrowseType::Genres),
            ..Default::default()
        };
        let values = db.query_strings(&mut qp).unwrap();
        assert_eq!(qp.results, 1);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "House");
    }

    #[test]
    fn count_items_totals() {
        let db = Db::open_test();
        for i in 0..3 {
            let mut mfi = sample_mfi(&format!("/m/{i}.mp3"), "A", "X");
            mfi.song_length = 1000;
            mfi.file_size = 100;
            db.file_add(&mut mfi).unwrap();
        }

        let mut qp = QueryParams {
            kind: QueryKind::CountItems,
            ..Default::default()
        };
        let fci = db.query_count(&mut qp).unwrap();
        assert_eq!(fci.count, 3);
        assert_eq!(fci.length, 3000);
        assert_eq!(fci.artist_count, 1);
        assert_eq!(fci.album_count, 1);
        assert_eq!(fci.file_size, 300);
    }

    #[test]
    fn plitems_plain_keeps_append_order() {
        let db = Db::open_test();
        let mut first = sample_mfi("/m/z.mp3", "A", "X");
        db.file_add(&mut first).unwrap();
        let mut second = sample_mfi("/m/a.mp3", "A", "X");
        db.file_add(&mut second).unwrap();

        let mut pli = sample_playlist("/m/lists/p.m3u", PlType::Plain);
        let plid = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(plid, "/m/z.mp3").unwrap();
        db.pl_add_item_bypath(plid, "/m/a.mp3").unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::PlaylistItems,
            id: plid,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "/m/z.mp3");
    }

    #[test]
    fn plitems_smart_applies_stored_order_and_limit() {
        let db = Db::open_test();
        for (i, year) in (0..15).map(|i| (i, 2000 + i)) {
            let mut mfi = sample_mfi(&format!("/m/{i}.mp3"), "A", "X");
            mfi.year = year;
            db.file_add(&mut mfi).unwrap();
        }

        let mut pli = sample_playlist("/m/lists/recent.smartpl", PlType::Smart);
        pli.query = Some("f.media_kind = 1".into());
        pli.query_order = Some("f.year DESC".into());
        pli.query_limit = 10;
        let plid = db.pl_add(&mut pli).unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::PlaylistItems,
            id: plid,
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files.len(), 10);
        assert_eq!(files[0].year, 2014);

        // A caller-supplied order wins over the stored one
        let mut qp = QueryParams {
            kind: QueryKind::PlaylistItems,
            id: plid,
            order: Some("f.year ASC".into()),
            ..Default::default()
        };
        let files = db.query_files(&mut qp).unwrap();
        assert_eq!(files[0].year, 2000);
    }

    #[test]
    fn plitems_requires_id() {
        let db = Db::open_test();
        let mut qp = QueryParams {
            kind: QueryKind::PlaylistItems,
            ..Default::default()
        };
        assert!(db.query_files(&mut qp).is_err());
    }

    #[test]
    fn find_playlists_requires_filter() {
        let db = Db::open_test();
        let mut qp = QueryParams {
            kind: QueryKind::FindPlaylists,
            ..Default::default()
        };
        assert!(db.query_playlists(&mut qp).is_err());
    }

    #[test]
    fn find_playlists_by_item() {
        let db = Db::open_test();
        let mut mfi = sample_mfi("/m/a.mp3", "A", "X");
        db.file_add(&mut mfi).unwrap();
        let mut pli = sample_playlist("/m/lists/p.m3u", PlType::Plain);
        let plid = db.pl_add(&mut pli).unwrap();
        db.pl_add_item_bypath(plid, "/m/a.mp3").unwrap();
        let mut other = sample_playlist("/m/lists/empty.m3u", PlType::Plain);
        db.pl_add(&mut other).unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::FindPlaylists,
            filter: Some("filepath = '/m/a.mp3'".into()),
            ..Default::default()
        };
        let playlists = db.query_playlists(&mut qp).unwrap();
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].id, plid);
    }

    #[test]
    fn wrong_kind_for_decoder_is_an_error() {
        let db = Db::open_test();
        let mut qp = QueryParams {
            kind: QueryKind::CountItems,
            ..Default::default()
        };
        assert!(db.query_files(&mut qp).is_err());
    }

    #[test]
    fn group_dirs_lists_distinct_parents() {
        let db = Db::open_test();
        let mut a = sample_mfi("/m/album/1.mp3", "A", "X");
        db.file_add(&mut a).unwrap();
        let mut b = sample_mfi("/m/album/2.mp3", "A", "X");
        db.file_add(&mut b).unwrap();

        let mut qp = QueryParams {
            kind: QueryKind::GroupDirs,
            persistentid: a.songalbumid,
            ..Default::default()
        };
        let dirs = db.query_strings(&mut qp).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, "/m/album");
    }
}
