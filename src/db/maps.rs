//! Column-map driven mapping between records and rows.
//!
//! Every persisted entity declares an ordered `Col` table. The table, the
//! column order in the DDL and the field order in the record struct are the
//! same sequence; [`assert_map_matches_table`] checks the lengths at startup.
//! Binding, row decoding and the three fixup passes all walk these tables so
//! a new column only has to be added in one place per layer.

use color_eyre::Result;
use color_eyre::eyre::bail;
use rusqlite::Row;
use rusqlite::types::ValueRef;
use unicode_normalization::UnicodeNormalization;

use crate::db::Db;
use crate::text_encoding;
use crate::util;

/// Not bound in INSERT/UPDATE statements: no matching column, or the value is
/// produced by the database (id, trigger results, aggregate columns).
pub const NO_BIND: u8 = 1 << 0;
/// On UPDATE the existing value is kept when the new one is zero, to avoid
/// clobbering counters and ratings.
pub const NO_ZERO: u8 = 1 << 1;

/// Which fixup treatment a column gets. `Standard` is sanitize-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    Standard,
    NoSanitize,
    Codectype,
    Type,
    Title,
    Artist,
    Album,
    AlbumArtist,
    Genre,
    Composer,
    MediaKind,
    ItemKind,
    TimeModified,
    TitleSort,
    ArtistSort,
    AlbumSort,
    AlbumArtistSort,
    ComposerSort,
    SongArtistId,
    SongAlbumId,
}

/// A column value in transit between a record field and the database.
#[derive(Debug, Clone, PartialEq)]
pub enum ColValue {
    Int(i64),
    Text(Option<String>),
}

impl ColValue {
    pub fn as_int(&self) -> i64 {
        match self {
            ColValue::Int(v) => *v,
            ColValue::Text(Some(s)) => util::parse_or_zero(s),
            ColValue::Text(None) => 0,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            ColValue::Text(v) => v,
            ColValue::Int(v) => Some(v.to_string()),
        }
    }
}

impl rusqlite::ToSql for ColValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        match self {
            ColValue::Int(v) => v.to_sql(),
            ColValue::Text(v) => v.to_sql(),
        }
    }
}

/// One column of an entity map.
pub struct Col<T> {
    pub name: &'static str,
    pub fixup: Fixup,
    pub flags: u8,
    pub get: fn(&T) -> ColValue,
    pub set: fn(&mut T, ColValue),
}

/// Rows for the column map tables. The field accessors are written out via
/// these macros so the tables stay as compact as the schema they mirror.
macro_rules! col_int {
    ($t:ty, $name:literal, $field:ident) => {
        col_int!($t, $name, $field, crate::db::maps::Fixup::Standard, 0)
    };
    ($t:ty, $name:literal, $field:ident, $fixup:expr) => {
        col_int!($t, $name, $field, $fixup, 0)
    };
    ($t:ty, $name:literal, $field:ident, $fixup:expr, $flags:expr) => {
        crate::db::maps::Col::<$t> {
            name: $name,
            fixup: $fixup,
            flags: $flags,
            get: |r: &$t| crate::db::maps::ColValue::Int(r.$field as i64),
            set: |r: &mut $t, v| r.$field = v.as_int() as _,
        }
    };
}

macro_rules! col_text {
    ($t:ty, $name:literal, $field:ident) => {
        col_text!($t, $name, $field, crate::db::maps::Fixup::Standard, 0)
    };
    ($t:ty, $name:literal, $field:ident, $fixup:expr) => {
        col_text!($t, $name, $field, $fixup, 0)
    };
    ($t:ty, $name:literal, $field:ident, $fixup:expr, $flags:expr) => {
        crate::db::maps::Col::<$t> {
            name: $name,
            fixup: $fixup,
            flags: $flags,
            get: |r: &$t| crate::db::maps::ColValue::Text(r.$field.clone()),
            set: |r: &mut $t, v| r.$field = v.into_text(),
        }
    };
}

/// Like `col_text` for required (non-NULL) string fields such as `path`.
macro_rules! col_text_req {
    ($t:ty, $name:literal, $field:ident, $fixup:expr) => {
        crate::db::maps::Col::<$t> {
            name: $name,
            fixup: $fixup,
            flags: 0,
            get: |r: &$t| crate::db::maps::ColValue::Text(Some(r.$field.clone())),
            set: |r: &mut $t, v| r.$field = v.into_text().unwrap_or_default(),
        }
    };
}

pub(crate) use {col_int, col_text, col_text_req};

/// `INSERT INTO <table> (a, b, ...) VALUES (?, ?, ...)` for the bindable
/// columns of a map, in map order.
pub fn insert_sql<T>(table: &str, map: &[Col<T>]) -> String {
    let names: Vec<&str> = map
        .iter()
        .filter(|c| c.flags & NO_BIND == 0)
        .map(|c| c.name)
        .collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({});",
        names.join(", "),
        placeholders
    )
}

/// `UPDATE <table> SET a = ?, ... WHERE id = ?`. `NO_ZERO` columns go through
/// `daap_no_zero` so a zero input preserves the stored value.
pub fn update_sql<T>(table: &str, map: &[Col<T>]) -> String {
    let assignments: Vec<String> = map
        .iter()
        .filter(|c| c.flags & NO_BIND == 0)
        .map(|c| {
            if c.flags & NO_ZERO != 0 {
                format!("{0} = daap_no_zero(?, {0})", c.name)
            } else {
                format!("{} = ?", c.name)
            }
        })
        .collect();
    format!(
        "UPDATE {table} SET {} WHERE id = ?;",
        assignments.join(", ")
    )
}

/// Bind parameter values for a record in map order; for updates the id goes
/// last, matching [`update_sql`].
pub fn bind_values<T>(record: &T, map: &[Col<T>], update_id: Option<i64>) -> Vec<ColValue> {
    let mut values: Vec<ColValue> = map
        .iter()
        .filter(|c| c.flags & NO_BIND == 0)
        .map(|c| (c.get)(record))
        .collect();
    if let Some(id) = update_id {
        values.push(ColValue::Int(id));
    }
    values
}

/// Decode a row into a record via the map. Columns are taken by position; a
/// row with more columns than the map decodes fine (newer schema), fewer is a
/// schema drift error.
pub fn record_from_row<T: Default>(row: &Row, map: &[Col<T>]) -> Result<T> {
    let ncols = row.as_ref().column_count();
    if ncols < map.len() {
        bail!(
            "BUG: database has fewer columns ({ncols}) than the column map ({})",
            map.len()
        );
    }

    let mut record = T::default();
    for (i, col) in map.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => ColValue::Text(None),
            ValueRef::Integer(v) => ColValue::Int(v),
            ValueRef::Real(v) => ColValue::Int(v as i64),
            ValueRef::Text(bytes) => {
                ColValue::Text(Some(String::from_utf8_lossy(bytes).into_owned()))
            }
            ValueRef::Blob(_) => ColValue::Text(None),
        };
        (col.set)(&mut record, value);
    }
    Ok(record)
}

/// Startup sanity check: the map must cover exactly the columns of its table.
pub fn assert_map_matches_table<T>(db: &Db, table: &str, map: &[Col<T>], derived: usize) -> Result<()> {
    let ncols: i64 = db
        .get_one_int(
            &format!("SELECT COUNT(*) FROM pragma_table_info('{table}');"),
            [],
        )?
        .unwrap_or(0);
    let expected = (map.len() - derived) as i64;
    if ncols != expected {
        bail!("BUG: table {table} has {ncols} columns but the map binds {expected}");
    }
    Ok(())
}

// ------------------------------------ Fixup ----------------------------------

/// The three-pass tag fixup. Pass one sanitizes every string column in the
/// map, passes two and three are entity specific and get called once per map
/// entry with that column's fixup kind.
pub fn fixup_tags<T>(
    record: &mut T,
    map: &[Col<T>],
    defaults: impl Fn(&mut T, Fixup),
    sort_keys: impl Fn(&mut T, Fixup),
) {
    for col in map {
        sanitize(record, col);
    }
    for col in map {
        defaults(record, col.fixup);
    }
    for col in map {
        sort_keys(record, col.fixup);
    }
}

fn sanitize<T>(record: &mut T, col: &Col<T>) {
    if matches!(col.fixup, Fixup::NoSanitize | Fixup::Codectype) {
        return;
    }
    let ColValue::Text(Some(value)) = (col.get)(record) else {
        return;
    };

    let trimmed = value.trim();
    let fixed = if trimmed.is_empty() {
        None
    } else {
        Some(text_encoding::fixup_string(trimmed))
    };
    (col.set)(record, ColValue::Text(fixed));
}

/// Width numbers are padded to, so short numbers sort before long ones.
const SORT_PAD_WIDTH: usize = 5;
/// A digit run longer than this aborts sort key generation for the tag.
const SORT_DIGITS_MAX: usize = 50;

/// Create or normalize a sort tag.
///
/// A sort tag provided by the source is only NFD-normalized. Otherwise one is
/// synthesized from the display tag: leading articles and quote characters
/// are skipped and digit runs are zero-padded so `a2`, `a10`, `a21` sort in
/// natural order.
pub fn sort_tag_create(sort_tag: &mut Option<String>, src_tag: Option<&str>) {
    if let Some(existing) = sort_tag {
        tracing::debug!("Existing sort tag will be normalized: {existing}");
        *sort_tag = Some(existing.nfd().collect());
        return;
    }

    let Some(src) = src_tag.filter(|s| !s.is_empty()) else {
        *sort_tag = None;
        return;
    };

    let lower = src.to_lowercase();
    let stripped = if lower.starts_with("a ") && src.len() > 2 {
        &src[2..]
    } else if lower.starts_with("an ") && src.len() > 3 {
        &src[3..]
    } else if lower.starts_with("the ") && src.len() > 4 {
        &src[4..]
    } else if src.starts_with(['[', '(', '\'', '"']) && src.chars().count() > 1 {
        &src[1..]
    } else {
        src
    };

    let mut out = String::with_capacity(stripped.len() + SORT_PAD_WIDTH);
    let mut digits = String::new();
    for ch in stripped.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() > SORT_DIGITS_MAX {
                // Absurd input, keep what we have rather than build a huge key
                digits.clear();
                break;
            }
        } else {
            flush_digits(&mut out, &mut digits);
            out.push(ch);
        }
    }
    flush_digits(&mut out, &mut digits);

    *sort_tag = Some(out.nfd().collect());
}

fn flush_digits(out: &mut String, digits: &mut String) {
    if digits.is_empty() {
        return;
    }
    for _ in digits.len()..SORT_PAD_WIDTH {
        out.push('0');
    }
    out.push_str(digits);
    digits.clear();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn synthesized(src: &str) -> String {
        let mut tag = None;
        sort_tag_create(&mut tag, Some(src));
        tag.unwrap()
    }

    #[test]
    fn articles_are_stripped() {
        assert_eq!(synthesized("The Beatles"), "Beatles");
        assert_eq!(synthesized("A Perfect Circle"), "Perfect Circle");
        assert_eq!(synthesized("An Horse"), "Horse");
        assert_eq!(synthesized("(What's the Story) Morning Glory?"), "What's the Story) Morning Glory?");
    }

    #[test]
    fn numbers_sort_naturally() {
        let a2 = synthesized("a2");
        let a10 = synthesized("a10");
        let a21 = synthesized("a21");
        let a111 = synthesized("a111");
        assert_eq!(a2, "a00002");
        assert!(a2 < a10 && a10 < a21 && a21 < a111);
    }

    #[test]
    fn trailing_number_is_padded() {
        assert_eq!(synthesized("Track 9"), "Track 00009");
    }

    #[test]
    fn provided_sort_tag_is_only_normalized() {
        let mut tag = Some("Ame\u{301}lie".to_string());
        sort_tag_create(&mut tag, Some("ignored"));
        // NFD keeps the decomposed form
        assert_eq!(tag.unwrap(), "Ame\u{301}lie");

        let mut tag = Some("Am\u{e9}lie".to_string());
        sort_tag_create(&mut tag, Some("ignored"));
        assert_eq!(tag.unwrap(), "Ame\u{301}lie");
    }

    #[test]
    fn empty_source_means_no_tag() {
        let mut tag = None;
        sort_tag_create(&mut tag, None);
        assert_eq!(tag, None);
        sort_tag_create(&mut tag, Some(""));
        assert_eq!(tag, None);
    }

    #[test]
    fn oversized_digit_runs_bail_out() {
        let huge = format!("x{}", "9".repeat(SORT_DIGITS_MAX + 10));
        assert_eq!(synthesized(&huge), "x");
    }

    #[derive(Default)]
    struct Rec {
        name: Option<String>,
        plain: Option<String>,
        count: u32,
    }

    static REC_COLS: &[Col<Rec>] = &[
        col_text!(Rec, "name", name, Fixup::NoSanitize),
        col_text!(Rec, "plain", plain),
        col_int!(Rec, "count", count, Fixup::Standard, NO_ZERO),
    ];

    #[test]
    fn sanitize_trims_and_folds_empty_to_null() {
        let mut rec = Rec {
            name: Some("  keep me  ".into()),
            plain: Some("   ".into()),
            count: 3,
        };
        fixup_tags(&mut rec, REC_COLS, |_, _| {}, |_, _| {});
        // NoSanitize fields are untouched
        assert_eq!(rec.name.as_deref(), Some("  keep me  "));
        assert_eq!(rec.plain, None);
    }

    #[test]
    fn update_sql_wraps_no_zero_columns() {
        let sql = update_sql("rec", REC_COLS);
        assert_eq!(
            sql,
            "UPDATE rec SET name = ?, plain = ?, count = daap_no_zero(?, count) WHERE id = ?;"
        );
    }

    #[test]
    fn insert_sql_skips_nothing_here() {
        assert_eq!(
            insert_sql("rec", REC_COLS),
            "INSERT INTO rec (name, plain, count) VALUES (?, ?, ?);"
        );
    }
}
