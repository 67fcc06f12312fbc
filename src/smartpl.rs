//! Parses smart playlist bodies.
//!
//! A smart playlist is a single expression of the form
//!
//! ```text
//! "Recently Added" { time_added > 2 weeks ago order by time_added desc limit 20 }
//! ```
//!
//! The parse result carries the WHERE/ORDER BY/LIMIT triple that gets stored
//! on the playlist row. Field names are intentionally not prefixed with `f.`
//! because smart queries may order by calculated fields of a group query.

use color_eyre::eyre::{Context, bail};
use color_eyre::{Result, Section};

pub const SMARTPL_SIZE_MAX: usize = 8192;

const STRING_FIELDS: &[&str] = &[
    "artist",
    "album_artist",
    "album",
    "title",
    "genre",
    "composer",
    "comment",
    "path",
    "type",
    "grouping",
];

const INT_FIELDS: &[&str] = &[
    "play_count",
    "skip_count",
    "rating",
    "year",
    "compilation",
    "track",
    "disc",
    "bitrate",
    "song_length",
    "usermark",
];

const DATE_FIELDS: &[&str] = &[
    "time_added",
    "time_modified",
    "time_played",
    "time_skipped",
    "date_released",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Is,
    Includes,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl IntOp {
    fn sql(self) -> &'static str {
        match self {
            IntOp::Eq => "=",
            IntOp::Ne => "<>",
            IntOp::Gt => ">",
            IntOp::Ge => ">=",
            IntOp::Lt => "<",
            IntOp::Le => "<=",
        }
    }
}

/// A point in time relative to now, as written in the playlist body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateSpec {
    Today,
    Yesterday,
    LastWeek,
    LastMonth,
    LastYear,
    Ago { amount: u32, unit: DateUnit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Days,
    Weeks,
    Months,
    Years,
}

impl DateSpec {
    /// SQLite datetime modifier, evaluated at query time so stored smart
    /// playlists stay relative.
    fn sql(&self) -> String {
        let modifier = match self {
            DateSpec::Today => "start of day".to_string(),
            DateSpec::Yesterday => "-1 days".to_string(),
            DateSpec::LastWeek => "-7 days".to_string(),
            DateSpec::LastMonth => "-1 months".to_string(),
            DateSpec::LastYear => "-1 years".to_string(),
            DateSpec::Ago { amount, unit } => match unit {
                DateUnit::Days => format!("-{amount} days"),
                DateUnit::Weeks => format!("-{} days", amount * 7),
                DateUnit::Months => format!("-{amount} months"),
                DateUnit::Years => format!("-{amount} years"),
            },
        };
        format!("strftime('%s', datetime('now', 'localtime', '{modifier}'))")
    }

    fn reserialize(&self) -> String {
        match self {
            DateSpec::Today => "today".to_string(),
            DateSpec::Yesterday => "yesterday".to_string(),
            DateSpec::LastWeek => "last week".to_string(),
            DateSpec::LastMonth => "last month".to_string(),
            DateSpec::LastYear => "last year".to_string(),
            DateSpec::Ago { amount, unit } => {
                let unit = match unit {
                    DateUnit::Days => "days",
                    DateUnit::Weeks => "weeks",
                    DateUnit::Months => "months",
                    DateUnit::Years => "years",
                };
                format!("{amount} {unit} ago")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str {
        field: String,
        op: StrOp,
        value: String,
    },
    Int {
        field: String,
        op: IntOp,
        value: i64,
    },
    Date {
        field: String,
        after: bool,
        spec: DateSpec,
    },
    Kind {
        field: String,
        label: String,
        value: u32,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn sql(&self) -> String {
        match self {
            Expr::Str { field, op, value } => {
                let escaped = value.replace('\'', "''");
                match op {
                    StrOp::Is => format!("{field} = '{escaped}'"),
                    StrOp::Includes => format!("{field} LIKE '%{escaped}%'"),
                    StrOp::StartsWith => format!("{field} LIKE '{escaped}%'"),
                    StrOp::EndsWith => format!("{field} LIKE '%{escaped}'"),
                }
            }
            Expr::Int { field, op, value } => format!("{field} {} {value}", op.sql()),
            Expr::Date { field, after, spec } => {
                let cmp = if *after { ">" } else { "<" };
                format!("{field} {cmp} {}", spec.sql())
            }
            Expr::Kind { field, value, .. } => format!("{field} = {value}"),
            Expr::Not(inner) => format!("NOT ({})", inner.sql()),
            Expr::And(a, b) => format!("({} AND {})", a.sql(), b.sql()),
            Expr::Or(a, b) => format!("({} OR {})", a.sql(), b.sql()),
        }
    }

    fn reserialize(&self) -> String {
        match self {
            Expr::Str { field, op, value } => {
                let op = match op {
                    StrOp::Is => "is",
                    StrOp::Includes => "includes",
                    StrOp::StartsWith => "starts with",
                    StrOp::EndsWith => "ends with",
                };
                format!("{field} {op} \"{value}\"")
            }
            Expr::Int { field, op, value } => format!("{field} {} {value}", op.sql()),
            Expr::Date { field, after, spec } => {
                let cmp = if *after { "after" } else { "before" };
                format!("{field} {cmp} {}", spec.reserialize())
            }
            Expr::Kind { field, label, .. } => format!("{field} is {label}"),
            Expr::Not(inner) => format!("not ({})", inner.reserialize()),
            Expr::And(a, b) => format!("({} and {})", a.reserialize(), b.reserialize()),
            Expr::Or(a, b) => format!("({} or {})", a.reserialize(), b.reserialize()),
        }
    }
}

/// A parsed smart playlist body.
#[derive(Debug, Clone, PartialEq)]
pub struct Smartpl {
    pub title: String,
    pub expr: Expr,
    pub order: Option<(String, bool)>,
    pub limit: u32,
}

impl Smartpl {
    pub fn where_clause(&self) -> String {
        self.expr.sql()
    }

    /// Aggregate criteria only arise from internal group queries, never from
    /// a playlist body, so this is always empty after a parse.
    pub fn having(&self) -> Option<String> {
        None
    }

    pub fn order_clause(&self) -> Option<String> {
        self.order
            .as_ref()
            .map(|(field, desc)| format!("{field} {}", if *desc { "DESC" } else { "ASC" }))
    }

    /// Canonical text form; parsing it again yields an equal [`Smartpl`].
    pub fn reserialize(&self) -> String {
        let mut out = format!("\"{}\" {{ {}", self.title, self.expr.reserialize());
        if let Some((field, desc)) = &self.order {
            out.push_str(&format!(
                " order by {field} {}",
                if *desc { "desc" } else { "asc" }
            ));
        }
        if self.limit > 0 {
            out.push_str(&format!(" limit {}", self.limit));
        }
        out.push_str(" }");
        out
    }
}

fn media_kind_value(label: &str) -> Option<u32> {
    Some(match label {
        "music" => 1,
        "movie" => 2,
        "podcast" => 4,
        "audiobook" => 8,
        "musicvideo" => 32,
        "tvshow" => 64,
        _ => return None,
    })
}

fn data_kind_value(label: &str) -> Option<u32> {
    Some(match label {
        "file" => 0,
        "url" => 1,
        "spotify" => 2,
        "pipe" => 3,
        _ => return None,
    })
}

peg::parser! {
grammar smartpl() for str {
    pub rule playlist() -> Smartpl
        = _ title:quoted() _ "{" _ expr:expr() order:order_by()? limit:limit()? _ "}" _ {
            Smartpl { title, expr, order, limit: limit.unwrap_or(0) }
        }

    rule expr() -> Expr = precedence! {
        a:(@) _ ("or" / "OR") _ b:@ { Expr::Or(Box::new(a), Box::new(b)) }
        --
        a:(@) _ ("and" / "AND") _ b:@ { Expr::And(Box::new(a), Box::new(b)) }
        --
        ("not" / "NOT") _ e:@ { Expr::Not(Box::new(e)) }
        --
        t:term() { t }
        "(" _ e:expr() _ ")" { e }
    }

    rule term() -> Expr
        = kind_term() / date_term() / int_term() / str_term()

    rule str_term() -> Expr
        = field:str_field() _ op:str_op() _ value:quoted() {?
            if value.is_empty() && op != StrOp::Is {
                Err("non-empty string")
            } else {
                Ok(Expr::Str { field, op, value })
            }
        }

    rule int_term() -> Expr
        = field:int_field() _ op:int_op() _ value:number() {
            Expr::Int { field, op, value }
        }

    rule date_term() -> Expr
        = field:date_field() _ after:("after" { true } / "before" { false }) _ spec:date_spec() {
            Expr::Date { field, after, spec }
        }
        / field:date_field() _ op:(">" { true } / "<" { false }) _ spec:date_spec() {
            Expr::Date { field, after: op, spec }
        }

    rule kind_term() -> Expr
        = "media_kind" _ ("is" / "=") _ label:ident() {?
            match media_kind_value(&label) {
                Some(value) => Ok(Expr::Kind { field: "media_kind".into(), label, value }),
                None => Err("media kind"),
            }
        }
        / "data_kind" _ ("is" / "=") _ label:ident() {?
            match data_kind_value(&label) {
                Some(value) => Ok(Expr::Kind { field: "data_kind".into(), label, value }),
                None => Err("data kind"),
            }
        }

    rule date_spec() -> DateSpec
        = "today" { DateSpec::Today }
        / "yesterday" { DateSpec::Yesterday }
        / "last" _ "week" { DateSpec::LastWeek }
        / "last" _ "month" { DateSpec::LastMonth }
        / "last" _ "year" { DateSpec::LastYear }
        / amount:number() _ unit:date_unit() _ "ago" {
            DateSpec::Ago { amount: amount as u32, unit }
        }

    rule date_unit() -> DateUnit
        = ("days" / "day") { DateUnit::Days }
        / ("weeks" / "week") { DateUnit::Weeks }
        / ("months" / "month") { DateUnit::Months }
        / ("years" / "year") { DateUnit::Years }

    rule str_field() -> String
        = f:ident() {? if STRING_FIELDS.contains(&f.as_str()) { Ok(f) } else { Err("string field") } }
    rule int_field() -> String
        = f:ident() {? if INT_FIELDS.contains(&f.as_str()) { Ok(f) } else { Err("integer field") } }
    rule date_field() -> String
        = f:ident() {? if DATE_FIELDS.contains(&f.as_str()) { Ok(f) } else { Err("date field") } }

    rule str_op() -> StrOp
        = "is" { StrOp::Is }
        / "includes" { StrOp::Includes }
        / "starts" _ "with" { StrOp::StartsWith }
        / "ends" _ "with" { StrOp::EndsWith }

    rule int_op() -> IntOp
        = "<=" { IntOp::Le }
        / ">=" { IntOp::Ge }
        / "<>" { IntOp::Ne }
        / "!=" { IntOp::Ne }
        / "<" { IntOp::Lt }
        / ">" { IntOp::Gt }
        / "=" { IntOp::Eq }

    rule order_by() -> (String, bool)
        = _ "order" _ "by" _ field:ident() desc:(_ d:direction() {d})? {
            (field, desc.unwrap_or(false))
        }
    rule direction() -> bool
        = "desc" { true } / "asc" { false }

    rule limit() -> u32
        = _ "limit" _ n:number() { n as u32 }

    rule ident() -> String
        = s:$(['a'..='z' | 'A'..='Z' | '_']['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*) { s.to_owned() }

    rule number() -> i64
        = n:$("-"? ['0'..='9']+) {? n.parse().or(Err("number")) }

    rule quoted() -> String
        = "\"" chars:(quoted_char()*) "\"" { chars.into_iter().collect() }
    rule quoted_char() -> char
        = "\\\"" { '"' }
        / "\\\\" { '\\' }
        / c:$([^ '"']) { c.chars().next().unwrap() }

    rule _() = quiet!{[' ' | '\t' | '\n' | '\r']*}
}
}

/// Parse a playlist body.
pub fn parse(expression: &str) -> Result<Smartpl> {
    match smartpl::playlist(expression) {
        Ok(smartpl) => {
            if smartpl.title.is_empty() {
                bail!("Smart playlist has no title");
            }
            Ok(smartpl)
        }
        Err(e) => {
            use ariadne::{Label, Report, ReportKind, Source};

            let span = e.location.offset..e.location.offset;
            Report::build(ReportKind::Error, span.clone())
                .with_message("Could not parse smart playlist")
                .with_label(Label::new(span).with_message(format!("Expected one of {}", e.expected)))
                .finish()
                .eprint(Source::from(expression))
                .ok();

            Err(e)
                .wrap_err("Could not parse smart playlist")
                .with_note(|| format!("expression was: {expression}"))
        }
    }
}

/// Parse a `.smartpl` file from disk.
pub fn parse_file(path: &camino::Utf8Path) -> Result<Smartpl> {
    let metadata = std::fs::metadata(path)
        .wrap_err("Could not open smart playlist")
        .with_note(|| format!("path: {path}"))?;
    if metadata.len() == 0 || metadata.len() > SMARTPL_SIZE_MAX as u64 {
        bail!(
            "Smart playlist '{path}' is zero bytes or too large (max size is {SMARTPL_SIZE_MAX})"
        );
    }
    let expression = std::fs::read_to_string(path)
        .wrap_err("Could not read smart playlist")
        .with_note(|| format!("path: {path}"))?;
    parse(&expression)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn basic_string_match() {
        let smartpl = parse(r#""Rock" { genre includes "rock" }"#).unwrap();
        assert_eq!(smartpl.title, "Rock");
        assert_eq!(smartpl.where_clause(), "genre LIKE '%rock%'");
        assert_eq!(smartpl.limit, 0);
        assert_eq!(smartpl.order, None);
    }

    #[test]
    fn media_kind_and_order_and_limit() {
        let smartpl = parse(
            r#""Recent Music" { media_kind is music and time_added after 2 weeks ago order by time_added desc limit 20 }"#,
        )
        .unwrap();
        assert_eq!(
            smartpl.where_clause(),
            "(media_kind = 1 AND time_added > strftime('%s', datetime('now', 'localtime', '-14 days')))"
        );
        assert_eq!(smartpl.order_clause().as_deref(), Some("time_added DESC"));
        assert_eq!(smartpl.limit, 20);
    }

    #[test]
    fn precedence_or_binds_looser_than_and() {
        let smartpl = parse(
            r#""Mix" { rating > 80 or rating > 60 and play_count > 10 }"#,
        )
        .unwrap();
        assert_eq!(
            smartpl.where_clause(),
            "(rating > 80 OR (rating > 60 AND play_count > 10))"
        );
    }

    #[test]
    fn not_and_parens() {
        let smartpl = parse(r#""No Xmas" { not (genre includes "christmas") }"#).unwrap();
        assert_eq!(
            smartpl.where_clause(),
            "NOT (genre LIKE '%christmas%')"
        );
    }

    #[test]
    fn quotes_are_escaped_in_sql() {
        let smartpl = parse(r#""Q" { artist is "O'Brien" }"#).unwrap();
        assert_eq!(smartpl.where_clause(), "artist = 'O''Brien'");
    }

    #[test]
    fn empty_includes_is_rejected() {
        assert!(parse(r#""Bad" { genre includes "" }"#).is_err());
    }

    #[test]
    fn missing_title_is_rejected() {
        assert!(parse(r#""" { genre includes "rock" }"#).is_err());
    }

    #[test]
    fn reserialize_roundtrip() {
        for body in [
            r#""Rock" { genre includes "rock" }"#,
            r#""Recent" { media_kind is music and time_added after 2 weeks ago order by time_added desc limit 20 }"#,
            r#""Mix" { rating > 80 or not (artist is "X") }"#,
            r#""Old" { date_released before last year limit 5 }"#,
        ] {
            let first = parse(body).unwrap();
            let second = parse(&first.reserialize()).unwrap();
            assert_eq!(first, second, "round trip failed for {body}");
        }
    }
}
