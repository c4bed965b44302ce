//! Column expressions: the small typed language columns are declared in.
//!
//! Grammar (whitespace-insensitive, case-insensitive keywords):
//!   field | hash(field) | any(field)
//!   count(*) | count(field) | count(distinct field) [where field]
//!   min(field) | max(field) | month_histogram(field) | distinct(field)
//!   a - b | days_between(a, b)            (derived columns only)

use crate::record::Field;
use crate::value::ColumnType;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Field(Field),
    Hash(Field),
    Any(Field),
    CountRows,
    CountNonNull(Field),
    CountDistinct { field: Field, when: Option<Field> },
    Min(Field),
    Max(Field),
    MonthHistogram(Field),
    Distinct(Field),
    Difference(String, String),
    DaysBetween(String, String),
}

/// Row filter applied before local aggregation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RecordFilter {
    #[default]
    All,
    DomainIs(String),
    Has(Field),
}

struct Patterns {
    call: Regex,
    count_distinct: Regex,
    difference: Regex,
    days_between: Regex,
    ident: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        call: Regex::new(r"(?i)^([a-z_]+)\s*\(\s*([a-z_*.]+)\s*\)$").expect("static regex"),
        count_distinct: Regex::new(r"(?i)^count\s*\(\s*distinct\s+([a-z_]+)\s*\)(?:\s+where\s+([a-z_]+))?$")
            .expect("static regex"),
        difference: Regex::new(r"(?i)^([a-z_][a-z0-9_]*)\s*-\s*([a-z_][a-z0-9_]*)$").expect("static regex"),
        days_between: Regex::new(r"(?i)^days_between\s*\(\s*([a-z_][a-z0-9_]*)\s*,\s*([a-z_][a-z0-9_]*)\s*\)$")
            .expect("static regex"),
        ident: Regex::new(r"(?i)^[a-z_][a-z0-9_]*$").expect("static regex"),
    })
}

fn field(name: &str) -> Result<Field, String> {
    Field::parse(name).ok_or_else(|| format!("unknown field `{name}`"))
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, String> {
        let s = src.trim();
        let p = patterns();

        if let Some(c) = p.count_distinct.captures(s) {
            let when = match c.get(2) {
                Some(m) => Some(field(m.as_str())?),
                None => None,
            };
            return Ok(Expr::CountDistinct { field: field(&c[1])?, when });
        }
        if let Some(c) = p.days_between.captures(s) {
            return Ok(Expr::DaysBetween(c[1].to_string(), c[2].to_string()));
        }
        if let Some(c) = p.call.captures(s) {
            let func = c[1].to_ascii_lowercase();
            let arg = &c[2];
            return match (func.as_str(), arg) {
                ("count", "*") => Ok(Expr::CountRows),
                ("count", a) => Ok(Expr::CountNonNull(field(a)?)),
                ("hash" | "md5", a) => Ok(Expr::Hash(field(a)?)),
                ("any" | "any_value", a) => Ok(Expr::Any(field(a)?)),
                ("min", a) => Ok(Expr::Min(field(a)?)),
                ("max", a) => Ok(Expr::Max(field(a)?)),
                ("month_histogram", a) => Ok(Expr::MonthHistogram(field(a)?)),
                ("distinct", a) => Ok(Expr::Distinct(field(a)?)),
                (other, _) => Err(format!("unknown function `{other}`")),
            };
        }
        if let Some(c) = p.difference.captures(s) {
            return Ok(Expr::Difference(c[1].to_string(), c[2].to_string()));
        }
        if p.ident.is_match(s) {
            return Ok(Expr::Field(field(s)?));
        }
        Err(format!("cannot parse expression `{src}`"))
    }

    /// Type produced by evaluating this expression, where it is fixed.
    /// `Difference` yields `None`: both `uint` and `int` are accepted.
    pub fn output_type(&self) -> Option<ColumnType> {
        let of_field = |f: &Field| if *f == Field::EventTime { ColumnType::Timestamp } else { ColumnType::Text };
        match self {
            Expr::Field(f) | Expr::Any(f) | Expr::Min(f) | Expr::Max(f) => Some(of_field(f)),
            Expr::Hash(_) => Some(ColumnType::Text),
            Expr::CountRows | Expr::CountNonNull(_) | Expr::CountDistinct { .. } | Expr::Distinct(_) => {
                Some(ColumnType::Uint)
            }
            Expr::MonthHistogram(_) => Some(ColumnType::Histogram),
            Expr::DaysBetween(..) => Some(ColumnType::Int),
            Expr::Difference(..) => None,
        }
    }

    /// Names of other columns this expression reads (derived expressions only).
    pub fn column_refs(&self) -> Vec<&str> {
        match self {
            Expr::Difference(a, b) | Expr::DaysBetween(a, b) => vec![a.as_str(), b.as_str()],
            _ => Vec::new(),
        }
    }
}

impl RecordFilter {
    pub fn parse(src: &str) -> Result<RecordFilter, String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"(?i)^(domain_is|has)\s*\(\s*([^)\s]+)\s*\)$").expect("static regex"));
        let s = src.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(RecordFilter::All);
        }
        let c = re.captures(s).ok_or_else(|| format!("cannot parse filter `{src}`"))?;
        match c[1].to_ascii_lowercase().as_str() {
            "domain_is" => Ok(RecordFilter::DomainIs(c[2].to_ascii_lowercase())),
            _ => Ok(RecordFilter::Has(field(&c[2])?)),
        }
    }

    pub fn accepts(&self, rec: &crate::record::PostRecord) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::DomainIs(d) => rec.domain == *d,
            RecordFilter::Has(f) => f.get(rec).is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_calls() {
        assert_eq!(Expr::parse("count(*)"), Ok(Expr::CountRows));
        assert_eq!(Expr::parse("COUNT(DISTINCT tweet_id)"), Ok(Expr::CountDistinct { field: Field::PostId, when: None }));
        assert_eq!(
            Expr::parse("count(distinct post_id) where reposted_id"),
            Ok(Expr::CountDistinct { field: Field::PostId, when: Some(Field::RepostedId) })
        );
        assert_eq!(Expr::parse("md5(domain_name)"), Ok(Expr::Hash(Field::Domain)));
        assert_eq!(Expr::parse("min(local_time)"), Ok(Expr::Min(Field::EventTime)));
        assert_eq!(Expr::parse("normalized_url"), Ok(Expr::Field(Field::NormalizedUrl)));
    }

    #[test]
    fn parses_derived_forms() {
        assert_eq!(Expr::parse("sum_all - nb_retweets"), Ok(Expr::Difference("sum_all".into(), "nb_retweets".into())));
        assert_eq!(
            Expr::parse("days_between(earliest, latest)"),
            Ok(Expr::DaysBetween("earliest".into(), "latest".into()))
        );
    }

    #[test]
    fn rejects_unknown_things() {
        assert!(Expr::parse("median(post_id)").is_err());
        assert!(Expr::parse("count(distinct nonsense)").is_err());
        assert!(Expr::parse("1 + 2").is_err());
    }

    #[test]
    fn parses_filters() {
        assert_eq!(RecordFilter::parse("domain_is(YouTube.com)"), Ok(RecordFilter::DomainIs("youtube.com".into())));
        assert_eq!(RecordFilter::parse("has(channel_id)"), Ok(RecordFilter::Has(Field::ChannelId)));
        assert_eq!(RecordFilter::parse(""), Ok(RecordFilter::All));
    }
}
