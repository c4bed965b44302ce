//! Column schema registry: declares every output column, its data type and
//! how it behaves when two partial aggregates are merged.

use crate::error::{AggError, Result};
use crate::expr::{Expr, RecordFilter};
use crate::value::ColumnType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Merge semantics of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Part of the GROUP BY at every step; never merged as a value.
    GroupKey,
    /// Summed on merge (entry-wise for histograms).
    Additive,
    /// Functionally constant per key; any witness is correct.
    Representative,
    ExtremalMin,
    ExtremalMax,
    /// Distinct count across all partitions, resolved by a global pass after
    /// the merge tree terminates. Never stored in partial aggregates.
    DistinctGlobal,
    /// Computed once from finalized columns. Never merged.
    Derived,
}

impl MergeKind {
    /// Whether partial aggregates carry this column.
    pub fn is_stored(self) -> bool {
        !matches!(self, MergeKind::DistinctGlobal | MergeKind::Derived)
    }
}

/// Configuration surface for one column, as read from a schema file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MergeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<ColumnType>,
    pub sql_or_expression: String,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: MergeKind, expr: &str) -> Self {
        Self { name: name.to_string(), kind, data_type: None, sql_or_expression: expr.to_string() }
    }

    pub fn typed(mut self, ty: ColumnType) -> Self {
        self.data_type = Some(ty);
        self
    }
}

/// Whole-schema configuration surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub name: String,
    #[serde(default)]
    pub filter: Option<String>,
    pub columns: Vec<ColumnSpec>,
}

/// A validated column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: MergeKind,
    pub ty: ColumnType,
    pub expr: Expr,
}

/// A validated schema. Construction fails fast on any inconsistency, before
/// a single record is read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    filter: RecordFilter,
    columns: Vec<ColumnDef>,
}

fn check_expr(kind: MergeKind, expr: &Expr) -> std::result::Result<(), String> {
    use Expr::*;
    let ok = match kind {
        MergeKind::GroupKey => matches!(expr, Field(_) | Hash(_)),
        MergeKind::Representative => matches!(expr, Field(_) | Any(_)),
        MergeKind::Additive => matches!(expr, CountRows | CountNonNull(_) | CountDistinct { .. } | MonthHistogram(_)),
        MergeKind::ExtremalMin => matches!(expr, Min(_)),
        MergeKind::ExtremalMax => matches!(expr, Max(_)),
        MergeKind::DistinctGlobal => matches!(expr, Distinct(_) | CountDistinct { when: None, .. }),
        MergeKind::Derived => matches!(expr, Difference(..) | DaysBetween(..)),
    };
    if !ok {
        return Err(format!("expression {expr:?} is not valid for a {kind:?} column"));
    }
    // Summing per-partition distinct counts is only exact when a value can
    // never appear in two partitions.
    if kind == MergeKind::Additive {
        if let CountDistinct { field, .. } | MonthHistogram(field) = expr {
            if !field.is_partition_aligned() {
                return Err(format!(
                    "additive distinct count over `{}` would over-count values seen in several partitions; \
                     declare it distinct_global instead",
                    field.name()
                ));
            }
        }
    }
    Ok(())
}

impl Schema {
    pub fn from_config(cfg: &SchemaConfig) -> Result<Schema> {
        let filter = match cfg.filter.as_deref() {
            Some(f) => RecordFilter::parse(f).map_err(AggError::config)?,
            None => RecordFilter::All,
        };
        let mut columns = Vec::with_capacity(cfg.columns.len());
        for spec in &cfg.columns {
            let expr = Expr::parse(&spec.sql_or_expression)
                .map_err(|e| AggError::config(format!("column `{}`: {e}", spec.name)))?;
            check_expr(spec.kind, &expr).map_err(|e| AggError::config(format!("column `{}`: {e}", spec.name)))?;
            let ty = match (spec.data_type, expr.output_type()) {
                (Some(declared), Some(produced)) if declared != produced => {
                    return Err(AggError::config(format!(
                        "column `{}` declared {declared:?} but its expression produces {produced:?}",
                        spec.name
                    )))
                }
                (Some(declared), _) => declared,
                (None, Some(produced)) => produced,
                (None, None) => ColumnType::Int,
            };
            columns.push(ColumnDef { name: spec.name.clone(), kind: spec.kind, ty, expr });
        }
        let schema = Schema { name: cfg.name.clone(), filter, columns };
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json_file(path: &Path) -> Result<Schema> {
        let f = File::open(path)?;
        let cfg: SchemaConfig = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| AggError::config(format!("schema file {}: {e}", path.display())))?;
        Schema::from_config(&cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(AggError::config(format!("schema `{}` declares no columns", self.name)));
        }
        let mut seen = HashSet::new();
        for c in &self.columns {
            if !seen.insert(c.name.as_str()) {
                return Err(AggError::config(format!("column `{}` declared twice", c.name)));
            }
        }

        // Group keys first, derived last.
        let n_keys = self.columns.iter().take_while(|c| c.kind == MergeKind::GroupKey).count();
        if n_keys == 0 {
            return Err(AggError::config(format!("schema `{}` has no leading group_key column", self.name)));
        }
        let n_derived = self.columns.iter().rev().take_while(|c| c.kind == MergeKind::Derived).count();
        for c in &self.columns[n_keys..self.columns.len() - n_derived] {
            if matches!(c.kind, MergeKind::GroupKey | MergeKind::Derived) {
                return Err(AggError::config(format!(
                    "column `{}`: group keys must come first and derived columns last",
                    c.name
                )));
            }
        }

        for c in self.columns.iter().filter(|c| c.kind == MergeKind::Derived) {
            if !matches!(c.ty, ColumnType::Uint | ColumnType::Int) {
                return Err(AggError::config(format!("derived column `{}` must be uint or int", c.name)));
            }
            for r in c.expr.column_refs() {
                let src = self.column(r)?;
                if src.kind == MergeKind::Derived {
                    return Err(AggError::config(format!("derived column `{}` reads derived column `{r}`", c.name)));
                }
                let wanted = match c.expr {
                    Expr::DaysBetween(..) => src.ty == ColumnType::Timestamp,
                    _ => matches!(src.ty, ColumnType::Uint | ColumnType::Int),
                };
                if !wanted {
                    return Err(AggError::config(format!(
                        "derived column `{}` cannot use `{r}` of type {:?}",
                        c.name, src.ty
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| AggError::config(format!("column `{name}` is not declared in schema `{}`", self.name)))
    }

    /// Look up a declared column. Undeclared names are a configuration error.
    pub fn column(&self, name: &str) -> Result<&ColumnDef> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn merge_kind(&self, name: &str) -> Result<MergeKind> {
        self.column(name).map(|c| c.kind)
    }

    pub fn builtin(name: &str) -> Result<Schema> {
        match name {
            "domains" => Schema::domains(),
            "youtube_links" => Schema::youtube_links(),
            "youtube_channels" => Schema::youtube_channels(),
            other => Err(AggError::config(format!(
                "unknown built-in schema `{other}` (expected domains, youtube_links or youtube_channels)"
            ))),
        }
    }

    /// Per-domain engagement.
    pub fn domains() -> Result<Schema> {
        use MergeKind::*;
        Schema::from_config(&SchemaConfig {
            name: "domains".into(),
            filter: None,
            columns: vec![
                ColumnSpec::new("domain_id", GroupKey, "hash(domain)"),
                ColumnSpec::new("domain_name", Representative, "any(domain)"),
                ColumnSpec::new("nb_distinct_links_from_domain", DistinctGlobal, "distinct(normalized_url)"),
                ColumnSpec::new("nb_collected_retweets_with_domain", Additive, "count(distinct post_id) where reposted_id"),
                ColumnSpec::new("sum_all_tweets_with_domain", Additive, "count(distinct post_id)"),
                ColumnSpec::new("nb_accounts_that_shared_domain_link", DistinctGlobal, "distinct(user_id)"),
                ColumnSpec::new("earliest_tweet", ExtremalMin, "min(event_time)"),
                ColumnSpec::new("latest_tweet", ExtremalMax, "max(event_time)"),
                ColumnSpec::new("histogram_of_tweets_per_month", Additive, "month_histogram(post_id)"),
                ColumnSpec::new(
                    "nb_collected_original_tweets",
                    Derived,
                    "sum_all_tweets_with_domain - nb_collected_retweets_with_domain",
                )
                .typed(ColumnType::Uint),
                ColumnSpec::new("days_between_first_and_last_tweet", Derived, "days_between(earliest_tweet, latest_tweet)"),
            ],
        })
    }

    /// Per normalized YouTube URL.
    pub fn youtube_links() -> Result<Schema> {
        use MergeKind::*;
        Schema::from_config(&SchemaConfig {
            name: "youtube_links".into(),
            filter: Some("domain_is(youtube.com)".into()),
            columns: vec![
                ColumnSpec::new("normalized_url", GroupKey, "normalized_url"),
                ColumnSpec::new("link_for_scraping", Representative, "any(link)"),
                ColumnSpec::new("nb_collected_retweets_with_link", Additive, "count(distinct post_id) where reposted_id"),
                ColumnSpec::new("sum_all_tweets_with_link", Additive, "count(distinct post_id)"),
                ColumnSpec::new("nb_accounts_that_shared_link", DistinctGlobal, "distinct(user_id)"),
                ColumnSpec::new("earliest_tweet", ExtremalMin, "min(event_time)"),
                ColumnSpec::new("latest_tweet", ExtremalMax, "max(event_time)"),
                ColumnSpec::new("histogram_of_tweets_per_month", Additive, "month_histogram(post_id)"),
                ColumnSpec::new(
                    "nb_collected_original_tweets",
                    Derived,
                    "sum_all_tweets_with_link - nb_collected_retweets_with_link",
                )
                .typed(ColumnType::Uint),
            ],
        })
    }

    /// Per YouTube channel id.
    pub fn youtube_channels() -> Result<Schema> {
        use MergeKind::*;
        Schema::from_config(&SchemaConfig {
            name: "youtube_channels".into(),
            filter: Some("has(channel_id)".into()),
            columns: vec![
                ColumnSpec::new("channel_id", GroupKey, "channel_id"),
                ColumnSpec::new("nb_distinct_links", DistinctGlobal, "distinct(normalized_url)"),
                ColumnSpec::new("nb_collected_retweets_with_channel", Additive, "count(distinct post_id) where reposted_id"),
                ColumnSpec::new("sum_all_tweets_with_channel", Additive, "count(distinct post_id)"),
                ColumnSpec::new("nb_accounts_that_shared_channel", DistinctGlobal, "distinct(user_id)"),
                ColumnSpec::new("earliest_tweet", ExtremalMin, "min(event_time)"),
                ColumnSpec::new("latest_tweet", ExtremalMax, "max(event_time)"),
                ColumnSpec::new(
                    "nb_collected_original_tweets",
                    Derived,
                    "sum_all_tweets_with_channel - nb_collected_retweets_with_channel",
                )
                .typed(ColumnType::Uint),
            ],
        })
    }
}
