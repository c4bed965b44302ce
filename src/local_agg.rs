//! Local Aggregator: one partition in, one sorted partial aggregate out.

use crate::date::YearMonth;
use crate::distinct::DistinctSpill;
use crate::error::{AggError, Result};
use crate::expr::Expr;
use crate::ndjson::NdjsonReader;
use crate::partition::PartitionFile;
use crate::plan::{AggregationPlan, MetricStep};
use crate::record::{Field, PostRecord};
use crate::relation::{AggRow, Coverage, Relation, RelationHeader, RelationRegistry, RelationWriter};
use crate::util::remove_with_backoff;
use crate::value::Cell;
use ahash::AHashSet;
use std::collections::BTreeMap;

/// Per-group running state of one stored metric.
#[derive(Debug)]
enum MetricAcc {
    Count(u64),
    Distinct { seen: AHashSet<String>, when: Option<Field> },
    Histogram { seen: AHashSet<String>, months: BTreeMap<YearMonth, u64> },
    Fold(Cell),
}

fn field_cell(field: Field, rec: &PostRecord) -> Cell {
    match field {
        Field::EventTime => Cell::Timestamp(rec.event_time),
        f => f.get(rec).map(|v| Cell::Text(v.into_owned())).unwrap_or(Cell::Null),
    }
}

impl MetricAcc {
    fn new(step: &MetricStep) -> Self {
        match &step.expr {
            Expr::CountRows | Expr::CountNonNull(_) => MetricAcc::Count(0),
            Expr::CountDistinct { when, .. } => MetricAcc::Distinct { seen: AHashSet::new(), when: *when },
            Expr::MonthHistogram(_) => MetricAcc::Histogram { seen: AHashSet::new(), months: BTreeMap::new() },
            _ => MetricAcc::Fold(Cell::Null),
        }
    }

    fn update(&mut self, step: &MetricStep, rec: &PostRecord) {
        match (self, &step.expr) {
            (MetricAcc::Count(n), Expr::CountRows) => *n += 1,
            (MetricAcc::Count(n), Expr::CountNonNull(f)) => {
                if f.get(rec).is_some() {
                    *n += 1;
                }
            }
            (MetricAcc::Distinct { seen, when }, Expr::CountDistinct { field, .. }) => {
                if when.map_or(true, |w| w.get(rec).is_some()) {
                    if let Some(v) = field.get(rec) {
                        if !seen.contains(v.as_ref()) {
                            seen.insert(v.into_owned());
                        }
                    }
                }
            }
            (MetricAcc::Histogram { seen, months }, Expr::MonthHistogram(field)) => {
                if let (Some(v), Some(month)) = (field.get(rec), YearMonth::from_epoch(rec.event_time)) {
                    if seen.insert(v.into_owned()) {
                        *months.entry(month).or_insert(0) += 1;
                    }
                }
            }
            (MetricAcc::Fold(acc), Expr::Field(f) | Expr::Any(f) | Expr::Min(f) | Expr::Max(f)) => {
                let cell = field_cell(*f, rec);
                let cur = std::mem::replace(acc, Cell::Null);
                *acc = step.merge.apply(cur, cell);
            }
            _ => {}
        }
    }

    fn finish(self) -> Cell {
        match self {
            MetricAcc::Count(n) => Cell::Uint(n),
            MetricAcc::Distinct { seen, .. } => Cell::Uint(seen.len() as u64),
            MetricAcc::Histogram { months, .. } => Cell::Histogram(months),
            MetricAcc::Fold(c) => c,
        }
    }
}

struct GroupAcc {
    metrics: Vec<MetricAcc>,
    distinct: Vec<AHashSet<String>>,
}

/// A written partial aggregate plus the records it had to skip.
#[derive(Clone, Debug)]
pub struct LocalAggregate {
    pub relation: Relation,
    /// Records that passed the filter but lacked a group key value.
    pub keyless: u64,
}

/// Aggregates partitions according to a plan.
pub struct LocalAggregator<'a> {
    plan: &'a AggregationPlan,
    read_buf: usize,
    write_buf: usize,
}

impl<'a> LocalAggregator<'a> {
    pub fn new(plan: &'a AggregationPlan, read_buf: usize, write_buf: usize) -> Self {
        Self { plan, read_buf, write_buf }
    }

    /// Aggregate one partition into a relation registered in `registry`.
    /// Distinct-global values go to `spill`. The partition file is removed
    /// once its aggregate is written.
    pub fn aggregate(&self, part: &PartitionFile, registry: &RelationRegistry, spill: &DistinctSpill) -> Result<LocalAggregate> {
        let plan = self.plan;
        let filter = plan.schema().filter();
        let mut groups: BTreeMap<Vec<String>, GroupAcc> = BTreeMap::new();
        let mut keyless = 0u64;

        let mut rdr = NdjsonReader::open(&part.path, self.read_buf)?;
        loop {
            let rec: PostRecord = match rdr.next_json() {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => return Err(AggError::Relation { path: part.path.clone(), message: e.to_string() }),
            };
            if !filter.accepts(&rec) {
                continue;
            }
            let Some(key) = plan.keys.iter().map(|k| k.eval(&rec)).collect::<Option<Vec<String>>>() else {
                keyless += 1;
                continue;
            };
            let g = groups.entry(key).or_insert_with(|| GroupAcc {
                metrics: plan.metrics.iter().map(MetricAcc::new).collect(),
                distinct: vec![AHashSet::new(); plan.distinct.len()],
            });
            for (acc, step) in g.metrics.iter_mut().zip(&plan.metrics) {
                acc.update(step, &rec);
            }
            for (set, step) in g.distinct.iter_mut().zip(&plan.distinct) {
                if let Some(v) = step.field.get(&rec) {
                    if !set.contains(v.as_ref()) {
                        set.insert(v.into_owned());
                    }
                }
            }
        }

        let covers = Coverage::from([part.bucket]);
        let name = registry.name_for(&covers);
        let header = RelationHeader::new(plan.keys.len(), plan.stored_header(), covers);
        let mut w = RelationWriter::create(registry.dir(), &name, header, self.write_buf)?;
        for (key, g) in groups {
            for (j, values) in g.distinct.iter().enumerate() {
                if !values.is_empty() {
                    spill.write_values(j, &key, values)?;
                }
            }
            let cells = g.metrics.into_iter().map(MetricAcc::finish).collect();
            w.push(&AggRow { key, cells })?;
        }
        let rel = w.finish()?;
        remove_with_backoff(&part.path)?;

        if keyless > 0 {
            tracing::warn!(partition = %part.bucket, keyless, "records without a group key skipped");
        }
        tracing::debug!(partition = %part.bucket, groups = rel.rows, "local aggregate written");
        registry.register(rel.clone())?;
        Ok(LocalAggregate { relation: rel, keyless })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationReader;
    use crate::schema::Schema;
    use crate::ndjson::NdjsonWriter;
    use std::path::Path;

    fn rec(id: &str, ts: i64, user: &str, rt: Option<&str>, domain: &str) -> PostRecord {
        PostRecord {
            post_id: id.into(),
            event_time: ts,
            user_id: Some(user.into()),
            reposted_id: rt.map(Into::into),
            link: format!("https://{domain}/{id}"),
            normalized_url: format!("{domain}/{id}"),
            domain: domain.into(),
            channel_id: None,
        }
    }

    fn write_partition(dir: &Path, bucket: YearMonth, recs: &[PostRecord]) -> PartitionFile {
        let path = dir.join(format!("t_part_{bucket}.ndjson"));
        let mut w = NdjsonWriter::create(&path, 0).unwrap();
        for r in recs {
            w.write_json(r).unwrap();
        }
        w.finish().unwrap();
        PartitionFile { bucket, path, records: recs.len() as u64 }
    }

    #[test]
    fn aggregates_domains_partition() {
        let dir = tempfile::tempdir().unwrap();
        let plan = AggregationPlan::new(Schema::domains().unwrap(), None).unwrap();
        let ym = YearMonth::new(2021, 7);
        // 2021-07-01 00:00:00 UTC and a day later
        let part = write_partition(
            dir.path(),
            ym,
            &[
                rec("1", 1_625_097_600, "u1", None, "a.com"),
                rec("2", 1_625_184_000, "u1", Some("1"), "a.com"),
                rec("3", 1_625_184_000, "u2", None, "b.com"),
            ],
        );
        let registry = RelationRegistry::new(dir.path(), "t");
        let spill = DistinctSpill::create(dir.path(), "t", 2, 0, 0).unwrap();
        let out = LocalAggregator::new(&plan, 0, 0).aggregate(&part, &registry, &spill).unwrap();
        assert_eq!(out.keyless, 0);
        let rel = out.relation;

        assert!(!part.path.exists());
        assert_eq!(rel.name, "t_agg_2021-07");
        assert_eq!(rel.rows, 2);
        assert_eq!(registry.len(), 1);

        let mut r = RelationReader::open(&rel.path, 0).unwrap();
        let names: Vec<_> = r.header().columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names[0], "domain_id");
        let mut rows = Vec::new();
        while let Some(row) = r.next_row().unwrap() {
            rows.push(row);
        }
        let a = rows.iter().find(|r| r.cells[0] == Cell::Text("a.com".into())).unwrap();
        // domain_name, retweets, sum_all, earliest, latest, histogram
        assert_eq!(a.cells[1], Cell::Uint(1));
        assert_eq!(a.cells[2], Cell::Uint(2));
        assert_eq!(a.cells[3], Cell::Timestamp(1_625_097_600));
        assert_eq!(a.cells[4], Cell::Timestamp(1_625_184_000));
        assert_eq!(a.cells[5].render(), "2021-07:2");

        let counts = spill.resolve(1).unwrap();
        let a_key = a.key.clone();
        // distinct column 1 is nb_accounts_that_shared_domain_link
        assert_eq!(counts.get(1, &a_key), 1);
        assert_eq!(counts.get(0, &a_key), 2);
    }

    #[test]
    fn records_without_a_key_are_counted() {
        use crate::schema::{ColumnSpec, MergeKind, SchemaConfig};
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::from_config(&SchemaConfig {
            name: "users".into(),
            filter: None,
            columns: vec![
                ColumnSpec::new("user", MergeKind::GroupKey, "user_id"),
                ColumnSpec::new("total", MergeKind::Additive, "count(*)"),
            ],
        })
        .unwrap();
        let plan = AggregationPlan::new(schema, None).unwrap();
        let mut anon = rec("2", 1_625_097_600, "x", None, "a.com");
        anon.user_id = None;
        let part = write_partition(
            dir.path(),
            YearMonth::new(2021, 7),
            &[rec("1", 1_625_097_600, "u1", None, "a.com"), anon.clone(), PostRecord { post_id: "3".into(), ..anon }],
        );
        let registry = RelationRegistry::new(dir.path(), "t");
        let spill = DistinctSpill::create(dir.path(), "t", 1, 0, 0).unwrap();
        let out = LocalAggregator::new(&plan, 0, 0).aggregate(&part, &registry, &spill).unwrap();
        assert_eq!(out.keyless, 2);
        assert_eq!(out.relation.rows, 1);
    }
}
