//! Aggregation plan: the schema compiled into typed steps. The mapping from
//! merge kind to merge function lives in one table (`MergeFn::for_column`),
//! so every local, merge and finalize step is driven by the same plan.

use crate::date::days_between;
use crate::error::{AggError, Result};
use crate::expr::Expr;
use crate::record::{Field, PostRecord};
use crate::relation::ColumnHeader;
use crate::schema::{MergeKind, Schema};
use crate::value::{Cell, ColumnType};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// How two partial values of one column combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeFn {
    Sum,
    HistogramSum,
    Min,
    Max,
    AnyValue,
}

fn value_cmp(a: &Cell, b: &Cell) -> Ordering {
    match (a, b) {
        (Cell::Text(x), Cell::Text(y)) => x.cmp(y),
        _ => a.rank_cmp(b),
    }
}

impl MergeFn {
    pub fn for_column(kind: MergeKind, ty: ColumnType) -> Option<MergeFn> {
        match (kind, ty) {
            (MergeKind::Additive, ColumnType::Histogram) => Some(MergeFn::HistogramSum),
            (MergeKind::Additive, _) => Some(MergeFn::Sum),
            (MergeKind::ExtremalMin, _) => Some(MergeFn::Min),
            (MergeKind::ExtremalMax, _) => Some(MergeFn::Max),
            (MergeKind::Representative, _) => Some(MergeFn::AnyValue),
            (MergeKind::GroupKey | MergeKind::DistinctGlobal | MergeKind::Derived, _) => None,
        }
    }

    /// Combine two partial values. Nulls are identities; any-value keeps the
    /// left witness so merges are deterministic.
    pub fn apply(self, left: Cell, right: Cell) -> Cell {
        match (self, left, right) {
            (_, Cell::Null, r) => r,
            (_, l, Cell::Null) => l,
            (MergeFn::Sum, Cell::Uint(a), Cell::Uint(b)) => Cell::Uint(a.saturating_add(b)),
            (MergeFn::Sum, Cell::Int(a), Cell::Int(b)) => Cell::Int(a.saturating_add(b)),
            (MergeFn::HistogramSum, Cell::Histogram(mut a), Cell::Histogram(b)) => {
                for (month, n) in b {
                    *a.entry(month).or_insert(0) += n;
                }
                Cell::Histogram(a)
            }
            (MergeFn::Min, l, r) => {
                if value_cmp(&r, &l) == Ordering::Less { r } else { l }
            }
            (MergeFn::Max, l, r) => {
                if value_cmp(&r, &l) == Ordering::Greater { r } else { l }
            }
            (_, l, _) => l,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KeyStep {
    pub name: String,
    pub expr: Expr,
}

impl KeyStep {
    /// Group key value for a record; `None` if the source field is absent.
    pub fn eval(&self, rec: &PostRecord) -> Option<String> {
        match &self.expr {
            Expr::Field(f) => f.get(rec).map(|v| v.into_owned()),
            Expr::Hash(f) => f.get(rec).map(|v| content_id(&v)),
            _ => None,
        }
    }
}

/// Content-derived identifier for a key value (hex SHA-256).
pub fn content_id(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[derive(Clone, Debug)]
pub struct MetricStep {
    pub name: String,
    pub ty: ColumnType,
    pub expr: Expr,
    pub merge: MergeFn,
    pub schema_index: usize,
}

#[derive(Clone, Debug)]
pub struct DistinctStep {
    pub name: String,
    pub field: Field,
    pub schema_index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivedOp {
    Difference(usize, usize),
    DaysBetween(usize, usize),
}

#[derive(Clone, Debug)]
pub struct DerivedStep {
    pub name: String,
    pub ty: ColumnType,
    pub op: DerivedOp,
    pub schema_index: usize,
}

#[derive(Clone, Debug)]
pub struct AggregationPlan {
    schema: Schema,
    pub keys: Vec<KeyStep>,
    pub metrics: Vec<MetricStep>,
    pub distinct: Vec<DistinctStep>,
    pub derived: Vec<DerivedStep>,
    rank_index: usize,
}

impl AggregationPlan {
    /// Compile a schema. `rank_by` defaults to the first unconditional
    /// additive uint column (a plain total rather than a `where` count).
    pub fn new(schema: Schema, rank_by: Option<&str>) -> Result<Self> {
        let mut keys = Vec::new();
        let mut metrics = Vec::new();
        let mut distinct = Vec::new();
        let mut derived = Vec::new();

        for (i, c) in schema.columns().iter().enumerate() {
            match c.kind {
                MergeKind::GroupKey => keys.push(KeyStep { name: c.name.clone(), expr: c.expr.clone() }),
                MergeKind::DistinctGlobal => {
                    let field = match &c.expr {
                        Expr::Distinct(f) | Expr::CountDistinct { field: f, .. } => *f,
                        other => return Err(AggError::config(format!("column `{}`: bad distinct expression {other:?}", c.name))),
                    };
                    distinct.push(DistinctStep { name: c.name.clone(), field, schema_index: i });
                }
                MergeKind::Derived => {
                    let op = match &c.expr {
                        Expr::Difference(a, b) => DerivedOp::Difference(schema.index_of(a)?, schema.index_of(b)?),
                        Expr::DaysBetween(a, b) => DerivedOp::DaysBetween(schema.index_of(a)?, schema.index_of(b)?),
                        other => return Err(AggError::config(format!("column `{}`: bad derived expression {other:?}", c.name))),
                    };
                    derived.push(DerivedStep { name: c.name.clone(), ty: c.ty, op, schema_index: i });
                }
                kind => {
                    let merge = MergeFn::for_column(kind, c.ty)
                        .ok_or_else(|| AggError::config(format!("column `{}` has no merge function", c.name)))?;
                    metrics.push(MetricStep { name: c.name.clone(), ty: c.ty, expr: c.expr.clone(), merge, schema_index: i });
                }
            }
        }

        let rank_index = match rank_by {
            Some(name) => schema.index_of(name)?,
            None => schema
                .columns()
                .iter()
                .position(|c| {
                    c.kind == MergeKind::Additive
                        && c.ty == ColumnType::Uint
                        && !matches!(c.expr, Expr::CountDistinct { when: Some(_), .. })
                })
                .ok_or_else(|| AggError::config("no ranking metric given and no additive uint column to default to"))?,
        };
        let rank_col = &schema.columns()[rank_index];
        if !rank_col.ty.is_numeric() {
            return Err(AggError::config(format!("ranking metric `{}` is not numeric ({:?})", rank_col.name, rank_col.ty)));
        }

        Ok(Self { schema, keys, metrics, distinct, derived, rank_index })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rank_index(&self) -> usize {
        self.rank_index
    }

    /// Columns carried by partial aggregates: group keys, then mergeable metrics.
    pub fn stored_header(&self) -> Vec<ColumnHeader> {
        self.schema
            .columns()
            .iter()
            .filter(|c| c.kind.is_stored())
            .map(|c| ColumnHeader { name: c.name.clone(), ty: c.ty })
            .collect()
    }

    /// Output column names in declared order.
    pub fn output_names(&self) -> Vec<&str> {
        self.schema.columns().iter().map(|c| c.name.as_str()).collect()
    }

    /// Fill derived cells of a full-width row from its finalized cells.
    pub fn compute_derived(&self, row: &mut [Cell]) {
        for d in &self.derived {
            let value = match d.op {
                DerivedOp::Difference(a, b) => match (row[a].as_i128(), row[b].as_i128()) {
                    (Some(x), Some(y)) => match d.ty {
                        ColumnType::Uint => Cell::Uint((x - y).clamp(0, u64::MAX as i128) as u64),
                        _ => Cell::Int((x - y).clamp(i64::MIN as i128, i64::MAX as i128) as i64),
                    },
                    _ => Cell::Null,
                },
                DerivedOp::DaysBetween(a, b) => match (&row[a], &row[b]) {
                    (Cell::Timestamp(x), Cell::Timestamp(y)) => Cell::Int(days_between(*x, *y)),
                    _ => Cell::Null,
                },
            };
            row[d.schema_index] = value;
        }
    }
}
