//! Merge-Reduce Tree: pairwise merges of partial aggregates, one round at a
//! time, until exactly one relation remains.
//!
//! Pairing is positional: adjacent pairs from the front of the live list, the
//! last relation carried when the count is odd. Merged relations come first
//! in the next round's list, in pair order, followed by the carry. With N
//! initial relations the tree terminates after exactly ceil(log2 N) rounds.

use crate::concurrency::map_limited;
use crate::error::{AggError, Result};
use crate::plan::AggregationPlan;
use crate::progress::ProgressScope;
use crate::relation::{AggRow, Relation, RelationHeader, RelationReader, RelationRegistry, RelationWriter};
use serde::Serialize;
use std::cmp::Ordering;

/// Split `items` into adjacent pairs plus the odd one out (always the last).
pub fn pair_up<T>(items: Vec<T>) -> (Vec<(T, T)>, Option<T>) {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    loop {
        match (it.next(), it.next()) {
            (Some(a), Some(b)) => pairs.push((a, b)),
            (Some(a), None) => return (pairs, Some(a)),
            _ => return (pairs, None),
        }
    }
}

/// ceil(log2 n); zero for n <= 1.
pub fn expected_rounds(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// What one round did, by relation name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub round: usize,
    /// (left, right, merged)
    pub merges: Vec<(String, String, String)>,
    pub carry: Option<String>,
    pub live_after: usize,
}

pub struct MergeTree<'a> {
    plan: &'a AggregationPlan,
    registry: &'a RelationRegistry,
    concurrency: usize,
    read_buf: usize,
    write_buf: usize,
    progress: bool,
}

impl<'a> MergeTree<'a> {
    pub fn new(plan: &'a AggregationPlan, registry: &'a RelationRegistry) -> Self {
        Self { plan, registry, concurrency: 1, read_buf: 64 * 1024, write_buf: 64 * 1024, progress: false }
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn io_buffers(mut self, read: usize, write: usize) -> Self {
        self.read_buf = read;
        self.write_buf = write;
        self
    }

    pub fn progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    /// Reduce `initial` (in order) to one relation. Fails with a termination
    /// error if anything other than one relation is live after the expected
    /// number of rounds.
    pub fn run(&self, initial: Vec<Relation>) -> Result<(Relation, Vec<RoundReport>)> {
        let n = initial.len();
        if n == 0 {
            return Err(AggError::Termination { round: 0, live: 0 });
        }
        let rounds = expected_rounds(n);
        tracing::info!(relations = n, rounds, "merge-reduce start");

        let mut live = initial;
        let mut reports = Vec::with_capacity(rounds);
        for r in 1..=rounds {
            let (next, report) = self.round(r, live)?;
            live = next;
            reports.push(report);
        }

        if live.len() != 1 || self.registry.len() != 1 {
            return Err(AggError::Termination { round: rounds, live: live.len().max(self.registry.len()) });
        }
        let terminal = live.remove(0);
        tracing::info!(relation = %terminal.name, rows = terminal.rows, "merge-reduce done");
        Ok((terminal, reports))
    }

    /// One round: merge every adjacent pair (concurrently, up to the
    /// configured limit) and carry the odd one out. Returns only after all
    /// merges of the round have completed.
    pub fn round(&self, round: usize, live: Vec<Relation>) -> Result<(Vec<Relation>, RoundReport)> {
        let (pairs, carry) = pair_up(live);
        let pb = ProgressScope::count(format!("merge round {round}"), pairs.len() as u64, self.progress);
        let merged = map_limited(pairs, self.concurrency, |(left, right)| {
            let out = self.merge_pair(&left, &right)?;
            pb.inc(1);
            Ok((left.name, right.name, out))
        })?;

        let mut next = Vec::with_capacity(merged.len() + 1);
        let mut merges = Vec::with_capacity(merged.len());
        for (l, r, rel) in merged {
            merges.push((l, r, rel.name.clone()));
            next.push(rel);
        }
        let carry_name = carry.as_ref().map(|c| c.name.clone());
        next.extend(carry);

        pb.finish(format!("round {round}: {} live", next.len()));
        tracing::info!(round, merges = merges.len(), carry = ?carry_name, live = next.len(), "merge round done");
        let report = RoundReport { round, merges, carry: carry_name, live_after: next.len() };
        Ok((next, report))
    }

    fn check_schemas(&self, left: &Relation, right: &Relation) -> Result<RelationHeader> {
        if let Some(detail) = left.header.column_mismatch(&right.header) {
            return Err(AggError::SchemaMismatch { left: left.name.clone(), right: right.name.clone(), detail });
        }
        let expected = RelationHeader::new(self.plan.keys.len(), self.plan.stored_header(), Default::default());
        if let Some(detail) = left.header.column_mismatch(&expected) {
            return Err(AggError::SchemaMismatch {
                left: left.name.clone(),
                right: format!("schema `{}`", self.plan.schema().name()),
                detail,
            });
        }
        if let Some(ym) = left.header.covers.intersection(&right.header.covers).next() {
            return Err(AggError::SchemaMismatch {
                left: left.name.clone(),
                right: right.name.clone(),
                detail: format!("both cover partition {ym}"),
            });
        }
        let covers = left.header.covers.union(&right.header.covers).copied().collect();
        Ok(RelationHeader::new(left.header.keys, left.header.columns.clone(), covers))
    }

    /// Concatenate two relations and re-aggregate by group key. Both inputs
    /// are sorted by key, so this is a streaming two-way merge. The merged
    /// relation is registered and both inputs are discarded.
    pub fn merge_pair(&self, left: &Relation, right: &Relation) -> Result<Relation> {
        let header = self.check_schemas(left, right)?;
        let merge_fns: Vec<_> = self.plan.metrics.iter().map(|m| m.merge).collect();

        let mut lr = RelationReader::open(&left.path, self.read_buf)?;
        let mut rr = RelationReader::open(&right.path, self.read_buf)?;
        for (rel, rdr) in [(left, &lr), (right, &rr)] {
            if rdr.header() != &rel.header {
                return Err(AggError::Relation {
                    path: rel.path.clone(),
                    message: "header on disk differs from the registered relation".into(),
                });
            }
        }

        let name = self.registry.name_for(&header.covers);
        let mut w = RelationWriter::create(self.registry.dir(), &name, header, self.write_buf)?;
        let mut a = lr.next_row()?;
        let mut b = rr.next_row()?;
        loop {
            let ord = match (&a, &b) {
                (Some(x), Some(y)) => x.key.cmp(&y.key),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            match ord {
                Ordering::Less => {
                    if let Some(row) = a.take() {
                        w.push(&row)?;
                    }
                    a = lr.next_row()?;
                }
                Ordering::Greater => {
                    if let Some(row) = b.take() {
                        w.push(&row)?;
                    }
                    b = rr.next_row()?;
                }
                Ordering::Equal => {
                    if let (Some(x), Some(y)) = (a.take(), b.take()) {
                        let cells = x
                            .cells
                            .into_iter()
                            .zip(y.cells)
                            .zip(&merge_fns)
                            .map(|((l, r), f)| f.apply(l, r))
                            .collect();
                        w.push(&AggRow { key: x.key, cells })?;
                    }
                    a = lr.next_row()?;
                    b = rr.next_row()?;
                }
            }
        }
        drop((lr, rr));
        let merged = w.finish()?;

        self.registry.register(merged.clone())?;
        self.registry.discard(&left.name)?;
        self.registry.discard(&right.name)?;
        tracing::debug!(left = %left.name, right = %right.name, merged = %merged.name, rows = merged.rows, "merged pair");
        Ok(merged)
    }
}
