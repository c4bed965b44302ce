//! Finalizer: terminal relation to ranked CSV.
//!
//! Order of operations: fill distinct-global columns, compute derived columns,
//! rank (descending by the ranking metric, ties by ascending key), optionally
//! enrich, then write the CSV through an in-progress file that is only
//! promoted once fully written.

use crate::distinct::DistinctCounts;
use crate::enrich::{enrich_keys, MetadataLookup, DEFAULT_BATCH};
use crate::error::{AggError, Result};
use crate::plan::AggregationPlan;
use crate::relation::{RelationHeader, RelationReader, RelationRegistry};
use crate::util::{create_with_backoff, remove_with_backoff, replace_file_atomic_backoff, tmp_path_for};
use crate::value::Cell;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub rows: u64,
    pub lookup_failures: u64,
}

/// One output row: group key plus every declared column in schema order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalRow {
    pub key: Vec<String>,
    pub cells: Vec<Cell>,
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
pub fn csv_field(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", s.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(s)
    }
}

fn write_csv_line<W: Write>(w: &mut W, fields: impl IntoIterator<Item = String>) -> std::io::Result<()> {
    let mut first = true;
    for f in fields {
        if !first {
            w.write_all(b",")?;
        }
        first = false;
        w.write_all(csv_field(&f).as_bytes())?;
    }
    w.write_all(b"\n")
}

pub struct Finalizer<'a> {
    plan: &'a AggregationPlan,
    lookup: Option<&'a dyn MetadataLookup>,
    read_buf: usize,
    write_buf: usize,
}

impl<'a> Finalizer<'a> {
    pub fn new(plan: &'a AggregationPlan) -> Self {
        Self { plan, lookup: None, read_buf: 64 * 1024, write_buf: 64 * 1024 }
    }

    pub fn with_lookup(mut self, lookup: &'a dyn MetadataLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn io_buffers(mut self, read: usize, write: usize) -> Self {
        self.read_buf = read;
        self.write_buf = write;
        self
    }

    /// Read the terminal relation and produce ranked, fully computed rows.
    pub fn final_rows(&self, registry: &RelationRegistry, distinct: &DistinctCounts) -> Result<Vec<FinalRow>> {
        let plan = self.plan;
        let terminal = registry.terminal()?;
        let expected = RelationHeader::new(plan.keys.len(), plan.stored_header(), Default::default());
        if let Some(detail) = terminal.header.column_mismatch(&expected) {
            return Err(AggError::SchemaMismatch {
                left: terminal.name.clone(),
                right: format!("schema `{}`", plan.schema().name()),
                detail,
            });
        }

        let width = plan.schema().columns().len();
        let mut rows = Vec::with_capacity(terminal.rows as usize);
        let mut rdr = RelationReader::open(&terminal.path, self.read_buf)?;
        while let Some(row) = rdr.next_row()? {
            let mut cells = vec![Cell::Null; width];
            for (i, k) in row.key.iter().enumerate() {
                cells[i] = Cell::Text(k.clone());
            }
            for (cell, m) in row.cells.into_iter().zip(&plan.metrics) {
                cells[m.schema_index] = cell;
            }
            for (j, d) in plan.distinct.iter().enumerate() {
                cells[d.schema_index] = Cell::Uint(distinct.get(j, &row.key));
            }
            plan.compute_derived(&mut cells);
            rows.push(FinalRow { key: row.key, cells });
        }

        let rank = plan.rank_index();
        rows.sort_by(|a, b| b.cells[rank].rank_cmp(&a.cells[rank]).then_with(|| a.key.cmp(&b.key)));
        Ok(rows)
    }

    /// Write the final CSV to `output`. Nothing is left at `output` unless
    /// every row was written.
    pub fn finalize(&self, registry: &RelationRegistry, distinct: &DistinctCounts, output: &Path) -> Result<FinalizeReport> {
        let rows = self.final_rows(registry, distinct)?;
        let keys: Vec<Vec<String>> = match self.lookup {
            Some(_) => rows.iter().map(|r| r.key.clone()).collect(),
            None => Vec::new(),
        };
        let enrichment = self.lookup.map(|l| enrich_keys(l, &keys, DEFAULT_BATCH));

        let tmp = tmp_path_for(output);
        let written = self.write_csv(&tmp, &rows, enrichment.as_ref().map(|e| (&e.columns, &e.cells)));
        if let Err(e) = written {
            let _ = remove_with_backoff(&tmp);
            return Err(e);
        }
        replace_file_atomic_backoff(&tmp, output)?;

        let report = FinalizeReport {
            rows: rows.len() as u64,
            lookup_failures: enrichment.map(|e| e.failures).unwrap_or(0),
        };
        tracing::info!(rows = report.rows, output = %output.display(), "final aggregate written");
        Ok(report)
    }

    fn write_csv(&self, path: &Path, rows: &[FinalRow], extra: Option<(&Vec<String>, &Vec<Vec<String>>)>) -> Result<()> {
        let mut w = BufWriter::with_capacity(self.write_buf.max(8 * 1024), create_with_backoff(path)?);
        let mut header: Vec<String> = self.plan.output_names().into_iter().map(str::to_string).collect();
        if let Some((cols, _)) = extra {
            header.extend(cols.iter().cloned());
        }
        write_csv_line(&mut w, header)?;

        for (i, row) in rows.iter().enumerate() {
            let mut fields: Vec<String> = row.cells.iter().map(Cell::render).collect();
            if let Some((_, cells)) = extra {
                fields.extend(cells[i].iter().cloned());
            }
            write_csv_line(&mut w, fields)?;
        }
        w.flush()?;
        Ok(())
    }
}
