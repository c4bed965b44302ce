//! On-disk relations and the registry of live relations for one run.
//!
//! A relation is an NDJSON file: a header line naming its stored columns and
//! covered partition buckets, then one row per group key in strictly
//! ascending key order. Sorted rows let a pair merge stream both inputs.

use crate::date::YearMonth;
use crate::error::{AggError, Result};
use crate::ndjson::{NdjsonReader, NdjsonWriter};
use crate::util::{remove_with_backoff, tmp_path_for};
use crate::value::{Cell, ColumnType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Set of partition buckets a relation summarizes.
pub type Coverage = BTreeSet<YearMonth>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationHeader {
    /// Number of leading group key columns in `columns`.
    pub keys: usize,
    pub columns: Vec<ColumnHeader>,
    pub covers: Coverage,
}

impl RelationHeader {
    pub fn new(keys: usize, columns: Vec<ColumnHeader>, covers: Coverage) -> Self {
        Self { keys, columns, covers }
    }

    /// Describe the first difference in stored columns, if any.
    pub fn column_mismatch(&self, other: &RelationHeader) -> Option<String> {
        if self.keys != other.keys {
            return Some(format!("{} group key columns vs {}", self.keys, other.keys));
        }
        if self.columns.len() != other.columns.len() {
            return Some(format!("{} columns vs {}", self.columns.len(), other.columns.len()));
        }
        self.columns.iter().zip(&other.columns).enumerate().find_map(|(i, (a, b))| {
            (a != b).then(|| format!("column {i}: {}:{:?} vs {}:{:?}", a.name, a.ty, b.name, b.ty))
        })
    }
}

/// One aggregate row: group key values and the stored metric cells.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggRow {
    #[serde(rename = "k")]
    pub key: Vec<String>,
    #[serde(rename = "c")]
    pub cells: Vec<Cell>,
}

/// Suffix that names a coverage set: the bucket itself for one partition,
/// otherwise `<first>_to_<last>_n<count>`.
pub fn coverage_suffix(covers: &Coverage) -> String {
    match (covers.iter().next(), covers.iter().next_back()) {
        (Some(a), Some(b)) if covers.len() == 1 && a == b => a.to_string(),
        (Some(a), Some(b)) => format!("{a}_to_{b}_n{}", covers.len()),
        _ => "empty".to_string(),
    }
}

/// Handle to a fully written relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub path: PathBuf,
    pub header: RelationHeader,
    pub rows: u64,
}

fn check_row(path: &Path, header: &RelationHeader, row: &AggRow, last: Option<&Vec<String>>) -> Result<()> {
    let bad = |message: String| AggError::Relation { path: path.to_path_buf(), message };
    if row.key.len() != header.keys || row.key.len() + row.cells.len() != header.columns.len() {
        return Err(bad(format!(
            "row width {}+{} does not match header ({} keys, {} columns)",
            row.key.len(),
            row.cells.len(),
            header.keys,
            header.columns.len()
        )));
    }
    for (cell, col) in row.cells.iter().zip(&header.columns[header.keys..]) {
        if !cell.matches_type(col.ty) {
            return Err(bad(format!("cell {cell:?} is not of type {:?} (column {})", col.ty, col.name)));
        }
    }
    if let Some(prev) = last {
        if row.key <= *prev {
            return Err(bad(format!("keys out of order: {:?} after {:?}", row.key, prev)));
        }
    }
    Ok(())
}

/// Writes a relation to `<dir>/<name>.ndjson` via an in-progress file.
pub struct RelationWriter {
    name: String,
    dest: PathBuf,
    header: RelationHeader,
    w: NdjsonWriter,
    last_key: Option<Vec<String>>,
    rows: u64,
}

impl RelationWriter {
    pub fn create(dir: &Path, name: &str, header: RelationHeader, buf_bytes: usize) -> Result<Self> {
        let dest = dir.join(format!("{name}.ndjson"));
        let mut w = NdjsonWriter::create(&tmp_path_for(&dest), buf_bytes)?;
        w.write_json(&header)?;
        Ok(Self { name: name.to_string(), dest, header, w, last_key: None, rows: 0 })
    }

    /// Append a row. Keys must be strictly ascending.
    pub fn push(&mut self, row: &AggRow) -> Result<()> {
        check_row(self.w.path(), &self.header, row, self.last_key.as_ref())?;
        self.w.write_json(row)?;
        self.last_key = Some(row.key.clone());
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<Relation> {
        self.w.finish_atomic(&self.dest)?;
        Ok(Relation { name: self.name, path: self.dest, header: self.header, rows: self.rows })
    }
}

/// Streaming reader that validates every row against the header.
pub struct RelationReader {
    path: PathBuf,
    header: RelationHeader,
    r: NdjsonReader,
    last_key: Option<Vec<String>>,
}

impl RelationReader {
    pub fn open(path: &Path, buf_bytes: usize) -> Result<Self> {
        let mut r = NdjsonReader::open(path, buf_bytes)?;
        let header: RelationHeader = r
            .next_json()
            .map_err(|e| AggError::Relation { path: path.to_path_buf(), message: format!("bad header: {e}") })?
            .ok_or_else(|| AggError::Relation { path: path.to_path_buf(), message: "missing header".into() })?;
        Ok(Self { path: path.to_path_buf(), header, r, last_key: None })
    }

    pub fn header(&self) -> &RelationHeader {
        &self.header
    }

    pub fn next_row(&mut self) -> Result<Option<AggRow>> {
        let row: Option<AggRow> = self
            .r
            .next_json()
            .map_err(|e| AggError::Relation { path: self.path.clone(), message: e.to_string() })?;
        if let Some(row) = &row {
            check_row(&self.path, &self.header, row, self.last_key.as_ref())?;
            self.last_key = Some(row.key.clone());
        }
        Ok(row)
    }
}

/// Explicit index of the live partial aggregates of one run, keyed by
/// relation name (`<run>_agg_<coverage suffix>`). Shared by the merge
/// workers of a round, hence the internal lock.
pub struct RelationRegistry {
    dir: PathBuf,
    run: String,
    live: Mutex<BTreeMap<String, Relation>>,
}

impl RelationRegistry {
    pub fn new(dir: &Path, run: &str) -> Self {
        Self { dir: dir.to_path_buf(), run: run.to_string(), live: Mutex::new(BTreeMap::new()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> String {
        format!("{}_agg_", self.run)
    }

    pub fn name_for(&self, covers: &Coverage) -> String {
        format!("{}{}", self.prefix(), coverage_suffix(covers))
    }

    pub fn register(&self, rel: Relation) -> Result<()> {
        let mut live = self.live.lock();
        if live.contains_key(&rel.name) {
            return Err(AggError::Relation { path: rel.path, message: "relation registered twice".into() });
        }
        tracing::debug!(relation = %rel.name, rows = rel.rows, "registered relation");
        live.insert(rel.name.clone(), rel);
        Ok(())
    }

    /// Drop a relation from the registry and delete its file.
    pub fn discard(&self, name: &str) -> Result<()> {
        let removed = self.live.lock().remove(name);
        match removed {
            Some(rel) => {
                remove_with_backoff(&rel.path)?;
                tracing::debug!(relation = %name, "discarded relation");
                Ok(())
            }
            None => Err(AggError::Relation { path: self.dir.join(name), message: "not a live relation".into() }),
        }
    }

    pub fn live_names(&self) -> Vec<String> {
        self.live.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relation files on disk whose names carry this run's prefix.
    pub fn list_on_disk(&self) -> Result<Vec<String>> {
        let prefix = self.prefix();
        let mut names = Vec::new();
        for ent in fs::read_dir(&self.dir)? {
            let ent = ent?;
            let file = ent.file_name();
            let Some(file) = file.to_str() else { continue };
            if let Some(stem) = file.strip_suffix(".ndjson") {
                if stem.starts_with(&prefix) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// The single terminal relation. Anything other than exactly one live
    /// relation, or stray relation files next to it, means the reduction did
    /// not terminate.
    pub fn terminal(&self) -> Result<Relation> {
        let live = self.live.lock();
        let on_disk = self.list_on_disk()?;
        if live.len() != 1 || on_disk.len() != 1 {
            let mut found: Vec<String> = live.keys().cloned().collect();
            found.extend(on_disk.into_iter().filter(|n| !live.contains_key(n)));
            return Err(AggError::MissingTerminal { found });
        }
        let (name, rel) = live.iter().next().map(|(n, r)| (n.clone(), r.clone())).ok_or(AggError::MissingTerminal { found: Vec::new() })?;
        if on_disk[0] != name {
            return Err(AggError::MissingTerminal { found: vec![name, on_disk[0].clone()] });
        }
        Ok(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RelationHeader {
        RelationHeader::new(
            1,
            vec![
                ColumnHeader { name: "domain".into(), ty: ColumnType::Text },
                ColumnHeader { name: "total".into(), ty: ColumnType::Uint },
            ],
            Coverage::from([YearMonth::new(2021, 7)]),
        )
    }

    fn row(k: &str, n: u64) -> AggRow {
        AggRow { key: vec![k.into()], cells: vec![Cell::Uint(n)] }
    }

    #[test]
    fn write_then_read_sorted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RelationWriter::create(dir.path(), "r_agg_2021-07", header(), 0).unwrap();
        w.push(&row("a", 2)).unwrap();
        w.push(&row("b", 1)).unwrap();
        let rel = w.finish().unwrap();
        assert_eq!(rel.rows, 2);
        assert!(rel.path.ends_with("r_agg_2021-07.ndjson"));

        let mut r = RelationReader::open(&rel.path, 0).unwrap();
        assert_eq!(r.header(), &header());
        assert_eq!(r.next_row().unwrap(), Some(row("a", 2)));
        assert_eq!(r.next_row().unwrap(), Some(row("b", 1)));
        assert_eq!(r.next_row().unwrap(), None);
    }

    #[test]
    fn writer_rejects_unsorted_and_mistyped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RelationWriter::create(dir.path(), "r", header(), 0).unwrap();
        w.push(&row("b", 1)).unwrap();
        assert!(w.push(&row("a", 1)).is_err());
        assert!(w.push(&row("b", 1)).is_err());
        let bad = AggRow { key: vec!["c".into()], cells: vec![Cell::Text("x".into())] };
        assert!(w.push(&bad).is_err());
    }

    #[test]
    fn coverage_names() {
        let one = Coverage::from([YearMonth::new(2021, 7)]);
        assert_eq!(coverage_suffix(&one), "2021-07");
        let three = Coverage::from([YearMonth::new(2021, 7), YearMonth::new(2021, 9), YearMonth::new(2022, 1)]);
        assert_eq!(coverage_suffix(&three), "2021-07_to_2022-01_n3");
    }

    #[test]
    fn registry_terminal_requires_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RelationRegistry::new(dir.path(), "run");
        assert!(matches!(reg.terminal(), Err(AggError::MissingTerminal { .. })));

        for (ym, k) in [(7, "a"), (8, "b")] {
            let covers = Coverage::from([YearMonth::new(2021, ym)]);
            let name = reg.name_for(&covers);
            let mut h = header();
            h.covers = covers;
            let mut w = RelationWriter::create(dir.path(), &name, h, 0).unwrap();
            w.push(&row(k, 1)).unwrap();
            reg.register(w.finish().unwrap()).unwrap();
        }
        assert_eq!(reg.list_on_disk().unwrap(), vec!["run_agg_2021-07", "run_agg_2021-08"]);
        let err = reg.terminal().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Termination);

        reg.discard("run_agg_2021-07").unwrap();
        assert_eq!(reg.terminal().unwrap().name, "run_agg_2021-08");
        assert!(reg.discard("run_agg_2021-07").is_err());
    }
}
