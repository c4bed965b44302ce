//! Batch metadata enrichment of final rows (channel titles, video stats and
//! the like). Lookups are external and may fail per key; a failure only
//! blanks that row's metadata cells.

use crate::error::{AggError, Result};
use crate::util::open_with_backoff;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const DEFAULT_BATCH: usize = 50;

pub trait MetadataLookup: Send + Sync {
    /// Names of the columns appended to the output.
    fn columns(&self) -> Vec<String>;

    /// Metadata for one group key, one value per column.
    fn lookup(&self, key: &[String]) -> std::result::Result<Vec<String>, String>;

    /// Metadata for a batch of keys. Remote APIs usually override this to
    /// issue one request per batch.
    fn lookup_batch(&self, keys: &[Vec<String>]) -> Vec<std::result::Result<Vec<String>, String>> {
        keys.iter().map(|k| self.lookup(k)).collect()
    }
}

/// Enrichment cells for a list of keys, in key order.
#[derive(Debug, Default)]
pub struct Enrichment {
    pub columns: Vec<String>,
    pub cells: Vec<Vec<String>>,
    pub failures: u64,
}

const WARN_FAILURES: u64 = 10;

pub fn enrich_keys(lookup: &dyn MetadataLookup, keys: &[Vec<String>], batch: usize) -> Enrichment {
    let columns = lookup.columns();
    let width = columns.len();
    let mut cells = Vec::with_capacity(keys.len());
    let mut failures = 0u64;

    for chunk in keys.chunks(batch.max(1)) {
        let mut results = lookup.lookup_batch(chunk);
        // A short batch answer counts as failures for the missing keys.
        results.resize_with(chunk.len(), || Err("no answer in batch".to_string()));
        for (key, res) in chunk.iter().zip(results) {
            let res = res.and_then(|row| {
                if row.len() == width {
                    Ok(row)
                } else {
                    Err(format!("expected {width} metadata values, got {}", row.len()))
                }
            });
            match res {
                Ok(row) => cells.push(row),
                Err(reason) => {
                    failures += 1;
                    if failures <= WARN_FAILURES {
                        tracing::warn!(key = ?key, reason = %reason, "metadata lookup failed");
                    }
                    cells.push(vec![String::new(); width]);
                }
            }
        }
    }
    if failures > WARN_FAILURES {
        tracing::warn!(failures, "metadata lookups failed (only the first {WARN_FAILURES} logged)");
    }
    Enrichment { columns, cells, failures }
}

/// Metadata from a local TSV dump: a header row (`key<TAB>col...`) then one
/// row per key. Keys missing from the dump fail their lookup.
#[derive(Clone, Debug)]
pub struct TsvLookup {
    columns: Vec<String>,
    rows: HashMap<String, Vec<String>>,
}

impl TsvLookup {
    pub fn from_path(path: &Path) -> Result<Self> {
        let rdr = BufReader::new(open_with_backoff(path)?);
        let mut lines = rdr.lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| AggError::config(format!("metadata file {} is empty", path.display())))?;
        let columns: Vec<String> = header.split('\t').skip(1).map(|s| s.trim().to_string()).collect();
        if columns.is_empty() {
            return Err(AggError::config(format!("metadata file {} declares no columns", path.display())));
        }
        let mut rows = HashMap::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split('\t');
            let key = parts.next().unwrap_or_default().to_string();
            let mut values: Vec<String> = parts.map(str::to_string).collect();
            values.resize(columns.len(), String::new());
            rows.insert(key, values);
        }
        Ok(Self { columns, rows })
    }
}

impl MetadataLookup for TsvLookup {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn lookup(&self, key: &[String]) -> std::result::Result<Vec<String>, String> {
        let joined = key.join("\t");
        self.rows.get(&joined).cloned().ok_or_else(|| format!("no metadata for `{joined}`"))
    }
}
