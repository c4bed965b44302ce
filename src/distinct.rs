//! Global distinct pass for `distinct_global` columns.
//!
//! Local aggregation writes each partition's distinct `(column, group key,
//! value)` triples to hash-sharded spill files. Sharding is by `(column, group
//! key)`, so every shard holds the complete value set for its keys and can be
//! deduplicated and counted on its own once the merge tree has terminated.

use crate::concurrency::map_limited;
use crate::error::{AggError, Result};
use crate::ndjson::{NdjsonReader, NdjsonWriter};
use crate::util::remove_with_backoff;
use ahash::{AHashMap, AHashSet, RandomState};
use parking_lot::Mutex;
use std::fs;
use std::hash::{BuildHasher, Hash, Hasher};
use std::path::{Path, PathBuf};

/// Disk-backed sharded spill writer; safe to share across local aggregation workers.
pub struct DistinctSpill {
    dir: PathBuf,
    shards: Vec<Mutex<NdjsonWriter>>,
    paths: Vec<PathBuf>,
    state: RandomState, // seeded for deterministic sharding
    read_buf: usize,
}

impl DistinctSpill {
    pub fn create(work_dir: &Path, run: &str, count: usize, write_buf: usize, read_buf: usize) -> Result<Self> {
        let count = count.max(1);
        let dir = work_dir.join(format!("{run}_distinct"));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut shards = Vec::with_capacity(count);
        let mut paths = Vec::with_capacity(count);
        for i in 0..count {
            let path = dir.join(format!("shard_{i:04}.ndjson"));
            shards.push(Mutex::new(NdjsonWriter::create(&path, write_buf)?));
            paths.push(path);
        }

        let state = RandomState::with_seeds(
            0x1357_9bdf_acce_55ed,
            0x2468_ace0_fdb9_8642,
            0xfeed_face_dead_beef,
            0x0bad_f00d_c0de_cafe,
        );
        Ok(Self { dir, shards, paths, state, read_buf })
    }

    #[inline]
    fn shard_index(&self, column: usize, key: &[String]) -> usize {
        let mut h = self.state.build_hasher();
        column.hash(&mut h);
        key.hash(&mut h);
        (h.finish() as usize) % self.shards.len()
    }

    /// Record every value of one group's distinct column. Duplicates across
    /// calls (and partitions) are fine; `resolve` removes them.
    pub fn write_values<'v>(&self, column: usize, key: &[String], values: impl IntoIterator<Item = &'v String>) -> Result<()> {
        let idx = self.shard_index(column, key);
        let mut guard = self.shards[idx].lock();
        for v in values {
            guard.write_json(&(column, key, v))?;
        }
        Ok(())
    }

    /// Flush and close the spill files, then dedup and count each shard.
    /// Shards are processed `concurrency` at a time and removed afterwards.
    pub fn resolve(self, concurrency: usize) -> Result<DistinctCounts> {
        for w in self.shards {
            w.into_inner().finish()?;
        }
        let read_buf = self.read_buf;
        let per_shard = map_limited(self.paths, concurrency, |path| {
            let counts = count_shard(&path, read_buf)?;
            remove_with_backoff(&path)?;
            Ok(counts)
        })?;
        fs::remove_dir_all(&self.dir)?;

        let mut counts = AHashMap::new();
        for shard in per_shard {
            counts.extend(shard);
        }
        tracing::debug!(groups = counts.len(), "global distinct pass done");
        Ok(DistinctCounts { counts })
    }
}

fn count_shard(path: &Path, read_buf: usize) -> Result<AHashMap<(usize, Vec<String>), u64>> {
    let mut rdr = NdjsonReader::open(path, read_buf)?;
    let mut seen: AHashSet<String> = AHashSet::new();
    let mut line = String::new();
    while rdr.read_line(&mut line)? > 0 {
        if !line.is_empty() && !seen.contains(line.as_str()) {
            seen.insert(line.clone());
        }
    }
    let mut counts: AHashMap<(usize, Vec<String>), u64> = AHashMap::new();
    for entry in seen {
        let (column, key, _value): (usize, Vec<String>, String) = serde_json::from_str(&entry)
            .map_err(|e| AggError::Relation { path: path.to_path_buf(), message: e.to_string() })?;
        *counts.entry((column, key)).or_default() += 1;
    }
    Ok(counts)
}

/// Distinct counts per `(distinct column index, group key)`.
#[derive(Debug, Default)]
pub struct DistinctCounts {
    counts: AHashMap<(usize, Vec<String>), u64>,
}

impl DistinctCounts {
    pub fn get(&self, column: usize, key: &[String]) -> u64 {
        self.counts.get(&(column, key.to_vec())).copied().unwrap_or(0)
    }
}
