//! Partitioner: buckets raw posts by calendar month of their event time and
//! materializes one partition file per bucket.
//!
//! File layout (under the work dir):
//!   _staging/<YYYY-MM>/<input index>.part   per-input-file pieces (temp)
//!   _staging/rejects/<input index>.tsv      rejected links (temp)
//!   <run>_part_<YYYY-MM>.ndjson             final partition, pieces stitched in input order
//!
//! Each input file writes only its own pieces, so files decode in parallel
//! and the stitched partitions are byte-identical across re-runs.

use crate::concurrency::map_limited;
use crate::date::YearMonth;
use crate::error::Result;
use crate::ndjson::NdjsonWriter;
use crate::normalize::UrlNormalizer;
use crate::paths::InputFile;
use crate::progress::ProgressScope;
use crate::record::{parse_post, DropReason, PostRecord};
use crate::stitch::concat_parts;
use crate::util::remove_with_backoff;
use crate::zstd_jsonl::{for_each_line_with_progress, StreamOutcome};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const WARN_REJECTS: u64 = 10;

/// Counters surfaced to the caller; nothing here aborts a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub lines: u64,
    pub posts: u64,
    pub records: u64,
    pub malformed: u64,
    pub missing_id: u64,
    pub bad_timestamp: u64,
    pub filtered_reposts: u64,
    pub rejected_links: u64,
    pub posts_without_links: u64,
    pub corrupt_files: u64,
}

impl PartitionStats {
    fn count_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::Malformed => self.malformed += 1,
            DropReason::MissingId => self.missing_id += 1,
            DropReason::BadTimestamp => self.bad_timestamp += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.malformed + self.missing_id + self.bad_timestamp
    }

    fn absorb(&mut self, o: &PartitionStats) {
        self.lines += o.lines;
        self.posts += o.posts;
        self.records += o.records;
        self.malformed += o.malformed;
        self.missing_id += o.missing_id;
        self.bad_timestamp += o.bad_timestamp;
        self.filtered_reposts += o.filtered_reposts;
        self.rejected_links += o.rejected_links;
        self.posts_without_links += o.posts_without_links;
        self.corrupt_files += o.corrupt_files;
    }
}

/// One materialized partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionFile {
    pub bucket: YearMonth,
    pub path: PathBuf,
    pub records: u64,
}

#[derive(Debug)]
pub struct PartitionOutput {
    /// Sorted by bucket.
    pub partitions: Vec<PartitionFile>,
    pub stats: PartitionStats,
    pub rejects: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PartitionOptions {
    pub exclude_reposts: bool,
    pub file_concurrency: usize,
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub progress: bool,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            exclude_reposts: false,
            file_concurrency: 1,
            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 256 * 1024,
            progress: false,
        }
    }
}

pub fn partition_path(work_dir: &Path, run: &str, bucket: YearMonth) -> PathBuf {
    work_dir.join(format!("{run}_part_{bucket}.ndjson"))
}

struct FileResult {
    stats: PartitionStats,
    per_bucket: BTreeMap<YearMonth, u64>,
}

pub struct Partitioner<'a> {
    work_dir: PathBuf,
    run: String,
    normalizer: &'a dyn UrlNormalizer,
    opts: PartitionOptions,
    rejects_path: Option<PathBuf>,
    warned: AtomicU64,
}

fn tsv_clean(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}

impl<'a> Partitioner<'a> {
    pub fn new(work_dir: &Path, run: &str, normalizer: &'a dyn UrlNormalizer, opts: PartitionOptions) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            run: run.to_string(),
            normalizer,
            opts,
            rejects_path: None,
            warned: AtomicU64::new(0),
        }
    }

    /// Also write rejected links (`link<TAB>reason`) to `path`.
    pub fn with_rejects_file(mut self, path: impl AsRef<Path>) -> Self {
        self.rejects_path = Some(path.as_ref().to_path_buf());
        self
    }

    fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("_staging")
    }

    pub fn run(&self, inputs: &[InputFile]) -> Result<PartitionOutput> {
        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let pb = ProgressScope::count("partition", inputs.len() as u64, self.opts.progress);
        let results = map_limited(inputs.to_vec(), self.opts.file_concurrency, |input| {
            let r = self.process_file(&input);
            pb.inc(1);
            r
        })?;

        let mut stats = PartitionStats::default();
        let mut buckets: BTreeMap<YearMonth, u64> = BTreeMap::new();
        for r in &results {
            stats.absorb(&r.stats);
            for (ym, n) in &r.per_bucket {
                *buckets.entry(*ym).or_default() += n;
            }
        }

        let wb = self.opts.write_buffer_bytes;
        let mut partitions = Vec::with_capacity(buckets.len());
        for (bucket, records) in buckets {
            let pieces = list_files(&staging.join(bucket.to_string()))?;
            let path = partition_path(&self.work_dir, &self.run, bucket);
            concat_parts(&pieces, &path, wb)?;
            partitions.push(PartitionFile { bucket, path, records });
        }

        let rejects = match &self.rejects_path {
            Some(dest) => {
                let pieces = list_files(&staging.join("rejects"))?;
                if pieces.is_empty() {
                    remove_with_backoff(dest)?;
                    None
                } else {
                    concat_parts(&pieces, dest, wb)?;
                    Some(dest.clone())
                }
            }
            None => None,
        };
        fs::remove_dir_all(&staging)?;

        pb.finish(format!("{} partitions", partitions.len()));
        tracing::info!(
            partitions = partitions.len(),
            records = stats.records,
            dropped = stats.dropped(),
            rejected_links = stats.rejected_links,
            "partitioning done"
        );
        Ok(PartitionOutput { partitions, stats, rejects })
    }

    fn warn_reject(&self, link: &str, reason: &str) {
        let n = self.warned.fetch_add(1, Ordering::Relaxed);
        if n < WARN_REJECTS {
            tracing::warn!(link, reason, "normalizer rejected link");
        } else if n == WARN_REJECTS {
            tracing::warn!("further rejected links are only counted");
        }
    }

    fn process_file(&self, input: &InputFile) -> Result<FileResult> {
        let staging = self.staging_dir();
        let wb = self.opts.write_buffer_bytes;
        let mut writers: BTreeMap<YearMonth, NdjsonWriter> = BTreeMap::new();
        let mut rejects: Option<NdjsonWriter> = None;
        let mut st = PartitionStats::default();

        let outcome = for_each_line_with_progress(&input.path, self.opts.read_buffer_bytes, |_| {}, |line| {
            st.lines += 1;
            let post = match parse_post(line) {
                Ok(p) => p,
                Err(reason) => {
                    st.count_drop(reason);
                    return Ok(());
                }
            };
            let Some(bucket) = YearMonth::from_epoch(post.event_time) else {
                st.count_drop(DropReason::BadTimestamp);
                return Ok(());
            };
            if self.opts.exclude_reposts && post.reposted_id.is_some() {
                st.filtered_reposts += 1;
                return Ok(());
            }
            st.posts += 1;
            if post.links.is_empty() {
                st.posts_without_links += 1;
                return Ok(());
            }
            for link in &post.links {
                match self.normalizer.normalize(link) {
                    Ok(n) => {
                        let w = match writers.entry(bucket) {
                            Entry::Occupied(e) => e.into_mut(),
                            Entry::Vacant(v) => {
                                let piece = staging.join(bucket.to_string()).join(format!("{:06}.part", input.index));
                                v.insert(NdjsonWriter::create(&piece, wb)?)
                            }
                        };
                        w.write_json(&PostRecord {
                            post_id: post.id.clone(),
                            event_time: post.event_time,
                            user_id: post.user_id.clone(),
                            reposted_id: post.reposted_id.clone(),
                            link: link.clone(),
                            normalized_url: n.normalized_url,
                            domain: n.domain,
                            channel_id: n.channel_id,
                        })?;
                        st.records += 1;
                    }
                    Err(reason) => {
                        st.rejected_links += 1;
                        self.warn_reject(link, &reason);
                        if rejects.is_none() {
                            let piece = staging.join("rejects").join(format!("{:06}.tsv", input.index));
                            rejects = Some(NdjsonWriter::create(&piece, wb)?);
                        }
                        if let Some(w) = rejects.as_mut() {
                            w.write_line(&format!("{}\t{}", tsv_clean(link), tsv_clean(&reason)))?;
                        }
                    }
                }
            }
            Ok(())
        })?;

        if outcome == StreamOutcome::SkippedCorrupt {
            st.corrupt_files += 1;
        }
        let mut per_bucket = BTreeMap::new();
        for (bucket, w) in writers {
            per_bucket.insert(bucket, w.lines());
            w.finish()?;
        }
        if let Some(w) = rejects {
            w.finish()?;
        }
        tracing::debug!(file = %input.path.display(), records = st.records, "partitioned input file");
        Ok(FileResult { stats: st, per_bucket })
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for ent in fs::read_dir(dir)? {
        let ent = ent?;
        if ent.file_type()?.is_file() {
            out.push(ent.path());
        }
    }
    out.sort();
    Ok(out)
}
