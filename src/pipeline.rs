use crate::config::AggOptions;
use crate::distinct::DistinctSpill;
use crate::enrich::MetadataLookup;
use crate::error::AggError;
use crate::finalize::Finalizer;
use crate::local_agg::LocalAggregator;
use crate::merge_tree::{MergeTree, RoundReport};
use crate::normalize::{BasicNormalizer, UrlNormalizer};
use crate::partition::{PartitionOptions, PartitionStats, Partitioner};
use crate::paths::discover_inputs;
use crate::plan::AggregationPlan;
use crate::progress::ProgressScope;
use crate::relation::RelationRegistry;
use crate::schema::Schema;
use crate::util::{init_tracing_once, remove_with_backoff};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a run did. Recoverable problems (dropped lines, rejected links,
/// records without a group key, failed metadata lookups) are only reported
/// here.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub output: PathBuf,
    pub rejects: Option<PathBuf>,
    pub input_files: usize,
    pub stats: PartitionStats,
    pub partitions: usize,
    pub keyless_records: u64,
    pub rounds: Vec<RoundReport>,
    pub final_rows: u64,
    pub lookup_failures: u64,
}

/// Builder-style entry point for a partitioned aggregation run.
#[derive(Clone)]
pub struct LinkAggregator {
    pub(crate) opts: AggOptions,
    schema: Option<Schema>,
    normalizer: Arc<dyn UrlNormalizer>,
    lookup: Option<Arc<dyn MetadataLookup>>,
}

impl Default for LinkAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkAggregator {
    pub fn new() -> Self {
        Self { opts: AggOptions::default(), schema: None, normalizer: Arc::new(BasicNormalizer), lookup: None }
    }

    pub fn with_options(mut self, opts: AggOptions) -> Self { self.opts = opts; self }

    // -------- Builder methods --------
    pub fn input(mut self, path: impl AsRef<Path>) -> Self { self.opts = self.opts.with_input(path); self }
    pub fn inputs<I, P>(mut self, paths: I) -> Self where I: IntoIterator<Item = P>, P: AsRef<Path> { self.opts = self.opts.with_inputs(paths); self }
    pub fn file_pattern(mut self, regex: impl Into<String>) -> Self { self.opts = self.opts.with_file_pattern(regex); self }
    pub fn run_name(mut self, name: impl Into<String>) -> Self { self.opts = self.opts.with_run_name(name); self }
    pub fn rank_by(mut self, column: impl Into<String>) -> Self { self.opts = self.opts.with_rank_by(column); self }
    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_work_dir(dir); self }
    pub fn keep_work_dir(mut self, yes: bool) -> Self { self.opts = self.opts.with_keep_work_dir(yes); self }
    pub fn exclude_reposts(mut self, yes: bool) -> Self { self.opts = self.opts.with_exclude_reposts(yes); self }
    pub fn parallelism(mut self, threads: usize) -> Self { self.opts = self.opts.with_parallelism(threads); self }
    pub fn file_concurrency(mut self, n: usize) -> Self { self.opts = self.opts.with_file_concurrency(n); self }
    pub fn merge_concurrency(mut self, n: usize) -> Self { self.opts = self.opts.with_merge_concurrency(n); self }
    pub fn distinct_shards(mut self, n: usize) -> Self { self.opts = self.opts.with_distinct_shards(n); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn progress_label(mut self, label: impl Into<String>) -> Self { self.opts = self.opts.with_progress_label(label); self }
    pub fn io_buffers(mut self, read_bytes: usize, write_bytes: usize) -> Self { self.opts = self.opts.with_io_buffers(read_bytes, write_bytes); self }

    pub fn schema(mut self, schema: Schema) -> Self { self.schema = Some(schema); self }
    pub fn normalizer(mut self, n: Arc<dyn UrlNormalizer>) -> Self { self.normalizer = n; self }
    pub fn metadata(mut self, lookup: Arc<dyn MetadataLookup>) -> Self { self.lookup = Some(lookup); self }

    fn label(&self, stage: &str) -> String {
        match &self.opts.progress_label {
            Some(l) => format!("{l}: {stage}"),
            None => stage.to_string(),
        }
    }

    /// Run every stage and write the ranked CSV to `output`.
    ///
    /// Configuration problems are reported before any input is read. On any
    /// error no file is left at `output`, including one from an earlier run;
    /// the error chain carries an [`AggError`] whose category tells
    /// configuration and termination failures apart.
    pub fn run(&self, output: impl AsRef<Path>) -> Result<RunSummary> {
        let output = output.as_ref();
        let result = self.run_stages(output);
        if result.is_err() {
            if let Err(e) = remove_with_backoff(output) {
                tracing::warn!(error = %e, output = %output.display(), "could not remove stale output");
            }
        }
        result
    }

    fn run_stages(&self, output: &Path) -> Result<RunSummary> {
        init_tracing_once();
        if let Some(n) = self.opts.parallelism {
            rayon::ThreadPoolBuilder::new().num_threads(n).build_global().ok();
        }
        let opts = &self.opts;

        // -------- validate (no I/O) --------
        let schema = match &self.schema {
            Some(s) => s.clone(),
            None => Schema::domains()?,
        };
        let plan = AggregationPlan::new(schema, opts.rank_by.as_deref())?;
        let run = opts.run_name.clone().unwrap_or_else(|| plan.schema().name().to_string());
        check_run_name(&run)?;
        let files = discover_inputs(&opts.inputs, opts.file_pattern.as_deref())?;
        if files.is_empty() {
            tracing::warn!("no input files matched; the run will fail at the merge stage");
        } else {
            tracing::info!(files = files.len(), schema = plan.schema().name(), run = %run, "planned aggregation");
        }

        let out_dir = output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
        // An earlier result must not survive a run that fails later on.
        remove_with_backoff(output).with_context(|| format!("remove previous {}", output.display()))?;
        let work_dir = opts.work_dir.clone().unwrap_or_else(|| out_dir.join(".linkagg_work"));
        prepare_work_dir(&work_dir, &run)?;

        let result = self.execute(&plan, &run, &files, &work_dir, out_dir, output);
        if !opts.keep_work_dir {
            if let Err(e) = clean_work_dir(&work_dir, &run) {
                tracing::warn!(error = %e, dir = %work_dir.display(), "could not clean work dir");
            }
        }
        result
    }

    fn execute(
        &self,
        plan: &AggregationPlan,
        run: &str,
        files: &[crate::paths::InputFile],
        work_dir: &Path,
        out_dir: &Path,
        output: &Path,
    ) -> Result<RunSummary> {
        let opts = &self.opts;
        let (rb, wb) = (opts.read_buffer_bytes, opts.write_buffer_bytes);

        // -------- partition --------
        let rejects_path = out_dir.join(format!("{run}_rejects.tsv"));
        let part_opts = PartitionOptions {
            exclude_reposts: opts.exclude_reposts,
            file_concurrency: opts.file_concurrency,
            read_buffer_bytes: rb,
            write_buffer_bytes: wb,
            progress: opts.progress,
        };
        let parted = Partitioner::new(work_dir, run, self.normalizer.as_ref(), part_opts)
            .with_rejects_file(&rejects_path)
            .run(files)
            .context("partitioning inputs")?;
        let n_partitions = parted.partitions.len();

        // -------- local aggregation --------
        let registry = RelationRegistry::new(work_dir, run);
        let spill = DistinctSpill::create(work_dir, run, opts.distinct_shards, wb, rb)?;
        let local = LocalAggregator::new(plan, rb, wb);
        let pb = ProgressScope::count(self.label("local aggregation"), n_partitions as u64, opts.progress);
        let locals = crate::concurrency::map_limited(parted.partitions, opts.merge_concurrency, |part| {
            let out = local.aggregate(&part, &registry, &spill)?;
            pb.inc(1);
            Ok(out)
        })
        .context("local aggregation")?;
        pb.finish(format!("{} partial aggregates", locals.len()));
        let keyless_records: u64 = locals.iter().map(|l| l.keyless).sum();
        let partials = locals.into_iter().map(|l| l.relation).collect();

        // -------- merge-reduce --------
        let tree = MergeTree::new(plan, &registry)
            .concurrency(opts.merge_concurrency)
            .io_buffers(rb, wb)
            .progress(opts.progress);
        let (_terminal, rounds) = tree.run(partials).context("merge-reduce")?;

        // -------- global distinct + finalize --------
        let distinct = spill.resolve(opts.merge_concurrency).context("global distinct pass")?;
        let mut finalizer = Finalizer::new(plan).io_buffers(rb, wb);
        if let Some(l) = &self.lookup {
            finalizer = finalizer.with_lookup(l.as_ref());
        }
        let report = finalizer
            .finalize(&registry, &distinct, output)
            .with_context(|| format!("writing {}", output.display()))?;

        let summary = RunSummary {
            output: output.to_path_buf(),
            rejects: parted.rejects,
            input_files: files.len(),
            stats: parted.stats,
            partitions: n_partitions,
            keyless_records,
            rounds,
            final_rows: report.rows,
            lookup_failures: report.lookup_failures,
        };
        tracing::info!(
            rows = summary.final_rows,
            partitions = summary.partitions,
            rounds = summary.rounds.len(),
            dropped = summary.stats.dropped(),
            keyless = summary.keyless_records,
            "aggregation complete"
        );
        Ok(summary)
    }
}

fn check_run_name(run: &str) -> std::result::Result<(), AggError> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").map_err(|e| AggError::config(e.to_string()))?;
    if re.is_match(run) {
        Ok(())
    } else {
        Err(AggError::config(format!("run name `{run}` must be alphanumeric with `_` or `-`")))
    }
}

/// Work files that belong to `run`: partitions, partial aggregates, spills.
fn is_run_file(name: &str, run: &str) -> bool {
    name.strip_prefix(run)
        .map(|rest| rest.starts_with("_part_") || rest.starts_with("_agg_") || rest == "_distinct")
        .unwrap_or(false)
}

/// Remove leftovers of an earlier run with the same name so the registry
/// and the on-disk listing agree.
fn prepare_work_dir(dir: &Path, run: &str) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    clean_work_dir(dir, run)
}

fn clean_work_dir(dir: &Path, run: &str) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for ent in fs::read_dir(dir)? {
        let ent = ent?;
        let name = ent.file_name().to_string_lossy().into_owned();
        if name == "_staging" || is_run_file(&name, run) {
            let path = ent.path();
            if ent.file_type()?.is_dir() {
                fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
            } else {
                remove_with_backoff(&path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
    }
    // Only remove the directory itself if nothing else lives there.
    if fs::read_dir(dir)?.next().is_none() {
        let _ = fs::remove_dir(dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_file_names() {
        assert!(is_run_file("domains_part_2021-07.ndjson", "domains"));
        assert!(is_run_file("domains_agg_2021-07_to_2021-09_n3.ndjson.inprogress", "domains"));
        assert!(is_run_file("domains_distinct", "domains"));
        assert!(!is_run_file("domains2_agg_2021-07.ndjson", "domains"));
        assert!(!is_run_file("notes.txt", "domains"));
    }

    #[test]
    fn run_names_are_checked() {
        assert!(check_run_name("domains-2021").is_ok());
        assert!(check_run_name("../evil").is_err());
        assert!(check_run_name("").is_err());
    }
}
