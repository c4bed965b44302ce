use std::path::{Path, PathBuf};

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct AggOptions {
    pub inputs: Vec<PathBuf>,          // files or directories (walked recursively)
    pub file_pattern: Option<String>,  // regex over file names; None = default JSONL/zst pattern
    pub run_name: Option<String>,      // relation name prefix; defaults to the schema name
    pub rank_by: Option<String>,       // ranking metric; None = first additive uint column
    pub work_dir: Option<PathBuf>,     // if None, `<output dir>/.linkagg_work/`
    pub keep_work_dir: bool,           // leave work files behind for inspection
    pub exclude_reposts: bool,         // drop posts that carry a reposted id
    pub parallelism: Option<usize>,    // Some(N) to size the rayon pool, None to use default
    pub file_concurrency: usize,       // input files decoded concurrently
    pub merge_concurrency: usize,      // pair merges (and local aggregations) run concurrently
    pub distinct_shards: usize,        // spill shards for the global distinct pass
    pub progress: bool,
    pub progress_label: Option<String>,

    // IO tuning
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
}

impl Default for AggOptions {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            file_pattern: None,
            run_name: None,
            rank_by: None,
            work_dir: None,
            keep_work_dir: false,
            exclude_reposts: false,
            parallelism: None,
            file_concurrency: 1, // safe default: zstd windows can be large
            merge_concurrency: 4,
            distinct_shards: 64,
            progress: true,
            progress_label: None,
            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 256 * 1024,
        }
    }
}

impl AggOptions {
    pub fn with_input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(path.as_ref().to_path_buf());
        self
    }
    pub fn with_inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.inputs.extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }
    pub fn with_file_pattern(mut self, regex: impl Into<String>) -> Self {
        self.file_pattern = Some(regex.into());
        self
    }
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }
    pub fn with_rank_by(mut self, column: impl Into<String>) -> Self {
        self.rank_by = Some(column.into());
        self
    }
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }
    pub fn with_keep_work_dir(mut self, yes: bool) -> Self {
        self.keep_work_dir = yes;
        self
    }
    pub fn with_exclude_reposts(mut self, yes: bool) -> Self {
        self.exclude_reposts = yes;
        self
    }
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = Some(threads.max(1));
        self
    }
    pub fn with_file_concurrency(mut self, n: usize) -> Self {
        self.file_concurrency = n.max(1);
        self
    }
    pub fn with_merge_concurrency(mut self, n: usize) -> Self {
        self.merge_concurrency = n.max(1);
        self
    }
    pub fn with_distinct_shards(mut self, n: usize) -> Self {
        self.distinct_shards = n.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_progress_label(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }
    pub fn with_io_buffers(mut self, read_bytes: usize, write_bytes: usize) -> Self {
        self.read_buffer_bytes = read_bytes.max(8 * 1024);
        self.write_buffer_bytes = write_bytes.max(8 * 1024);
        self
    }
}
