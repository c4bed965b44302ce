use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use linkagg::{set_global_multiprogress, AggError, ErrorCategory, LinkAggregator, Schema, TsvLookup};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Aggregate the links shared in JSONL post exports into one ranked CSV per
/// schema, keeping memory bounded by a single month of posts.
#[derive(Parser, Debug)]
#[command(name = "linkagg", version)]
struct Cli {
    /// Input files or directories (walked recursively). `.zst` files are
    /// decompressed on the fly.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Final CSV path.
    #[arg(short, long)]
    output: PathBuf,

    /// Built-in schema: domains, youtube_links or youtube_channels.
    #[arg(short, long, default_value = "domains", conflicts_with = "schema_file")]
    schema: String,

    /// JSON schema file declaring columns and merge kinds.
    #[arg(long)]
    schema_file: Option<PathBuf>,

    /// Column to rank the output by (descending).
    #[arg(long)]
    rank_by: Option<String>,

    /// Directory for partitions and partial aggregates.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Prefix for work files; defaults to the schema name.
    #[arg(long)]
    run_name: Option<String>,

    /// Regex over file names selecting inputs inside directories.
    #[arg(long)]
    pattern: Option<String>,

    /// Drop reposts before partitioning.
    #[arg(long)]
    no_retweets: bool,

    /// Size of the worker thread pool.
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, default_value_t = 1)]
    file_concurrency: usize,

    #[arg(long, default_value_t = 4)]
    merge_concurrency: usize,

    #[arg(long, default_value_t = 64)]
    distinct_shards: usize,

    #[arg(long)]
    no_progress: bool,

    /// Leave work files in place after the run.
    #[arg(long)]
    keep_work_dir: bool,

    /// TSV metadata dump (`key<TAB>column...`) joined onto the final rows.
    #[arg(long)]
    metadata: Option<PathBuf>,
}

fn build(cli: &Cli) -> Result<LinkAggregator> {
    let schema = match &cli.schema_file {
        Some(path) => Schema::from_json_file(path)?,
        None => Schema::builtin(&cli.schema)?,
    };
    let mut agg = LinkAggregator::new()
        .inputs(&cli.inputs)
        .schema(schema)
        .exclude_reposts(cli.no_retweets)
        .file_concurrency(cli.file_concurrency)
        .merge_concurrency(cli.merge_concurrency)
        .distinct_shards(cli.distinct_shards)
        .progress(!cli.no_progress)
        .keep_work_dir(cli.keep_work_dir);
    if let Some(col) = &cli.rank_by {
        agg = agg.rank_by(col);
    }
    if let Some(dir) = &cli.work_dir {
        agg = agg.work_dir(dir);
    }
    if let Some(name) = &cli.run_name {
        agg = agg.run_name(name);
    }
    if let Some(p) = &cli.pattern {
        agg = agg.file_pattern(p);
    }
    if let Some(n) = cli.threads {
        agg = agg.parallelism(n);
    }
    if let Some(path) = &cli.metadata {
        agg = agg.metadata(Arc::new(TsvLookup::from_path(path)?));
    }
    Ok(agg)
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    let category = err.chain().find_map(|e| e.downcast_ref::<AggError>()).map(AggError::category);
    match category {
        Some(ErrorCategory::Configuration) => ExitCode::from(2),
        Some(ErrorCategory::Termination) => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.no_progress {
        set_global_multiprogress(Arc::new(MultiProgress::new()));
    }
    let result = build(&cli).and_then(|agg| agg.run(&cli.output));
    match result {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("could not render run summary: {e}"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    }
}
