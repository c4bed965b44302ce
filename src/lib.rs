mod config;
mod date;
mod error;
mod paths;
mod zstd_jsonl;

mod progress;
mod stitch;
mod concurrency;
mod util;
mod mem;
mod pipeline;

mod record;
mod normalize;
mod value;
mod expr;
mod schema;
mod plan;

mod ndjson;
mod relation;
mod partition;
mod distinct;
mod local_agg;
mod merge_tree;
mod enrich;
mod finalize;

pub use crate::config::AggOptions;
pub use crate::date::{days_between, format_timestamp, parse_event_time, YearMonth};
pub use crate::error::{AggError, ErrorCategory};
pub use crate::pipeline::{LinkAggregator, RunSummary};

// Record model, link normalization and column schemas.
pub use crate::record::{parse_post, DropReason, Field, Post, PostRecord};
pub use crate::normalize::{BasicNormalizer, NormalizedLink, UrlNormalizer};
pub use crate::value::{Cell, ColumnType};
pub use crate::expr::{Expr, RecordFilter};
pub use crate::schema::{ColumnDef, ColumnSpec, MergeKind, Schema, SchemaConfig};
pub use crate::plan::{AggregationPlan, MergeFn};

// Individual stages, for callers that drive the pipeline themselves.
pub use crate::paths::{discover_inputs, InputFile, DEFAULT_INPUT_PATTERN};
pub use crate::partition::{PartitionFile, PartitionOptions, PartitionOutput, PartitionStats, Partitioner};
pub use crate::relation::{AggRow, ColumnHeader, Coverage, Relation, RelationHeader, RelationReader, RelationRegistry, RelationWriter};
pub use crate::distinct::{DistinctCounts, DistinctSpill};
pub use crate::local_agg::{LocalAggregate, LocalAggregator};
pub use crate::merge_tree::{expected_rounds, pair_up, MergeTree, RoundReport};
pub use crate::enrich::{enrich_keys, Enrichment, MetadataLookup, TsvLookup};
pub use crate::finalize::{csv_field, FinalRow, FinalizeReport, Finalizer};

// Expose multiprogress and progress helpers.
pub use crate::progress::{set_global_multiprogress, make_count_progress, ProgressScope};

// Expose memory helpers for adaptive throttling from the binary.
pub use crate::mem::{available_memory_fraction, is_low_memory};

//export robust file ops from util so binaries can import from crate root.
pub use crate::util::{open_with_backoff, create_with_backoff, remove_with_backoff, replace_file_atomic_backoff};

// export NDJSON and zstd line helpers
pub use crate::ndjson::{NdjsonReader, NdjsonWriter};
pub use crate::zstd_jsonl::{for_each_line, StreamOutcome};
