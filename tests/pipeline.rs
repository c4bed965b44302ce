#[path = "common/mod.rs"]
mod common;

use common::*;
use linkagg::{AggError, ColumnSpec, ErrorCategory, LinkAggregator, MergeKind, MetadataLookup, Schema, SchemaConfig};
use std::path::Path;
use std::sync::Arc;

fn category(err: &anyhow::Error) -> Option<ErrorCategory> {
    err.chain().find_map(|e| e.downcast_ref::<AggError>()).map(AggError::category)
}

/// Per-domain totals keyed by the plain domain string.
fn totals_schema() -> Schema {
    Schema::from_config(&SchemaConfig {
        name: "totals".into(),
        filter: None,
        columns: vec![
            ColumnSpec::new("domain", MergeKind::GroupKey, "domain"),
            ColumnSpec::new("total", MergeKind::Additive, "count(*)"),
            ColumnSpec::new("first_seen", MergeKind::ExtremalMin, "min(event_time)"),
        ],
    })
    .unwrap()
}

fn quiet() -> LinkAggregator {
    LinkAggregator::new().progress(false)
}

/// Full domains run over three months (one `.zst`, one plain file).
#[test]
fn domains_end_to_end() {
    let base = make_corpus_two_domains();
    let out = base.join("out").join("domains.csv");

    let summary = quiet().input(base.join("input")).run(&out).unwrap();

    assert_eq!(summary.input_files, 2);
    assert_eq!(summary.partitions, 3);
    assert_eq!(summary.rounds.len(), 2);
    assert_eq!(summary.stats.posts, 8);
    assert_eq!(summary.stats.records, 9);
    assert_eq!(summary.final_rows, 2);
    assert!(summary.rejects.is_none());

    let csv = read_csv(&out);
    assert_eq!(
        csv.header,
        vec![
            "domain_id",
            "domain_name",
            "nb_distinct_links_from_domain",
            "nb_collected_retweets_with_domain",
            "sum_all_tweets_with_domain",
            "nb_accounts_that_shared_domain_link",
            "earliest_tweet",
            "latest_tweet",
            "histogram_of_tweets_per_month",
            "nb_collected_original_tweets",
            "days_between_first_and_last_tweet",
        ]
    );
    // Ranked by total posts, descending.
    let names: Vec<&str> = csv.rows.iter().map(|r| r[csv.col("domain_name")].as_str()).collect();
    assert_eq!(names, vec!["b.com", "a.com"]);

    let a = |col: &str| csv.get("domain_name", "a.com", col);
    assert_eq!(a("domain_id").len(), 64);
    assert_eq!(a("sum_all_tweets_with_domain"), "4");
    assert_eq!(a("nb_collected_retweets_with_domain"), "1");
    assert_eq!(a("nb_collected_original_tweets"), "3");
    assert_eq!(a("nb_distinct_links_from_domain"), "2");
    assert_eq!(a("nb_accounts_that_shared_domain_link"), "4");
    assert_eq!(a("earliest_tweet"), "2021-07-01 00:00:10");
    assert_eq!(a("latest_tweet"), "2021-09-03 00:00:00");
    assert_eq!(a("days_between_first_and_last_tweet"), "63");
    assert_eq!(a("histogram_of_tweets_per_month"), "2021-07:2|2021-08:1|2021-09:1");

    let b = |col: &str| csv.get("domain_name", "b.com", col);
    assert_eq!(b("sum_all_tweets_with_domain"), "5");
    assert_eq!(b("nb_collected_original_tweets"), "5");
    assert_eq!(b("nb_distinct_links_from_domain"), "3");
    assert_eq!(b("histogram_of_tweets_per_month"), "2021-07:3|2021-08:1|2021-09:1");

    // Work files are gone and nothing half-written is left next to the output.
    assert!(!base.join("out").join(".linkagg_work").exists());
    assert!(!base.join("out").join("domains.csv.inprogress").exists());
}

/// u2 shares b.com in all three months. Summing per-partition account counts
/// would give 3 + 1 + 1 = 5; the global distinct pass gives 3.
#[test]
fn account_counts_are_global_distinct_counts() {
    let base = make_corpus_two_domains();
    let out = base.join("domains.csv");
    quiet().input(base.join("input")).run(&out).unwrap();

    let csv = read_csv(&out);
    assert_eq!(csv.get("domain_name", "b.com", "nb_accounts_that_shared_domain_link"), "3");
}

/// Partition 1: a twice, b once. Partition 2: a once. Partition 3: b three times.
#[test]
fn additive_totals_across_three_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(
        &input,
        &[
            post("1", JUL + 1, "u1", None, &["https://a.com/1"]),
            post("2", JUL + 2, "u1", None, &["https://a.com/2"]),
            post("3", JUL + 3, "u1", None, &["https://b.com/1"]),
            post("4", AUG + 1, "u1", None, &["https://a.com/3"]),
            post("5", SEP + 1, "u1", None, &["https://b.com/2"]),
            post("6", SEP + 2, "u1", None, &["https://b.com/3"]),
            post("7", SEP + 3, "u1", None, &["https://b.com/4"]),
        ],
    );
    let out = dir.path().join("totals.csv");
    let summary = quiet().input(&input).schema(totals_schema()).run(&out).unwrap();
    assert_eq!(summary.partitions, 3);

    let csv = read_csv(&out);
    assert_eq!(csv.header, vec!["domain", "total", "first_seen"]);
    assert_eq!(csv.rows, vec![
        vec!["b.com".to_string(), "4".to_string(), "2021-07-01 00:00:03".to_string()],
        vec!["a.com".to_string(), "3".to_string(), "2021-07-01 00:00:01".to_string()],
    ]);
}

/// Five monthly partitions: round 1 merges (1,2) and (3,4) and carries 5,
/// round 2 merges the two results and carries 5, round 3 merges the rest.
#[test]
fn five_partitions_reduce_in_three_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let oct = SEP + 30 * DAY;
    let nov = oct + 31 * DAY;
    let input = dir.path().join("posts.jsonl");
    let lines: Vec<String> = [JUL, AUG, SEP, oct, nov]
        .iter()
        .enumerate()
        .map(|(i, ts)| post(&i.to_string(), ts + 60, "u", None, &["https://a.com/x"]))
        .collect();
    write_jsonl_lines(&input, &lines);

    let out = dir.path().join("totals.csv");
    let summary = quiet().input(&input).schema(totals_schema()).run_name("r").run(&out).unwrap();

    let rounds = &summary.rounds;
    assert_eq!(rounds.len(), 3);
    let m = |l: &str, r: &str, o: &str| (format!("r_agg_{l}"), format!("r_agg_{r}"), format!("r_agg_{o}"));

    assert_eq!(rounds[0].merges, vec![
        m("2021-07", "2021-08", "2021-07_to_2021-08_n2"),
        m("2021-09", "2021-10", "2021-09_to_2021-10_n2"),
    ]);
    assert_eq!(rounds[0].carry.as_deref(), Some("r_agg_2021-11"));
    assert_eq!(rounds[0].live_after, 3);

    assert_eq!(rounds[1].merges, vec![m("2021-07_to_2021-08_n2", "2021-09_to_2021-10_n2", "2021-07_to_2021-10_n4")]);
    assert_eq!(rounds[1].carry.as_deref(), Some("r_agg_2021-11"));
    assert_eq!(rounds[1].live_after, 2);

    assert_eq!(rounds[2].merges, vec![m("2021-07_to_2021-10_n4", "2021-11", "2021-07_to_2021-11_n5")]);
    assert_eq!(rounds[2].carry, None);
    assert_eq!(rounds[2].live_after, 1);

    assert_eq!(read_csv(&out).get("domain", "a.com", "total"), "5");
}

#[test]
fn dropped_lines_and_rejected_links_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(
        &input,
        &[
            post("1", JUL, "u1", None, &["https://a.com/1", "ftp://a.com/file"]),
            "{not json".to_string(),
            r#"{"timestamp_utc": 1625097600, "links": "https://a.com/2"}"#.to_string(),
            r#"{"id": "9", "local_time": "yesterday", "links": "https://a.com/3"}"#.to_string(),
            post("2", JUL, "u1", None, &[]),
        ],
    );
    let out = dir.path().join("out").join("totals.csv");
    let summary = quiet().input(&input).schema(totals_schema()).run(&out).unwrap();

    assert_eq!(summary.stats.malformed, 1);
    assert_eq!(summary.stats.missing_id, 1);
    assert_eq!(summary.stats.bad_timestamp, 1);
    assert_eq!(summary.stats.rejected_links, 1);
    assert_eq!(summary.stats.posts_without_links, 1);
    assert_eq!(summary.stats.records, 1);

    let rejects = summary.rejects.expect("rejects file");
    assert_eq!(rejects, dir.path().join("out").join("totals_rejects.tsv"));
    let lines = read_lines(&rejects);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("ftp://a.com/file\t"));
    assert_eq!(read_csv(&out).get("domain", "a.com", "total"), "1");
}

#[test]
fn reposts_can_be_excluded() {
    let base = make_corpus_two_domains();
    let out = base.join("domains.csv");
    let summary = quiet().input(base.join("input")).exclude_reposts(true).run(&out).unwrap();

    assert_eq!(summary.stats.filtered_reposts, 1);
    let csv = read_csv(&out);
    assert_eq!(csv.get("domain_name", "a.com", "sum_all_tweets_with_domain"), "3");
    assert_eq!(csv.get("domain_name", "a.com", "nb_collected_retweets_with_domain"), "0");
}

#[test]
fn undeclared_ranking_metric_fails_before_any_output() {
    let base = make_corpus_two_domains();
    let out = base.join("out").join("domains.csv");
    let err = quiet().input(base.join("input")).rank_by("nb_likes").run(&out).unwrap_err();

    assert_eq!(category(&err), Some(ErrorCategory::Configuration));
    assert!(!out.exists());
    assert!(!base.join("out").exists());
}

#[test]
fn no_valid_records_is_a_termination_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(&input, &["{broken".to_string(), r#"{"id":"1"}"#.to_string()]);
    let out = dir.path().join("domains.csv");

    let err = quiet().input(&input).run(&out).unwrap_err();
    assert_eq!(category(&err), Some(ErrorCategory::Termination));
    assert!(!out.exists());
    assert!(!Path::new(&format!("{}.inprogress", out.display())).exists());
}

/// Epoch milliseconds and absurd floats are bad timestamps, not 1970 posts.
#[test]
fn out_of_range_event_times_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(
        &input,
        &[
            post("1", JUL, "u1", None, &["https://a.com/1"]),
            post("2", JUL * 1000, "u2", None, &["https://a.com/2"]),
            r#"{"id": "3", "timestamp_utc": 1e30, "links": "https://a.com/3"}"#.to_string(),
        ],
    );
    let out = dir.path().join("totals.csv");
    let summary = quiet().input(&input).schema(totals_schema()).run(&out).unwrap();

    assert_eq!(summary.stats.bad_timestamp, 2);
    assert_eq!(summary.stats.records, 1);
    assert_eq!(summary.partitions, 1);
    let csv = read_csv(&out);
    assert_eq!(csv.get("domain", "a.com", "total"), "1");
    assert_eq!(csv.get("domain", "a.com", "first_seen"), "2021-07-01 00:00:00");
}

/// A failing rerun must not leave the previous run's CSV looking current.
#[test]
fn failed_reruns_remove_the_previous_output() {
    let base = make_corpus_two_domains();
    let out = base.join("out").join("domains.csv");
    quiet().input(base.join("input")).run(&out).unwrap();
    assert!(out.exists());

    let broken = base.join("broken.jsonl");
    write_jsonl_lines(&broken, &["{broken".to_string()]);
    let err = quiet().input(&broken).run(&out).unwrap_err();
    assert_eq!(category(&err), Some(ErrorCategory::Termination));
    assert!(!out.exists());

    quiet().input(base.join("input")).run(&out).unwrap();
    let err = quiet().input(base.join("input")).rank_by("nb_likes").run(&out).unwrap_err();
    assert_eq!(category(&err), Some(ErrorCategory::Configuration));
    assert!(!out.exists());
}

#[test]
fn records_without_a_group_key_are_summarized() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(
        &input,
        &[
            post("1", JUL, "u1", None, &["https://a.com/1"]),
            r#"{"id": "2", "timestamp_utc": 1625097600, "links": "https://a.com/2|https://b.com/1"}"#.to_string(),
        ],
    );
    let schema = Schema::from_config(&SchemaConfig {
        name: "users".into(),
        filter: None,
        columns: vec![
            ColumnSpec::new("user", MergeKind::GroupKey, "user_id"),
            ColumnSpec::new("total", MergeKind::Additive, "count(*)"),
        ],
    })
    .unwrap();
    let out = dir.path().join("users.csv");
    let summary = quiet().input(&input).schema(schema).run(&out).unwrap();

    assert_eq!(summary.stats.records, 3);
    assert_eq!(summary.keyless_records, 2);
    assert_eq!(summary.final_rows, 1);
    assert_eq!(read_csv(&out).get("user", "u1", "total"), "1");
}

#[test]
fn ranking_by_a_distinct_column() {
    let base = make_corpus_two_domains();
    let out = base.join("domains.csv");
    quiet().input(base.join("input")).rank_by("nb_accounts_that_shared_domain_link").run(&out).unwrap();

    // a.com has 4 accounts, b.com 3.
    let csv = read_csv(&out);
    assert_eq!(csv.rows[0][csv.col("domain_name")], "a.com");
}

#[test]
fn youtube_schemas_filter_rows() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("posts.jsonl");
    write_jsonl_lines(
        &input,
        &[
            post("1", JUL, "u1", None, &["https://youtu.be/dQw4w9WgXcQ", "https://a.com/x"]),
            post("2", AUG, "u2", None, &["https://www.youtube.com/channel/UC_x5XG1OV2P6uZZ5FSM9Ttw"]),
            post("3", AUG + 1, "u3", Some("2"), &["https://m.youtube.com/channel/UC_x5XG1OV2P6uZZ5FSM9Ttw/"]),
        ],
    );

    let links = dir.path().join("links.csv");
    quiet().input(&input).schema(Schema::youtube_links().unwrap()).run(&links).unwrap();
    let csv = read_csv(&links);
    assert_eq!(csv.rows.len(), 2);
    assert_eq!(csv.rows[0][csv.col("normalized_url")], "youtube.com/channel/UC_x5XG1OV2P6uZZ5FSM9Ttw");
    assert_eq!(csv.get("normalized_url", "youtube.com/channel/UC_x5XG1OV2P6uZZ5FSM9Ttw", "sum_all_tweets_with_link"), "2");
    assert_eq!(csv.get("normalized_url", "youtube.com/dQw4w9WgXcQ", "nb_accounts_that_shared_link"), "1");

    let channels = dir.path().join("channels.csv");
    quiet().input(&input).schema(Schema::youtube_channels().unwrap()).run(&channels).unwrap();
    let csv = read_csv(&channels);
    assert_eq!(csv.rows.len(), 1);
    assert_eq!(csv.get("channel_id", "UC_x5XG1OV2P6uZZ5FSM9Ttw", "nb_collected_retweets_with_channel"), "1");
    assert_eq!(csv.get("channel_id", "UC_x5XG1OV2P6uZZ5FSM9Ttw", "nb_collected_original_tweets"), "1");
    assert_eq!(csv.get("channel_id", "UC_x5XG1OV2P6uZZ5FSM9Ttw", "nb_accounts_that_shared_channel"), "2");
}

struct Titles;

impl MetadataLookup for Titles {
    fn columns(&self) -> Vec<String> {
        vec!["title".into()]
    }

    fn lookup(&self, key: &[String]) -> Result<Vec<String>, String> {
        match key[0].as_str() {
            "a.com" => Ok(vec!["Site A".into()]),
            other => Err(format!("quota exceeded for {other}")),
        }
    }
}

#[test]
fn failed_metadata_lookups_leave_cells_empty() {
    let base = make_corpus_two_domains();
    let out = base.join("totals.csv");
    let summary = quiet()
        .input(base.join("input"))
        .schema(totals_schema())
        .metadata(Arc::new(Titles))
        .run(&out)
        .unwrap();

    assert_eq!(summary.lookup_failures, 1);
    let csv = read_csv(&out);
    assert_eq!(csv.header, vec!["domain", "total", "first_seen", "title"]);
    assert_eq!(csv.get("domain", "a.com", "title"), "Site A");
    assert_eq!(csv.get("domain", "b.com", "title"), "");
}

#[test]
fn reruns_with_the_same_name_replace_stale_work_files() {
    let base = make_corpus_two_domains();
    let work = base.join("work");
    let out = base.join("domains.csv");
    quiet().input(base.join("input")).work_dir(&work).keep_work_dir(true).run(&out).unwrap();
    assert!(work.join("domains_agg_2021-07_to_2021-09_n3.ndjson").exists());

    let first = std::fs::read(&out).unwrap();
    quiet().input(base.join("input")).work_dir(&work).run(&out).unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), first);
    assert!(!work.exists());
}
