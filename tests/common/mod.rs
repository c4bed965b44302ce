#![allow(dead_code)]

use serde_json::json;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// 2021-07-01, 2021-08-01 and 2021-09-01 at 00:00:00 UTC.
pub const JUL: i64 = 1_625_097_600;
pub const AUG: i64 = 1_627_776_000;
pub const SEP: i64 = 1_630_454_400;
pub const DAY: i64 = 86_400;

/// Write a compressed `.zst` file containing the provided JSONL lines.
pub fn write_zst_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    for l in lines {
        writeln!(&mut enc, "{}", l).unwrap();
    }
    enc.finish().unwrap();
}

/// Write a plain JSONL file.
pub fn write_jsonl_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = File::create(path).unwrap();
    for l in lines {
        writeln!(&mut f, "{}", l).unwrap();
    }
}

/// One raw post line in the export shape the partitioner reads.
pub fn post(id: &str, ts: i64, user: &str, retweeted: Option<&str>, links: &[&str]) -> String {
    let mut v = json!({
        "id": id,
        "timestamp_utc": ts,
        "user_id": user,
        "links": links.join("|"),
    });
    if let Some(rt) = retweeted {
        v["retweeted_id"] = json!(rt);
    }
    v.to_string()
}

/// Read a text file line-by-line into strings (skips empty lines).
pub fn read_lines(path: &Path) -> Vec<String> {
    let f = File::open(path).unwrap();
    let r = BufReader::new(f);
    r.lines().map(|l| l.unwrap()).filter(|s| !s.is_empty()).collect()
}

/// Parsed CSV (no quoted fields in the fixtures, so a plain split is enough).
pub struct Csv {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Csv {
    pub fn col(&self, name: &str) -> usize {
        self.header.iter().position(|h| h == name).unwrap_or_else(|| panic!("no column {name}"))
    }

    /// The row whose `by` column equals `value`.
    pub fn row(&self, by: &str, value: &str) -> &Vec<String> {
        let i = self.col(by);
        self.rows.iter().find(|r| r[i] == value).unwrap_or_else(|| panic!("no row with {by}={value}"))
    }

    pub fn get(&self, by: &str, value: &str, col: &str) -> String {
        self.row(by, value)[self.col(col)].clone()
    }
}

pub fn read_csv(path: &Path) -> Csv {
    let mut lines = read_lines(path).into_iter();
    let header = lines.next().unwrap().split(',').map(str::to_string).collect();
    let rows = lines.map(|l| l.split(',').map(str::to_string).collect()).collect();
    Csv { header, rows }
}

/// Three months of posts over two domains.
///
/// - 2021-07: p1 (u1, a.com/x), p2 (u2, b.com/1), p3 (u1, b.com/2),
///   p8 (u5, both a.com/x and b.com/1)
/// - 2021-08: p4 (u3, a.com/x, retweet of p1), p5 (u2, b.com/1)
/// - 2021-09: p6 (u4, a.com/y), p7 (u2, b.com/3)
///
/// So a.com: 4 posts, 1 retweet, accounts {u1,u3,u4,u5}, links {x,y};
/// b.com: 5 posts, no retweets, accounts {u1,u2,u5}, links {1,2,3}.
/// July lives in a `.zst` file; August and September in one plain file.
pub fn make_corpus_two_domains() -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.into_path();
    let input = base.join("input");

    write_zst_lines(
        &input.join("2021-07.jsonl.zst"),
        &[
            post("p1", JUL + 10, "u1", None, &["https://www.a.com/x"]),
            post("p2", JUL + 20, "u2", None, &["https://b.com/1?utm_source=tw"]),
            post("p3", JUL + 30, "u1", None, &["http://b.com/2/"]),
            post("p8", JUL + 40, "u5", None, &["https://a.com/x", "https://b.com/1"]),
        ],
    );
    write_jsonl_lines(
        &input.join("2021-08_09.jsonl"),
        &[
            post("p4", AUG + 5 * DAY, "u3", Some("p1"), &["https://a.com/x"]),
            post("p5", AUG + 6 * DAY, "u2", None, &["https://b.com/1"]),
            post("p6", SEP + 2 * DAY, "u4", None, &["https://a.com/y"]),
            post("p7", SEP + 3 * DAY, "u2", None, &["https://b.com/3"]),
        ],
    );
    base
}
