use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use zstd::stream::read::Decoder;

use crate::error::{AggError, Result};
use crate::mem::maybe_throttle_low_memory;
use crate::util::open_with_backoff;

/// How a file stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete,
    /// Decoding failed part-way; lines before the failure were delivered.
    SkippedCorrupt,
}

enum Failure {
    Decode(io::Error),
    Callback(AggError),
}

fn warn_decode_skip(path: &Path, e: &io::Error) {
    let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    tracing::warn!(
        path = %abs.display(),
        error = %e,
        "skipping input file after decode error; this usually means a truncated or corrupt download"
    );
}

/// A `Read` wrapper that counts raw (compressed) bytes read.
struct CountingReader<R: Read> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn is_zstd(path: &Path) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("zst")).unwrap_or(false)
}

/// Stream a JSONL file (plain or `.zst`) line by line, reporting raw bytes
/// consumed through `on_progress`.
///
/// Decode errors (corrupt frames, invalid UTF-8) are logged once and the
/// remainder of the file is skipped; errors returned by `on_line` abort.
pub fn for_each_line_with_progress(
    path: &Path,
    read_buf_bytes: usize,
    mut on_progress: impl FnMut(u64),
    mut on_line: impl FnMut(&str) -> Result<()>,
) -> Result<StreamOutcome> {
    match stream(path, read_buf_bytes, &mut on_progress, &mut on_line) {
        Ok(()) => Ok(StreamOutcome::Complete),
        Err(Failure::Callback(e)) => Err(e),
        Err(Failure::Decode(e)) if e.kind() == io::ErrorKind::NotFound => Err(AggError::Io(e)),
        Err(Failure::Decode(e)) => {
            warn_decode_skip(path, &e);
            Ok(StreamOutcome::SkippedCorrupt)
        }
    }
}

pub fn for_each_line(path: &Path, on_line: impl FnMut(&str) -> Result<()>) -> Result<StreamOutcome> {
    for_each_line_with_progress(path, 64 * 1024, |_| {}, on_line)
}

fn stream(
    path: &Path,
    read_buf_bytes: usize,
    on_progress: &mut impl FnMut(u64),
    on_line: &mut impl FnMut(&str) -> Result<()>,
) -> std::result::Result<(), Failure> {
    let file = open_with_backoff(path).map_err(Failure::Decode)?;
    let counter = Arc::new(AtomicU64::new(0));
    let counted = CountingReader { inner: file, counter: counter.clone() };

    let cap = read_buf_bytes.max(16 * 1024);
    let mut reader: Box<dyn BufRead> = if is_zstd(path) {
        let mut decoder = Decoder::new(counted).map_err(Failure::Decode)?;
        // Large-window frames otherwise fail with "Frame requires too much memory".
        decoder.window_log_max(31).map_err(Failure::Decode)?;
        Box::new(BufReader::with_capacity(cap, decoder))
    } else {
        Box::new(BufReader::with_capacity(cap, counted))
    };

    let mut buf = String::with_capacity(16 * 1024);
    let mut last = 0u64;
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf).map_err(Failure::Decode)?;
        let cur = counter.load(Ordering::Relaxed);
        if cur > last {
            on_progress(cur - last);
            last = cur;
        }
        if n == 0 {
            break;
        }
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        if buf.trim().is_empty() {
            continue;
        }
        on_line(&buf).map_err(Failure::Callback)?;
        maybe_throttle_low_memory(0.10);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_plain_and_zstd_alike() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.jsonl");
        fs::write(&plain, "{\"x\":1}\r\n\n{\"x\":2}\n").unwrap();
        let packed = dir.path().join("a.jsonl.zst");
        let bytes = zstd::encode_all(&b"{\"x\":1}\n{\"x\":2}"[..], 3).unwrap();
        fs::write(&packed, bytes).unwrap();

        for p in [&plain, &packed] {
            let mut lines = Vec::new();
            let out = for_each_line(p, |l| {
                lines.push(l.to_string());
                Ok(())
            })
            .unwrap();
            assert_eq!(out, StreamOutcome::Complete);
            assert_eq!(lines, vec!["{\"x\":1}", "{\"x\":2}"]);
        }
    }

    #[test]
    fn corrupt_zstd_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bad.zst");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(b"definitely not zstd").unwrap();
        drop(f);
        let out = for_each_line(&p, |_| Ok(())).unwrap();
        assert_eq!(out, StreamOutcome::SkippedCorrupt);
    }

    #[test]
    fn callback_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.jsonl");
        fs::write(&p, "{}\n").unwrap();
        let err = for_each_line(&p, |_| Err(AggError::config("stop"))).unwrap_err();
        assert!(matches!(err, AggError::Configuration { .. }));
    }
}
