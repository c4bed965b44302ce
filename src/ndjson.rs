use crate::util::{create_with_backoff, open_with_backoff, replace_file_atomic_backoff};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_BUF_BYTES: usize = 256 * 1024;

/// Buffered NDJSON reader.
pub struct NdjsonReader {
    rdr: BufReader<File>,
    buf: String,
}

impl NdjsonReader {
    pub fn open(path: &Path, buf_bytes: usize) -> io::Result<Self> {
        let f = open_with_backoff(path)?;
        Ok(Self { rdr: BufReader::with_capacity(buf_bytes.max(8 * 1024), f), buf: String::new() })
    }

    /// Read the next line into `buf`. Returns the number of bytes read (0 on EOF).
    /// Strips trailing `\r?\n`.
    pub fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        buf.clear();
        let n = self.rdr.read_line(buf)?;
        if n == 0 {
            return Ok(0);
        }
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        Ok(n)
    }

    /// Next non-empty line decoded as `T`; `None` at EOF.
    pub fn next_json<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        let mut buf = std::mem::take(&mut self.buf);
        let out = loop {
            if self.read_line(&mut buf)? == 0 {
                break None;
            }
            if buf.trim().is_empty() {
                continue;
            }
            break Some(serde_json::from_str(&buf).map_err(io::Error::from)?);
        };
        self.buf = buf;
        Ok(out)
    }
}

/// Buffered NDJSON writer. Usually created on a temp path and promoted with
/// `finish_atomic` so readers never observe a half-written file.
pub struct NdjsonWriter {
    path: PathBuf,
    w: Option<BufWriter<File>>,
    lines: u64,
}

impl NdjsonWriter {
    pub fn create(path: &Path, buf_bytes: usize) -> io::Result<Self> {
        let f = create_with_backoff(path)?;
        Ok(Self { path: path.to_path_buf(), w: Some(BufWriter::with_capacity(buf_bytes.max(8 * 1024), f)), lines: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    #[inline]
    pub fn write_line(&mut self, s: &str) -> io::Result<()> {
        if let Some(w) = &mut self.w {
            w.write_all(s.as_bytes())?;
            w.write_all(b"\n")?;
            self.lines += 1;
        }
        Ok(())
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        if let Some(w) = &mut self.w {
            serde_json::to_writer(&mut *w, value).map_err(io::Error::from)?;
            w.write_all(b"\n")?;
            self.lines += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        if let Some(mut w) = self.w.take() {
            w.flush()?;
        }
        Ok(())
    }

    /// Flushes and atomically promotes the temp file to `final_path`.
    pub fn finish_atomic(mut self, final_path: &Path) -> io::Result<()> {
        if let Some(mut w) = self.w.take() {
            w.flush()?;
        }
        replace_file_atomic_backoff(&self.path, final_path)
    }
}
