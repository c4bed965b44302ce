//! Stitching of per-input-file staging pieces into one file.

use crate::util::{create_with_backoff, open_with_backoff, remove_with_backoff, replace_file_atomic_backoff, tmp_path_for};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Concatenate `parts` in path order into `out_path` (written via a temp file
/// and promoted atomically), then remove the parts. Returns bytes written.
pub fn concat_parts(parts: &[PathBuf], out_path: &Path, write_buf: usize) -> io::Result<u64> {
    let mut paths = parts.to_vec();
    paths.sort();
    let tmp = tmp_path_for(out_path);
    let mut out = BufWriter::with_capacity(write_buf.max(8 * 1024), create_with_backoff(&tmp)?);
    let mut total = 0u64;
    for p in &paths {
        let mut r = BufReader::new(open_with_backoff(p)?);
        total += io::copy(&mut r, &mut out)?;
    }
    out.flush()?;
    drop(out);
    replace_file_atomic_backoff(&tmp, out_path)?;
    for p in &paths {
        remove_with_backoff(p)?;
    }
    Ok(total)
}
