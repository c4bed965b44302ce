use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

// -------- file operations with backoff (network volumes, AV scanners) --------

const TRIES: usize = 16;
const DELAY_MS: u64 = 50;

/// Transient errors worth retrying: sharing/lock violations and flaky devices
/// (Windows codes 5, 32, 33, 225, 433, 1006, 1117, 1224, 21), plus EINTR/EAGAIN.
fn is_retriable_io_error(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
        return true;
    }
    cfg!(windows) && matches!(e.raw_os_error(), Some(5 | 32 | 33 | 225 | 433 | 1006 | 1117 | 1224 | 21))
}

/// Run `op` until it succeeds, fails with a non-retriable error, or `tries`
/// attempts are used. The delay grows linearly with each attempt.
pub fn with_backoff<T>(tries: usize, delay_ms: u64, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut last_err: Option<io::Error> = None;
    for i in 0..tries.max(1) {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_retriable_io_error(&e) => {
                last_err = Some(e);
                sleep(Duration::from_millis(delay_ms.saturating_mul((i + 1) as u64)));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "retries exhausted")))
}

fn annotate(e: io::Error, what: &str, path: &Path) -> io::Error {
    io::Error::new(e.kind(), format!("{what} {}: {e}", path.display()))
}

pub fn open_with_backoff(path: &Path) -> io::Result<File> {
    with_backoff(TRIES, DELAY_MS, || File::open(path)).map_err(|e| annotate(e, "open", path))
}

pub fn create_with_backoff(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    with_backoff(TRIES, DELAY_MS, || File::create(path)).map_err(|e| annotate(e, "create", path))
}

/// Remove a file; succeeds if it is already gone.
pub fn remove_with_backoff(path: &Path) -> io::Result<()> {
    with_backoff(TRIES, DELAY_MS, || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .map_err(|e| annotate(e, "remove", path))
}

/// Atomically replace `dest` with `tmp`. Falls back to copy+remove when the
/// rename is refused (cross-device temp dirs, sharing violations).
pub fn replace_file_atomic_backoff(tmp: &Path, dest: &Path) -> io::Result<()> {
    let renamed = with_backoff(TRIES, DELAY_MS, || fs::rename(tmp, dest));
    if renamed.is_ok() {
        return Ok(());
    }
    with_backoff(TRIES, DELAY_MS, || fs::copy(tmp, dest)).map_err(|e| annotate(e, "copy to", dest))?;
    remove_with_backoff(tmp)
}

/// Sibling temp path used while a file is being produced.
pub fn tmp_path_for(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".inprogress");
    dest.with_file_name(name)
}
