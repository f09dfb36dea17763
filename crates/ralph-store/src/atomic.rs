//! Crash-consistent file replacement.
//!
//! The new content goes to a uniquely named temp file in the target's own
//! directory, is flushed to disk, then renamed over the target. Readers see
//! either the old file or the new one, never a prefix of either.

use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

/// Suffix of in-flight temp files. Anything ending in it is never a valid record.
pub const TMP_SUFFIX: &str = ".tmp";

const PERSIST_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    bytes.push(b'\n');
    write_bytes(path, &bytes)
}

/// Atomically replace `path` with `bytes`. Blocking: sleeps between
/// contended rename attempts.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let stem = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "status".into());
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{stem}."))
        .suffix(TMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    let mut attempt = 0;
    loop {
        match tmp.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) if attempt + 1 < PERSIST_ATTEMPTS && is_transient(&e.error) => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt);
                tracing::debug!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e.error,
                    "rename contended, backing off"
                );
                std::thread::sleep(delay);
                tmp = e.file;
                attempt += 1;
            }
            // Dropping the returned NamedTempFile removes the temp file.
            Err(e) => return Err(e.error),
        }
    }
}

/// Errors a concurrent reader or writer can cause on some platforms.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
    )
}
