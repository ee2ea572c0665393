//! Per-instance rolling log capture.
//!
//! Each launch of a server on port `P` opens a fresh file under
//! `<logs>/<P>/`, named from the UTC launch timestamp. Retention is bounded:
//! rotation happens before the new file is opened, never while it is being
//! written. Child output is piped through a line-wise timestamping transform
//! that makes no assumption about chunk boundaries.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

/// Newest log files kept per port, counting the one about to be opened.
pub const MAX_LOG_FILES: usize = 10;

/// Upper bound on bytes returned by a tail read.
pub const TAIL_LIMIT: u64 = 2 * 1024 * 1024;

/// Marker prepended to a tail read that did not include the whole file.
const TRUNCATION_MARKER: &str = "[Truncated...]\n";

/// Shared handle to an open per-launch log file.
pub type LogFile = Arc<Mutex<tokio::fs::File>>;

/// A tail read of one log file.
#[derive(Debug)]
pub struct LogTail {
    /// File name of the selected log.
    pub file_name: String,
    /// Total size of the file in bytes.
    pub size: u64,
    /// Last [`TAIL_LIMIT`] bytes at most, lossily decoded.
    pub content: String,
}

/// Formats the log file name for a launch at `now`: the RFC 3339 UTC
/// timestamp with `:` and `.` replaced by `-`, extension `.log`.
#[must_use]
pub fn stamped_file_name(now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{stamp}.log")
}

/// Rotates the port's log directory and opens the file for a new launch.
///
/// Rotation keeps the newest [`MAX_LOG_FILES`]` - 1` existing files so the
/// directory never holds more than [`MAX_LOG_FILES`] logs after the new file
/// is created.
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the file cannot
/// be opened.
pub async fn open_for_launch(logs_root: &Path, port: u16) -> std::io::Result<(LogFile, PathBuf)> {
    let dir = logs_root.join(port.to_string());
    tokio::fs::create_dir_all(&dir).await?;

    for stale in list_logs_desc(&dir)?.into_iter().skip(MAX_LOG_FILES - 1) {
        if let Err(e) = std::fs::remove_file(&stale) {
            warn!(path = %stale.display(), "failed to rotate log file: {e}");
        }
    }

    let path = dir.join(stamped_file_name(Utc::now()));
    let file = tokio::fs::File::create(&path).await?;
    Ok((Arc::new(Mutex::new(file)), path))
}

/// Reads the tail of the `index`-th most recent log for `port`.
///
/// Returns `None` when the port has no log directory or the index is out of
/// range. Content longer than [`TAIL_LIMIT`] is cut to the trailing bytes
/// and prefixed with a truncation marker.
///
/// # Errors
///
/// Returns an error when the selected file cannot be read.
pub async fn tail(logs_root: &Path, port: u16, index: usize) -> std::io::Result<Option<LogTail>> {
    let dir = logs_root.join(port.to_string());
    if !dir.exists() {
        return Ok(None);
    }
    let Some(path) = list_logs_desc(&dir)?.into_iter().nth(index) else {
        return Ok(None);
    };
    read_tail(&path, TAIL_LIMIT).await.map(Some)
}

async fn read_tail(path: &Path, limit: u64) -> std::io::Result<LogTail> {
    let size = tokio::fs::metadata(path).await?.len();
    let mut file = tokio::fs::File::open(path).await?;

    let truncated = size > limit;
    if truncated {
        file.seek(SeekFrom::Start(size - limit)).await?;
    }
    let mut buf = Vec::with_capacity(size.min(limit) as usize);
    file.read_to_end(&mut buf).await?;

    let mut content = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        content.insert_str(0, TRUNCATION_MARKER);
    }
    Ok(LogTail {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size,
        content,
    })
}

/// Lists `*.log` files in `dir`, newest first (mtime, then name, descending).
fn list_logs_desc(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path.extension() == Some(std::ffi::OsStr::new("log"));
        if is_log && entry.file_type()?.is_file() {
            let mtime = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((mtime, path));
        }
    }
    files.sort_by(|a, b| b.cmp(a));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Stateful line-wise timestamper for a byte stream.
///
/// Buffers input until a newline, prefixes each complete line with
/// `[<RFC 3339 UTC>] `, and flushes any buffered remainder as one final
/// stamped line on [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct LineStamper {
    buf: Vec<u8>,
}

impl LineStamper {
    /// Creates an empty stamper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk and returns the stamped complete lines it yields.
    pub fn stamp(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            out.extend_from_slice(line_prefix().as_bytes());
            out.extend(self.buf.drain(..=pos));
        }
        out
    }

    /// Flushes the buffered tail, if any, as one final stamped line.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut out = line_prefix().into_bytes();
        out.append(&mut self.buf);
        out.push(b'\n');
        Some(out)
    }
}

fn line_prefix() -> String {
    format!("[{}] ", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Pumps a child output stream through a [`LineStamper`] into the shared
/// per-launch log file until EOF, then flushes the buffered tail.
pub async fn pump<R>(mut reader: R, file: LogFile)
where
    R: AsyncRead + Unpin,
{
    let mut stamper = LineStamper::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let stamped = stamper.stamp(&chunk[..n]);
                if !stamped.is_empty() {
                    let mut file = file.lock().await;
                    if file.write_all(&stamped).await.is_err() {
                        return;
                    }
                    let _ = file.flush().await;
                }
            },
        }
    }
    if let Some(tail) = stamper.finish() {
        let mut file = file.lock().await;
        let _ = file.write_all(&tail).await;
        let _ = file.flush().await;
    }
}
