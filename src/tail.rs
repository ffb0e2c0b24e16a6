//! Polling tail of the daemon log.
//!
//! A [`LogCursor`] replays the whole file, then on each [`LogCursor::poll`]
//! returns only lines appended since the previous call. A shrinking file is
//! taken as truncation or rotation: the cursor reopens the path and replays
//! it from the start. Reads stop after [`BATCH_LINES`] lines; the rest is
//! picked up by the next poll. [`spawn`] drives a cursor on a timer for one
//! subscriber and drains any backlog without waiting for the timer.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Upper bound on lines read per open or poll.
pub const BATCH_LINES: usize = 256;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Error opening log file: {0}")]
    Open(io::Error),
    #[error("Error getting file info: {0}")]
    Stat(io::Error),
    #[error("Error reading log file: {0}")]
    Read(io::Error),
    #[error("Error reopening log file: {0}")]
    Reopen(io::Error),
}

impl TailError {
    /// Whether the stream has to end after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TailError::Open(_) | TailError::Reopen(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    Log(String),
    /// The file shrank; the `Log` events that follow replace everything sent before.
    Reset,
    Error(String),
}

/// Result of one poll tick.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    Idle,
    Appended(Vec<String>),
    Reset(Vec<String>),
}

#[derive(Debug)]
pub struct LogCursor {
    path: PathBuf,
    file: File,
    byte_offset: u64,
    last_known_size: u64,
    backlog: bool,
}

impl LogCursor {
    /// Opens `path` and returns the cursor with the first batch of complete
    /// lines. Further batches come from [`LogCursor::poll`].
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<String>), TailError> {
        let path = path.into();
        let mut file = File::open(&path).map_err(TailError::Open)?;
        let (lines, offset) = read_lines(&mut file, 0, BATCH_LINES).map_err(TailError::Open)?;
        let backlog = lines.len() == BATCH_LINES;
        let cursor = Self { path, file, byte_offset: offset, last_known_size: offset, backlog };
        Ok((cursor, lines))
    }

    pub fn poll(&mut self) -> Result<Poll, TailError> {
        let size = fs::metadata(&self.path).map_err(TailError::Stat)?.len();
        if size < self.last_known_size {
            return self.reset();
        }
        if size <= self.byte_offset {
            self.backlog = false;
            return Ok(Poll::Idle);
        }
        let (lines, offset) = read_lines(&mut self.file, self.byte_offset, BATCH_LINES)
            .map_err(TailError::Read)?;
        self.byte_offset = offset;
        self.last_known_size = size;
        self.backlog = lines.len() == BATCH_LINES;
        if lines.is_empty() {
            Ok(Poll::Idle)
        } else {
            Ok(Poll::Appended(lines))
        }
    }

    fn reset(&mut self) -> Result<Poll, TailError> {
        let mut file = File::open(&self.path).map_err(TailError::Reopen)?;
        let (lines, offset) = read_lines(&mut file, 0, BATCH_LINES).map_err(TailError::Reopen)?;
        self.file = file;
        self.byte_offset = offset;
        self.last_known_size = offset;
        self.backlog = lines.len() == BATCH_LINES;
        Ok(Poll::Reset(lines))
    }

    /// Whether the last read stopped at the batch limit, so more complete
    /// lines may already be waiting.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    pub fn last_known_size(&self) -> u64 {
        self.last_known_size
    }
}

/// Reads up to `limit` newline-terminated lines starting at `from`. A
/// trailing fragment without `\n` is left unread. Returns the lines and the
/// offset just past the last consumed newline.
fn read_lines(file: &mut File, from: u64, limit: usize) -> io::Result<(Vec<String>, u64)> {
    file.seek(SeekFrom::Start(from))?;
    let mut reader = BufReader::new(file);
    let mut offset = from;
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    while lines.len() < limit {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        offset += n as u64;
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        lines.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok((lines, offset))
}

/// Number of lines in the file; a final line without `\n` counts too.
pub fn count_lines(path: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for chunk in reader.split(b'\n') {
        chunk?;
        count += 1;
    }
    Ok(count)
}

/// Starts a tail task for one subscriber. The task stops once the returned
/// receiver is dropped, or after a fatal error has been delivered.
pub fn spawn(path: PathBuf, interval: Duration) -> (mpsc::Receiver<TailEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(run(path, interval, tx));
    (rx, handle)
}

async fn run(path: PathBuf, interval: Duration, tx: mpsc::Sender<TailEvent>) {
    let opened = tokio::task::spawn_blocking(move || LogCursor::open(path)).await;
    let (mut cursor, lines) = match opened {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            let _ = tx.send(TailEvent::Error(e.to_string())).await;
            return;
        }
        Err(e) => {
            warn!("log tail open task failed: {e}");
            return;
        }
    };
    debug!("tailing {} from offset {}", cursor.path().display(), cursor.byte_offset());
    if !send_lines(&tx, lines).await {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut backlog = cursor.has_backlog();

    loop {
        if backlog {
            if tx.is_closed() {
                debug!("log subscriber disconnected");
                break;
            }
        } else {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("log subscriber disconnected");
                    break;
                }
                _ = ticker.tick() => {}
            }
        }

        let polled = tokio::task::spawn_blocking(move || {
            let r = cursor.poll();
            (cursor, r)
        })
        .await;
        let result = match polled {
            Ok((c, r)) => {
                cursor = c;
                r
            }
            Err(e) => {
                warn!("log tail poll task failed: {e}");
                break;
            }
        };

        backlog = matches!(result, Ok(Poll::Appended(_) | Poll::Reset(_))) && cursor.has_backlog();
        let delivered = match result {
            Ok(Poll::Idle) => true,
            Ok(Poll::Appended(lines)) => send_lines(&tx, lines).await,
            Ok(Poll::Reset(lines)) => {
                info!("{} shrank; replaying from start", cursor.path().display());
                tx.send(TailEvent::Reset).await.is_ok() && send_lines(&tx, lines).await
            }
            Err(e) => {
                warn!("log tail: {e}");
                let fatal = e.is_fatal();
                tx.send(TailEvent::Error(e.to_string())).await.is_ok() && !fatal
            }
        };
        if !delivered {
            break;
        }
    }
}

async fn send_lines(tx: &mpsc::Sender<TailEvent>, lines: Vec<String>) -> bool {
    for line in lines {
        if tx.send(TailEvent::Log(line)).await.is_err() {
            return false;
        }
    }
    true
}
