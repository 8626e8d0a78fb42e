use crate::cancel::CancelToken;
use crate::error::{HostError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Output,
    Error,
}

/// One complete line read from a watched log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
    pub path: PathBuf,
}

/// Follows a log file that another process appends to and emits every new
/// line exactly once, in file order.
///
/// The file is only ever opened for reading, so the writer is never blocked.
/// A trailing line without its `\n` is held back until the writer finishes it.
#[derive(Debug)]
pub struct LogWatch {
    tail: Arc<Tail>,
    poll_interval: Duration,
    create_backoff: Duration,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Tail {
    path: PathBuf,
    stream: LogStream,
    read_offset: AtomicU64,
}

impl LogWatch {
    pub fn new<P: Into<PathBuf>>(path: P, stream: LogStream) -> Self {
        Self {
            tail: Arc::new(Tail {
                path: path.into(),
                stream,
                read_offset: AtomicU64::new(0),
            }),
            poll_interval: Duration::from_millis(1000),
            create_backoff: Duration::from_millis(1000),
            stop: CancelToken::new(),
            handle: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long to wait between checks for a file that does not exist yet.
    pub fn with_create_backoff(mut self, backoff: Duration) -> Self {
        self.create_backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.tail.path
    }

    pub fn read_offset(&self) -> u64 {
        self.tail.read_offset.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts polling and returns the receiving end of a fresh channel.
    pub fn start(&mut self) -> Receiver<LogLine> {
        let (tx, rx) = mpsc::channel();
        self.start_with(tx);
        rx
    }

    /// Starts polling, delivering lines into an existing channel so several
    /// watchers can share one consumer. A running watcher is restarted.
    pub fn start_with(&mut self, tx: Sender<LogLine>) {
        if self.is_running() {
            self.stop();
        }

        let stop = CancelToken::new();
        self.stop = stop.clone();
        let tail = Arc::clone(&self.tail);
        let pacing = Pacing {
            poll_interval: self.poll_interval,
            create_backoff: self.create_backoff,
        };
        let name = format!("log-watch: {}", tail.path.display());

        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || tail.run(pacing, &tx, &stop));

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => log::warn!("Could not start watcher for {}: {e}", self.tail.path.display()),
        }
    }

    /// Signals the poll loop and waits for it to wind down. The loop notices
    /// at its next wake-up, so this returns within one sleep slice.
    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Watcher for {} panicked", self.tail.path.display());
            }
        }
    }

    /// Stops the poll loop, then reads whatever the writer appended since the
    /// last pass and sends it to `tx`. A missing file is not waited for.
    pub fn stop_and_flush(&mut self, tx: &Sender<LogLine>) {
        self.stop();
        if self.tail.path.exists() {
            self.tail.emit(tx);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pacing {
    poll_interval: Duration,
    create_backoff: Duration,
}

impl Drop for LogWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Tail {
    fn run(&self, pacing: Pacing, tx: &Sender<LogLine>, stop: &CancelToken) {
        // Give the writer a moment to create and open its log.
        if !stop.sleep(pacing.poll_interval) {
            return;
        }
        if !self.read_pass(pacing, tx, stop) {
            return;
        }

        while stop.sleep(pacing.poll_interval) {
            let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
            if len > self.read_offset.load(Ordering::SeqCst) && !self.read_pass(pacing, tx, stop) {
                return;
            }
        }
    }

    /// Returns `false` when the watcher should exit (stopped, or nobody listens).
    fn read_pass(&self, pacing: Pacing, tx: &Sender<LogLine>, stop: &CancelToken) -> bool {
        while !self.path.exists() {
            if !stop.sleep(pacing.create_backoff) {
                return false;
            }
        }
        self.emit(tx)
    }

    /// One read of the file; `false` once the receiver is gone.
    fn emit(&self, tx: &Sender<LogLine>) -> bool {
        let lines = match self.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                log::debug!("Retrying {} on next poll: {e}", self.path.display());
                return true;
            }
        };

        for text in lines {
            let line = LogLine {
                stream: self.stream,
                text,
                path: self.path.clone(),
            };
            if tx.send(line).is_err() {
                log::debug!("No subscriber left for {}", self.path.display());
                return false;
            }
        }
        true
    }

    fn read_new_lines(&self) -> Result<Vec<String>> {
        let offset = self.read_offset.load(Ordering::SeqCst);
        let mut file =
            File::open(&self.path).map_err(|_| HostError::FileUnavailable(self.path.clone()))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };

        let lines = buf[..last_newline]
            .split(|&b| b == b'\n')
            .map(|raw| {
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                String::from_utf8_lossy(raw).into_owned()
            })
            .collect();

        self.read_offset
            .store(offset + last_newline as u64 + 1, Ordering::SeqCst);
        Ok(lines)
    }
}
