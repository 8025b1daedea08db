//! One append-only line writer per destination file.
//!
//! Each writer owns an unbounded queue and a task that pulls one line at a time
//! and appends it to its file. A failing append is retried under the writer's
//! [`RetryPolicy`]; once the attempts are used up the line is dropped and an
//! [`GpibError::OutputIo`] is reported. Cancellation stops the task without
//! draining the queue.

use crate::error::GpibError;
use crate::error_recovery::RetryPolicy;
use crate::messages::ErrorSink;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Secondary live sink receiving every line a writer handles.
#[derive(Clone, Debug, Default)]
pub enum Mirror {
    /// No mirroring
    #[default]
    None,
    /// Print each line to stdout
    Stdout,
    /// Forward each line to a channel
    Channel(mpsc::UnboundedSender<String>),
}

impl Mirror {
    fn send(&self, line: &str) {
        match self {
            Mirror::None => {}
            Mirror::Stdout => println!("{line}"),
            Mirror::Channel(tx) => {
                let _ = tx.send(line.to_string());
            }
        }
    }
}

/// How a writer appends.
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Attempts and delay per line
    pub policy: RetryPolicy,
    /// Flush the file after every line
    pub flush_each_line: bool,
    /// Live sink
    pub mirror: Mirror,
}

/// Handle to a running writer task.
#[derive(Debug)]
pub struct LineWriter {
    path: PathBuf,
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl LineWriter {
    /// Start a writer appending to `path`, stopped by `cancel`.
    pub fn spawn(
        path: PathBuf,
        options: WriterOptions,
        errors: ErrorSink,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            path: path.clone(),
            options,
            errors,
            file: None,
        };
        let task = tokio::spawn(worker.run(rx, cancel));
        debug!("Started writer for '{}'", path.display());
        Self { path, tx, task }
    }

    /// Destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a line. Returns `false` once the writer has stopped.
    pub fn enqueue(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    /// Close the queue and wait for the task to exit. Queued lines are still
    /// written unless the writer was cancelled.
    pub async fn join(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

struct Worker {
    path: PathBuf,
    options: WriterOptions,
    errors: ErrorSink,
    file: Option<File>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>, cancel: CancellationToken) {
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            self.write(line).await;
        }

        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        info!("Writer for '{}' stopped", self.path.display());
    }

    async fn write(&mut self, line: String) {
        self.options.mirror.send(&line);

        let mut handle = self.file.take();
        let path = self.path.as_path();
        let flush = self.options.flush_each_line;
        let line = line.as_str();
        let result = self
            .options
            .policy
            .run(|_| {
                let file = handle.take();
                async move { append_line(file, path, line, flush).await }
            })
            .await;

        match result {
            Ok(file) => self.file = Some(file),
            Err((source, attempts)) => {
                let path = self.path.display().to_string();
                let err = GpibError::OutputIo {
                    path: path.clone(),
                    attempts,
                    source,
                };
                self.errors.report(&path, &err, Some(line));
            }
        }
    }
}

/// Append one line, reopening the file when no handle is held.
async fn append_line(file: Option<File>, path: &Path, line: &str, flush: bool) -> io::Result<File> {
    let mut file = match file {
        Some(file) => file,
        None => open_append(path).await?,
    };
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    if flush {
        file.flush().await?;
    }
    Ok(file)
}

async fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(mirror: Mirror) -> WriterOptions {
        WriterOptions {
            policy: RetryPolicy::new(2, Duration::from_millis(1)),
            flush_each_line: true,
            mirror,
        }
    }

    #[tokio::test]
    async fn appends_lines_and_mirrors_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        let (mirror_tx, mut mirror_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = LineWriter::spawn(
            path.clone(),
            options(Mirror::Channel(mirror_tx)),
            ErrorSink::discard(),
            cancel.clone(),
        );

        assert!(writer.enqueue("a;1".into()));
        assert!(writer.enqueue("b;2".into()));
        assert_eq!(mirror_rx.recv().await.unwrap(), "a;1");
        assert_eq!(mirror_rx.recv().await.unwrap(), "b;2");

        // closing the queue lets the task finish what it already pulled
        writer.join().await;
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "a;1\nb;2\n");
    }

    #[tokio::test]
    async fn unwritable_destination_reports_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (errors, mut rx) = ErrorSink::channel();
        let cancel = CancellationToken::new();
        // a directory cannot be opened for appending
        let writer = LineWriter::spawn(
            dir.path().to_path_buf(),
            options(Mirror::None),
            errors,
            cancel.clone(),
        );

        writer.enqueue("lost".into());
        let report = rx.recv().await.unwrap();
        assert!(report.error.contains("after 2 attempts"));
        assert_eq!(report.context.as_deref(), Some("lost"));

        cancel.cancel();
        writer.join().await;
    }
}
