//! Tracing subscriber setup with an optional asynchronous file writer.
//!
//! Formatted records are pushed onto a `BlockDeque` and drained into a
//! date-named file by a dedicated thread, so request workers never block on
//! disk. A zero queue size selects a plain synchronous writer. `RUST_LOG`
//! overrides the configured level either way.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{Datelike, Local};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::deque::BlockDeque;
use crate::error::Result;

/// Keeps the async writer alive; dropping it drains the queue, closes it
/// and joins the writer thread.
pub struct Logger {
    queue: Option<Arc<BlockDeque<Vec<u8>>>>,
    writer_thread: Option<JoinHandle<()>>,
}

pub fn init(config: &Config) -> Result<Option<Logger>> {
    if !config.open_log {
        return Ok(None);
    }
    fs::create_dir_all(&config.log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str(config.log_level)));

    if config.log_queue_size > 0 {
        let queue = Arc::new(BlockDeque::new(config.log_queue_size));
        let file = open_dated(&config.log_dir)?;
        let dir = config.log_dir.clone();

        let drain = Arc::clone(&queue);
        let writer_thread = thread::Builder::new()
            .name("mazurka-log".to_string())
            .spawn(move || writer_loop(&drain, &dir, file))?;

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(QueueWriter {
                        queue: Arc::clone(&queue),
                    }),
            )
            .try_init();

        Ok(Some(Logger {
            queue: Some(queue),
            writer_thread: Some(writer_thread),
        }))
    } else {
        let file = open_dated(&config.log_dir)?;
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init();

        Ok(Some(Logger {
            queue: None,
            writer_thread: None,
        }))
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            while !queue.is_empty() {
                queue.flush();
                thread::yield_now();
            }
            queue.close();
        }
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

fn level_str(level: u8) -> &'static str {
    match level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}

fn open_dated(dir: &Path) -> io::Result<File> {
    let name = format!("{}.log", Local::now().format("%Y_%m_%d"));
    OpenOptions::new().create(true).append(true).open(dir.join(name))
}

fn writer_loop(queue: &BlockDeque<Vec<u8>>, dir: &Path, mut file: File) {
    let mut day = Local::now().day();
    while let Some(record) = queue.pop_front() {
        let today = Local::now().day();
        if today != day {
            if let Ok(next) = open_dated(dir) {
                file = next;
                day = today;
            }
        }
        let _ = file.write_all(&record);
        if queue.is_empty() {
            let _ = file.flush();
        }
    }
    let _ = file.flush();
}

/// One formatted record per `write` call, pushed whole onto the queue.
#[derive(Clone)]
struct QueueWriter {
    queue: Arc<BlockDeque<Vec<u8>>>,
}

impl io::Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.queue.flush();
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    #[test]
    fn async_writer_drains_to_dated_file() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(BlockDeque::new(64));
        let file = open_dated(dir.path()).unwrap();
        let drain = Arc::clone(&queue);
        let dir_path = dir.path().to_path_buf();
        let handle = thread::spawn(move || writer_loop(&drain, &dir_path, file));

        queue.push_back(b"one\n".to_vec());
        queue.push_back(b"two\n".to_vec());
        while !queue.is_empty() {
            thread::yield_now();
        }
        queue.close();
        handle.join().unwrap();

        let name = format!("{}.log", Local::now().format("%Y_%m_%d"));
        let contents = fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(contents.contains("one"));
        assert!(contents.contains("two"));
    }

    #[test]
    fn level_mapping() {
        assert_eq!(level_str(0), "debug");
        assert_eq!(level_str(1), "info");
        assert_eq!(level_str(2), "warn");
        assert_eq!(level_str(3), "error");
    }
}
