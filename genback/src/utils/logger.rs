//! Logging: `tracing` console output plus the per-run info/error sinks.
//!
//! A run log line is `{timestamp},{field},{field},...` with every field CSV-escaped.
//! Both sinks sit behind one lock, every line is flushed as soon as it is written and
//! mirrored to the tracing subscriber while the lock is held, so console output and
//! file output never interleave.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Info,
    Error,
}

#[derive(Default)]
struct Sinks {
    info: Option<File>,
    error: Option<File>,
}

/// Append-only info/error sinks shared by every task of a run.
pub struct RunLog {
    sinks: Mutex<Sinks>,
}

impl RunLog {
    /// A log that only mirrors to tracing.
    pub fn console() -> Self {
        Self {
            sinks: Mutex::new(Sinks::default()),
        }
    }

    /// Open (append) the given sink files. Missing parent directories are created.
    pub fn open(info: Option<&Path>, error: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            sinks: Mutex::new(Sinks {
                info: info.map(open_append).transpose()?,
                error: error.map(open_append).transpose()?,
            }),
        })
    }

    pub fn info(&self, fields: &[&str]) {
        self.write(Sink::Info, fields);
    }

    pub fn error(&self, fields: &[&str]) {
        self.write(Sink::Error, fields);
    }

    pub fn write(&self, sink: Sink, fields: &[&str]) {
        let line = format_line(&Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(), fields);
        let mut guard = match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match sink {
            Sink::Info => tracing::info!(target: "genback::run", "{}", line),
            Sink::Error => tracing::error!(target: "genback::run", "{}", line),
        }

        let file = match sink {
            Sink::Info => guard.info.as_mut(),
            Sink::Error => guard.error.as_mut(),
        };
        if let Some(file) = file {
            let result = file
                .write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.flush());
            if let Err(e) = result {
                tracing::warn!("Failed to write run log line: {}", e);
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Build one CSV record: the timestamp followed by the escaped fields.
pub fn format_line(timestamp: &str, fields: &[&str]) -> String {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let record = std::iter::once(timestamp).chain(fields.iter().copied());
    let encoded = writer
        .write_record(record)
        .map_err(|e| e.to_string())
        .and_then(|_| writer.into_inner().map_err(|e| e.to_string()));

    match encoded {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim_end_matches('\n').to_string(),
        // The csv writer only fails on I/O and writes into memory here.
        Err(_) => std::iter::once(timestamp)
            .chain(fields.iter().copied())
            .collect::<Vec<_>>()
            .join(","),
    }
}
