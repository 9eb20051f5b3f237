use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use log::{debug, trace};

use crate::event::{EventRecord, ScalarEvent};
use crate::graph::GraphModel;
use crate::summary::SummaryBuilder;
use crate::writer::{time_f64, TensorboardWriter};

/// Disambiguates files created by one process within the same second.
static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterOptions {
    /// Appended verbatim to the generated file name.
    pub filename_suffix: String,
    /// Also `fsync` after every append, so records survive a machine crash and not just a
    /// process crash.
    pub sync_on_append: bool,
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.filename_suffix = suffix.into();
        self
    }

    pub fn sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }
}

/// Appends [`EventRecord`]s to a single event file. Every append reaches the operating system
/// before it returns.
///
/// Only one writer may own a given file. Two writers appending to the same path (from this or
/// another process) will interleave records unpredictably; nothing guards against it.
pub struct EventLogWriter {
    writer: TensorboardWriter<File>,
    path: PathBuf,
    sync_on_append: bool,
}

impl EventLogWriter {
    /// Creates `dir` (and any missing parents), opens a fresh event file inside it, and writes
    /// the file version header.
    pub fn create<P: AsRef<Path>>(dir: P, options: &WriterOptions) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let secs = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(io::Error::other)?
            .as_secs();
        let host = hostname::get()?;
        // The `tfevents` infix is how TensorBoard finds event files.
        let file_name = format!(
            "events.out.tfevents.{}.{}.{}.{}{}",
            secs,
            host.to_string_lossy(),
            std::process::id(),
            FILE_COUNTER.fetch_add(1, Ordering::Relaxed),
            options.filename_suffix,
        );
        let path = dir.join(file_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("opened event file {}", path.display());

        let mut writer = Self {
            writer: TensorboardWriter::new(file),
            path,
            sync_on_append: options.sync_on_append,
        };
        writer.writer.write_file_version()?;
        writer.flush()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes and appends one record.
    pub fn append(&mut self, record: &EventRecord) -> io::Result<()> {
        match record {
            EventRecord::Scalar(scalar) => self.append_scalar(scalar),
            EventRecord::Graph(model) => self.append_graph(model),
        }
    }

    pub fn append_scalar(&mut self, scalar: &ScalarEvent) -> io::Result<()> {
        let step = i64::try_from(scalar.step).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("step {} does not fit in an int64", scalar.step),
            )
        })?;
        let summary = SummaryBuilder::new()
            .scalar(&scalar.tag, scalar.value)
            .build();
        self.writer.write_summary(scalar.wall_time, step, summary)?;
        trace!(
            "appended scalar {}={} at step {} to {}",
            scalar.tag,
            scalar.value,
            scalar.step,
            self.path.display()
        );
        self.flush()
    }

    /// Appends a graph, stamped with the current time.
    pub fn append_graph(&mut self, model: &GraphModel) -> io::Result<()> {
        let now = time_f64(SystemTime::now())?;
        self.writer.write_graph(now, &model.to_graph_def())?;
        trace!(
            "appended graph with {} nodes to {}",
            model.len(),
            self.path.display()
        );
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.get_mut().flush()?;
        if self.sync_on_append {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flushes file data and metadata to disk and releases the file.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.get_mut().flush()?;
        self.writer.get_ref().sync_all()?;
        debug!("closed event file {}", self.path.display());
        Ok(())
    }
}
