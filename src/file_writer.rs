use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::warn;

use crate::event::ScalarEvent;
use crate::event_file::{EventLogWriter, WriterOptions};
use crate::graph::GraphModel;
use crate::writer::time_f64;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("writer is closed")]
    Closed,
    #[error("scalar tag must not be empty")]
    EmptyTag,
    #[error("step {0} is larger than the largest step an event can hold")]
    StepOutOfRange(u64),
}

/// `<base>/<YYYYmmddHHMMSS>/<role>`, stamped with the current local time. This is the layout
/// TensorBoard shows as one run per timestamp, with e.g. `train` and `test` side by side.
pub fn run_dir<P: AsRef<Path>>(base: P, role: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    base.as_ref().join(stamp).join(role)
}

/// Writes scalar summaries and graphs for a training run to a fresh event file under
/// `log_dir`.
///
/// A `FileWriter` is either open or closed. It starts open; [`close`](Self::close) (or dropping
/// it) closes it for good, and every later call returns [`WriteError::Closed`] without touching
/// the file. Calls block until the record has been handed to the operating system.
pub struct FileWriter {
    log_dir: PathBuf,
    inner: Option<EventLogWriter>,
}

impl FileWriter {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self, WriteError> {
        Self::with_options(log_dir, WriterOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(
        log_dir: P,
        options: WriterOptions,
    ) -> Result<Self, WriteError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        let inner = EventLogWriter::create(&log_dir, &options)?;
        Ok(Self {
            log_dir,
            inner: Some(inner),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of the event file, while the writer is open.
    pub fn log_path(&self) -> Option<&Path> {
        self.inner.as_ref().map(EventLogWriter::path)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn open_writer(&mut self) -> Result<&mut EventLogWriter, WriteError> {
        self.inner.as_mut().ok_or(WriteError::Closed)
    }

    /// Logs `value` under `tag` at `step`, stamped with the current time.
    pub fn write(&mut self, tag: &str, value: f32, step: u64) -> Result<(), WriteError> {
        let writer = self.open_writer()?;
        if tag.is_empty() {
            return Err(WriteError::EmptyTag);
        }
        if i64::try_from(step).is_err() {
            return Err(WriteError::StepOutOfRange(step));
        }
        writer.append_scalar(&ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: time_f64(SystemTime::now())?,
        })?;
        Ok(())
    }

    /// Logs a graph. Usually called once per run, but each call appends a complete graph.
    pub fn write_graph(&mut self, model: &GraphModel) -> Result<(), WriteError> {
        let writer = self.open_writer()?;
        writer.append_graph(model)?;
        Ok(())
    }

    /// Syncs the event file to disk and closes the writer.
    pub fn close(&mut self) -> Result<(), WriteError> {
        let writer = self.inner.take().ok_or(WriteError::Closed)?;
        writer.close()?;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.inner.take() {
            let path = writer.path().to_path_buf();
            if let Err(e) = writer.close() {
                warn!("failed to close event file {}: {}", path.display(), e);
            }
        }
    }
}
