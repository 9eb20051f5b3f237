use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use prost::Message;

use crate::event::EventRecord;
use crate::graph::GraphError;
use crate::masked_crc::MaskedCrc;
use crate::proto::tensorboard as pb;
use crate::tf_record::TfRecord;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("record truncated")]
    Truncated,
    #[error("length checksum mismatch: expected {expected:?}, got {actual:?}")]
    BadLengthCrc {
        expected: MaskedCrc,
        actual: MaskedCrc,
    },
    #[error("data checksum mismatch: expected {expected:?}, got {actual:?}")]
    BadDataCrc {
        expected: MaskedCrc,
        actual: MaskedCrc,
    },
    #[error("failed to decode event: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("malformed graph: {0}")]
    Graph(#[from] GraphError),
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Reads TensorBoard events from a stream of TFRecords. Any error leaves the reader positioned
/// somewhere inside the bad record; there is no attempt to resynchronize.
pub struct EventLogReader<R> {
    reader: R,
    pending: std::collections::VecDeque<EventRecord>,
}

impl EventLogReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> EventLogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Default::default(),
        }
    }

    /// Reads the next raw event, or `None` at a clean end of stream.
    pub fn read_event(&mut self) -> Result<Option<pb::Event>, ReadError> {
        match TfRecord::read(&mut self.reader)? {
            None => Ok(None),
            Some(record) => Ok(Some(pb::Event::decode(&record.data[..])?)),
        }
    }

    /// Reads the next scalar or graph record, skipping headers and event kinds this crate does
    /// not write.
    pub fn read_record(&mut self) -> Result<Option<EventRecord>, ReadError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            match self.read_event()? {
                None => return Ok(None),
                Some(event) => self.pending.extend(EventRecord::from_event(&event)?),
            }
        }
    }

    /// Reads every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<EventRecord>, ReadError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl<R: Read> Iterator for EventLogReader<R> {
    type Item = Result<EventRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}
