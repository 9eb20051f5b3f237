use std::io::{self, Write};
use std::time::SystemTime;

use prost::Message;

use crate::proto::tensorboard as pb;
use crate::tf_record::TfRecord;

/// Version string TensorBoard expects in the first event of every file.
pub const FILE_VERSION: &str = "brain.Event:2";
const WRITER: &str = "rust:paddleboard-writer";

/// Frames TensorBoard `Event`s as TFRecords onto any byte sink. This type does no buffering or
/// flushing of its own; see [`EventLogWriter`](crate::event_file::EventLogWriter) for a
/// file-backed writer that makes each event durable.
pub struct TensorboardWriter<W> {
    writer: W,
}

impl<W> TensorboardWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Seconds since the Unix epoch, as TensorBoard stores wall times.
pub fn time_f64(time: SystemTime) -> io::Result<f64> {
    Ok(time
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(io::Error::other)?
        .as_secs_f64())
}

impl<W: Write> TensorboardWriter<W> {
    /// Writes a raw TFRecord to the output stream. You may find it more convenient to use
    /// [`write_event`][Self::write_event] instead, which computes the record checksum for you.
    pub fn write_record(&mut self, record: &TfRecord) -> io::Result<()> {
        record.write(&mut self.writer)
    }

    /// Writes an `Event` to the output stream.
    pub fn write_event(&mut self, event: &pb::Event) -> io::Result<()> {
        let data = event.encode_to_vec();
        let record = TfRecord::from_data(data);
        self.write_record(&record)
    }

    /// Writes a file version header event. This reads the current system time.
    pub fn write_file_version(&mut self) -> io::Result<()> {
        let mut event = pb::Event::default();
        event.wall_time = time_f64(SystemTime::now())?;
        event.what = Some(pb::event::What::FileVersion(FILE_VERSION.to_string()));
        let mut source_metadata = pb::SourceMetadata::default();
        source_metadata.writer = WRITER.to_string();
        event.source_metadata = Some(source_metadata);
        self.write_event(&event)
    }

    /// Writes a summary to the output stream, wrapped in an `Event` with the given step and wall
    /// time (seconds since the epoch).
    pub fn write_summary(
        &mut self,
        wall_time: f64,
        step: i64,
        summary: pb::Summary,
    ) -> io::Result<()> {
        let mut event = pb::Event::default();
        event.wall_time = wall_time;
        event.step = step;
        event.what = Some(pb::event::What::Summary(summary));
        self.write_event(&event)
    }

    /// Writes a serialized graph definition, wrapped in an `Event` at step 0.
    pub fn write_graph(&mut self, wall_time: f64, graph: &pb::GraphDef) -> io::Result<()> {
        let mut event = pb::Event::default();
        event.wall_time = wall_time;
        event.what = Some(pb::event::What::GraphDef(graph.encode_to_vec()));
        self.write_event(&event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::SummaryBuilder;

    fn decode_all(mut bytes: &[u8]) -> Vec<pb::Event> {
        let mut events = Vec::new();
        while let Some(record) = TfRecord::read(&mut bytes).unwrap() {
            events.push(pb::Event::decode(&record.data[..]).unwrap());
        }
        events
    }

    #[test]
    fn test_file_version_header() {
        let mut writer = TensorboardWriter::new(Vec::new());
        writer.write_file_version().unwrap();
        let events = decode_all(&writer.into_inner());
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].what,
            Some(pb::event::What::FileVersion(FILE_VERSION.to_string()))
        );
        assert_eq!(
            events[0].source_metadata.as_ref().map(|m| m.writer.as_str()),
            Some(WRITER)
        );
        assert!(events[0].wall_time > 0.0);
    }

    #[test]
    fn test_summary_and_graph_events() {
        let mut writer = TensorboardWriter::new(Vec::new());
        let summary = SummaryBuilder::new().scalar("cost", 0.75).build();
        writer.write_summary(1234.5, 7, summary.clone()).unwrap();
        let mut graph = pb::GraphDef::default();
        graph.node.push(pb::NodeDef {
            name: "x".to_string(),
            op: "Placeholder".to_string(),
            ..Default::default()
        });
        writer.write_graph(1235.0, &graph).unwrap();

        let events = decode_all(writer.get_ref());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].wall_time, 1234.5);
        assert_eq!(events[0].step, 7);
        assert_eq!(events[0].what, Some(pb::event::What::Summary(summary)));
        match &events[1].what {
            Some(pb::event::What::GraphDef(bytes)) => {
                assert_eq!(pb::GraphDef::decode(&bytes[..]).unwrap(), graph)
            }
            other => panic!("expected graph event, got {:?}", other),
        }
    }

    #[test]
    fn test_time_before_epoch() {
        let before = std::time::UNIX_EPOCH - std::time::Duration::from_secs(1);
        assert!(time_f64(before).is_err());
    }
}
