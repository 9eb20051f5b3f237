use prost::Message;

use crate::graph::GraphModel;
use crate::proto::tensorboard as pb;
use crate::reader::ReadError;
use crate::summary::scalar_values;

/// A single scalar summary: one point on a plot.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: u64,
    pub value: f32,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Graph(GraphModel),
    Scalar(ScalarEvent),
}

impl EventRecord {
    /// Extracts the records carried by a TensorBoard `Event`. File version headers yield no
    /// records; a summary yields one record per scalar value it holds. Summary values of other
    /// kinds are skipped, since this crate never writes them.
    pub fn from_event(event: &pb::Event) -> Result<Vec<Self>, ReadError> {
        match &event.what {
            None | Some(pb::event::What::FileVersion(_)) => Ok(Vec::new()),
            Some(pb::event::What::GraphDef(bytes)) => {
                let graph_def = pb::GraphDef::decode(&bytes[..])?;
                let model = GraphModel::from_graph_def(&graph_def)?;
                Ok(vec![EventRecord::Graph(model)])
            }
            Some(pb::event::What::Summary(summary)) => {
                let step = u64::try_from(event.step)
                    .map_err(|_| ReadError::Malformed(format!("negative step {}", event.step)))?;
                Ok(scalar_values(summary)
                    .map(|(tag, value)| {
                        EventRecord::Scalar(ScalarEvent {
                            tag: tag.to_string(),
                            step,
                            value,
                            wall_time: event.wall_time,
                        })
                    })
                    .collect())
            }
        }
    }
}
