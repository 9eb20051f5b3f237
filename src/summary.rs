use super::proto::tensorboard as pb;
use pb::summary::value::Value as InnerValue;

#[derive(Default)]
pub struct SummaryBuilder {
    summary: pb::Summary,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> pb::Summary {
        self.summary
    }

    pub fn value(mut self, value: pb::summary::Value) -> Self {
        self.summary.value.push(value);
        self
    }

    /// Adds a `simple_value` entry, which TensorBoard plots on the scalars dashboard.
    pub fn scalar(self, tag: &str, scalar: f32) -> Self {
        let mut value = pb::summary::Value::default();
        value.tag = tag.to_string();
        value.value = Some(InnerValue::SimpleValue(scalar));
        self.value(value)
    }
}

/// The `(tag, value)` pairs of every scalar entry in a summary, skipping entries of other kinds.
pub fn scalar_values(summary: &pb::Summary) -> impl Iterator<Item = (&str, f32)> {
    summary.value.iter().filter_map(|v| match v.value {
        Some(InnerValue::SimpleValue(scalar)) => Some((v.tag.as_str(), scalar)),
        None => None,
    })
}
