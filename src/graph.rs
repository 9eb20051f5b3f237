//! A framework-independent directed graph of typed nodes, and its mapping to and from
//! TensorFlow's `GraphDef` wire format.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::proto::tensorboard as pb;
use pb::attr_value::{ListValue, Value as PbValue};

/// Sentinel for a dimension whose extent is not known (e.g. the batch dimension).
pub const UNKNOWN_DIM: i64 = -1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node has an empty identifier")]
    EmptyId,
    #[error("duplicate node identifier {0:?}")]
    DuplicateNode(String),
    #[error("node {0:?} lists itself as an input")]
    SelfLoop(String),
    #[error("node {node:?} has input {input:?}, which is not an earlier node")]
    DanglingInput { node: String, input: String },
    #[error("attribute {attr:?} on node {node:?} has no supported value")]
    UnsupportedAttr { node: String, attr: String },
    #[error("attribute {attr:?} on node {node:?} holds invalid UTF-8")]
    InvalidUtf8 { node: String, attr: String },
}

/// Element type of a tensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    BFloat16,
    Float32,
    Float64,
    String,
}

impl DType {
    pub fn to_proto(self) -> pb::DataType {
        use pb::DataType as D;
        match self {
            DType::Bool => D::DtBool,
            DType::Int8 => D::DtInt8,
            DType::Int16 => D::DtInt16,
            DType::Int32 => D::DtInt32,
            DType::Int64 => D::DtInt64,
            DType::UInt8 => D::DtUint8,
            DType::UInt16 => D::DtUint16,
            DType::UInt32 => D::DtUint32,
            DType::UInt64 => D::DtUint64,
            DType::Float16 => D::DtHalf,
            DType::BFloat16 => D::DtBfloat16,
            DType::Float32 => D::DtFloat,
            DType::Float64 => D::DtDouble,
            DType::String => D::DtString,
        }
    }

    pub fn from_proto(dtype: pb::DataType) -> Option<Self> {
        use pb::DataType as D;
        Some(match dtype {
            D::DtBool => DType::Bool,
            D::DtInt8 => DType::Int8,
            D::DtInt16 => DType::Int16,
            D::DtInt32 => DType::Int32,
            D::DtInt64 => DType::Int64,
            D::DtUint8 => DType::UInt8,
            D::DtUint16 => DType::UInt16,
            D::DtUint32 => DType::UInt32,
            D::DtUint64 => DType::UInt64,
            D::DtHalf => DType::Float16,
            D::DtBfloat16 => DType::BFloat16,
            D::DtFloat => DType::Float32,
            D::DtDouble => DType::Float64,
            D::DtString => DType::String,
            D::DtInvalid | D::DtComplex64 | D::DtComplex128 => return None,
        })
    }

    fn from_proto_i32(raw: i32) -> Option<Self> {
        pb::DataType::from_i32(raw).and_then(Self::from_proto)
    }
}

/// A tensor shape. Negative extents are normalized to [`UNKNOWN_DIM`]; the rank itself may also
/// be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Option<Vec<i64>>);

impl Shape {
    pub fn new<I: IntoIterator<Item = i64>>(dims: I) -> Self {
        Shape(Some(
            dims.into_iter()
                .map(|d| if d < 0 { UNKNOWN_DIM } else { d })
                .collect(),
        ))
    }

    pub fn unknown_rank() -> Self {
        Shape(None)
    }

    /// The dimensions, or `None` if the rank is unknown.
    pub fn dims(&self) -> Option<&[i64]> {
        self.0.as_deref()
    }

    fn to_proto(&self) -> pb::TensorShapeProto {
        let mut proto = pb::TensorShapeProto::default();
        match &self.0 {
            None => proto.unknown_rank = true,
            Some(dims) => {
                proto.dim = dims
                    .iter()
                    .map(|&size| pb::tensor_shape_proto::Dim {
                        size,
                        name: String::new(),
                    })
                    .collect();
            }
        }
        proto
    }

    fn from_proto(proto: &pb::TensorShapeProto) -> Self {
        if proto.unknown_rank {
            Shape::unknown_rank()
        } else {
            Shape::new(proto.dim.iter().map(|d| d.size))
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0 {
            None => f.write_str("<unknown>"),
            Some(dims) => {
                f.write_str("[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if *d == UNKNOWN_DIM {
                        f.write_str("?")?;
                    } else {
                        write!(f, "{}", d)?;
                    }
                }
                f.write_str("]")
            }
        }
    }
}

/// A typed attribute value. An empty list carries no element type on the wire; it is always
/// represented as `Ints(vec![])`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    String(String),
    Bool(bool),
    Shape(Shape),
    DType(DType),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Bools(Vec<bool>),
    Shapes(Vec<Shape>),
    DTypes(Vec<DType>),
}

impl AttrValue {
    fn is_empty_list(&self) -> bool {
        match self {
            AttrValue::Ints(xs) => xs.is_empty(),
            AttrValue::Floats(xs) => xs.is_empty(),
            AttrValue::Strings(xs) => xs.is_empty(),
            AttrValue::Bools(xs) => xs.is_empty(),
            AttrValue::Shapes(xs) => xs.is_empty(),
            AttrValue::DTypes(xs) => xs.is_empty(),
            _ => false,
        }
    }

    fn to_proto(&self) -> pb::AttrValue {
        let value = match self {
            AttrValue::Int(i) => PbValue::I(*i),
            AttrValue::Float(f) => PbValue::F(*f),
            AttrValue::String(s) => PbValue::S(s.as_bytes().to_vec()),
            AttrValue::Bool(b) => PbValue::B(*b),
            AttrValue::Shape(shape) => PbValue::Shape(shape.to_proto()),
            AttrValue::DType(dtype) => PbValue::Type(dtype.to_proto() as i32),
            AttrValue::Ints(xs) => PbValue::List(ListValue {
                i: xs.clone(),
                ..Default::default()
            }),
            AttrValue::Floats(xs) => PbValue::List(ListValue {
                f: xs.clone(),
                ..Default::default()
            }),
            AttrValue::Strings(xs) => PbValue::List(ListValue {
                s: xs.iter().map(|s| s.as_bytes().to_vec()).collect(),
                ..Default::default()
            }),
            AttrValue::Bools(xs) => PbValue::List(ListValue {
                b: xs.clone(),
                ..Default::default()
            }),
            AttrValue::Shapes(xs) => PbValue::List(ListValue {
                shape: xs.iter().map(Shape::to_proto).collect(),
                ..Default::default()
            }),
            AttrValue::DTypes(xs) => PbValue::List(ListValue {
                r#type: xs.iter().map(|d| d.to_proto() as i32).collect(),
                ..Default::default()
            }),
        };
        pb::AttrValue { value: Some(value) }
    }

    fn from_proto(node: &str, name: &str, proto: &pb::AttrValue) -> Result<Self, GraphError> {
        let unsupported = || GraphError::UnsupportedAttr {
            node: node.to_string(),
            attr: name.to_string(),
        };
        let utf8 = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec()).map_err(|_| GraphError::InvalidUtf8 {
                node: node.to_string(),
                attr: name.to_string(),
            })
        };
        Ok(match proto.value.as_ref().ok_or_else(unsupported)? {
            PbValue::I(i) => AttrValue::Int(*i),
            PbValue::F(f) => AttrValue::Float(*f),
            PbValue::S(s) => AttrValue::String(utf8(s.as_slice())?),
            PbValue::B(b) => AttrValue::Bool(*b),
            PbValue::Shape(shape) => AttrValue::Shape(Shape::from_proto(shape)),
            PbValue::Type(t) => AttrValue::DType(DType::from_proto_i32(*t).ok_or_else(unsupported)?),
            PbValue::List(lv) => {
                if !lv.f.is_empty() {
                    AttrValue::Floats(lv.f.clone())
                } else if !lv.s.is_empty() {
                    AttrValue::Strings(
                        lv.s.iter()
                            .map(|s| utf8(s.as_slice()))
                            .collect::<Result<_, _>>()?,
                    )
                } else if !lv.b.is_empty() {
                    AttrValue::Bools(lv.b.clone())
                } else if !lv.shape.is_empty() {
                    AttrValue::Shapes(lv.shape.iter().map(Shape::from_proto).collect())
                } else if !lv.r#type.is_empty() {
                    AttrValue::DTypes(
                        lv.r#type
                            .iter()
                            .map(|&t| DType::from_proto_i32(t).ok_or_else(unsupported))
                            .collect::<Result<_, _>>()?,
                    )
                } else {
                    AttrValue::Ints(lv.i.clone())
                }
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub op: String,
    /// Identifiers of input nodes, in argument order.
    pub inputs: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn input(mut self, id: impl Into<String>) -> Self {
        self.inputs.push(id.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    fn to_proto(&self) -> pb::NodeDef {
        let mut node = pb::NodeDef::default();
        node.name = self.id.clone();
        node.op = self.op.clone();
        node.input = self.inputs.clone();
        node.attr = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_proto()))
            .collect();
        node
    }

    fn from_proto(proto: &pb::NodeDef) -> Result<Self, GraphError> {
        let mut attrs = BTreeMap::new();
        for (k, v) in &proto.attr {
            attrs.insert(k.clone(), AttrValue::from_proto(&proto.name, k, v)?);
        }
        Ok(Self {
            id: proto.name.clone(),
            op: proto.op.clone(),
            inputs: proto.input.clone(),
            attrs,
        })
    }
}

/// An ordered graph. Nodes can only be added after all of their inputs, so the node order is
/// always a valid topological order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphModel {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node, checking that its identifier is fresh and that every input names an
    /// existing node other than itself. Empty list attributes of any kind are stored as
    /// `Ints(vec![])`.
    pub fn push(&mut self, mut node: Node) -> Result<(), GraphError> {
        if node.id.is_empty() {
            return Err(GraphError::EmptyId);
        }
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        for input in &node.inputs {
            if *input == node.id {
                return Err(GraphError::SelfLoop(node.id));
            }
            if !self.index.contains_key(input) {
                return Err(GraphError::DanglingInput {
                    node: node.id,
                    input: input.clone(),
                });
            }
        }
        for value in node.attrs.values_mut() {
            if value.is_empty_list() {
                *value = AttrValue::Ints(Vec::new());
            }
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Position of a node in definition order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn to_graph_def(&self) -> pb::GraphDef {
        let mut graph = pb::GraphDef::default();
        graph.node = self.nodes.iter().map(Node::to_proto).collect();
        graph
    }

    /// Rebuilds a model from a `GraphDef`, re-checking every structural invariant.
    pub fn from_graph_def(graph: &pb::GraphDef) -> Result<Self, GraphError> {
        let mut model = Self::new();
        for node in &graph.node {
            model.push(Node::from_proto(node)?)?;
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_graph() -> GraphModel {
        let mut g = GraphModel::new();
        g.push(
            Node::new("x", "Placeholder")
                .attr("shape", AttrValue::Shape(Shape::new([-1, 784])))
                .attr("dtype", AttrValue::DType(DType::Float32)),
        )
        .unwrap();
        g.push(Node::new("w", "VariableV2")).unwrap();
        g.push(
            Node::new("y", "mul")
                .input("x")
                .input("w")
                .attr("x_num_col_dims", AttrValue::Int(1))
                .attr("scale", AttrValue::Float(0.5))
                .attr("strides", AttrValue::Ints(vec![1, 1]))
                .attr("names", AttrValue::Strings(vec!["a".into(), "b".into()]))
                .attr("use_cudnn", AttrValue::Bool(true))
                .attr(
                    "_output_shapes",
                    AttrValue::Shapes(vec![Shape::new([-1, 10]), Shape::unknown_rank()]),
                ),
        )
        .unwrap();
        g
    }

    #[test]
    fn test_push_rejects_duplicates() {
        let mut g = small_graph();
        assert_eq!(
            g.push(Node::new("x", "Placeholder")),
            Err(GraphError::DuplicateNode("x".into()))
        );
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_push_rejects_self_loop() {
        let mut g = small_graph();
        assert_eq!(
            g.push(Node::new("z", "relu").input("z")),
            Err(GraphError::SelfLoop("z".into()))
        );
    }

    #[test]
    fn test_push_rejects_dangling_input() {
        let mut g = small_graph();
        assert_eq!(
            g.push(Node::new("z", "relu").input("nope")),
            Err(GraphError::DanglingInput {
                node: "z".into(),
                input: "nope".into()
            })
        );
        assert!(!g.contains("z"));
    }

    #[test]
    fn test_push_rejects_empty_id() {
        assert_eq!(
            GraphModel::new().push(Node::new("", "relu")),
            Err(GraphError::EmptyId)
        );
    }

    #[test]
    fn test_graph_def_roundtrip() {
        let g = small_graph();
        let def = g.to_graph_def();
        assert_eq!(def.node.len(), 3);
        assert_eq!(def.node[2].input, vec!["x".to_string(), "w".to_string()]);
        assert_eq!(GraphModel::from_graph_def(&def).unwrap(), g);
    }

    #[test]
    fn test_shape_normalizes_unknown_dims() {
        let shape = Shape::new([-1, 1, 28, -7]);
        assert_eq!(shape.dims(), Some(&[-1, 1, 28, -1][..]));
        assert_eq!(shape.to_string(), "[?, 1, 28, ?]");
        assert_eq!(Shape::unknown_rank().dims(), None);
    }

    #[test]
    fn test_empty_list_decodes_as_ints() {
        let proto = AttrValue::Strings(vec![]).to_proto();
        assert_eq!(
            AttrValue::from_proto("n", "a", &proto).unwrap(),
            AttrValue::Ints(vec![])
        );
    }

    #[test]
    fn test_empty_lists_survive_event_file() {
        use crate::event::EventRecord;
        use crate::event_file::{EventLogWriter, WriterOptions};
        use crate::reader::EventLogReader;

        let empties = [
            AttrValue::Ints(vec![]),
            AttrValue::Floats(vec![]),
            AttrValue::Strings(vec![]),
            AttrValue::Bools(vec![]),
            AttrValue::Shapes(vec![]),
            AttrValue::DTypes(vec![]),
        ];
        let mut node = Node::new("x", "Placeholder");
        for (i, empty) in empties.iter().enumerate() {
            node = node.attr(format!("list_{}", i), empty.clone());
        }
        let mut g = GraphModel::new();
        g.push(node).unwrap();
        assert!(g.get("x").unwrap().attrs.values().all(|v| *v == AttrValue::Ints(vec![])));

        let tmp = tempfile::tempdir().unwrap();
        let mut writer = EventLogWriter::create(tmp.path(), &WriterOptions::new()).unwrap();
        writer.append_graph(&g).unwrap();
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        let records = EventLogReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records, vec![EventRecord::Graph(g)]);
    }

    #[test]
    fn test_unsupported_dtype() {
        let proto = pb::AttrValue {
            value: Some(PbValue::Type(pb::DataType::DtComplex64 as i32)),
        };
        assert_eq!(
            AttrValue::from_proto("n", "dtype", &proto),
            Err(GraphError::UnsupportedAttr {
                node: "n".into(),
                attr: "dtype".into()
            })
        );
    }
}
