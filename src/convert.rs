//! Conversion of a framework [`Program`] into a [`GraphModel`] suitable for TensorBoard's graph
//! view.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::graph::{AttrValue, DType, GraphError, GraphModel, Node, Shape};
use crate::program::{Program, SourceAttr, VarDesc, VarType};

/// Op type given to leaf nodes for non-persistable inputs (data fed from outside).
pub const PLACEHOLDER_OP: &str = "Placeholder";
/// Op type given to leaf nodes for persistable inputs (parameters, optimizer state).
pub const VARIABLE_OP: &str = "VariableV2";
/// Attribute listing the shapes of an op's outputs, which TensorBoard uses to label edges.
pub const OUTPUT_SHAPES_ATTR: &str = "_output_shapes";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConversionError {
    #[error(
        "op #{op_index} ({op_type}) in block {block} reads {name:?}, \
         which is neither declared as an input nor produced by an earlier op"
    )]
    UndefinedInput {
        block: usize,
        op_index: usize,
        op_type: String,
        name: String,
    },
    #[error("variable {name:?} has data type {dtype:?}, which has no graph counterpart")]
    UnknownDType { name: String, dtype: VarType },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn to_dtype(var_type: VarType) -> Option<DType> {
    Some(match var_type {
        VarType::Bool => DType::Bool,
        VarType::Int8 => DType::Int8,
        VarType::Int16 => DType::Int16,
        VarType::Int32 => DType::Int32,
        VarType::Int64 => DType::Int64,
        VarType::Uint8 => DType::UInt8,
        VarType::Fp16 => DType::Float16,
        VarType::Bf16 => DType::BFloat16,
        VarType::Fp32 => DType::Float32,
        VarType::Fp64 => DType::Float64,
        VarType::SizeT => return None,
    })
}

/// Attribute names whose integer values are framework data type codes.
fn is_dtype_attr(name: &str) -> bool {
    name == "dtype" || name.ends_with("_dtype")
}

/// Sorts a framework attribute into one of the graph's attribute kinds. An empty list of any
/// kind becomes `Ints(vec![])`, which is how it reads back from the wire.
pub fn classify_attr(name: &str, attr: &SourceAttr) -> AttrValue {
    let dtype_code = |code: i64| {
        if !is_dtype_attr(name) {
            return None;
        }
        VarType::from_code(code).and_then(to_dtype)
    };
    match attr {
        SourceAttr::Int(i) => match dtype_code(*i as i64) {
            Some(dtype) => AttrValue::DType(dtype),
            None => AttrValue::Int(*i as i64),
        },
        SourceAttr::Long(l) => match dtype_code(*l) {
            Some(dtype) => AttrValue::DType(dtype),
            None => AttrValue::Int(*l),
        },
        SourceAttr::Float(f) => AttrValue::Float(*f),
        SourceAttr::String(s) => AttrValue::String(s.clone()),
        SourceAttr::Boolean(b) => AttrValue::Bool(*b),
        SourceAttr::Block(idx) => AttrValue::Int(*idx as i64),
        SourceAttr::Ints(xs) if name == "shape" => {
            AttrValue::Shape(Shape::new(xs.iter().map(|&x| x as i64)))
        }
        SourceAttr::Longs(xs) if name == "shape" => AttrValue::Shape(Shape::new(xs.iter().copied())),
        SourceAttr::Ints(xs) => AttrValue::Ints(xs.iter().map(|&x| x as i64).collect()),
        SourceAttr::Longs(xs) => AttrValue::Ints(xs.clone()),
        SourceAttr::Floats(xs) if xs.is_empty() => AttrValue::Ints(Vec::new()),
        SourceAttr::Floats(xs) => AttrValue::Floats(xs.clone()),
        SourceAttr::Strings(xs) if xs.is_empty() => AttrValue::Ints(Vec::new()),
        SourceAttr::Strings(xs) => AttrValue::Strings(xs.clone()),
        SourceAttr::Booleans(xs) if xs.is_empty() => AttrValue::Ints(Vec::new()),
        SourceAttr::Booleans(xs) => AttrValue::Bools(xs.clone()),
    }
}

fn var_shape(var: &VarDesc) -> Shape {
    match &var.shape {
        Some(dims) => Shape::new(dims.iter().copied()),
        None => Shape::unknown_rank(),
    }
}

fn leaf_node(var: &VarDesc) -> Result<Node, ConversionError> {
    let op = if var.persistable {
        VARIABLE_OP
    } else {
        PLACEHOLDER_OP
    };
    let mut node = Node::new(var.name.as_str(), op);
    if var.shape.is_some() {
        node = node.attr("shape", AttrValue::Shape(var_shape(var)));
    }
    if let Some(var_type) = var.dtype {
        let dtype = to_dtype(var_type).ok_or_else(|| ConversionError::UnknownDType {
            name: var.name.clone(),
            dtype: var_type,
        })?;
        node = node.attr("dtype", AttrValue::DType(dtype));
    }
    Ok(node)
}

/// Walks every op in block order and returns the input variables that must become leaf nodes,
/// in order of first use. An input is a leaf when it is declared and either nothing produces it
/// or it is persistable (optimizer ops write parameters back in place, after their readers).
fn find_leaves(program: &Program) -> Result<Vec<&VarDesc>, ConversionError> {
    let produced_anywhere: HashSet<&str> = program
        .blocks()
        .iter()
        .flat_map(|b| b.ops.iter())
        .flat_map(|op| op.output_args())
        .collect();

    let mut produced_so_far: HashSet<&str> = HashSet::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut leaves = Vec::new();
    for block in program.blocks() {
        for (op_index, op) in block.ops.iter().enumerate() {
            for name in op.input_args() {
                if produced_so_far.contains(name) || seen.contains(name) {
                    continue;
                }
                let var = program
                    .find_var(block.idx, name)
                    .filter(|var| var.persistable || !produced_anywhere.contains(name))
                    .ok_or_else(|| ConversionError::UndefinedInput {
                        block: block.idx,
                        op_index,
                        op_type: op.op_type.clone(),
                        name: name.to_string(),
                    })?;
                seen.insert(name);
                leaves.push(var);
            }
            produced_so_far.extend(op.output_args());
        }
    }
    Ok(leaves)
}

/// Picks `base`, or `base_1`, `base_2`, ... if that identifier is already in the graph.
fn unique_id(graph: &GraphModel, base: &str) -> String {
    if !graph.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|id| !graph.contains(id))
        .unwrap_or_else(|| base.to_string())
}

/// Converts a program to a graph: one node per leaf input variable, then one node per op in
/// block order. An op's node is named after its primary output variable, and its inputs are the
/// nodes that most recently produced each of its input variables.
///
/// The program must list ops in dependency order; reading a non-persistable variable before the
/// op that produces it is an error, as is reading a variable that is never declared.
pub fn convert(program: &Program) -> Result<GraphModel, ConversionError> {
    let leaves = find_leaves(program)?;

    let mut graph = GraphModel::new();
    // Variable name -> identifier of the node currently holding its value.
    let mut bindings: HashMap<&str, String> = HashMap::new();
    for var in &leaves {
        graph.push(leaf_node(var)?)?;
        bindings.insert(var.name.as_str(), var.name.clone());
    }

    let mut ordinal = 0;
    for block in program.blocks() {
        for (op_index, op) in block.ops.iter().enumerate() {
            let base = match op.primary_output() {
                Some(name) => name.to_string(),
                None => format!("{}_{}", op.op_type, ordinal),
            };
            let id = unique_id(&graph, &base);

            let mut node = Node::new(id.as_str(), op.op_type.as_str());
            for name in op.input_args() {
                let input = bindings
                    .get(name)
                    .ok_or_else(|| ConversionError::UndefinedInput {
                        block: block.idx,
                        op_index,
                        op_type: op.op_type.clone(),
                        name: name.to_string(),
                    })?;
                node = node.input(input.as_str());
            }
            for (name, attr) in &op.attrs {
                node = node.attr(name.as_str(), classify_attr(name, attr));
            }
            let output_shapes: Vec<Shape> = op
                .output_args()
                .map(|name| match program.find_var(block.idx, name) {
                    Some(var) => var_shape(var),
                    None => Shape::unknown_rank(),
                })
                .collect();
            if !output_shapes.is_empty() {
                node = node.attr(OUTPUT_SHAPES_ATTR, AttrValue::Shapes(output_shapes));
            }
            graph.push(node)?;

            for name in op.output_args() {
                bindings.insert(name, id.clone());
            }
            ordinal += 1;
        }
    }

    debug!(
        "converted program to graph: {} leaves, {} ops, {} nodes",
        leaves.len(),
        ordinal,
        graph.len()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{OpDesc, VarKind};

    /// `pixel -> conv2d -> relu -> fc -> mean`, plus an in-place SGD update of the filter.
    fn small_program() -> Program {
        let mut program = Program::new();
        let block = program.global_block_mut();
        block
            .add_var(VarDesc::tensor("pixel", vec![-1, 1, 28, 28], VarType::Fp32))
            .add_var(VarDesc::parameter("conv.w", vec![20, 1, 5, 5], VarType::Fp32))
            .add_var(VarDesc::tensor("conv.out", vec![-1, 20, 24, 24], VarType::Fp32))
            .add_var(VarDesc::tensor("relu.out", vec![-1, 20, 24, 24], VarType::Fp32))
            .add_var(VarDesc::parameter("fc.w", vec![11520, 10], VarType::Fp32))
            .add_var(VarDesc::tensor("fc.out", vec![-1, 10], VarType::Fp32))
            .add_var(VarDesc::tensor("loss", vec![1], VarType::Fp32))
            .add_var(VarDesc::parameter("lr", vec![1], VarType::Fp32));
        block
            .append_op(
                OpDesc::new("conv2d")
                    .input("Input", ["pixel"])
                    .input("Filter", ["conv.w"])
                    .output("Output", ["conv.out"])
                    .attr("strides", SourceAttr::Ints(vec![1, 1]))
                    .attr("paddings", SourceAttr::Ints(vec![0, 0]))
                    .attr("use_cudnn", SourceAttr::Boolean(true)),
            )
            .append_op(
                OpDesc::new("relu")
                    .input("X", ["conv.out"])
                    .output("Out", ["relu.out"]),
            )
            .append_op(
                OpDesc::new("mul")
                    .input("X", ["relu.out"])
                    .input("Y", ["fc.w"])
                    .output("Out", ["fc.out"])
                    .attr("x_num_col_dims", SourceAttr::Int(1)),
            )
            .append_op(
                OpDesc::new("mean")
                    .input("X", ["fc.out"])
                    .output("Out", ["loss"]),
            )
            .append_op(
                OpDesc::new("sgd")
                    .input("Param", ["conv.w"])
                    .input("LearningRate", ["lr"])
                    .output("ParamOut", ["conv.w"]),
            );
        program
    }

    fn ids(graph: &GraphModel) -> Vec<&str> {
        graph.nodes().iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_node_count_and_order() {
        let program = small_program();
        let graph = convert(&program).unwrap();
        // 4 leaves (pixel, conv.w, fc.w, lr) + 5 ops.
        assert_eq!(graph.len(), 4 + program.op_count());
        assert_eq!(
            ids(&graph),
            vec!["pixel", "conv.w", "fc.w", "lr", "conv.out", "relu.out", "fc.out", "loss", "conv.w_1"]
        );
        for (i, node) in graph.nodes().iter().enumerate() {
            for input in &node.inputs {
                assert!(graph.position(input).unwrap() < i, "{} -> {}", input, node.id);
            }
        }
    }

    #[test]
    fn test_leaf_nodes() {
        let graph = convert(&small_program()).unwrap();
        let pixel = graph.get("pixel").unwrap();
        assert_eq!(pixel.op, PLACEHOLDER_OP);
        assert!(pixel.inputs.is_empty());
        assert_eq!(
            pixel.attrs["shape"],
            AttrValue::Shape(Shape::new([-1, 1, 28, 28]))
        );
        assert_eq!(pixel.attrs["dtype"], AttrValue::DType(DType::Float32));
        assert_eq!(graph.get("conv.w").unwrap().op, VARIABLE_OP);
    }

    #[test]
    fn test_op_nodes() {
        let graph = convert(&small_program()).unwrap();
        let conv = graph.get("conv.out").unwrap();
        assert_eq!(conv.op, "conv2d");
        assert_eq!(conv.inputs, vec!["pixel".to_string(), "conv.w".to_string()]);
        assert_eq!(conv.attrs["strides"], AttrValue::Ints(vec![1, 1]));
        assert_eq!(conv.attrs["use_cudnn"], AttrValue::Bool(true));
        assert_eq!(
            conv.attrs[OUTPUT_SHAPES_ATTR],
            AttrValue::Shapes(vec![Shape::new([-1, 20, 24, 24])])
        );

        let sgd = graph.get("conv.w_1").unwrap();
        assert_eq!(sgd.op, "sgd");
        assert_eq!(sgd.inputs, vec!["conv.w".to_string(), "lr".to_string()]);
    }

    #[test]
    fn test_in_place_update_rebinds_consumers() {
        let mut program = small_program();
        program
            .global_block_mut()
            .add_var(VarDesc::tensor("w.norm", vec![1], VarType::Fp32))
            .append_op(
                OpDesc::new("reduce_sum")
                    .input("X", ["conv.w"])
                    .output("Out", ["w.norm"]),
            );
        let graph = convert(&program).unwrap();
        assert_eq!(
            graph.get("w.norm").unwrap().inputs,
            vec!["conv.w_1".to_string()]
        );
    }

    #[test]
    fn test_undeclared_input() {
        let mut program = small_program();
        program.global_block_mut().append_op(
            OpDesc::new("relu")
                .input("X", ["ghost"])
                .output("Out", ["ghost.out"]),
        );
        assert_eq!(
            convert(&program),
            Err(ConversionError::UndefinedInput {
                block: 0,
                op_index: 5,
                op_type: "relu".into(),
                name: "ghost".into(),
            })
        );
    }

    #[test]
    fn test_out_of_order_program() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .add_var(VarDesc::tensor("x", vec![2], VarType::Fp32))
            .add_var(VarDesc::tensor("y", vec![2], VarType::Fp32))
            .add_var(VarDesc::tensor("z", vec![2], VarType::Fp32))
            .append_op(OpDesc::new("relu").input("X", ["y"]).output("Out", ["z"]))
            .append_op(OpDesc::new("relu").input("X", ["x"]).output("Out", ["y"]));
        assert!(matches!(
            convert(&program),
            Err(ConversionError::UndefinedInput { op_index: 0, ref name, .. }) if name == "y"
        ));
    }

    #[test]
    fn test_unknown_dtype() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .add_var(VarDesc::tensor("n", vec![1], VarType::SizeT))
            .add_var(VarDesc::tensor("m", vec![1], VarType::Fp32))
            .append_op(OpDesc::new("cast").input("X", ["n"]).output("Out", ["m"]));
        assert_eq!(
            convert(&program),
            Err(ConversionError::UnknownDType {
                name: "n".into(),
                dtype: VarType::SizeT
            })
        );
    }

    #[test]
    fn test_op_without_outputs_and_opaque_leaf() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .add_var(VarDesc::opaque("feed", VarKind::FeedMinibatch))
            .append_op(OpDesc::new("print").input("In", ["feed"]))
            .append_op(OpDesc::new("print").input("In", ["feed"]));
        let graph = convert(&program).unwrap();
        assert_eq!(ids(&graph), vec!["feed", "print_0", "print_1"]);
        let feed = graph.get("feed").unwrap();
        assert!(feed.attrs.is_empty());
        assert!(!graph.get("print_0").unwrap().attrs.contains_key(OUTPUT_SHAPES_ATTR));
    }

    #[test]
    fn test_sub_block_sees_parent_vars() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .add_var(VarDesc::tensor("x", vec![-1, 3], VarType::Fp32))
            .append_op(
                OpDesc::new("while")
                    .input("X", ["x"])
                    .output("Out", ["x.loop"])
                    .attr("sub_block", SourceAttr::Block(1)),
            );
        program
            .append_block(0)
            .unwrap()
            .add_var(VarDesc::tensor("x.step", vec![-1, 3], VarType::Fp32))
            .append_op(OpDesc::new("scale").input("X", ["x"]).output("Out", ["x.step"]));
        let graph = convert(&program).unwrap();
        assert_eq!(ids(&graph), vec!["x", "x.loop", "x.step"]);
        assert_eq!(
            graph.get("x.loop").unwrap().attrs["sub_block"],
            AttrValue::Int(1)
        );
        assert_eq!(
            graph.get("x.loop").unwrap().attrs[OUTPUT_SHAPES_ATTR],
            AttrValue::Shapes(vec![Shape::unknown_rank()])
        );
    }

    #[test]
    fn test_classify_attr() {
        assert_eq!(
            classify_attr("shape", &SourceAttr::Ints(vec![-1, 784])),
            AttrValue::Shape(Shape::new([-1, 784]))
        );
        assert_eq!(
            classify_attr("shape", &SourceAttr::Longs(vec![-5, 3])),
            AttrValue::Shape(Shape::new([-1, 3]))
        );
        assert_eq!(
            classify_attr("dtype", &SourceAttr::Int(5)),
            AttrValue::DType(DType::Float32)
        );
        assert_eq!(
            classify_attr("out_dtype", &SourceAttr::Int(3)),
            AttrValue::DType(DType::Int64)
        );
        // Not a dtype-named attribute, so it stays an integer.
        assert_eq!(classify_attr("axis", &SourceAttr::Int(5)), AttrValue::Int(5));
        // Not a valid type code.
        assert_eq!(classify_attr("dtype", &SourceAttr::Int(99)), AttrValue::Int(99));
        assert_eq!(
            classify_attr("names", &SourceAttr::Strings(vec![])),
            AttrValue::Ints(vec![])
        );
        assert_eq!(
            classify_attr("epsilon", &SourceAttr::Float(1e-5)),
            AttrValue::Float(1e-5)
        );
        assert_eq!(
            classify_attr("data_format", &SourceAttr::String("NCHW".into())),
            AttrValue::String("NCHW".into())
        );
    }
}
