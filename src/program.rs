//! A read-only description of a framework program: blocks of operators over declared variables.
//!
//! These types mirror the shape of a Fluid `ProgramDesc`. They carry no behavior of their own;
//! a training framework (or a test) fills them in and hands them to
//! [`convert`](crate::convert::convert).

use std::collections::BTreeMap;

/// Variable data types, with the framework's numeric codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VarType {
    Bool = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    Fp16 = 4,
    Fp32 = 5,
    Fp64 = 6,
    SizeT = 19,
    Uint8 = 20,
    Int8 = 21,
    Bf16 = 22,
}

impl VarType {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => VarType::Bool,
            1 => VarType::Int16,
            2 => VarType::Int32,
            3 => VarType::Int64,
            4 => VarType::Fp16,
            5 => VarType::Fp32,
            6 => VarType::Fp64,
            19 => VarType::SizeT,
            20 => VarType::Uint8,
            21 => VarType::Int8,
            22 => VarType::Bf16,
            _ => return None,
        })
    }
}

/// What kind of object a variable holds. Only tensors carry shapes and element types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VarKind {
    LodTensor,
    SelectedRows,
    LodTensorArray,
    FeedMinibatch,
    FetchList,
    StepScopes,
    Reader,
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDesc {
    pub name: String,
    pub kind: VarKind,
    /// Declared dimensions; `-1` (or any negative value) marks an unknown extent.
    pub shape: Option<Vec<i64>>,
    pub dtype: Option<VarType>,
    /// Parameters and optimizer state survive across iterations and are updated in place.
    pub persistable: bool,
}

impl VarDesc {
    /// A non-persistable dense tensor variable.
    pub fn tensor(name: impl Into<String>, shape: Vec<i64>, dtype: VarType) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::LodTensor,
            shape: Some(shape),
            dtype: Some(dtype),
            persistable: false,
        }
    }

    /// A persistable dense tensor variable, such as a parameter.
    pub fn parameter(name: impl Into<String>, shape: Vec<i64>, dtype: VarType) -> Self {
        Self {
            persistable: true,
            ..Self::tensor(name, shape, dtype)
        }
    }

    /// A variable with no tensor metadata, such as a feed/fetch holder.
    pub fn opaque(name: impl Into<String>, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shape: None,
            dtype: None,
            persistable: false,
        }
    }
}

/// An operator attribute as the framework stores it: an untyped bag of the kinds it supports.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceAttr {
    Int(i32),
    Long(i64),
    Float(f32),
    String(String),
    Boolean(bool),
    Ints(Vec<i32>),
    Longs(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Booleans(Vec<bool>),
    /// Index of a sub-block, for control-flow operators.
    Block(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpDesc {
    pub op_type: String,
    /// Named input slots in declaration order, each with its ordered argument variable names.
    pub inputs: Vec<(String, Vec<String>)>,
    pub outputs: Vec<(String, Vec<String>)>,
    pub attrs: BTreeMap<String, SourceAttr>,
}

fn slot<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn input<I, S>(mut self, slot_name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push((slot_name.into(), slot(args)));
        self
    }

    pub fn output<I, S>(mut self, slot_name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.push((slot_name.into(), slot(args)));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: SourceAttr) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    /// All input argument names, slot by slot.
    pub fn input_args(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().flat_map(|(_, args)| args.iter().map(String::as_str))
    }

    pub fn output_args(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().flat_map(|(_, args)| args.iter().map(String::as_str))
    }

    /// The first argument of the first non-empty output slot.
    pub fn primary_output(&self) -> Option<&str> {
        self.output_args().next()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub idx: usize,
    pub parent_idx: Option<usize>,
    pub vars: Vec<VarDesc>,
    pub ops: Vec<OpDesc>,
}

impl Block {
    pub fn var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn add_var(&mut self, var: VarDesc) -> &mut Self {
        self.vars.push(var);
        self
    }

    pub fn append_op(&mut self, op: OpDesc) -> &mut Self {
        self.ops.push(op);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    blocks: Vec<Block>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    /// A program containing only the (empty) global block.
    pub fn new() -> Self {
        Self {
            blocks: vec![Block {
                idx: 0,
                parent_idx: None,
                vars: Vec::new(),
                ops: Vec::new(),
            }],
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, idx: usize) -> Option<&Block> {
        self.blocks.get(idx)
    }

    pub fn global_block_mut(&mut self) -> &mut Block {
        &mut self.blocks[0]
    }

    /// Adds a sub-block nested under `parent` and returns it, or `None` if there is no block
    /// `parent`.
    pub fn append_block(&mut self, parent: usize) -> Option<&mut Block> {
        if parent >= self.blocks.len() {
            return None;
        }
        let idx = self.blocks.len();
        self.blocks.push(Block {
            idx,
            parent_idx: Some(parent),
            vars: Vec::new(),
            ops: Vec::new(),
        });
        self.blocks.get_mut(idx)
    }

    /// Looks a variable up in block `block_idx`, then in its ancestors.
    pub fn find_var(&self, block_idx: usize, name: &str) -> Option<&VarDesc> {
        let mut cur = self.blocks.get(block_idx);
        while let Some(block) = cur {
            if let Some(var) = block.var(name) {
                return Some(var);
            }
            cur = block.parent_idx.and_then(|p| self.blocks.get(p));
        }
        None
    }

    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.ops.len()).sum()
    }
}
