//! Backend seam: the instruction lowerer drives a `CodeBackend`, which
//! realizes procedures in some target language. The bundled C backend lives
//! in `c_backend`; `RecordingBackend` captures the call stream as data for
//! verification tooling and tests.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn counter_name(self) -> &'static str {
        // Read and write procedures are never interleaved, but their loop
        // counters must not alias.
        match self {
            Direction::Read => "read_i",
            Direction::Write => "write_i",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    U8,
    U16,
    U32,
    S8,
    S16,
    S32,
}

impl Primitive {
    pub fn bits(self) -> u32 {
        match self {
            Primitive::Bool => 1,
            Primitive::U8 | Primitive::S8 => 8,
            Primitive::U16 | Primitive::S16 => 16,
            Primitive::U32 | Primitive::S32 => 32,
        }
    }

    pub fn unsigned_for(bits: u32) -> Primitive {
        match bits {
            0..=8 => Primitive::U8,
            9..=16 => Primitive::U16,
            _ => Primitive::U32,
        }
    }

    pub fn signed_for(bits: u32) -> Primitive {
        match bits {
            0..=8 => Primitive::S8,
            9..=16 => Primitive::S16,
            _ => Primitive::S32,
        }
    }
}

/// Kind of procedure being opened, so backends can shape the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    /// Serializes one sector's slice of the layout.
    Sector,
    /// Shared per-struct-type procedure.
    Struct,
    /// Top-level entry branching on sector index.
    Dispatcher,
}

/// An lvalue path into the serialized value, already flattened to steps a
/// backend can render directly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueExpr {
    pub steps: Vec<PathStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Field(String),
    Index(IndexExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExpr {
    Const(u32),
    Counter(String),
}

impl ValueExpr {
    pub fn field(mut self, name: &str) -> Self {
        self.steps.push(PathStep::Field(name.to_string()));
        self
    }

    pub fn index(mut self, idx: IndexExpr) -> Self {
        self.steps.push(PathStep::Index(idx));
        self
    }
}

pub trait CodeBackend {
    fn begin_procedure(&mut self, name: &str, dir: Direction, value_type: &str, kind: ProcKind);
    fn end_procedure(&mut self);
    /// Initialize the bitstream state against the procedure's buffer.
    fn emit_init(&mut self);

    /// One scalar read or write. `bias` is subtracted before storing and
    /// added back after loading; `transform` is an optional
    /// (pre-store, post-load) conversion function pair.
    fn emit_scalar(
        &mut self,
        dir: Direction,
        prim: Primitive,
        target: &ValueExpr,
        bits: u32,
        bias: i64,
        transform: Option<(&str, &str)>,
    );
    fn emit_buffer(&mut self, dir: Direction, target: &ValueExpr, bytes: u32);
    fn emit_string(&mut self, dir: Direction, target: &ValueExpr, len: u32, nullterm: bool);
    /// Consume `bits` (<= the primitive's width) meaninglessly.
    fn emit_discard(&mut self, dir: Direction, prim: Primitive, bits: u32);
    fn emit_call(&mut self, proc: &str, target: &ValueExpr);
    fn emit_assign(&mut self, target: &ValueExpr, literal: i64);

    fn begin_loop(&mut self, counter: &str, start: u32, last: u32);
    fn end_loop(&mut self);

    /// Open the `k`th branch of an if/else-if chain on `operand == case`.
    fn begin_case(&mut self, operand: &ValueExpr, case: i64, first: bool);
    fn begin_else(&mut self);
    fn end_chain(&mut self);

    /// One branch of the top-level dispatcher: forward to `proc` when the
    /// sector parameter equals `sector`. Closed by `end_chain`.
    fn emit_sector_dispatch(&mut self, sector: u32, proc: &str, first: bool);
}

/// Captures the backend call stream verbatim.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub ops: Vec<RecordedOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    BeginProcedure {
        name: String,
        dir: Direction,
        value_type: String,
        kind: ProcKind,
    },
    EndProcedure,
    Init,
    Scalar {
        dir: Direction,
        prim: Primitive,
        target: ValueExpr,
        bits: u32,
        bias: i64,
        transform: Option<(String, String)>,
    },
    Buffer {
        dir: Direction,
        target: ValueExpr,
        bytes: u32,
    },
    Str {
        dir: Direction,
        target: ValueExpr,
        len: u32,
        nullterm: bool,
    },
    Discard {
        dir: Direction,
        prim: Primitive,
        bits: u32,
    },
    Call {
        proc: String,
        target: ValueExpr,
    },
    Assign {
        target: ValueExpr,
        literal: i64,
    },
    BeginLoop {
        counter: String,
        start: u32,
        last: u32,
    },
    EndLoop,
    BeginCase {
        operand: ValueExpr,
        case: i64,
        first: bool,
    },
    BeginElse,
    EndChain,
    SectorDispatch {
        sector: u32,
        proc: String,
        first: bool,
    },
}

impl RecordingBackend {
    pub fn new() -> Self {
        RecordingBackend::default()
    }

    pub fn procedure_names(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                RecordedOp::BeginProcedure { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl CodeBackend for RecordingBackend {
    fn begin_procedure(&mut self, name: &str, dir: Direction, value_type: &str, kind: ProcKind) {
        self.ops.push(RecordedOp::BeginProcedure {
            name: name.to_string(),
            dir,
            value_type: value_type.to_string(),
            kind,
        });
    }

    fn end_procedure(&mut self) {
        self.ops.push(RecordedOp::EndProcedure);
    }

    fn emit_init(&mut self) {
        self.ops.push(RecordedOp::Init);
    }

    fn emit_scalar(
        &mut self,
        dir: Direction,
        prim: Primitive,
        target: &ValueExpr,
        bits: u32,
        bias: i64,
        transform: Option<(&str, &str)>,
    ) {
        self.ops.push(RecordedOp::Scalar {
            dir,
            prim,
            target: target.clone(),
            bits,
            bias,
            transform: transform.map(|(a, b)| (a.to_string(), b.to_string())),
        });
    }

    fn emit_buffer(&mut self, dir: Direction, target: &ValueExpr, bytes: u32) {
        self.ops.push(RecordedOp::Buffer {
            dir,
            target: target.clone(),
            bytes,
        });
    }

    fn emit_string(&mut self, dir: Direction, target: &ValueExpr, len: u32, nullterm: bool) {
        self.ops.push(RecordedOp::Str {
            dir,
            target: target.clone(),
            len,
            nullterm,
        });
    }

    fn emit_discard(&mut self, dir: Direction, prim: Primitive, bits: u32) {
        self.ops.push(RecordedOp::Discard { dir, prim, bits });
    }

    fn emit_call(&mut self, proc: &str, target: &ValueExpr) {
        self.ops.push(RecordedOp::Call {
            proc: proc.to_string(),
            target: target.clone(),
        });
    }

    fn emit_assign(&mut self, target: &ValueExpr, literal: i64) {
        self.ops.push(RecordedOp::Assign {
            target: target.clone(),
            literal,
        });
    }

    fn begin_loop(&mut self, counter: &str, start: u32, last: u32) {
        self.ops.push(RecordedOp::BeginLoop {
            counter: counter.to_string(),
            start,
            last,
        });
    }

    fn end_loop(&mut self) {
        self.ops.push(RecordedOp::EndLoop);
    }

    fn begin_case(&mut self, operand: &ValueExpr, case: i64, first: bool) {
        self.ops.push(RecordedOp::BeginCase {
            operand: operand.clone(),
            case,
            first,
        });
    }

    fn begin_else(&mut self) {
        self.ops.push(RecordedOp::BeginElse);
    }

    fn end_chain(&mut self) {
        self.ops.push(RecordedOp::EndChain);
    }

    fn emit_sector_dispatch(&mut self, sector: u32, proc: &str, first: bool) {
        self.ops.push(RecordedOp::SectorDispatch {
            sector,
            proc: proc.to_string(),
            first,
        });
    }
}
