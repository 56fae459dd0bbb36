//! C code backend: renders the backend call stream as C procedures over the
//! configured bitstream primitive library.

use crate::config::GenerationConfig;
use crate::emit::{CodeBackend, Direction, IndexExpr, PathStep, Primitive, ProcKind, ValueExpr};

pub struct CBackend<'a> {
    config: &'a GenerationConfig,
    out: String,
    indent: usize,
    /// Expression for the bitstream state in the current procedure: sector
    /// procedures declare a local, struct procedures receive a pointer.
    state_expr: &'static str,
}

impl<'a> CBackend<'a> {
    pub fn new(config: &'a GenerationConfig) -> Self {
        CBackend {
            config,
            out: String::new(),
            indent: 0,
            state_expr: "st",
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    /// File prologue: includes and forward declarations belong to the
    /// caller, which knows the full procedure set.
    pub fn prelude(config: &GenerationConfig) -> String {
        let mut out = String::new();
        out.push_str("/* generated by packc; do not edit */\n");
        out.push_str("#include <stdint.h>\n\n");
        let _ = config;
        out
    }

    fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    fn path(expr: &ValueExpr) -> String {
        let mut out = String::from("v");
        let mut first_field = true;
        for step in &expr.steps {
            match step {
                PathStep::Field(name) => {
                    if first_field {
                        out.push_str("->");
                        first_field = false;
                    } else {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                PathStep::Index(idx) => match idx {
                    IndexExpr::Const(i) => out.push_str(&format!("[{i}]")),
                    IndexExpr::Counter(name) => out.push_str(&format!("[{name}]")),
                },
            }
        }
        out
    }

    fn scalar_fn(&self, dir: Direction, prim: Primitive) -> &str {
        self.config.primitives.scalar(dir, prim)
    }
}

impl<'a> CodeBackend for CBackend<'a> {
    fn begin_procedure(&mut self, name: &str, dir: Direction, value_type: &str, kind: ProcKind) {
        let state = &self.config.state_type;
        let byte = &self.config.byte_type;
        let value = match dir {
            Direction::Read => format!("{value_type} *v"),
            Direction::Write => format!("const {value_type} *v"),
        };
        match kind {
            ProcKind::Sector => {
                self.line(&format!("void {name}({value}, {byte} *buf) {{"));
                self.state_expr = "&st";
            }
            ProcKind::Struct => {
                self.line(&format!("static void {name}({state} *st, {value}) {{"));
                self.state_expr = "st";
            }
            ProcKind::Dispatcher => {
                self.line(&format!(
                    "void {name}({value}, {byte} *buf, uint32_t sector) {{"
                ));
                self.state_expr = "&st";
            }
        }
        self.indent += 1;
    }

    fn end_procedure(&mut self) {
        self.indent -= 1;
        self.line("}");
        self.line("");
    }

    fn emit_init(&mut self) {
        let state = self.config.state_type.clone();
        let init = self.config.primitives.init.clone();
        self.line(&format!("{state} st;"));
        self.line(&format!("{init}(&st, buf);"));
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
        let target = Self::path(target);
        let st = self.state_expr;
        let func = self.scalar_fn(dir, prim).to_string();
        match dir {
            Direction::Read => {
                let mut expr = if prim == Primitive::Bool {
                    format!("{func}({st})")
                } else {
                    format!("{func}({st}, {bits})")
                };
                if bias > 0 {
                    expr = format!("({expr} + {bias})");
                } else if bias < 0 {
                    expr = format!("({expr} - {})", -bias);
                }
                if let Some((_, post)) = transform {
                    expr = format!("{post}({expr})");
                }
                self.line(&format!("{target} = {expr};"));
            }
            Direction::Write => {
                let mut expr = target;
                if let Some((pre, _)) = transform {
                    expr = format!("{pre}({expr})");
                }
                if bias > 0 {
                    expr = format!("({expr} - {bias})");
                } else if bias < 0 {
                    expr = format!("({expr} + {})", -bias);
                }
                if prim == Primitive::Bool {
                    self.line(&format!("{func}({st}, {expr});"));
                } else {
                    self.line(&format!("{func}({st}, {expr}, {bits});"));
                }
            }
        }
    }

    fn emit_buffer(&mut self, dir: Direction, target: &ValueExpr, bytes: u32) {
        let target = Self::path(target);
        let st = self.state_expr;
        let byte = self.config.byte_type.clone();
        let func = match dir {
            Direction::Read => self.config.primitives.read_buffer.clone(),
            Direction::Write => self.config.primitives.write_buffer.clone(),
        };
        self.line(&format!("{func}({st}, ({byte} *)&{target}, {bytes});"));
    }

    fn emit_string(&mut self, dir: Direction, target: &ValueExpr, len: u32, nullterm: bool) {
        let target = Self::path(target);
        let st = self.state_expr;
        let func = match dir {
            Direction::Read => self.config.primitives.read_string.clone(),
            Direction::Write => self.config.primitives.write_string.clone(),
        };
        let nt = if nullterm { 1 } else { 0 };
        self.line(&format!("{func}({st}, {target}, {len}, {nt});"));
    }

    fn emit_discard(&mut self, dir: Direction, prim: Primitive, bits: u32) {
        let st = self.state_expr;
        let func = self.scalar_fn(dir, prim).to_string();
        match dir {
            Direction::Read => self.line(&format!("(void){func}({st}, {bits});")),
            Direction::Write => self.line(&format!("{func}({st}, 0, {bits});")),
        }
    }

    fn emit_call(&mut self, proc: &str, target: &ValueExpr) {
        let target = Self::path(target);
        let st = self.state_expr;
        self.line(&format!("{proc}({st}, &{target});"));
    }

    fn emit_assign(&mut self, target: &ValueExpr, literal: i64) {
        let target = Self::path(target);
        self.line(&format!("{target} = {literal};"));
    }

    fn begin_loop(&mut self, counter: &str, start: u32, last: u32) {
        self.line(&format!(
            "for (uint32_t {counter} = {start}; {counter} <= {last}; {counter}++) {{"
        ));
        self.indent += 1;
    }

    fn end_loop(&mut self) {
        self.indent -= 1;
        self.line("}");
    }

    fn begin_case(&mut self, operand: &ValueExpr, case: i64, first: bool) {
        let operand = Self::path(operand);
        if first {
            self.line(&format!("if ({operand} == {case}) {{"));
        } else {
            self.indent -= 1;
            self.line(&format!("}} else if ({operand} == {case}) {{"));
        }
        self.indent += 1;
    }

    fn begin_else(&mut self) {
        self.indent -= 1;
        self.line("} else {");
        self.indent += 1;
    }

    fn end_chain(&mut self) {
        self.indent -= 1;
        self.line("}");
    }

    fn emit_sector_dispatch(&mut self, sector: u32, proc: &str, first: bool) {
        if first {
            self.line(&format!("if (sector == {sector}) {{"));
        } else {
            self.indent -= 1;
            self.line(&format!("}} else if (sector == {sector}) {{"));
        }
        self.indent += 1;
        self.line(&format!("{proc}(v, buf);"));
    }
}
