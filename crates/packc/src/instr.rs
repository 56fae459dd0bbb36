//! Instruction trees: the bridge between the flat item list and a code
//! backend.
//!
//! One builder produces the tree and both directions lower from it, so the
//! decode and encode procedures walk the serialized stream in lockstep by
//! construction.

use std::collections::BTreeMap;

use crate::config::GenerationConfig;
use crate::emit::{CodeBackend, Direction, IndexExpr, Primitive, ValueExpr};
use crate::items::{slice_run_len, PathSegment, SerializationItem};
use crate::options::{FieldOptions, ShapeKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Container(Vec<Instruction>),
    Single(SerializationItem),
    /// Adjacent per-element items folded into one loop over the final index.
    SliceLoop {
        item: SerializationItem,
        start: u32,
        count: u32,
    },
    Padding(u32),
    UnionSwitch {
        operand: Vec<PathSegment>,
        arms: Vec<SwitchArm>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchArm {
    pub case: i64,
    pub is_else: bool,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionPair {
    pub decode: Instruction,
    pub encode: Instruction,
}

/// Build the decode/encode pair for one item list. Both trees come from the
/// same builder invocation.
pub fn instruction_pair(items: &[SerializationItem]) -> InstructionPair {
    let tree = build_tree(items);
    InstructionPair {
        decode: tree.clone(),
        encode: tree,
    }
}

pub fn build_tree(items: &[SerializationItem]) -> Instruction {
    let mut body = build_range(items, 0, items.len(), 0);
    if body.len() == 1 {
        return body.remove(0);
    }
    Instruction::Container(body)
}

fn build_range(
    items: &[SerializationItem],
    start: usize,
    end: usize,
    depth: usize,
) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut i = start;
    while i < end {
        let item = &items[i];
        if item.conditions.len() > depth {
            let lhs = &item.conditions[depth].lhs;
            let mut j = i;
            while j < end
                && items[j].conditions.len() > depth
                && items[j].conditions[depth].lhs == *lhs
            {
                j += 1;
            }
            let mut arms = Vec::new();
            let mut k = i;
            while k < j {
                let cond = &items[k].conditions[depth];
                let (case, is_else) = (cond.rhs, cond.is_else);
                let mut m = k;
                while m < j && items[m].conditions[depth].rhs == case {
                    m += 1;
                }
                arms.push(SwitchArm {
                    case,
                    is_else,
                    body: build_range(items, k, m, depth + 1),
                });
                k = m;
            }
            out.push(Instruction::UnionSwitch {
                operand: lhs.clone(),
                arms,
            });
            i = j;
            continue;
        }
        if !item.omitted {
            if let Some(opts) = item.leaf_options() {
                if let Some(bits) = opts.pad_bits {
                    out.push(Instruction::Padding(bits));
                    i += 1;
                    continue;
                }
            }
        }
        let run = slice_run_len(&items[..end], i);
        if run > 1 {
            let slice_start = match items[i].segments.last() {
                Some(PathSegment::Slice { start, .. }) => *start,
                _ => 0,
            };
            out.push(Instruction::SliceLoop {
                item: items[i].clone(),
                start: slice_start,
                count: run as u32,
            });
            i += run;
        } else {
            out.push(Instruction::Single(item.clone()));
            i += 1;
        }
    }
    out
}

/// Lowers instruction trees onto a code backend.
pub struct Lowering<'a> {
    pub config: &'a GenerationConfig,
    /// Struct type name to its (decode, encode) procedure names.
    pub struct_procs: &'a BTreeMap<String, (String, String)>,
}

impl<'a> Lowering<'a> {
    pub fn lower(
        &self,
        dir: Direction,
        tree: &Instruction,
        backend: &mut dyn CodeBackend,
    ) -> Result<(), String> {
        self.lower_one(dir, tree, None, backend)
    }

    fn lower_one(
        &self,
        dir: Direction,
        instr: &Instruction,
        counter: Option<&str>,
        backend: &mut dyn CodeBackend,
    ) -> Result<(), String> {
        match instr {
            Instruction::Container(body) => {
                for child in body {
                    self.lower_one(dir, child, counter, backend)?;
                }
                Ok(())
            }
            Instruction::Padding(bits) => {
                lower_padding(dir, *bits, backend);
                Ok(())
            }
            Instruction::Single(item) => self.lower_item(dir, item, counter, backend),
            Instruction::SliceLoop { item, start, count } => {
                let counter = dir.counter_name();
                backend.begin_loop(counter, *start, start + count - 1);
                self.lower_item(dir, item, Some(counter), backend)?;
                backend.end_loop();
                Ok(())
            }
            Instruction::UnionSwitch { operand, arms } => {
                let operand = value_expr(operand, None);
                for (pos, arm) in arms.iter().enumerate() {
                    if pos > 0 && arm.is_else {
                        backend.begin_else();
                    } else {
                        backend.begin_case(&operand, arm.case, pos == 0);
                    }
                    for child in &arm.body {
                        self.lower_one(dir, child, counter, backend)?;
                    }
                }
                backend.end_chain();
                Ok(())
            }
        }
    }

    fn lower_item(
        &self,
        dir: Direction,
        item: &SerializationItem,
        counter: Option<&str>,
        backend: &mut dyn CodeBackend,
    ) -> Result<(), String> {
        let target = value_expr(&item.segments, counter);
        let Some(opts) = item.leaf_options() else {
            return Err(format!("item {} has no member access", item.path_string()));
        };
        if item.omitted {
            // omitted storage reappears on decode as its default, if any
            if dir == Direction::Read {
                if let Some(value) = opts.default_value {
                    backend.emit_assign(&target, value);
                }
            }
            return Ok(());
        }
        self.lower_shape(dir, opts, &target, None, item, backend)
    }

    fn lower_shape(
        &self,
        dir: Direction,
        opts: &FieldOptions,
        target: &ValueExpr,
        transform: Option<(&str, &str)>,
        item: &SerializationItem,
        backend: &mut dyn CodeBackend,
    ) -> Result<(), String> {
        match &opts.shape {
            ShapeKind::None => Ok(()),
            ShapeKind::Boolean => {
                backend.emit_scalar(dir, Primitive::Bool, target, 1, 0, transform);
                Ok(())
            }
            ShapeKind::Integral {
                bits, min, signed, ..
            } => {
                let (prim, bias) = if *signed {
                    (Primitive::signed_for(*bits), 0)
                } else {
                    (Primitive::unsigned_for(*bits), *min)
                };
                backend.emit_scalar(dir, prim, target, *bits, bias, transform);
                Ok(())
            }
            ShapeKind::Pointer => {
                let bits = self.config.pointer_bits;
                backend.emit_scalar(
                    dir,
                    Primitive::unsigned_for(bits),
                    target,
                    bits,
                    0,
                    transform,
                );
                Ok(())
            }
            ShapeKind::Buffer { bytes } => {
                backend.emit_buffer(dir, target, *bytes);
                Ok(())
            }
            ShapeKind::Text { len, nonstring } => {
                backend.emit_string(dir, target, *len, !nonstring);
                Ok(())
            }
            ShapeKind::Structure { type_name } => {
                let (read_proc, write_proc) =
                    self.struct_procs.get(type_name).ok_or_else(|| {
                        format!(
                            "no procedure generated for structure type {type_name:?} at {}",
                            item.path_string()
                        )
                    })?;
                let proc = match dir {
                    Direction::Read => read_proc,
                    Direction::Write => write_proc,
                };
                backend.emit_call(proc, target);
                Ok(())
            }
            ShapeKind::Transformed {
                options,
                pre,
                post,
            } => self.lower_shape(
                dir,
                options,
                target,
                Some((pre.as_str(), post.as_str())),
                item,
                backend,
            ),
            ShapeKind::TaggedUnion { type_name, .. } => Err(format!(
                "unexpanded union {type_name:?} at {}",
                item.path_string()
            )),
        }
    }
}

fn lower_padding(dir: Direction, mut bits: u32, backend: &mut dyn CodeBackend) {
    while bits >= 32 {
        backend.emit_discard(dir, Primitive::U32, 32);
        bits -= 32;
    }
    if bits >= 16 {
        backend.emit_discard(dir, Primitive::U16, 16);
        bits -= 16;
    }
    if bits >= 8 {
        backend.emit_discard(dir, Primitive::U8, 8);
        bits -= 8;
    }
    if bits > 0 {
        backend.emit_discard(dir, Primitive::U8, bits);
    }
}

/// Render an item path as backend value steps; `counter` replaces the final
/// slice index inside a loop body.
fn value_expr(segments: &[PathSegment], counter: Option<&str>) -> ValueExpr {
    let last_slice = segments
        .iter()
        .rposition(|seg| matches!(seg, PathSegment::Slice { .. }));
    let mut expr = ValueExpr::default();
    for (pos, seg) in segments.iter().enumerate() {
        match seg {
            PathSegment::Member { name, .. } => expr = expr.field(name),
            PathSegment::Slice { start, .. } => {
                let idx = match (counter, last_slice) {
                    (Some(counter), Some(last)) if pos == last => {
                        IndexExpr::Counter(counter.to_string())
                    }
                    _ => IndexExpr::Const(*start),
                };
                expr = expr.index(idx);
            }
        }
    }
    expr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{RecordedOp, RecordingBackend};
    use crate::items::Condition;

    fn opts(shape: ShapeKind) -> FieldOptions {
        FieldOptions {
            shape,
            extents: Vec::new(),
            omitted: false,
            default_value: None,
            union_member_id: None,
            never_split: false,
            pad_bits: None,
            stat_categories: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn scalar_item(name: &str, bits: u32, min: i64, max: i64) -> SerializationItem {
        SerializationItem {
            segments: vec![PathSegment::member(
                name,
                opts(ShapeKind::Integral {
                    bits,
                    min,
                    max,
                    signed: min < 0,
                }),
            )],
            conditions: Vec::new(),
            omitted: false,
            defaulted: false,
        }
    }

    #[test]
    fn adjacent_elements_fold_into_a_loop() {
        let mut items = Vec::new();
        for i in 0..3u32 {
            let mut it = scalar_item("arr", 8, 0, 255);
            it.segments.push(PathSegment::Slice { start: i, count: 1 });
            items.push(it);
        }
        let tree = build_tree(&items);
        // a container with one child collapses to that child
        assert!(matches!(
            tree,
            Instruction::SliceLoop {
                start: 0,
                count: 3,
                ..
            }
        ));
    }

    #[test]
    fn conditioned_items_group_under_one_switch() {
        let tag_lhs = vec![PathSegment::member(
            "tag",
            opts(ShapeKind::Integral {
                bits: 8,
                min: 0,
                max: 255,
                signed: false,
            }),
        )];
        let mut arm_a = scalar_item("a", 8, 0, 255);
        arm_a.conditions = vec![Condition {
            lhs: tag_lhs.clone(),
            rhs: 1,
            is_else: false,
        }];
        let mut arm_a2 = scalar_item("a2", 8, 0, 255);
        arm_a2.conditions = arm_a.conditions.clone();
        let mut arm_b = scalar_item("b", 8, 0, 255);
        arm_b.conditions = vec![Condition {
            lhs: tag_lhs.clone(),
            rhs: 2,
            is_else: true,
        }];
        let items = vec![scalar_item("tag", 8, 0, 255), arm_a, arm_a2, arm_b];
        let tree = build_tree(&items);
        let Instruction::Container(body) = tree else {
            panic!("expected container");
        };
        assert_eq!(body.len(), 2);
        let Instruction::UnionSwitch { arms, .. } = &body[1] else {
            panic!("expected switch, got {:?}", body[1]);
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].body.len(), 2);
        assert!(arms[1].is_else);
    }

    #[test]
    fn ranged_integral_lowers_with_bias() {
        let config = GenerationConfig::default();
        let procs = BTreeMap::new();
        let lowering = Lowering {
            config: &config,
            struct_procs: &procs,
        };
        let items = vec![scalar_item("hp", 7, 10, 100)];
        let tree = build_tree(&items);
        let mut backend = RecordingBackend::new();
        lowering
            .lower(Direction::Write, &tree, &mut backend)
            .unwrap();
        assert_eq!(
            backend.ops,
            vec![RecordedOp::Scalar {
                dir: Direction::Write,
                prim: Primitive::U8,
                target: ValueExpr::default().field("hp"),
                bits: 7,
                bias: 10,
                transform: None,
            }]
        );
    }

    #[test]
    fn natural_signed_range_keeps_the_signed_primitive() {
        let config = GenerationConfig::default();
        let procs = BTreeMap::new();
        let lowering = Lowering {
            config: &config,
            struct_procs: &procs,
        };
        let items = vec![scalar_item("delta", 16, -32768, 32767)];
        let tree = build_tree(&items);
        let mut backend = RecordingBackend::new();
        lowering
            .lower(Direction::Read, &tree, &mut backend)
            .unwrap();
        match &backend.ops[0] {
            RecordedOp::Scalar { prim, bias, .. } => {
                assert_eq!(*prim, Primitive::S16);
                assert_eq!(*bias, 0);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn power_of_two_signed_subrange_still_biases() {
        let config = GenerationConfig::default();
        let procs = BTreeMap::new();
        let lowering = Lowering {
            config: &config,
            struct_procs: &procs,
        };
        // [-8,7] spans exactly 4 bits but the field is a sub-range of a
        // wider type, so it stores biased through the unsigned primitive.
        let mut item = scalar_item("nudge", 4, -8, 7);
        if let Some(PathSegment::Member { options, .. }) = item.segments.last_mut() {
            options.shape = ShapeKind::Integral {
                bits: 4,
                min: -8,
                max: 7,
                signed: false,
            };
        }
        let tree = build_tree(&[item]);
        let mut backend = RecordingBackend::new();
        lowering
            .lower(Direction::Write, &tree, &mut backend)
            .unwrap();
        assert_eq!(
            backend.ops,
            vec![RecordedOp::Scalar {
                dir: Direction::Write,
                prim: Primitive::U8,
                target: ValueExpr::default().field("nudge"),
                bits: 4,
                bias: -8,
                transform: None,
            }]
        );
    }

    #[test]
    fn padding_discards_in_descending_widths() {
        let config = GenerationConfig::default();
        let procs = BTreeMap::new();
        let lowering = Lowering {
            config: &config,
            struct_procs: &procs,
        };
        let mut backend = RecordingBackend::new();
        lowering
            .lower(Direction::Read, &Instruction::Padding(59), &mut backend)
            .unwrap();
        let widths: Vec<(Primitive, u32)> = backend
            .ops
            .iter()
            .map(|op| match op {
                RecordedOp::Discard { prim, bits, .. } => (*prim, *bits),
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(
            widths,
            vec![
                (Primitive::U32, 32),
                (Primitive::U16, 16),
                (Primitive::U8, 8),
                (Primitive::U8, 3),
            ]
        );
    }

    #[test]
    fn omitted_defaulted_item_assigns_only_on_decode() {
        let config = GenerationConfig::default();
        let procs = BTreeMap::new();
        let lowering = Lowering {
            config: &config,
            struct_procs: &procs,
        };
        let mut item = scalar_item("legacy", 8, 0, 255);
        item.omitted = true;
        item.defaulted = true;
        if let Some(PathSegment::Member { options, .. }) = item.segments.last_mut() {
            options.omitted = true;
            options.default_value = Some(7);
        }
        let pair = instruction_pair(&[item]);
        let mut read_backend = RecordingBackend::new();
        lowering
            .lower(Direction::Read, &pair.decode, &mut read_backend)
            .unwrap();
        assert_eq!(
            read_backend.ops,
            vec![RecordedOp::Assign {
                target: ValueExpr::default().field("legacy"),
                literal: 7,
            }]
        );
        let mut write_backend = RecordingBackend::new();
        lowering
            .lower(Direction::Write, &pair.encode, &mut write_backend)
            .unwrap();
        assert!(write_backend.ops.is_empty());
    }
}
