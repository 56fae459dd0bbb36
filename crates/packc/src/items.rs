//! Serialization items: the flattened units of the layout.
//!
//! An item is a path of access segments plus the union-branch conditions it
//! lives under. Items with identical condition `lhs` paths are mutually
//! exclusive and share storage; `offsets_and_sizes` is the single place
//! that accounting happens.

use crate::config::GenerationConfig;
use crate::options::{
    resolve_field, terminal_decl, FieldOptions, OptionsCache, SchemaError, SchemaErrorKind,
    ShapeKind,
};
use crate::schema::{FieldDecl, SchemaDoc, TypeBody, TypeDecl};

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Member {
        name: String,
        options: Box<FieldOptions>,
    },
    Slice {
        start: u32,
        count: u32,
    },
}

impl PathSegment {
    pub fn member(name: &str, options: FieldOptions) -> Self {
        PathSegment::Member {
            name: name.to_string(),
            options: Box::new(options),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Path of the tag storage this condition compares against.
    pub lhs: Vec<PathSegment>,
    pub rhs: i64,
    pub is_else: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializationItem {
    pub segments: Vec<PathSegment>,
    pub conditions: Vec<Condition>,
    pub omitted: bool,
    pub defaulted: bool,
}

impl SerializationItem {
    pub fn leaf_options(&self) -> Option<&FieldOptions> {
        self.segments.iter().rev().find_map(|seg| match seg {
            PathSegment::Member { options, .. } => Some(options.as_ref()),
            PathSegment::Slice { .. } => None,
        })
    }

    /// Number of slice segments after the last member access, i.e. how many
    /// of the leaf's array extents are already consumed.
    pub fn trailing_slices(&self) -> usize {
        self.segments
            .iter()
            .rev()
            .take_while(|seg| matches!(seg, PathSegment::Slice { .. }))
            .count()
    }

    pub fn path_string(&self) -> String {
        path_to_string(&self.segments)
    }
}

pub fn path_to_string(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            PathSegment::Member { name, .. } => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Slice { start, count } => {
                if *count == 1 {
                    out.push_str(&format!("[{start}]"));
                } else {
                    out.push_str(&format!("[{start}..{}]", start + count));
                }
            }
        }
    }
    out
}

/// Verbatim item list of a structure type: one item per field, with tagged
/// unions already split into shared-prefix items plus conditional arm items.
pub fn items_for_type(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    type_name: &str,
) -> Result<Vec<SerializationItem>, SchemaError> {
    let decl = terminal_decl(schema, type_name)?;
    let fields = match &decl.body {
        TypeBody::Struct { fields } => fields,
        _ => {
            return Err(SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("{type_name:?} is not a structure"),
            ))
        }
    };
    let mut out = Vec::new();
    for field in fields {
        let opts = resolve_field(cache, config, schema, decl, field).map_err(|e| {
            SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("{}.{}: {}", decl.name, field.name, e.message),
            )
        })?;
        push_field_items(cache, config, schema, &mut out, decl, &[], &[], &field.name, opts)?;
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn push_field_items(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    out: &mut Vec<SerializationItem>,
    owner: &TypeDecl,
    base_segments: &[PathSegment],
    base_conditions: &[Condition],
    field_name: &str,
    opts: FieldOptions,
) -> Result<(), SchemaError> {
    let mut segments = base_segments.to_vec();
    segments.push(PathSegment::member(field_name, opts.clone()));
    if matches!(opts.shape, ShapeKind::TaggedUnion { .. }) && opts.extents.is_empty() {
        union_arm_items(
            cache,
            config,
            schema,
            out,
            base_segments,
            &segments,
            base_conditions,
            Some(owner),
            &opts,
        )
    } else {
        out.push(SerializationItem {
            segments,
            conditions: base_conditions.to_vec(),
            omitted: opts.omitted,
            defaulted: opts.default_value.is_some(),
        });
        Ok(())
    }
}

/// Split one tagged-union value into items.
///
/// Internal tagging emits the shared leading fields once (through the first
/// non-omitted arm, whose layout all arms are validated to share up to the
/// tag) followed by conditional per-arm remainders. External tagging emits
/// whole arms conditioned on the sibling tag.
#[allow(clippy::too_many_arguments)]
fn union_arm_items(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    out: &mut Vec<SerializationItem>,
    parent_segments: &[PathSegment],
    union_segments: &[PathSegment],
    base_conditions: &[Condition],
    owner: Option<&TypeDecl>,
    union_opts: &FieldOptions,
) -> Result<(), SchemaError> {
    let (type_name, tag, internal) = match &union_opts.shape {
        ShapeKind::TaggedUnion {
            type_name,
            tag,
            internal,
        } => (type_name.as_str(), tag.as_str(), *internal),
        _ => unreachable!("union_arm_items on a non-union shape"),
    };
    let decl = schema.lookup(type_name).ok_or_else(|| {
        SchemaError::new(
            SchemaErrorKind::TypeResolutionFailure,
            format!("unknown union type {type_name:?}"),
        )
    })?;
    let arms: &[FieldDecl] = match &decl.body {
        TypeBody::Union { fields } => fields,
        _ => {
            return Err(SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("{type_name:?} is not a union"),
            ))
        }
    };
    let mut resolved: Vec<(&FieldDecl, FieldOptions)> = Vec::with_capacity(arms.len());
    for arm in arms {
        let arm_opts = resolve_field(cache, config, schema, decl, arm).map_err(|e| {
            SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("{}.{}: {}", decl.name, arm.name, e.message),
            )
        })?;
        resolved.push((arm, arm_opts));
    }
    // arms with no storage and no default contribute nothing
    let emitted: Vec<usize> = resolved
        .iter()
        .enumerate()
        .filter(|(_, (_, o))| !(o.omitted && o.default_value.is_none()))
        .map(|(i, _)| i)
        .collect();

    if internal {
        let (arm0, arm0_opts) = resolved
            .iter()
            .find(|(_, o)| !o.omitted)
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {type_name:?} has no non-omitted arms"),
                )
            })?;
        let arm0_struct = match &arm0_opts.shape {
            ShapeKind::Structure { type_name } => terminal_decl(schema, type_name)?,
            _ => {
                return Err(SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {type_name:?}: arm {:?} is not a structure", arm0.name),
                ))
            }
        };
        let arm0_fields = match &arm0_struct.body {
            TypeBody::Struct { fields } => fields,
            _ => unreachable!("terminal_decl returned a non-struct for a structure shape"),
        };
        let tag_pos = arm0_fields
            .iter()
            .position(|f| f.name == tag)
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {type_name:?}: arm {:?} lacks tag field {tag:?}", arm0.name),
                )
            })?;
        let mut arm0_base = union_segments.to_vec();
        arm0_base.push(PathSegment::member(&arm0.name, arm0_opts.clone()));
        // shared leading fields, decoded before any arm is chosen
        for lead in &arm0_fields[..=tag_pos] {
            let lead_opts = resolve_field(cache, config, schema, arm0_struct, lead)
                .map_err(|e| {
                    SchemaError::new(
                        SchemaErrorKind::TypeResolutionFailure,
                        format!("{}.{}: {}", arm0_struct.name, lead.name, e.message),
                    )
                })?;
            push_field_items(
                cache,
                config,
                schema,
                out,
                arm0_struct,
                &arm0_base,
                base_conditions,
                &lead.name,
                lead_opts,
            )?;
        }
        let tag_opts = resolve_field(cache, config, schema, arm0_struct, &arm0_fields[tag_pos])
            .map_err(|e| {
                SchemaError::new(
                    SchemaErrorKind::TypeResolutionFailure,
                    format!("{}.{}: {}", arm0_struct.name, tag, e.message),
                )
            })?;
        let mut tag_lhs = arm0_base.clone();
        tag_lhs.push(PathSegment::member(tag, tag_opts));

        for (pos, arm_idx) in emitted.iter().enumerate() {
            let (arm, arm_opts) = &resolved[*arm_idx];
            let rhs = arm_opts.union_member_id.ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {type_name:?}: arm {:?} lacks a union_member id", arm.name),
                )
            })?;
            let cond = Condition {
                lhs: tag_lhs.clone(),
                rhs,
                is_else: pos + 1 == emitted.len(),
            };
            let mut conditions = base_conditions.to_vec();
            conditions.push(cond);
            if arm_opts.omitted {
                let mut segments = union_segments.to_vec();
                segments.push(PathSegment::member(&arm.name, arm_opts.clone()));
                out.push(SerializationItem {
                    segments,
                    conditions,
                    omitted: true,
                    defaulted: arm_opts.default_value.is_some(),
                });
                continue;
            }
            let arm_struct = match &arm_opts.shape {
                ShapeKind::Structure { type_name } => terminal_decl(schema, type_name)?,
                _ => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::UnresolvedTag,
                        format!(
                            "union {type_name:?}: arm {:?} is not a structure",
                            arm.name
                        ),
                    ))
                }
            };
            let arm_fields = match &arm_struct.body {
                TypeBody::Struct { fields } => fields,
                _ => unreachable!("terminal_decl returned a non-struct for a structure shape"),
            };
            let mut arm_base = union_segments.to_vec();
            arm_base.push(PathSegment::member(&arm.name, arm_opts.clone()));
            for rest in &arm_fields[tag_pos + 1..] {
                let rest_opts = resolve_field(cache, config, schema, arm_struct, rest)
                    .map_err(|e| {
                        SchemaError::new(
                            SchemaErrorKind::TypeResolutionFailure,
                            format!("{}.{}: {}", arm_struct.name, rest.name, e.message),
                        )
                    })?;
                push_field_items(
                    cache,
                    config,
                    schema,
                    out,
                    arm_struct,
                    &arm_base,
                    &conditions,
                    &rest.name,
                    rest_opts,
                )?;
            }
        }
    } else {
        let owner_decl = owner.ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("externally tagged union {type_name:?} needs a containing struct"),
            )
        })?;
        let siblings = match &owner_decl.body {
            TypeBody::Struct { fields } => fields,
            _ => {
                return Err(SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("externally tagged union {type_name:?} must live in a struct"),
                ))
            }
        };
        let tag_field = siblings.iter().find(|f| f.name == tag).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("tag field {tag:?} not found beside union {type_name:?}"),
            )
        })?;
        let tag_opts = resolve_field(cache, config, schema, owner_decl, tag_field)
            .map_err(|e| {
                SchemaError::new(
                    SchemaErrorKind::TypeResolutionFailure,
                    format!("{}.{}: {}", owner_decl.name, tag, e.message),
                )
            })?;
        let mut tag_lhs = parent_segments.to_vec();
        tag_lhs.push(PathSegment::member(tag, tag_opts));

        for (pos, arm_idx) in emitted.iter().enumerate() {
            let (arm, arm_opts) = &resolved[*arm_idx];
            let rhs = arm_opts.union_member_id.ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {type_name:?}: arm {:?} lacks a union_member id", arm.name),
                )
            })?;
            let mut conditions = base_conditions.to_vec();
            conditions.push(Condition {
                lhs: tag_lhs.clone(),
                rhs,
                is_else: pos + 1 == emitted.len(),
            });
            let mut segments = union_segments.to_vec();
            segments.push(PathSegment::member(&arm.name, arm_opts.clone()));
            out.push(SerializationItem {
                segments,
                conditions,
                omitted: arm_opts.omitted,
                defaulted: arm_opts.default_value.is_some(),
            });
        }
    }
    Ok(())
}

/// Recursively replace array and struct items with one item per element or
/// member, preserving condition lists. Stops at opaque buffers, strings,
/// omitted items, and padding. Idempotent.
pub fn full_expand(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    items: &[SerializationItem],
) -> Result<Vec<SerializationItem>, SchemaError> {
    let mut out = Vec::new();
    for item in items {
        expand_into(cache, config, schema, item, &mut out)?;
    }
    Ok(out)
}

fn expand_into(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    item: &SerializationItem,
    out: &mut Vec<SerializationItem>,
) -> Result<(), SchemaError> {
    if item.omitted {
        out.push(item.clone());
        return Ok(());
    }
    let Some(opts) = item.leaf_options().cloned() else {
        out.push(item.clone());
        return Ok(());
    };
    if opts.pad_bits.is_some() {
        out.push(item.clone());
        return Ok(());
    }
    let consumed = item.trailing_slices().min(opts.extents.len());
    let remaining = &opts.extents[consumed..];
    if !remaining.is_empty() {
        let extent = remaining[0];
        for i in 0..extent {
            let mut elem = item.clone();
            elem.segments.push(PathSegment::Slice { start: i, count: 1 });
            expand_into(cache, config, schema, &elem, out)?;
        }
        return Ok(());
    }
    match &opts.shape {
        ShapeKind::Structure { type_name } => {
            let sub_items = items_for_type(cache, config, schema, type_name)?;
            for sub in sub_items {
                let mut segments = item.segments.clone();
                segments.extend(sub.segments);
                let mut conditions = item.conditions.clone();
                conditions.extend(sub.conditions.into_iter().map(|mut c| {
                    let mut lhs = item.segments.clone();
                    lhs.extend(c.lhs);
                    c.lhs = lhs;
                    c
                }));
                let merged = SerializationItem {
                    segments,
                    conditions,
                    omitted: sub.omitted,
                    defaulted: sub.defaulted,
                };
                expand_into(cache, config, schema, &merged, out)?;
            }
            Ok(())
        }
        ShapeKind::TaggedUnion { .. } => {
            // only reachable for array elements; external tagging on arrays
            // is rejected at resolve time
            let mut arm_items = Vec::new();
            let parent = &item.segments[..item.segments.len().saturating_sub(1)];
            union_arm_items(
                cache,
                config,
                schema,
                &mut arm_items,
                parent,
                &item.segments,
                &item.conditions,
                None,
                &opts,
            )?;
            for arm_item in &arm_items {
                expand_into(cache, config, schema, arm_item, out)?;
            }
            Ok(())
        }
        _ => {
            out.push(item.clone());
            Ok(())
        }
    }
}

/// Serialized bit size of one item (0 for omitted items).
pub fn item_bits(config: &GenerationConfig, item: &SerializationItem) -> u64 {
    if item.omitted {
        return 0;
    }
    let Some(opts) = item.leaf_options() else {
        return 0;
    };
    if let Some(pad) = opts.pad_bits {
        return u64::from(pad);
    }
    let scalar = opts.scalar_bits(config).unwrap_or(0);
    let mut mult: u64 = 1;
    let mut consumed = 0usize;
    for seg in item.segments.iter().rev() {
        match seg {
            PathSegment::Slice { count, .. } => {
                mult *= u64::from(*count);
                consumed += 1;
            }
            PathSegment::Member { .. } => break,
        }
    }
    let consumed = consumed.min(opts.extents.len());
    let remaining: u64 = opts.extents[consumed..]
        .iter()
        .fold(1u64, |acc, e| acc * u64::from(*e));
    scalar * mult * remaining
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// `(offset, size)` in bits, parallel to the input item list.
    pub entries: Vec<(u64, u64)>,
    pub total_bits: u64,
}

/// Forward pass computing each item's bit offset and size.
///
/// A stack of open branch states keyed by condition `lhs` makes
/// mutually-exclusive union arms reuse the branch start offset, so the total
/// after a union is the maximum over its arms, not their sum.
pub fn offsets_and_sizes(config: &GenerationConfig, items: &[SerializationItem]) -> Layout {
    struct OpenBranch {
        lhs: Vec<PathSegment>,
        rhs: i64,
        start: u64,
        max_end: u64,
    }
    let mut stack: Vec<OpenBranch> = Vec::new();
    let mut offset = 0u64;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let mut common = 0usize;
        while common < stack.len()
            && common < item.conditions.len()
            && stack[common].lhs == item.conditions[common].lhs
        {
            common += 1;
        }
        while stack.len() > common {
            if let Some(closed) = stack.pop() {
                offset = closed.max_end.max(offset);
            }
        }
        if common > 0 {
            let top = common - 1;
            let cond = &item.conditions[top];
            if cond.rhs != stack[top].rhs {
                // next arm of the same union: overlap with the previous one
                stack[top].max_end = stack[top].max_end.max(offset);
                offset = stack[top].start;
                stack[top].rhs = cond.rhs;
            }
        }
        for depth in stack.len()..item.conditions.len() {
            let cond = &item.conditions[depth];
            stack.push(OpenBranch {
                lhs: cond.lhs.clone(),
                rhs: cond.rhs,
                start: offset,
                max_end: offset,
            });
        }
        let size = item_bits(config, item);
        entries.push((offset, size));
        offset += size;
        if let Some(top) = stack.last_mut() {
            top.max_end = top.max_end.max(offset);
        }
    }
    while let Some(closed) = stack.pop() {
        offset = closed.max_end.max(offset);
    }
    Layout {
        entries,
        total_bits: offset,
    }
}

/// Length of the run of adjacent per-element items starting at `start` that
/// can merge into one `Slice{start,count}` loop. Elements merge only when
/// everything except the final slice index is identical.
pub fn slice_run_len(items: &[SerializationItem], start: usize) -> usize {
    let first = &items[start];
    let Some(PathSegment::Slice {
        start: first_idx,
        count: 1,
    }) = first.segments.last()
    else {
        return 1;
    };
    let prefix = &first.segments[..first.segments.len() - 1];
    let mut run = 1usize;
    while start + run < items.len() {
        let next = &items[start + run];
        if next.conditions != first.conditions
            || next.omitted != first.omitted
            || next.defaulted != first.defaulted
            || next.segments.len() != first.segments.len()
            || &next.segments[..next.segments.len() - 1] != prefix
        {
            break;
        }
        match next.segments.last() {
            Some(PathSegment::Slice { start: idx, count: 1 })
                if *idx == first_idx + run as u32 => {}
            _ => break,
        }
        run += 1;
    }
    run
}
