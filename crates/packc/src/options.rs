//! Option Resolver: computes each field's effective serialization shape
//! from the attributes inherited through its array/typedef chain.
//!
//! Resolution is field-local: a failure poisons only the failing field (and
//! whatever depends on it), never its siblings. Results are cached per
//! `(owner type, field)` for the lifetime of the compilation unit.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::GenerationConfig;
use crate::diagnostics::{Diagnostic, Stage};
use crate::schema::{
    builtin_prim, Attr, FieldDecl, PrimKind, SchemaDoc, TypeBody, TypeDecl, TypeRef,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeKind {
    /// No storage of its own; carries padding when `pad_bits` is set.
    None,
    Boolean,
    Buffer {
        bytes: u32,
    },
    Integral {
        bits: u32,
        min: i64,
        max: i64,
        /// True when the stored value is the declared type's full
        /// two's-complement range, so it can be written as-is instead of
        /// biased by `min`.
        signed: bool,
    },
    Pointer,
    Text {
        len: u32,
        nonstring: bool,
    },
    Structure {
        type_name: String,
    },
    TaggedUnion {
        type_name: String,
        tag: String,
        internal: bool,
    },
    /// Serialized as the substitute type's shape, converted through the
    /// named functions on the way in and out of storage.
    Transformed {
        options: Box<FieldOptions>,
        pre: String,
        post: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldOptions {
    pub shape: ShapeKind,
    /// Array extents left after shape derivation, outermost first. The
    /// shape describes one element.
    pub extents: Vec<u32>,
    pub omitted: bool,
    pub default_value: Option<i64>,
    pub union_member_id: Option<i64>,
    pub never_split: bool,
    pub pad_bits: Option<u32>,
    pub stat_categories: Vec<String>,
    pub notes: Vec<String>,
}

impl FieldOptions {
    /// Serialized bits of one element; `None` for shapes that expand into
    /// sub-items instead of occupying storage directly.
    pub fn scalar_bits(&self, config: &GenerationConfig) -> Option<u64> {
        match &self.shape {
            ShapeKind::None => Some(u64::from(self.pad_bits.unwrap_or(0))),
            ShapeKind::Boolean => Some(1),
            ShapeKind::Buffer { bytes } => Some(u64::from(*bytes) * 8),
            ShapeKind::Integral { bits, .. } => Some(u64::from(*bits)),
            ShapeKind::Pointer => Some(u64::from(config.pointer_bits)),
            ShapeKind::Text { len, .. } => Some(u64::from(*len) * 8),
            ShapeKind::Transformed { options, .. } => options.scalar_bits(config),
            ShapeKind::Structure { .. } | ShapeKind::TaggedUnion { .. } => None,
        }
    }

    pub fn total_bits(&self, config: &GenerationConfig) -> Option<u64> {
        let scalar = self.scalar_bits(config)?;
        Some(self.extents.iter().fold(scalar, |acc, e| acc * u64::from(*e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    BadAttributeCombination,
    ContradictoryXOptions,
    UnresolvedTag,
    TypeResolutionFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        SchemaError {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            SchemaErrorKind::BadAttributeCombination => "PACKC-OPT-BADATTR",
            SchemaErrorKind::ContradictoryXOptions => "PACKC-OPT-XOPT",
            SchemaErrorKind::UnresolvedTag => "PACKC-OPT-TAG",
            SchemaErrorKind::TypeResolutionFailure => "PACKC-TYPE-UNRESOLVED",
        }
    }

    pub fn to_diagnostic(&self, path: &str) -> Diagnostic {
        Diagnostic::error(self.code(), Stage::Resolve, self.message.clone()).with_path(path)
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

pub type OptionsCache = BTreeMap<(String, String), Result<FieldOptions, SchemaError>>;

/// A type reference walked to its terminal, with the attribute chain in
/// oldest-ancestor-first order and all array extents composed.
struct ResolvedRef {
    attrs: Vec<Attr>,
    extents: Vec<u32>,
    /// Every type name on the chain, field reference first.
    names: Vec<String>,
    terminal: Terminal,
}

enum Terminal {
    Prim(PrimKind),
    Struct(String),
    Union(String),
}

fn walk_ref(schema: &SchemaDoc, ty: &TypeRef, depth: usize) -> Result<ResolvedRef, SchemaError> {
    if depth > 64 {
        return Err(SchemaError::new(
            SchemaErrorKind::TypeResolutionFailure,
            format!("typedef chain through {:?} is too deep or cyclic", ty.name),
        ));
    }
    let mut resolved = if let Some(prim) = builtin_prim(&ty.name) {
        ResolvedRef {
            attrs: Vec::new(),
            extents: Vec::new(),
            names: vec![ty.name.clone()],
            terminal: Terminal::Prim(prim),
        }
    } else if let Some(decl) = schema.lookup(&ty.name) {
        match &decl.body {
            TypeBody::Alias { target } => {
                let mut inner = walk_ref(schema, target, depth + 1)?;
                // the alias is newer than everything it wraps
                inner.attrs.extend(decl.attrs.iter().cloned());
                inner.names.insert(0, decl.name.clone());
                inner
            }
            TypeBody::Struct { .. } => ResolvedRef {
                attrs: decl.attrs.clone(),
                extents: Vec::new(),
                names: vec![decl.name.clone()],
                terminal: Terminal::Struct(decl.name.clone()),
            },
            TypeBody::Union { .. } => ResolvedRef {
                attrs: decl.attrs.clone(),
                extents: Vec::new(),
                names: vec![decl.name.clone()],
                terminal: Terminal::Union(decl.name.clone()),
            },
            TypeBody::Prim { prim } => ResolvedRef {
                attrs: decl.attrs.clone(),
                extents: Vec::new(),
                names: vec![decl.name.clone()],
                terminal: Terminal::Prim(*prim),
            },
        }
    } else {
        return Err(SchemaError::new(
            SchemaErrorKind::TypeResolutionFailure,
            format!("unknown type {:?}", ty.name),
        ));
    };
    // this reference's extents wrap whatever the chain produced
    let mut extents = ty.extents.clone();
    extents.extend(resolved.extents);
    resolved.extents = extents;
    Ok(resolved)
}

pub fn resolve_field(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    owner: &TypeDecl,
    field: &FieldDecl,
) -> Result<FieldOptions, SchemaError> {
    let key = (owner.name.clone(), field.name.clone());
    if let Some(cached) = cache.get(&key) {
        return cached.clone();
    }
    let result = resolve_parts(cache, config, schema, Some(owner), field);
    cache.insert(key, result.clone());
    result
}

fn resolve_parts(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    owner: Option<&TypeDecl>,
    field: &FieldDecl,
) -> Result<FieldOptions, SchemaError> {
    let walked = walk_ref(schema, &field.ty, 0)?;
    let mut attrs = walked.attrs.clone();
    attrs.extend(field.attrs.iter().cloned());

    let mut omitted = false;
    let mut default_value = None;
    let mut union_member_id = None;
    let mut never_split = false;
    let mut nonstring = false;
    let mut pad_bits = None;
    let mut stat_categories = Vec::new();
    let mut notes = Vec::new();
    let mut shape_attrs: Vec<&Attr> = Vec::new();
    for attr in &attrs {
        if attr.is_shape() {
            shape_attrs.push(attr);
            continue;
        }
        match attr {
            Attr::Omit => omitted = true,
            Attr::Default { value } => default_value = Some(*value),
            Attr::UnionMember { id } => union_member_id = Some(*id),
            Attr::NeverSplit => never_split = true,
            Attr::Nonstring => nonstring = true,
            Attr::StatCategory { name } => stat_categories.push(name.clone()),
            Attr::Note { text } => notes.push(text.clone()),
            _ => {}
        }
    }

    // a newer attribute of the same kind overrides what the chain
    // inherited; different kinds on one field are contradictory
    if shape_attrs.len() > 1 {
        let kinds: Vec<&str> = shape_attrs.iter().map(|a| shape_attr_name(a)).collect();
        if kinds.windows(2).any(|w| w[0] != w[1]) {
            return Err(SchemaError::new(
                SchemaErrorKind::ContradictoryXOptions,
                format!(
                    "field {:?} combines mutually exclusive shape attributes: {}",
                    field.name,
                    kinds.join(", ")
                ),
            ));
        }
    }

    let mut extents = walked.extents.clone();
    let shape = match shape_attrs.last() {
        Some(Attr::Pad { bits }) => {
            if !extents.is_empty() {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!("field {:?}: pad cannot apply to an array", field.name),
                ));
            }
            if *bits == 0 {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!("field {:?}: pad of zero bits", field.name),
                ));
            }
            pad_bits = Some(*bits);
            ShapeKind::None
        }
        Some(Attr::Buffer { bytes }) => {
            let total = match bytes {
                Some(b) => *b,
                None => {
                    let elem = prim_byte_size(&walked, config).ok_or_else(|| {
                        SchemaError::new(
                            SchemaErrorKind::BadAttributeCombination,
                            format!(
                                "field {:?}: buffer without an explicit byte count needs a sized primitive element",
                                field.name
                            ),
                        )
                    })?;
                    extents.iter().fold(elem, |acc, e| acc * *e)
                }
            };
            if total == 0 {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!("field {:?}: zero-byte buffer", field.name),
                ));
            }
            extents.clear();
            ShapeKind::Buffer { bytes: total }
        }
        Some(Attr::Integral { bits, min, max }) => {
            derive_integral(config, &walked, field, *bits, *min, *max)?
        }
        Some(Attr::Text) => {
            let last = *extents.last().ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!("field {:?}: text requires a fixed-extent array", field.name),
                )
            })?;
            let byte_elem = matches!(
                walked.terminal,
                Terminal::Prim(PrimKind::Unsigned { bits: 8 })
                    | Terminal::Prim(PrimKind::Signed { bits: 8 })
            );
            if !byte_elem {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!(
                        "field {:?}: text requires single-byte elements",
                        field.name
                    ),
                ));
            }
            extents.pop();
            let len = if nonstring { last } else { last.saturating_sub(1) };
            if len == 0 {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!("field {:?}: text extent leaves no characters", field.name),
                ));
            }
            ShapeKind::Text { len, nonstring }
        }
        Some(Attr::TaggedUnion { tag, internal }) => {
            let type_name = match &walked.terminal {
                Terminal::Union(name) => name.clone(),
                _ => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadAttributeCombination,
                        format!("field {:?}: tagged_union on a non-union type", field.name),
                    ))
                }
            };
            if !*internal && !extents.is_empty() {
                // one sibling tag cannot select arms per element
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!(
                        "field {:?}: an array of unions must be internally tagged",
                        field.name
                    ),
                ));
            }
            validate_tagged_union(cache, config, schema, owner, field, &type_name, tag, *internal)?;
            ShapeKind::TaggedUnion {
                type_name,
                tag: tag.clone(),
                internal: *internal,
            }
        }
        Some(Attr::Transform {
            ty,
            pre,
            post,
            never_split: transform_atomic,
        }) => {
            let inner = resolve_substitute(cache, config, schema, field, ty)?;
            if *transform_atomic {
                never_split = true;
            }
            ShapeKind::Transformed {
                options: Box::new(inner),
                pre: pre.clone(),
                post: post.clone(),
            }
        }
        Some(_) => unreachable!("non-shape attribute in shape position"),
        None => {
            if omitted {
                ShapeKind::None
            } else {
                match &walked.terminal {
                    Terminal::Prim(PrimKind::Unsigned { .. })
                    | Terminal::Prim(PrimKind::Signed { .. }) => {
                        derive_integral(config, &walked, field, None, None, None)?
                    }
                    Terminal::Prim(PrimKind::Float { bits }) => ShapeKind::Buffer { bytes: bits / 8 },
                    Terminal::Prim(PrimKind::Pointer) => ShapeKind::Pointer,
                    Terminal::Struct(name) => ShapeKind::Structure {
                        type_name: name.clone(),
                    },
                    Terminal::Union(_) => {
                        return Err(SchemaError::new(
                            SchemaErrorKind::UnresolvedTag,
                            format!(
                                "field {:?}: union field requires a tagged_union attribute",
                                field.name
                            ),
                        ))
                    }
                }
            }
        }
    };

    if default_value.is_some() && !omitted {
        return Err(SchemaError::new(
            SchemaErrorKind::BadAttributeCombination,
            format!("field {:?}: default requires omit", field.name),
        ));
    }
    if let Some(decl) = owner {
        let in_union = matches!(decl.body, TypeBody::Union { .. });
        if in_union && omitted && default_value.is_some() && union_member_id.is_none() {
            return Err(SchemaError::new(
                SchemaErrorKind::BadAttributeCombination,
                format!(
                    "field {:?}: omitted defaulted union member must carry a union_member id",
                    field.name
                ),
            ));
        }
    }

    Ok(FieldOptions {
        shape,
        extents,
        omitted,
        default_value,
        union_member_id,
        never_split,
        pad_bits,
        stat_categories,
        notes,
    })
}

fn shape_attr_name(attr: &Attr) -> &'static str {
    match attr {
        Attr::Buffer { .. } => "buffer",
        Attr::Integral { .. } => "integral",
        Attr::Text => "text",
        Attr::TaggedUnion { .. } => "tagged_union",
        Attr::Transform { .. } => "transform",
        Attr::Pad { .. } => "pad",
        _ => "?",
    }
}

fn prim_byte_size(walked: &ResolvedRef, config: &GenerationConfig) -> Option<u32> {
    match walked.terminal {
        Terminal::Prim(PrimKind::Unsigned { bits }) | Terminal::Prim(PrimKind::Signed { bits }) => {
            Some(bits.div_ceil(8))
        }
        Terminal::Prim(PrimKind::Float { bits }) => Some(bits / 8),
        Terminal::Prim(PrimKind::Pointer) => Some(config.pointer_bits.div_ceil(8)),
        _ => None,
    }
}

fn bits_for_span(field: &FieldDecl, min: i64, max: i64) -> Result<u32, SchemaError> {
    let span = max.checked_sub(min).ok_or_else(|| {
        SchemaError::new(
            SchemaErrorKind::BadAttributeCombination,
            format!(
                "field {:?}: integral range [{min},{max}] is too wide",
                field.name
            ),
        )
    })? as u64;
    let bits = 64 - span.leading_zeros();
    Ok(bits.max(1))
}

fn derive_integral(
    config: &GenerationConfig,
    walked: &ResolvedRef,
    field: &FieldDecl,
    bits_attr: Option<u32>,
    min_attr: Option<i64>,
    max_attr: Option<i64>,
) -> Result<ShapeKind, SchemaError> {
    let (nat_bits, nat_min, nat_max) = match walked.terminal {
        Terminal::Prim(PrimKind::Unsigned { bits }) if (1..=32).contains(&bits) => {
            (bits, 0i64, (1i64 << bits) - 1)
        }
        Terminal::Prim(PrimKind::Signed { bits }) if (2..=32).contains(&bits) => {
            (bits, -(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        }
        _ => {
            return Err(SchemaError::new(
                SchemaErrorKind::BadAttributeCombination,
                format!(
                    "field {:?}: integral shape needs an integral type of at most 32 bits",
                    field.name
                ),
            ))
        }
    };
    if min_attr.is_some() != max_attr.is_some() {
        return Err(SchemaError::new(
            SchemaErrorKind::BadAttributeCombination,
            format!("field {:?}: integral range needs both min and max", field.name),
        ));
    }
    let range = min_attr.zip(max_attr);
    if let Some((min, max)) = range {
        if max <= min {
            return Err(SchemaError::new(
                SchemaErrorKind::BadAttributeCombination,
                format!("field {:?}: empty integral range [{min},{max}]", field.name),
            ));
        }
    }
    let (bits, min, max) = match (bits_attr, range) {
        (Some(bits), None) => (bits, nat_min, nat_max),
        (None, Some((min, max))) => {
            // a declared bitfield width wins over the derived count
            let bits = match field.bit_width {
                Some(w) => w,
                None => bits_for_span(field, min, max)?,
            };
            (bits, min, max)
        }
        (Some(bits), Some((min, max))) => {
            if bits_for_span(field, min, max)? > bits {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadAttributeCombination,
                    format!(
                        "field {:?}: range [{min},{max}] does not fit in {bits} bits",
                        field.name
                    ),
                ));
            }
            (bits, min, max)
        }
        (None, None) => (field.bit_width.unwrap_or(nat_bits), nat_min, nat_max),
    };
    if bits == 0 || bits > 32 {
        return Err(SchemaError::new(
            SchemaErrorKind::BadAttributeCombination,
            format!("field {:?}: bit count {bits} out of range 1..=32", field.name),
        ));
    }
    if min == 0 && max == 1 && walked.names.iter().any(|n| *n == config.bool_type) {
        return Ok(ShapeKind::Boolean);
    }
    // A sub-range of a signed type still stores biased, even when its span
    // happens to match a power of two. Only the declared type's own full
    // range at its own width can skip the bias.
    let signed = min < 0 && min == nat_min && max == nat_max && bits == nat_bits;
    Ok(ShapeKind::Integral {
        bits,
        min,
        max,
        signed,
    })
}

fn resolve_substitute(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    field: &FieldDecl,
    substitute: &str,
) -> Result<FieldOptions, SchemaError> {
    let synthetic = FieldDecl {
        name: field.name.clone(),
        ty: TypeRef::named(substitute),
        attrs: Vec::new(),
        bit_width: None,
    };
    let inner = resolve_parts(cache, config, schema, None, &synthetic).map_err(|e| {
        SchemaError::new(
            SchemaErrorKind::TypeResolutionFailure,
            format!(
                "field {:?}: transform substitute {:?}: {}",
                field.name, substitute, e.message
            ),
        )
    })?;
    let scalar = matches!(
        inner.shape,
        ShapeKind::Boolean | ShapeKind::Integral { .. } | ShapeKind::Buffer { .. } | ShapeKind::Pointer
    );
    if !scalar || !inner.extents.is_empty() {
        return Err(SchemaError::new(
            SchemaErrorKind::BadAttributeCombination,
            format!(
                "field {:?}: transform substitute {:?} must be a scalar shape",
                field.name, substitute
            ),
        ));
    }
    Ok(inner)
}

#[allow(clippy::too_many_arguments)]
fn validate_tagged_union(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    owner: Option<&TypeDecl>,
    field: &FieldDecl,
    union_name: &str,
    tag: &str,
    internal: bool,
) -> Result<(), SchemaError> {
    let decl = schema.lookup(union_name).ok_or_else(|| {
        SchemaError::new(
            SchemaErrorKind::TypeResolutionFailure,
            format!("unknown union type {union_name:?}"),
        )
    })?;
    let arms = match &decl.body {
        TypeBody::Union { fields } => fields,
        _ => {
            return Err(SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("{union_name:?} is not a union"),
            ))
        }
    };

    if internal {
        let mut leading: Option<&[FieldDecl]> = None;
        let mut saw_arm = false;
        for arm in arms {
            let arm_opts = resolve_field(cache, config, schema, decl, arm).map_err(|e| {
                SchemaError::new(
                    SchemaErrorKind::TypeResolutionFailure,
                    format!("union {union_name:?} arm {:?}: {}", arm.name, e.message),
                )
            })?;
            if arm_opts.omitted {
                continue;
            }
            saw_arm = true;
            let struct_name = match &arm_opts.shape {
                ShapeKind::Structure { type_name } if arm_opts.extents.is_empty() => type_name,
                _ => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::UnresolvedTag,
                        format!(
                            "internally tagged union {union_name:?}: arm {:?} is not a structure",
                            arm.name
                        ),
                    ))
                }
            };
            let arm_decl = schema.lookup(struct_name).ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::TypeResolutionFailure,
                    format!("unknown type {struct_name:?}"),
                )
            })?;
            let arm_fields = match &arm_decl.body {
                TypeBody::Struct { fields } => fields,
                _ => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::UnresolvedTag,
                        format!("union arm type {struct_name:?} is not a struct"),
                    ))
                }
            };
            let tag_pos = arm_fields.iter().position(|f| f.name == tag).ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!(
                        "internally tagged union {union_name:?}: arm {:?} lacks tag field {tag:?}",
                        arm.name
                    ),
                )
            })?;
            let run = &arm_fields[..=tag_pos];
            match leading {
                None => leading = Some(run),
                Some(prev) => {
                    if prev != run {
                        return Err(SchemaError::new(
                            SchemaErrorKind::UnresolvedTag,
                            format!(
                                "internally tagged union {union_name:?}: arms disagree on the leading fields up to {tag:?}",
                            ),
                        ));
                    }
                }
            }
            let tag_opts = resolve_field(cache, config, schema, arm_decl, &arm_fields[tag_pos])
                .map_err(|e| {
                    SchemaError::new(
                        SchemaErrorKind::TypeResolutionFailure,
                        format!("union {union_name:?} tag field {tag:?}: {}", e.message),
                    )
                })?;
            if !matches!(tag_opts.shape, ShapeKind::Integral { .. } | ShapeKind::Boolean)
                || !tag_opts.extents.is_empty()
            {
                return Err(SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!("union {union_name:?}: tag field {tag:?} is not integral"),
                ));
            }
        }
        if !saw_arm {
            return Err(SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("internally tagged union {union_name:?} has no non-omitted arms"),
            ));
        }
    } else {
        let owner_decl = owner.ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("externally tagged union {union_name:?} needs a containing struct"),
            )
        })?;
        let siblings = match &owner_decl.body {
            TypeBody::Struct { fields } => fields,
            _ => {
                return Err(SchemaError::new(
                    SchemaErrorKind::UnresolvedTag,
                    format!(
                        "externally tagged union {union_name:?} must live inside a struct"
                    ),
                ))
            }
        };
        let union_pos = siblings
            .iter()
            .position(|f| f.name == field.name)
            .unwrap_or(siblings.len());
        let tag_pos = siblings.iter().position(|f| f.name == tag).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("tag field {tag:?} is not a sibling of {:?}", field.name),
            )
        })?;
        if tag_pos >= union_pos {
            return Err(SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!(
                    "tag field {tag:?} must be declared before the union field {:?}",
                    field.name
                ),
            ));
        }
        let tag_opts = resolve_field(cache, config, schema, owner_decl, &siblings[tag_pos])
            .map_err(|e| {
                SchemaError::new(
                    SchemaErrorKind::TypeResolutionFailure,
                    format!("tag field {tag:?}: {}", e.message),
                )
            })?;
        if !matches!(tag_opts.shape, ShapeKind::Integral { .. } | ShapeKind::Boolean)
            || !tag_opts.extents.is_empty()
        {
            return Err(SchemaError::new(
                SchemaErrorKind::UnresolvedTag,
                format!("tag field {tag:?} is not integral"),
            ));
        }
    }
    Ok(())
}

/// Walk alias chains from a type name to the declaration they bottom out
/// in. Aliases that add array extents do not name a plain declaration and
/// are rejected.
pub fn terminal_decl<'a>(schema: &'a SchemaDoc, name: &str) -> Result<&'a TypeDecl, SchemaError> {
    let mut current = name.to_string();
    for _ in 0..64 {
        let decl = schema.lookup(&current).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::TypeResolutionFailure,
                format!("unknown type {current:?}"),
            )
        })?;
        match &decl.body {
            TypeBody::Alias { target } => {
                if !target.extents.is_empty() {
                    return Err(SchemaError::new(
                        SchemaErrorKind::TypeResolutionFailure,
                        format!("{current:?} aliases an array, not a declaration"),
                    ));
                }
                current = target.name.clone();
            }
            _ => return Ok(decl),
        }
    }
    Err(SchemaError::new(
        SchemaErrorKind::TypeResolutionFailure,
        format!("typedef chain through {name:?} is too deep or cyclic"),
    ))
}

/// Resolve every field reachable from the schema root, pushing one
/// diagnostic per newly failing field. Sibling resolution always continues.
/// Returns false when any field failed.
pub fn resolve_unit(
    cache: &mut OptionsCache,
    config: &GenerationConfig,
    schema: &SchemaDoc,
    diags: &mut Vec<Diagnostic>,
) -> bool {
    let mut ok = true;
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue = vec![schema.root.clone()];
    while let Some(type_name) = queue.pop() {
        if !visited.insert(type_name.clone()) {
            continue;
        }
        let Some(decl) = schema.lookup(&type_name) else {
            continue;
        };
        let fields = match &decl.body {
            TypeBody::Struct { fields } | TypeBody::Union { fields } => fields,
            TypeBody::Alias { .. } => {
                match walk_ref(schema, &TypeRef::named(&type_name), 0) {
                    Ok(walked) => match walked.terminal {
                        Terminal::Struct(name) | Terminal::Union(name) => queue.push(name),
                        Terminal::Prim(_) => {}
                    },
                    Err(e) => {
                        diags.push(e.to_diagnostic(&type_name));
                        ok = false;
                    }
                }
                continue;
            }
            TypeBody::Prim { .. } => continue,
        };
        for field in fields {
            let fresh = !cache.contains_key(&(type_name.clone(), field.name.clone()));
            match resolve_field(cache, config, schema, decl, field) {
                Ok(opts) => queue_shape_types(&opts, &mut queue),
                Err(e) => {
                    if fresh {
                        diags.push(e.to_diagnostic(&format!("{type_name}.{}", field.name)));
                    }
                    ok = false;
                }
            }
        }
    }
    ok
}

fn queue_shape_types(opts: &FieldOptions, queue: &mut Vec<String>) {
    match &opts.shape {
        ShapeKind::Structure { type_name } | ShapeKind::TaggedUnion { type_name, .. } => {
            queue.push(type_name.clone())
        }
        ShapeKind::Transformed { options, .. } => queue_shape_types(options, queue),
        _ => {}
    }
}
