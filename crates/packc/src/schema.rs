//! Schema document model.
//!
//! A schema arrives as a JSON document (already past any host-language
//! attribute parsing) carrying per-type and per-field attribute lists. The
//! document is version-pinned via `schema_version`.

use serde::{Deserialize, Serialize};

use packc_contracts::PACKC_SCHEMA_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub schema_version: String,
    /// Name of the structure type the generation request serializes.
    pub root: String,
    pub types: Vec<TypeDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<Attr>,
    /// Flattened: the body's `kind` tag and payload sit beside `name` in
    /// the JSON object.
    #[serde(flatten)]
    pub body: TypeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeBody {
    /// Typedef link. Each hop may add attributes and array extents.
    Alias { target: TypeRef },
    Struct { fields: Vec<FieldDecl> },
    Union { fields: Vec<FieldDecl> },
    Prim { prim: PrimKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "base", rename_all = "snake_case")]
pub enum PrimKind {
    Unsigned { bits: u32 },
    Signed { bits: u32 },
    Float { bits: u32 },
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<Attr>,
    /// Declared bitfield width, when the field is a fixed-width bitfield.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_width: Option<u32>,
}

/// A type reference with outermost-first array extents. Accepts a bare
/// string in JSON as shorthand for an extent-free reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extents: Vec<u32>,
}

impl TypeRef {
    pub fn named(name: &str) -> Self {
        TypeRef {
            name: name.to_string(),
            extents: Vec::new(),
        }
    }
}

impl<'de> Deserialize<'de> for TypeRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Full {
                name: String,
                #[serde(default)]
                extents: Vec<u32>,
            },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Name(name) => TypeRef {
                name,
                extents: Vec::new(),
            },
            Repr::Full { name, extents } => TypeRef { name, extents },
        })
    }
}

/// Closed attribute vocabulary. The shape attributes (`buffer`, `integral`,
/// `text`, `tagged_union`, `transform`, `pad`) are mutually exclusive per
/// field; the rest are modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attr", rename_all = "snake_case")]
pub enum Attr {
    Buffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes: Option<u32>,
    },
    Integral {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bits: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Text,
    /// Marks a character array as raw bytes: no terminator is reserved.
    /// Inherited transitively through typedefs.
    Nonstring,
    TaggedUnion {
        tag: String,
        #[serde(default)]
        internal: bool,
    },
    Transform {
        ty: String,
        pre: String,
        post: String,
        #[serde(default)]
        never_split: bool,
    },
    Omit,
    Default {
        value: i64,
    },
    UnionMember {
        id: i64,
    },
    NeverSplit,
    Pad {
        bits: u32,
    },
    StatCategory {
        name: String,
    },
    Note {
        text: String,
    },
}

impl Attr {
    /// True for the mutually-exclusive shape ("x-option") attributes.
    pub fn is_shape(&self) -> bool {
        matches!(
            self,
            Attr::Buffer { .. }
                | Attr::Integral { .. }
                | Attr::Text
                | Attr::TaggedUnion { .. }
                | Attr::Transform { .. }
                | Attr::Pad { .. }
        )
    }
}

/// Built-in primitive type names every schema can reference without
/// declaring them.
pub fn builtin_prim(name: &str) -> Option<PrimKind> {
    Some(match name {
        "u8" => PrimKind::Unsigned { bits: 8 },
        "u16" => PrimKind::Unsigned { bits: 16 },
        "u32" => PrimKind::Unsigned { bits: 32 },
        "s8" => PrimKind::Signed { bits: 8 },
        "s16" => PrimKind::Signed { bits: 16 },
        "s32" => PrimKind::Signed { bits: 32 },
        "bool" => PrimKind::Unsigned { bits: 8 },
        "f32" => PrimKind::Float { bits: 32 },
        "f64" => PrimKind::Float { bits: 64 },
        "ptr" => PrimKind::Pointer,
        _ => return None,
    })
}

impl SchemaDoc {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, String> {
        let doc: SchemaDoc =
            serde_json::from_slice(bytes).map_err(|e| format!("schema parse error: {e}"))?;
        if doc.schema_version != PACKC_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version {:?} (expected {:?})",
                doc.schema_version, PACKC_SCHEMA_VERSION
            ));
        }
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_json_value(v: &serde_json::Value) -> Result<Self, String> {
        let doc: SchemaDoc = serde_json::from_value(v.clone())
            .map_err(|e| format!("schema parse error: {e}"))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn lookup(&self, name: &str) -> Option<&TypeDecl> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Structural checks that do not need option resolution: identifier
    /// shapes, duplicate names, nonzero extents, and a resolvable root.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for decl in &self.types {
            validate_type_name(&decl.name)?;
            if builtin_prim(&decl.name).is_some() {
                return Err(format!("type {:?} shadows a builtin", decl.name));
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(format!("duplicate type name {:?}", decl.name));
            }
            match &decl.body {
                TypeBody::Alias { target } => validate_ref(target)?,
                TypeBody::Struct { fields } | TypeBody::Union { fields } => {
                    let mut field_names = std::collections::BTreeSet::new();
                    if fields.is_empty() {
                        return Err(format!("type {:?} has no fields", decl.name));
                    }
                    for f in fields {
                        validate_member_name(&f.name)?;
                        if !field_names.insert(f.name.as_str()) {
                            return Err(format!(
                                "duplicate field {:?} in type {:?}",
                                f.name, decl.name
                            ));
                        }
                        validate_ref(&f.ty)?;
                        if let Some(w) = f.bit_width {
                            if w == 0 || w > 32 {
                                return Err(format!(
                                    "field {:?} bit width {w} out of range 1..=32",
                                    f.name
                                ));
                            }
                        }
                    }
                }
                TypeBody::Prim { .. } => {}
            }
        }
        if self.lookup(&self.root).is_none() && builtin_prim(&self.root).is_none() {
            return Err(format!("root type {:?} is not declared", self.root));
        }
        Ok(())
    }
}

fn validate_ref(ty: &TypeRef) -> Result<(), String> {
    validate_type_name(&ty.name)?;
    for e in &ty.extents {
        if *e == 0 {
            return Err(format!("zero array extent on type {:?}", ty.name));
        }
    }
    Ok(())
}

pub fn validate_type_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("type name must be non-empty".to_string());
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(format!("invalid type name start (must be [A-Za-z_]): {name:?}"));
    }
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!(
                "invalid type name char (allowed [A-Za-z0-9_]): {name:?}"
            ));
        }
    }
    Ok(())
}

pub fn validate_member_name(name: &str) -> Result<(), String> {
    validate_type_name(name).map_err(|e| e.replace("type name", "member name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_declarations_parse_from_the_flat_object_form() {
        let doc = SchemaDoc::from_json_value(&json!({
            "schema_version": PACKC_SCHEMA_VERSION,
            "root": "Save",
            "types": [
                {"name": "Percent", "kind": "alias", "target": "u8"},
                {"name": "Save", "kind": "struct", "fields": [
                    {"name": "hp", "ty": "Percent"},
                    {"name": "inv", "ty": {"name": "u8", "extents": [4]}}
                ]}
            ]
        }))
        .unwrap();
        assert!(matches!(doc.types[0].body, TypeBody::Alias { .. }));
        let TypeBody::Struct { fields } = &doc.types[1].body else {
            panic!("expected a struct body");
        };
        assert_eq!(fields[1].ty.extents, vec![4]);
    }

    #[test]
    fn type_declarations_serialize_back_to_the_flat_object_form() {
        let doc = SchemaDoc {
            schema_version: PACKC_SCHEMA_VERSION.to_string(),
            root: "Save".to_string(),
            types: vec![TypeDecl {
                name: "Save".to_string(),
                attrs: Vec::new(),
                body: TypeBody::Struct {
                    fields: vec![FieldDecl {
                        name: "hp".to_string(),
                        ty: TypeRef::named("u8"),
                        attrs: Vec::new(),
                        bit_width: None,
                    }],
                },
            }],
        };
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["types"][0]["kind"], "struct");
        assert!(v["types"][0].get("body").is_none());
        assert_eq!(v["types"][0]["fields"][0]["name"], "hp");
    }
}
