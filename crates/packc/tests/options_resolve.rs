mod testutil;

use serde_json::json;

use packc::config::GenerationConfig;
use packc::options::{
    resolve_field, resolve_unit, FieldOptions, OptionsCache, SchemaError, SchemaErrorKind,
    ShapeKind,
};
use packc::schema::{SchemaDoc, TypeBody};
use testutil::schema_from_json;

fn resolve(
    schema: &SchemaDoc,
    ty: &str,
    field: &str,
) -> Result<FieldOptions, SchemaError> {
    let config = GenerationConfig::default();
    let decl = schema.lookup(ty).expect("type exists");
    let fields = match &decl.body {
        TypeBody::Struct { fields } | TypeBody::Union { fields } => fields,
        other => panic!("unexpected body {other:?}"),
    };
    let f = fields
        .iter()
        .find(|f| f.name == field)
        .expect("field exists");
    resolve_field(&mut OptionsCache::new(), &config, schema, decl, f)
}

#[test]
fn range_attribute_derives_the_bit_count() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "hp", "ty": "u8",
                 "attrs": [{"attr": "integral", "min": 0, "max": 100}]}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "hp").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 7,
            min: 0,
            max: 100,
            signed: false,
        }
    );
}

#[test]
fn bits_alone_keep_the_natural_extremes() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "ticks", "ty": "u16",
                 "attrs": [{"attr": "integral", "bits": 12}]}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "ticks").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 12,
            min: 0,
            max: 65535,
            signed: false,
        }
    );
}

#[test]
fn natural_signed_range_resolves_as_signed() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "temp", "ty": "s8"}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "temp").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 8,
            min: -128,
            max: 127,
            signed: true,
        }
    );
}

#[test]
fn power_of_two_signed_subrange_is_not_signed() {
    // [-8,7] has the span of a 4-bit two's-complement range, but it is a
    // sub-range of s8 and must still resolve to a biased encoding.
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "nudge", "ty": "s8",
                 "attrs": [{"attr": "integral", "min": -8, "max": 7}]}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "nudge").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 4,
            min: -8,
            max: 7,
            signed: false,
        }
    );
}

#[test]
fn an_extreme_integral_range_is_rejected_without_panicking() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "huge", "ty": "s32",
                 "attrs": [{"attr": "integral",
                            "min": -9223372036854775807i64,
                            "max": 9223372036854775807i64}]}
            ]}
        ]
    }));
    let err = resolve(&schema, "Save", "huge").unwrap_err();
    assert_eq!(err.kind, SchemaErrorKind::BadAttributeCombination);
}

#[test]
fn declared_bitfield_width_wins_over_the_derived_count() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "level", "ty": "u8", "bit_width": 6,
                 "attrs": [{"attr": "integral", "min": 0, "max": 20}]}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "level").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 6,
            min: 0,
            max: 20,
            signed: false,
        }
    );
}

#[test]
fn zero_one_range_on_the_bool_type_becomes_boolean() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "alive", "ty": "bool",
                 "attrs": [{"attr": "integral", "min": 0, "max": 1}]},
                {"name": "coin", "ty": "u8",
                 "attrs": [{"attr": "integral", "min": 0, "max": 1}]}
            ]}
        ]
    }));
    assert_eq!(resolve(&schema, "Save", "alive").unwrap().shape, ShapeKind::Boolean);
    // same range on a non-bool type stays a 1-bit integral
    assert_eq!(
        resolve(&schema, "Save", "coin").unwrap().shape,
        ShapeKind::Integral {
            bits: 1,
            min: 0,
            max: 1,
            signed: false,
        }
    );
}

#[test]
fn shape_attributes_are_mutually_exclusive() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "name", "ty": {"name": "u8", "extents": [16]},
                 "attrs": [{"attr": "text"}, {"attr": "buffer"}]}
            ]}
        ]
    }));
    let err = resolve(&schema, "Save", "name").unwrap_err();
    assert_eq!(err.kind, SchemaErrorKind::ContradictoryXOptions);
    assert_eq!(err.code(), "PACKC-OPT-XOPT");
}

#[test]
fn text_reserves_a_terminator_unless_nonstring() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "name", "ty": {"name": "u8", "extents": [16]},
                 "attrs": [{"attr": "text"}]},
                {"name": "code", "ty": {"name": "u8", "extents": [16]},
                 "attrs": [{"attr": "text"}, {"attr": "nonstring"}]}
            ]}
        ]
    }));
    assert_eq!(
        resolve(&schema, "Save", "name").unwrap().shape,
        ShapeKind::Text {
            len: 15,
            nonstring: false
        }
    );
    assert_eq!(
        resolve(&schema, "Save", "code").unwrap().shape,
        ShapeKind::Text {
            len: 16,
            nonstring: true
        }
    );
}

#[test]
fn attributes_inherit_through_the_typedef_chain() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Percent", "kind": "alias", "target": "u8",
             "attrs": [{"attr": "integral", "min": 0, "max": 100}]},
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "charge", "ty": "Percent"},
                {"name": "arr", "ty": {"name": "Percent", "extents": [4]}}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "charge").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 7,
            min: 0,
            max: 100,
            signed: false,
        }
    );
    let arr = resolve(&schema, "Save", "arr").unwrap();
    assert_eq!(arr.extents, vec![4]);
    assert_eq!(
        arr.shape,
        ShapeKind::Integral {
            bits: 7,
            min: 0,
            max: 100,
            signed: false,
        }
    );
}

#[test]
fn newer_attributes_override_inherited_ones() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Percent", "kind": "alias", "target": "u8",
             "attrs": [{"attr": "integral", "min": 0, "max": 100}]},
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "wide", "ty": "Percent",
                 "attrs": [{"attr": "integral", "min": 0, "max": 200}]}
            ]}
        ]
    }));
    let opts = resolve(&schema, "Save", "wide").unwrap();
    assert_eq!(
        opts.shape,
        ShapeKind::Integral {
            bits: 8,
            min: 0,
            max: 200,
            signed: false,
        }
    );
}

#[test]
fn default_requires_omit() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "legacy", "ty": "u8",
                 "attrs": [{"attr": "default", "value": 3}]}
            ]}
        ]
    }));
    let err = resolve(&schema, "Save", "legacy").unwrap_err();
    assert_eq!(err.kind, SchemaErrorKind::BadAttributeCombination);
}

#[test]
fn union_fields_need_a_tagged_union_attribute() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "FormA", "kind": "struct", "fields": [
                {"name": "x", "ty": "u8"}
            ]},
            {"name": "Form", "kind": "union", "fields": [
                {"name": "a", "ty": "FormA", "attrs": [{"attr": "union_member", "id": 1}]}
            ]},
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "form", "ty": "Form"}
            ]}
        ]
    }));
    let err = resolve(&schema, "Save", "form").unwrap_err();
    assert_eq!(err.kind, SchemaErrorKind::UnresolvedTag);
}

#[test]
fn external_tag_must_precede_the_union_field() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "FormA", "kind": "struct", "fields": [
                {"name": "x", "ty": "u8"}
            ]},
            {"name": "Form", "kind": "union", "fields": [
                {"name": "a", "ty": "FormA", "attrs": [{"attr": "union_member", "id": 1}]}
            ]},
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "form", "ty": "Form",
                 "attrs": [{"attr": "tagged_union", "tag": "which"}]},
                {"name": "which", "ty": "u8"}
            ]}
        ]
    }));
    let err = resolve(&schema, "Save", "form").unwrap_err();
    assert_eq!(err.kind, SchemaErrorKind::UnresolvedTag);
}

#[test]
fn a_failing_field_does_not_poison_its_siblings() {
    let schema = schema_from_json(json!({
        "root": "Save",
        "types": [
            {"name": "Save", "kind": "struct", "fields": [
                {"name": "ok", "ty": "u8"},
                {"name": "bad", "ty": "u8",
                 "attrs": [{"attr": "text"}, {"attr": "buffer"}]}
            ]}
        ]
    }));
    let config = GenerationConfig::default();
    let mut cache = OptionsCache::new();
    let mut diags = Vec::new();
    let ok = resolve_unit(&mut cache, &config, &schema, &mut diags);
    assert!(!ok);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].path.as_deref(), Some("Save.bad"));
    assert!(resolve(&schema, "Save", "ok").is_ok());
}
