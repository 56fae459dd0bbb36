//! Generation configuration: sector geometry, target type identities, and
//! the bitstream primitive name table. Everything is checked up front so a
//! bad config can never abort generation halfway through emission.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use packc_contracts::PACKC_CONFIG_SCHEMA_VERSION;

use crate::emit::{Direction, Primitive};
use crate::schema::validate_type_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub schema_version: String,
    /// Byte capacity of one storage sector.
    #[serde(default = "default_sector_bytes")]
    pub sector_bytes: u32,
    #[serde(default = "default_max_sectors")]
    pub max_sectors: u32,
    /// Schema type treated as boolean for `[0,1]` reclassification.
    #[serde(default = "default_bool_type")]
    pub bool_type: String,
    /// Target-language byte type, used by backends for buffer casts.
    #[serde(default = "default_byte_type")]
    pub byte_type: String,
    /// Target-language bitstream state type.
    #[serde(default = "default_state_type")]
    pub state_type: String,
    #[serde(default = "default_pointer_bits")]
    pub pointer_bits: u32,
    #[serde(default)]
    pub primitives: PrimitiveNames,
}

fn default_sector_bytes() -> u32 {
    4096
}
fn default_max_sectors() -> u32 {
    4
}
fn default_bool_type() -> String {
    "bool".to_string()
}
fn default_byte_type() -> String {
    "u8".to_string()
}
fn default_state_type() -> String {
    "BitState".to_string()
}
fn default_pointer_bits() -> u32 {
    32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveNames {
    pub init: String,
    pub read_bool: String,
    pub write_bool: String,
    pub read_u8: String,
    pub write_u8: String,
    pub read_u16: String,
    pub write_u16: String,
    pub read_u32: String,
    pub write_u32: String,
    pub read_s8: String,
    pub write_s8: String,
    pub read_s16: String,
    pub write_s16: String,
    pub read_s32: String,
    pub write_s32: String,
    pub read_buffer: String,
    pub write_buffer: String,
    pub read_string: String,
    pub write_string: String,
}

static DEFAULT_PRIMITIVES: Lazy<PrimitiveNames> = Lazy::new(|| PrimitiveNames {
    init: "bit_init".to_string(),
    read_bool: "read_bool".to_string(),
    write_bool: "write_bool".to_string(),
    read_u8: "read_u8".to_string(),
    write_u8: "write_u8".to_string(),
    read_u16: "read_u16".to_string(),
    write_u16: "write_u16".to_string(),
    read_u32: "read_u32".to_string(),
    write_u32: "write_u32".to_string(),
    read_s8: "read_s8".to_string(),
    write_s8: "write_s8".to_string(),
    read_s16: "read_s16".to_string(),
    write_s16: "write_s16".to_string(),
    read_s32: "read_s32".to_string(),
    write_s32: "write_s32".to_string(),
    read_buffer: "read_buffer".to_string(),
    write_buffer: "write_buffer".to_string(),
    read_string: "read_string".to_string(),
    write_string: "write_string".to_string(),
});

impl Default for PrimitiveNames {
    fn default() -> Self {
        DEFAULT_PRIMITIVES.clone()
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            schema_version: PACKC_CONFIG_SCHEMA_VERSION.to_string(),
            sector_bytes: default_sector_bytes(),
            max_sectors: default_max_sectors(),
            bool_type: default_bool_type(),
            byte_type: default_byte_type(),
            state_type: default_state_type(),
            pointer_bits: default_pointer_bits(),
            primitives: PrimitiveNames::default(),
        }
    }
}

impl PrimitiveNames {
    pub fn all(&self) -> [(&'static str, &str); 19] {
        [
            ("init", &self.init),
            ("read_bool", &self.read_bool),
            ("write_bool", &self.write_bool),
            ("read_u8", &self.read_u8),
            ("write_u8", &self.write_u8),
            ("read_u16", &self.read_u16),
            ("write_u16", &self.write_u16),
            ("read_u32", &self.read_u32),
            ("write_u32", &self.write_u32),
            ("read_s8", &self.read_s8),
            ("write_s8", &self.write_s8),
            ("read_s16", &self.read_s16),
            ("write_s16", &self.write_s16),
            ("read_s32", &self.read_s32),
            ("write_s32", &self.write_s32),
            ("read_buffer", &self.read_buffer),
            ("write_buffer", &self.write_buffer),
            ("read_string", &self.read_string),
            ("write_string", &self.write_string),
        ]
    }

    pub fn scalar(&self, dir: Direction, prim: Primitive) -> &str {
        match (dir, prim) {
            (Direction::Read, Primitive::Bool) => &self.read_bool,
            (Direction::Write, Primitive::Bool) => &self.write_bool,
            (Direction::Read, Primitive::U8) => &self.read_u8,
            (Direction::Write, Primitive::U8) => &self.write_u8,
            (Direction::Read, Primitive::U16) => &self.read_u16,
            (Direction::Write, Primitive::U16) => &self.write_u16,
            (Direction::Read, Primitive::U32) => &self.read_u32,
            (Direction::Write, Primitive::U32) => &self.write_u32,
            (Direction::Read, Primitive::S8) => &self.read_s8,
            (Direction::Write, Primitive::S8) => &self.write_s8,
            (Direction::Read, Primitive::S16) => &self.read_s16,
            (Direction::Write, Primitive::S16) => &self.write_s16,
            (Direction::Read, Primitive::S32) => &self.read_s32,
            (Direction::Write, Primitive::S32) => &self.write_s32,
        }
    }
}

impl GenerationConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, String> {
        let config: GenerationConfig =
            serde_json::from_slice(bytes).map_err(|e| format!("config parse error: {e}"))?;
        if config.schema_version != PACKC_CONFIG_SCHEMA_VERSION {
            return Err(format!(
                "unsupported config schema_version {:?} (expected {:?})",
                config.schema_version, PACKC_CONFIG_SCHEMA_VERSION
            ));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sector_bytes == 0 {
            return Err("sector_bytes must be nonzero".to_string());
        }
        if self.max_sectors == 0 {
            return Err("max_sectors must be nonzero".to_string());
        }
        if self.pointer_bits == 0 || self.pointer_bits > 32 {
            return Err(format!(
                "pointer_bits {} out of range 1..=32",
                self.pointer_bits
            ));
        }
        for name in [&self.bool_type, &self.byte_type, &self.state_type] {
            validate_type_name(name).map_err(|e| format!("config type identity: {e}"))?;
        }
        let mut seen = std::collections::BTreeSet::new();
        for (role, name) in self.primitives.all() {
            validate_type_name(name)
                .map_err(|e| format!("primitive {role}: {}", e.replace("type name", "name")))?;
            if !seen.insert(name.to_string()) {
                return Err(format!("primitive {role} reuses the name {name:?}"));
            }
        }
        Ok(())
    }
}
