//! Stable identity for a (schema, config) pair. Written into the report so
//! callers can tell when regenerated output corresponds to new inputs.

use sha2::{Digest, Sha256};

use crate::config::GenerationConfig;
use crate::schema::SchemaDoc;

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Hex SHA-256 over the canonical JSON of the schema and config. Key order
/// is deterministic, so semantically equal inputs hash equal.
pub fn unit_fingerprint(schema: &SchemaDoc, config: &GenerationConfig) -> String {
    let mut hasher = Sha256::new();
    let schema_json = serde_json::to_vec(schema).unwrap_or_default();
    let config_json = serde_json::to_vec(config).unwrap_or_default();
    hasher.update((schema_json.len() as u64).to_le_bytes());
    hasher.update(&schema_json);
    hasher.update((config_json.len() as u64).to_le_bytes());
    hasher.update(&config_json);
    hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaDoc {
        SchemaDoc::from_json_value(&json!({
            "schema_version": packc_contracts::PACKC_SCHEMA_VERSION,
            "root": "Save",
            "types": [
                {"name": "Save", "kind": "struct", "fields": [
                    {"name": "hp", "ty": "u8"}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let config = GenerationConfig::default();
        let a = unit_fingerprint(&schema(), &config);
        let b = unit_fingerprint(&schema(), &config);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut other = config.clone();
        other.sector_bytes = 8192;
        assert_ne!(a, unit_fingerprint(&schema(), &other));
    }
}
