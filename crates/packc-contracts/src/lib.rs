//! Shared, version-pinned schema identifiers.
//!
//! These constants are the single source of truth for the version strings
//! that appear in machine-readable packc I/O: schema documents, generation
//! configs, and generation reports.

pub const PACKC_SCHEMA_VERSION: &str = "packc.schema@0.1.0";
pub const PACKC_CONFIG_SCHEMA_VERSION: &str = "packc.config@0.1.0";
pub const PACKC_REPORT_SCHEMA_VERSION: &str = "packc.report@0.1.0";
