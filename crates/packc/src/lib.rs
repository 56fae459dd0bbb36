pub mod c_backend;
pub mod config;
pub mod diagnostics;
pub mod emit;
pub mod generate;
pub mod instr;
pub mod items;
pub mod layout_query;
pub mod options;
pub mod schema;
pub mod sectors;

mod fingerprint;
