//! Configuration parsing for kodi-forwarder
//!
//! This crate handles parsing the KDL process configuration and loading the
//! JSON button-mapping documents that drive the forwarding engine.

mod error;
mod mapping;
mod model;
mod parser;

pub use error::{ConfigError, MappingError};
pub use mapping::{
    load_mapping, Action, EventPhase, MappingEntry, MappingTable, ModifierFlags,
};
pub use model::*;
pub use parser::{parse_config, parse_config_str};
