use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(kodi_forwarder::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(kodi_forwarder::config::invalid))]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(kodi_forwarder::config::missing_field))]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating a mapping document.
///
/// All of these are fatal at startup: a forwarder without a valid mapping
/// table has nothing to do.
#[derive(Error, Diagnostic, Debug)]
pub enum MappingError {
    #[error("No mapping named '{name}' found under {dir}")]
    #[diagnostic(code(kodi_forwarder::mapping::not_found))]
    NotFound { name: String, dir: PathBuf },

    #[error("Mapping '{name}' in {path} is malformed: {source}")]
    #[diagnostic(code(kodi_forwarder::mapping::malformed))]
    Malformed {
        name: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "Mapping '{name}': duplicate entry for key {key} (flags {flags:#04x}, phase {phase})"
    )]
    #[diagnostic(code(kodi_forwarder::mapping::duplicate_entry))]
    DuplicateEntry {
        name: String,
        key: String,
        flags: u8,
        phase: String,
    },

    #[error("Mapping '{name}': entry for key {key} has no action")]
    #[diagnostic(code(kodi_forwarder::mapping::empty_entry))]
    EmptyEntry { name: String, key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
