#![allow(clippy::uninlined_format_args)]
#![allow(unsafe_code)]

//! Agent configuration for skein.
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! `SKEIN_*` environment variables. [`Validator`] checks the merged result
//! before an agent starts serving.

pub mod config;
pub mod validate;

pub use config::*;
pub use validate::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse into [`SkeinConfig`]
    #[error("malformed config: {0}")]
    Parse(String),

    /// One or more validator errors, joined with `; `
    #[error("invalid config: {0}")]
    Validation(String),

    #[error("bad value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// An override variable is set but cannot be parsed
    #[error("bad environment override: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
