//! Configuration loading, validation and env substitution.
//!
//! Config files: `courier.toml`, `courier.yaml` or `courier.json`,
//! searched in `./` then `~/.config/courier/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw file,
//! and `COURIER_SENDING_*` overrides after parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config},
    schema::{CourierConfig, SendingConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
