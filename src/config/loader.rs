//! Configuration loading
//!
//! Relays files are JSON documents layered with `LOCALRELAY_*` environment
//! overrides through the `config` crate.

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use log::debug;
use std::path::Path;

use crate::common::{RelayError, Result};
use crate::config::defaults::ENV_PREFIX;
use crate::config::validator::validate_file;
use crate::config::RelaysFile;

/// Load and validate a relays file
///
/// # Errors
///
/// Returns [`RelayError::Config`] if the file is missing, is not valid JSON,
/// or describes invalid relays.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<RelaysFile> {
    let path = path.as_ref();

    if !path.is_file() {
        return Err(RelayError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let builder = Config::builder()
        .add_source(File::from(path.to_path_buf()).format(FileFormat::Json))
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    let file = build(builder)?;
    debug!("Loaded {} relay(s) from {}", file.relays.len(), path.display());
    Ok(file)
}

/// Load and validate a relays document held in memory
pub fn load_str(json: &str) -> Result<RelaysFile> {
    build(Config::builder().add_source(File::from_str(json, FileFormat::Json)))
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<RelaysFile> {
    let file: RelaysFile = builder
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| RelayError::Config(format!("Failed to load relays: {}", e)))?;

    validate_file(&file)?;
    Ok(file)
}
