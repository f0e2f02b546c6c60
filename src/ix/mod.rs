//! imxup top-level definitions go here:

use std::fs;
use std::path;

pub mod agent;
pub mod util;

pub use self::agent::messages;
pub use self::agent::{Error, ErrorKind, Result, ServiceHandle, ServiceId};

/// The home directory for imxup configuration files, the queue database,
/// templates, and completed-gallery artifacts:
pub static IMXUP_HOME: &str = ".imxup";

/// Gets the base directory used by the agent for imxup-related assets
/// such as configuration files, the database, templates, etc.
pub fn home_dir() -> Result<Box<path::Path>> {
    match dirs::home_dir() {
        Some(path) => {
            let mut assets = path.clone();
            assets.push(IMXUP_HOME);
            Ok(assets.into())
        }
        None => Err(ErrorKind::MissingAssetDir.into()),
    }
}

/// Gets the location of the imxup agent configuration file.
/// By default, this file is located at "${home_dir()}/imxup.ini".
pub fn config_file() -> Result<Box<path::Path>> {
    home_dir().and_then(|dir| {
        let mut config_file = dir.to_path_buf();
        config_file.push("imxup");
        config_file.set_extension("ini");
        Ok(config_file.into())
    })
}

/// Gets the location of the imxup agent database file.
/// By default, this file is located at "${home_dir()}/imxup.db".
pub fn database_file() -> Result<Box<path::Path>> {
    home_dir().and_then(|dir| {
        let mut db_file = dir.to_path_buf();
        db_file.push("imxup");
        db_file.set_extension("db");
        Ok(db_file.into())
    })
}

/// Gets the central artifact directory where JSON manifests and rendered
/// BBCode files for completed galleries are collected.
/// By default, this directory is located at "${home_dir()}/galleries".
pub fn galleries_dir() -> Result<Box<path::Path>> {
    subdir("galleries")
}

/// Gets the directory holding user BBCode templates (`*.template` files).
/// By default, this directory is located at "${home_dir()}/templates".
pub fn templates_dir() -> Result<Box<path::Path>> {
    subdir("templates")
}

/// Gets the agent log directory.
/// By default, this directory is located at "${home_dir()}/logs".
pub fn logs_dir() -> Result<Box<path::Path>> {
    subdir("logs")
}

/// Gets the scratch directory used for temporary gallery archives.
/// By default, this directory is located at "${home_dir()}/temp".
pub fn scratch_dir() -> Result<Box<path::Path>> {
    subdir("temp")
}

fn subdir(name: &str) -> Result<Box<path::Path>> {
    home_dir().and_then(|dir| {
        let mut sub = dir.to_path_buf();
        sub.push(name);
        Ok(sub.into())
    })
}

/// Creates the imxup home directory layout if any part of it is missing.
pub fn ensure_home_layout() -> Result<()> {
    fs::create_dir_all(home_dir()?)?;
    fs::create_dir_all(galleries_dir()?)?;
    fs::create_dir_all(templates_dir()?)?;
    fs::create_dir_all(logs_dir()?)?;
    fs::create_dir_all(scratch_dir()?)?;
    Ok(())
}
