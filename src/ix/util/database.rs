//! Test database functions.

use crate::ix::agent::database;
use crate::ix::util;

/// Create a temporary file-backed database
pub fn temp() -> database::Result<database::Database> {
    util::path::temp("imxup-temp-database", ".db")
        .map_err(Into::into)
        .and_then(|path| database::Database::new(&database::Source::File(path)))
}
