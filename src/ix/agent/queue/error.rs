//! Queue manager errors.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::database;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn duplicate_path<S: Into<String>>(path: S) -> Error {
        ErrorKind::DuplicatePath { path: path.into() }.into()
    }

    pub fn item_not_found<S: Into<String>>(path: S) -> Error {
        ErrorKind::ItemNotFound { path: path.into() }.into()
    }

    pub fn not_a_directory<S: Into<String>>(path: S) -> Error {
        ErrorKind::NotADirectory { path: path.into() }.into()
    }

    pub fn scan_invalid<S: Into<String>>(message: S) -> Error {
        ErrorKind::ScanInvalid {
            message: message.into(),
        }
        .into()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.ctx.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.ctx.backtrace()
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        self.kind().clone().into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ctx.fmt(f)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub enum ErrorKind {
    #[fail(display = "gallery already present: {}", path)]
    DuplicatePath { path: String },

    #[fail(display = "no gallery for path: {}", path)]
    ItemNotFound { path: String },

    #[fail(display = "not a directory: {}", path)]
    NotADirectory { path: String },

    #[fail(display = "scan invalid: {}", message)]
    ScanInvalid { message: String },

    #[fail(display = "glob pattern error: {}", error)]
    GlobsetError { error: String },

    #[fail(display = "database error: {}", kind)]
    DatabaseError { kind: database::ErrorKind },

    #[fail(display = "io error: {}", error)]
    IoError { error: String },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::from(Context::new(kind))
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(ctx: Context<ErrorKind>) -> Error {
        Error { ctx }
    }
}

/// map from database errors
impl From<database::ErrorKind> for Error {
    fn from(kind: database::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::DatabaseError { kind }))
    }
}
impl From<database::Error> for Error {
    fn from(error: database::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from globset errors
impl From<globset::Error> for Error {
    fn from(error: globset::Error) -> Error {
        Error::from(Context::new(ErrorKind::GlobsetError {
            error: error.to_string(),
        }))
    }
}

/// map from IO errors
impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::from(Context::new(ErrorKind::IoError {
            error: error.to_string(),
        }))
    }
}
