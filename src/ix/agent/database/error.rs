//! Database errors.

use failure::{Backtrace, Context, Fail};
use std::path::PathBuf;
use std::{fmt, io, result};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn status<S: Into<String>>(token: S) -> Error {
        ErrorKind::InvalidStatus {
            token: token.into(),
        }
        .into()
    }

    pub fn tab_type<S: Into<String>>(token: S) -> Error {
        ErrorKind::InvalidTabType {
            token: token.into(),
        }
        .into()
    }

    pub fn field<S: Into<String>>(name: S) -> Error {
        ErrorKind::InvalidField { name: name.into() }.into()
    }

    pub fn path(path: PathBuf) -> Error {
        ErrorKind::InvalidPath { path }.into()
    }

    pub fn item_not_found<S: Into<String>>(path: S) -> Error {
        ErrorKind::ItemNotFound { path: path.into() }.into()
    }

    pub fn system_tab<S: Into<String>>(name: S) -> Error {
        ErrorKind::SystemTab { name: name.into() }.into()
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
    #[fail(display = "invalid queue status: {:?}", token)]
    InvalidStatus { token: String },

    #[fail(display = "invalid tab type: {:?}", token)]
    InvalidTabType { token: String },

    #[fail(display = "invalid editable field: {:?}", name)]
    InvalidField { name: String },

    #[fail(display = "path is not valid UTF-8: {:?}", path)]
    InvalidPath { path: PathBuf },

    #[fail(display = "no gallery record for path: {}", path)]
    ItemNotFound { path: String },

    #[fail(display = "system tabs cannot be modified: {}", name)]
    SystemTab { name: String },

    #[fail(display = "sqlite error: {}", error)]
    SqliteError { error: String },

    #[fail(display = "connection pool error: {}", error)]
    PoolError { error: String },

    #[fail(display = "json error: {}", error)]
    JsonError { error: String },

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

/// map from rusqlite errors
impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Error {
        Error::from(Context::new(ErrorKind::SqliteError {
            error: error.to_string(),
        }))
    }
}

/// map from r2d2 errors
impl From<r2d2::Error> for Error {
    fn from(error: r2d2::Error) -> Error {
        Error::from(Context::new(ErrorKind::PoolError {
            error: error.to_string(),
        }))
    }
}

/// map from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::from(Context::new(ErrorKind::JsonError {
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
