//! CLI errors.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::{config, database, queue};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn unknown_gallery<S: Into<String>>(path: S) -> Error {
        ErrorKind::UnknownGallery { path: path.into() }.into()
    }

    pub fn refused<S: Into<String>>(message: S) -> Error {
        ErrorKind::Refused {
            message: message.into(),
        }
        .into()
    }

    pub fn no_manifest<S: Into<String>>(path: S) -> Error {
        ErrorKind::NoManifest { path: path.into() }.into()
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
    #[fail(display = "no gallery in the queue for {}", path)]
    UnknownGallery { path: String },

    #[fail(display = "{}", message)]
    Refused { message: String },

    #[fail(display = "no completion manifest found for {}", path)]
    NoManifest { path: String },

    #[fail(display = "config error: {}", kind)]
    ConfigError { kind: config::ErrorKind },

    #[fail(display = "database error: {}", kind)]
    DatabaseError { kind: database::ErrorKind },

    #[fail(display = "queue error: {}", kind)]
    QueueError { kind: queue::ErrorKind },

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

/// map from config errors
impl From<config::ErrorKind> for Error {
    fn from(kind: config::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::ConfigError { kind }))
    }
}
impl From<config::Error> for Error {
    fn from(error: config::Error) -> Error {
        error.kind().clone().into()
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

/// map from queue errors
impl From<queue::ErrorKind> for Error {
    fn from(kind: queue::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::QueueError { kind }))
    }
}
impl From<queue::Error> for Error {
    fn from(error: queue::Error) -> Error {
        error.kind().clone().into()
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
