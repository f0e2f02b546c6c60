//! File-host worker errors.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::{archive, config, database};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn auth_failed<S: Into<String>>(message: S) -> Error {
        ErrorKind::AuthFailed {
            message: message.into(),
        }
        .into()
    }

    pub fn upload_rejected<S: Into<String>>(message: S) -> Error {
        ErrorKind::UploadRejected {
            message: message.into(),
        }
        .into()
    }

    pub fn http_status(status: u16) -> Error {
        ErrorKind::HttpStatus { status }.into()
    }

    pub fn gallery_missing(db_id: i64) -> Error {
        ErrorKind::GalleryMissing { db_id }.into()
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
    #[fail(display = "authentication failed: {}", message)]
    AuthFailed { message: String },

    #[fail(display = "host rejected the upload: {}", message)]
    UploadRejected { message: String },

    #[fail(display = "unexpected HTTP status {}", status)]
    HttpStatus { status: u16 },

    #[fail(display = "no gallery record with db id {}", db_id)]
    GalleryMissing { db_id: i64 },

    #[fail(display = "network error: {}", message)]
    Network { message: String },

    #[fail(display = "archive error: {}", kind)]
    ArchiveError { kind: archive::ErrorKind },

    #[fail(display = "config error: {}", kind)]
    ConfigError { kind: config::ErrorKind },

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

/// map from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Error {
        Error::from(Context::new(ErrorKind::Network {
            message: error.to_string(),
        }))
    }
}

/// map from archive errors
impl From<archive::ErrorKind> for Error {
    fn from(kind: archive::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::ArchiveError { kind }))
    }
}
impl From<archive::Error> for Error {
    fn from(error: archive::Error) -> Error {
        error.kind().clone().into()
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

/// map from IO errors
impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::from(Context::new(ErrorKind::IoError {
            error: error.to_string(),
        }))
    }
}
