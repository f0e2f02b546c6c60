//! Rename worker errors.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::{config, database};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn auth_required() -> Error {
        ErrorKind::AuthRequired.into()
    }

    pub fn ddos_challenge() -> Error {
        ErrorKind::DdosChallenge.into()
    }

    pub fn http_status(status: u16) -> Error {
        ErrorKind::HttpStatus { status }.into()
    }

    pub fn network<S: Into<String>>(message: S) -> Error {
        ErrorKind::Network {
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
    #[fail(display = "web session is not authenticated")]
    AuthRequired,

    #[fail(display = "DDoS challenge page served instead of content")]
    DdosChallenge,

    #[fail(display = "unexpected HTTP status {}", status)]
    HttpStatus { status: u16 },

    #[fail(display = "network error: {}", message)]
    Network { message: String },

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
