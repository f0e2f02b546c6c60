//! Upload engine errors.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::api;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn no_images<S: Into<String>>(path: S) -> Error {
        ErrorKind::NoImages { path: path.into() }.into()
    }

    pub fn gallery_create_failed<S: Into<String>>(message: S) -> Error {
        ErrorKind::GalleryCreateFailed {
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
    #[fail(display = "no image files found in {}", path)]
    NoImages { path: String },

    #[fail(display = "failed to create gallery: {}", message)]
    GalleryCreateFailed { message: String },

    #[fail(display = "api error: {}", kind)]
    ApiError { kind: api::ErrorKind },

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

/// map from api errors
impl From<api::ErrorKind> for Error {
    fn from(kind: api::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::ApiError { kind }))
    }
}
impl From<api::Error> for Error {
    fn from(error: api::Error) -> Error {
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
