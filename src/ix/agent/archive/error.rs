//! Archive errors.

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

    pub fn not_a_directory(path: PathBuf) -> Error {
        ErrorKind::NotADirectory { path }.into()
    }

    pub fn empty_folder(path: PathBuf) -> Error {
        ErrorKind::EmptyFolder { path }.into()
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
    #[fail(display = "not a directory: {:?}", path)]
    NotADirectory { path: PathBuf },

    #[fail(display = "nothing to archive in {:?}", path)]
    EmptyFolder { path: PathBuf },

    #[fail(display = "zip error: {}", error)]
    ZipError { error: String },

    #[fail(display = "directory walk error: {}", error)]
    WalkdirError { error: String },

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

/// map from zip errors
impl From<zip::result::ZipError> for Error {
    fn from(error: zip::result::ZipError) -> Error {
        Error::from(Context::new(ErrorKind::ZipError {
            error: error.to_string(),
        }))
    }
}

/// map from walkdir errors
impl From<walkdir::Error> for Error {
    fn from(error: walkdir::Error) -> Error {
        Error::from(Context::new(ErrorKind::WalkdirError {
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
