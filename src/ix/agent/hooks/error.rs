//! Hook execution errors. Hook failures are logged and never fail the
//! gallery they ran for.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, result};

use crate::ix::agent::archive;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn empty_command() -> Error {
        ErrorKind::EmptyCommand.into()
    }

    pub fn non_zero_exit(code: Option<i32>) -> Error {
        ErrorKind::NonZeroExit { code }.into()
    }

    pub fn timed_out(seconds: u64) -> Error {
        ErrorKind::TimedOut { seconds }.into()
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
    #[fail(display = "hook command is empty after substitution")]
    EmptyCommand,

    #[fail(display = "hook exited with code {:?}", code)]
    NonZeroExit { code: Option<i32> },

    #[fail(display = "hook timed out after {} seconds", seconds)]
    TimedOut { seconds: u64 },

    #[fail(display = "archive error: {}", kind)]
    ArchiveError { kind: archive::ErrorKind },

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

/// map from IO errors
impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::from(Context::new(ErrorKind::IoError {
            error: error.to_string(),
        }))
    }
}
