//! Primary-host API errors.

use failure::{Backtrace, Context, Fail};
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

    /// True when the operation is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self.kind() {
            ErrorKind::TransientNetwork { .. } => true,
            _ => false,
        }
    }

    pub fn missing_api_key() -> Error {
        ErrorKind::MissingApiKey.into()
    }

    pub fn transient<S: Into<String>>(message: S) -> Error {
        ErrorKind::TransientNetwork {
            message: message.into(),
        }
        .into()
    }

    pub fn fatal_status<S: Into<String>>(status: u16, message: S) -> Error {
        ErrorKind::FatalStatus {
            status,
            message: message.into(),
        }
        .into()
    }

    pub fn malformed_response<S: Into<String>>(message: S) -> Error {
        ErrorKind::MalformedResponse {
            message: message.into(),
        }
        .into()
    }

    pub fn rejected<S: Into<String>>(message: S) -> Error {
        ErrorKind::Rejected {
            message: message.into(),
        }
        .into()
    }

    /// Sorts an HTTP status into the retry taxonomy: server-side failures
    /// are transient, everything else 4xx is fatal.
    pub fn from_status(status: u16, body_hint: &str) -> Error {
        if status >= 500 {
            Error::transient(format!("server returned HTTP {}", status))
        } else {
            Error::fatal_status(status, body_hint.to_string())
        }
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
    #[fail(display = "no API key in the secret store")]
    MissingApiKey,

    #[fail(display = "transient network error: {}", message)]
    TransientNetwork { message: String },

    #[fail(display = "host rejected request (HTTP {}): {}", status, message)]
    FatalStatus { status: u16, message: String },

    #[fail(display = "malformed host response: {}", message)]
    MalformedResponse { message: String },

    #[fail(display = "host rejected upload: {}", message)]
    Rejected { message: String },

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

/// map from reqwest errors: connection and timeout failures are transient
impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Error {
        Error::from(Context::new(ErrorKind::TransientNetwork {
            message: error.to_string(),
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
