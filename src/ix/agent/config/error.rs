//! Configuration errors.

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

    pub fn config_file_not_found<S: Into<String>>(message: S) -> Error {
        ErrorKind::ConfigFileNotFound {
            message: message.into(),
        }
        .into()
    }

    pub fn invalid_value<K: Into<String>, V: Into<String>>(key: K, value: V) -> Error {
        ErrorKind::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
        .into()
    }

    pub fn missing_credential<S: Into<String>>(name: S) -> Error {
        ErrorKind::MissingCredential { name: name.into() }.into()
    }

    pub fn secret_store<S: Into<String>>(message: S) -> Error {
        ErrorKind::SecretStore {
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
    #[fail(display = "configuration file not found: {}", message)]
    ConfigFileNotFound { message: String },

    #[fail(display = "invalid configuration value for {}: {:?}", key, value)]
    InvalidValue { key: String, value: String },

    #[fail(display = "missing credential: {}", name)]
    MissingCredential { name: String },

    #[fail(display = "secret store error: {}", message)]
    SecretStore { message: String },

    #[fail(display = "ini parse error: {}", error)]
    IniParseError { error: String },

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

/// map from ini parse errors
impl From<ini::ini::ParseError> for Error {
    fn from(error: ini::ini::ParseError) -> Error {
        Error::from(Context::new(ErrorKind::IniParseError {
            error: error.to_string(),
        }))
    }
}

impl From<ini::ini::Error> for Error {
    fn from(error: ini::ini::Error) -> Error {
        Error::from(Context::new(ErrorKind::IniParseError {
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
