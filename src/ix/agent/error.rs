//! This module defines agent-specific error types implementation.

use failure::{Backtrace, Context, Fail};
use std::{fmt, io, num, result, string};

use crate::ix::agent::{
    api, archive, artifacts, cli, config, database, engine, filehost, hooks, queue, rename,
};

/// Type alias for handling errors throughout the agent
pub type Result<T> = result::Result<T, Error>;

/// An error that can occur while interacting with the agent
#[derive(Debug)]
pub struct Error {
    ctx: Context<ErrorKind>,
}

impl Error {
    fn _render<T: string::ToString>(&self, context: Option<T>) -> i32 {
        let kind = self.kind();

        // Display the message to the user
        match context {
            Some(ctx) => eprintln!("{context}:{kind}", context = ctx.to_string(), kind = kind),
            None => eprintln!("{}", kind),
        };

        // Print the message and backtrace to the log
        log::info!("ERROR: {}", kind);
        log::info!(
            "BACKTRACE: {}",
            self.backtrace()
                .map(|bt| bt.to_string())
                .unwrap_or_else(|| "None".to_string())
        );

        1
    }

    /// This function will display an error to the user and return the
    /// code with which the program should exit.
    pub fn render(&self) -> i32 {
        self._render(None as Option<String>)
    }

    /// This function will display an error to the user and return the
    /// code with which the program should exit, along with a provided
    /// context string.
    pub fn render_with_context<T: string::ToString>(&self, context: T) -> i32 {
        self._render(Some(context))
    }

    /// Return the kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        self.ctx.get_context()
    }

    pub fn startup(err: io::Error) -> Error {
        ErrorKind::Startup {
            cause: err.to_string(),
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

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind() == other.kind()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ctx.fmt(f)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Fail)]
pub enum ErrorKind {
    #[fail(display = "missing asset dir")]
    MissingAssetDir,

    #[fail(display = "error encountered during agent service startup: {}", cause)]
    Startup { cause: String },

    #[fail(display = "number parse error: {}", error)]
    ParseIntError { error: String },

    #[fail(display = "io error: {}", error)]
    IoError { error: String },

    #[fail(display = "error setting up logger: {}", error)]
    SetLoggerError { error: String },

    #[fail(display = "json error: {}", error)]
    JsonError { error: String },

    #[fail(display = "url parse error: {}", error)]
    UrlParseError { error: String },

    // links to other modules
    #[fail(display = "config error: {}", kind)]
    ConfigError { kind: config::ErrorKind },

    #[fail(display = "database error: {}", kind)]
    DatabaseError { kind: database::ErrorKind },

    #[fail(display = "queue error: {}", kind)]
    QueueError { kind: queue::ErrorKind },

    #[fail(display = "api error: {}", kind)]
    ApiError { kind: api::ErrorKind },

    #[fail(display = "engine error: {}", kind)]
    EngineError { kind: engine::ErrorKind },

    #[fail(display = "archive error: {}", kind)]
    ArchiveError { kind: archive::ErrorKind },

    #[fail(display = "file host error: {}", kind)]
    FileHostError { kind: filehost::ErrorKind },

    #[fail(display = "rename error: {}", kind)]
    RenameError { kind: rename::ErrorKind },

    #[fail(display = "hooks error: {}", kind)]
    HooksError { kind: hooks::ErrorKind },

    #[fail(display = "artifacts error: {}", kind)]
    ArtifactsError { kind: artifacts::ErrorKind },

    #[fail(display = "cli error: {}", kind)]
    CliError { kind: cli::ErrorKind },
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

/// map from engine errors
impl From<engine::ErrorKind> for Error {
    fn from(kind: engine::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::EngineError { kind }))
    }
}
impl From<engine::Error> for Error {
    fn from(error: engine::Error) -> Error {
        error.kind().clone().into()
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

/// map from file host errors
impl From<filehost::ErrorKind> for Error {
    fn from(kind: filehost::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::FileHostError { kind }))
    }
}
impl From<filehost::Error> for Error {
    fn from(error: filehost::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from rename errors
impl From<rename::ErrorKind> for Error {
    fn from(kind: rename::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::RenameError { kind }))
    }
}
impl From<rename::Error> for Error {
    fn from(error: rename::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from hooks errors
impl From<hooks::ErrorKind> for Error {
    fn from(kind: hooks::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::HooksError { kind }))
    }
}
impl From<hooks::Error> for Error {
    fn from(error: hooks::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from artifacts errors
impl From<artifacts::ErrorKind> for Error {
    fn from(kind: artifacts::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::ArtifactsError { kind }))
    }
}
impl From<artifacts::Error> for Error {
    fn from(error: artifacts::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from cli errors
impl From<cli::ErrorKind> for Error {
    fn from(kind: cli::ErrorKind) -> Error {
        Error::from(Context::new(ErrorKind::CliError { kind }))
    }
}
impl From<cli::Error> for Error {
    fn from(error: cli::Error) -> Error {
        error.kind().clone().into()
    }
}

/// map from ParseInt errors
impl From<num::ParseIntError> for Error {
    fn from(error: num::ParseIntError) -> Error {
        Error::from(Context::new(ErrorKind::ParseIntError {
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

/// map from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::from(Context::new(ErrorKind::JsonError {
            error: error.to_string(),
        }))
    }
}

/// map from url parse errors
impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Error {
        Error::from(Context::new(ErrorKind::UrlParseError {
            error: error.to_string(),
        }))
    }
}

/// map from log errors
impl From<log::SetLoggerError> for Error {
    fn from(error: log::SetLoggerError) -> Error {
        Error::from(Context::new(ErrorKind::SetLoggerError {
            error: error.to_string(),
        }))
    }
}
