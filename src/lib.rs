mod ix;

pub use crate::ix::agent::api;
pub use crate::ix::agent::archive;
pub use crate::ix::agent::artifacts;
pub use crate::ix::agent::bandwidth;
pub use crate::ix::agent::cli;
pub use crate::ix::agent::config;
pub use crate::ix::agent::database;
pub use crate::ix::agent::engine;
pub use crate::ix::agent::filehost;
pub use crate::ix::agent::hooks;
pub use crate::ix::agent::queue;
pub use crate::ix::agent::rename;
pub use crate::ix::agent::{Agent, AgentHandle};
pub use crate::ix::util;
pub use crate::ix::{
    config_file, database_file, ensure_home_layout, galleries_dir, home_dir, logs_dir, messages,
    scratch_dir, templates_dir, Error, ErrorKind, Result, ServiceHandle, ServiceId,
};
