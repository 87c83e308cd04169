use std::path::PathBuf;

use thiserror::Error;

use crate::{command::LoadError, config::ConfigError, proxy::GenerateError, toolchain::ToolchainError};

/// Reasons a command, or a whole build invocation, fails.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no command ids given: pass them with --cmd=<id> or --command=<id>, comma separated")]
    NoCommands,

    #[error("a command directory must be named after its id: got id `{id}` in directory `{directory}`")]
    IdMismatch { id: String, directory: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("command `{command}`, node `{node}`: {source}")]
    Node {
        command: String,
        node: String,
        #[source]
        source: ToolchainError,
    },

    #[error("command `{command}`, node `{node}`: {source}")]
    Proxy {
        command: String,
        node: String,
        #[source]
        source: GenerateError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}`: manifest serialization failed: {source}")]
    Manifest {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| BuildError::Io { path, source }
    }
}
