use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rhai::{EvalAltResult, Module, Scope};
use thiserror::Error;
use tracing::{debug, info};

use crate::toolchain::{self, Bundler, CompilationUnit, SOURCE_EXTENSION, ToolchainError};

use super::definition::{CommandDefinition, DefinitionError};

/// Variable a command source exports its definition under.
pub const DEFINITION_EXPORT: &str = "DEFINITION";
/// Module name of a command's entry source, relative to its directory.
pub const ENTRY_MODULE: &str = "main";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("command `{command}`: no source at {}", path.display())]
    SourceNotFound { command: String, path: PathBuf },

    #[error("command `{command}`: the source does not export `DEFINITION`")]
    DefinitionMissing { command: String },

    #[error("command `{command}`: {source}")]
    Bundle {
        command: String,
        #[source]
        source: ToolchainError,
    },

    #[error("command `{command}`: evaluating the definition failed: {message}")]
    Evaluation { command: String, message: String },

    #[error("command `{command}`: the definition has the wrong shape: {message}")]
    Malformed { command: String, message: String },

    #[error("command `{command}`: {source}")]
    Invalid {
        command: String,
        #[source]
        source: DefinitionError,
    },
}

/// Reads command definitions without running any node logic.
///
/// The loader bundles a tiny unit that re-exports `DEFINITION` from the
/// command's entry module, evaluates it into a throwaway module and keeps
/// only the exported value. Handler functions are compiled but never called.
#[derive(Clone)]
pub struct DefinitionLoader {
    commands_dir: PathBuf,
    bundler: Arc<dyn Bundler>,
}

impl DefinitionLoader {
    pub fn new(commands_dir: impl Into<PathBuf>, bundler: Arc<dyn Bundler>) -> Self {
        Self {
            commands_dir: commands_dir.into(),
            bundler,
        }
    }

    pub fn commands_dir(&self) -> &Path {
        &self.commands_dir
    }

    pub fn command_dir(&self, command_id: &str) -> PathBuf {
        self.commands_dir.join(command_id)
    }

    pub fn entry_path(&self, command_id: &str) -> PathBuf {
        self.command_dir(command_id)
            .join(ENTRY_MODULE)
            .with_extension(SOURCE_EXTENSION)
    }

    #[tracing::instrument(name = "load_definition", skip(self))]
    pub async fn load(&self, command_id: &str) -> Result<CommandDefinition, LoadError> {
        let entry = self.entry_path(command_id);
        if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            return Err(LoadError::SourceNotFound {
                command: command_id.to_string(),
                path: entry,
            });
        }

        let unit = CompilationUnit::new(
            format!("{command_id} (definition)"),
            self.command_dir(command_id),
            definition_unit(),
        );
        let bundled = self
            .bundler
            .bundle(&unit)
            .await
            .map_err(|source| LoadError::Bundle {
                command: command_id.to_string(),
                source,
            })?;
        debug!(bytes = bundled.len(), "definition unit bundled");

        let definition = evaluate(command_id, &unit.label, &bundled)?;
        definition.validate().map_err(|source| LoadError::Invalid {
            command: command_id.to_string(),
            source,
        })?;

        info!(id = %definition.id, nodes = definition.nodes.len(), "definition loaded");
        Ok(definition)
    }
}

fn definition_unit() -> String {
    format!(
        "import \"{ENTRY_MODULE}\" as command;\n\
         const cmdforge_definition = command::{DEFINITION_EXPORT};\n\
         export cmdforge_definition as {DEFINITION_EXPORT};\n"
    )
}

fn evaluate(command_id: &str, label: &str, bundled: &str) -> Result<CommandDefinition, LoadError> {
    let engine = toolchain::script_engine();
    let ast = toolchain::compile(&engine, label, bundled).map_err(|source| LoadError::Bundle {
        command: command_id.to_string(),
        source,
    })?;

    let module = Module::eval_ast_as_new(Scope::new(), &ast, &engine).map_err(|err| match *err {
        EvalAltResult::ErrorVariableNotFound(ref name, _) if name == DEFINITION_EXPORT => {
            LoadError::DefinitionMissing {
                command: command_id.to_string(),
            }
        }
        ref other => LoadError::Evaluation {
            command: command_id.to_string(),
            message: other.to_string(),
        },
    })?;

    let exported = module
        .get_var(DEFINITION_EXPORT)
        .ok_or_else(|| LoadError::DefinitionMissing {
            command: command_id.to_string(),
        })?;

    rhai::serde::from_dynamic::<CommandDefinition>(&exported).map_err(|err| LoadError::Malformed {
        command: command_id.to_string(),
        message: err.to_string(),
    })
}
