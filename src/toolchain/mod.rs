//! Build collaborators: bundling, minifying and formatting script sources.
//!
//! The orchestrator only talks to the [`Bundler`], [`Minifier`] and
//! [`Formatter`] traits. The defaults in this module work on Rhai sources in
//! process.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rhai::{AST, Engine, module_resolvers::DummyModuleResolver};
use thiserror::Error;

pub mod bundler;
pub mod format;
pub mod host;
pub mod minify;
pub mod scan;
pub mod shake;

pub use bundler::RhaiBundler;
pub use format::RhaiFormatter;
pub use minify::RhaiMinifier;

/// Extension of command sources and of their imports.
pub const SOURCE_EXTENSION: &str = "rhai";

/// Upper bound on operations for any build-time evaluation.
const MAX_OPERATIONS: u64 = 5_000_000;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("{unit}: cannot resolve import `{import}` ({})", path.display())]
    ImportNotFound {
        unit: String,
        import: String,
        path: PathBuf,
    },

    #[error("{unit}: failed to read {}: {source}", path.display())]
    Io {
        unit: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{unit}: syntax error: {message}")]
    Syntax { unit: String, message: String },

    #[error("{unit}: evaluation failed: {message}")]
    Evaluation { unit: String, message: String },

    #[error("{unit}: no function `{handler}` taking {arity} parameters")]
    MissingHandler {
        unit: String,
        handler: String,
        arity: usize,
    },

    #[error("unterminated {what} starting at byte {offset}")]
    Unterminated { what: &'static str, offset: usize },
}

/// A synthetic entry point handed to the bundler.
///
/// `import` paths in `source` resolve against `base_dir`.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub label: String,
    pub base_dir: PathBuf,
    pub source: String,
}

impl CompilationUnit {
    pub fn new(label: impl Into<String>, base_dir: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            base_dir: base_dir.into(),
            source: source.into(),
        }
    }
}

/// Resolves every import of a unit into one self-contained source.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, unit: &CompilationUnit) -> Result<String, ToolchainError>;
}

#[async_trait]
pub trait Minifier: Send + Sync {
    async fn minify(&self, source: &str) -> Result<String, ToolchainError>;
}

#[async_trait]
pub trait Formatter: Send + Sync {
    async fn format(&self, source: &str) -> Result<String, ToolchainError>;
}

#[derive(Clone)]
pub struct Toolchain {
    pub bundler: Arc<dyn Bundler>,
    pub minifier: Arc<dyn Minifier>,
    pub formatter: Arc<dyn Formatter>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            bundler: Arc::new(RhaiBundler),
            minifier: Arc::new(RhaiMinifier),
            formatter: Arc::new(RhaiFormatter),
        }
    }
}

/// An engine that cannot load modules, so bundled sources run in isolation.
/// It carries the [`host`] functions compiled artifacts rely on.
pub fn script_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.set_max_operations(MAX_OPERATIONS);
    host::register(&mut engine);
    engine
}

/// Fails unless `ast` defines `name` with exactly `arity` parameters.
pub fn require_function(ast: &AST, unit: &str, name: &str, arity: usize) -> Result<(), ToolchainError> {
    if ast
        .iter_functions()
        .any(|function| function.name == name && function.params.len() == arity)
    {
        return Ok(());
    }
    Err(ToolchainError::MissingHandler {
        unit: unit.to_string(),
        handler: name.to_string(),
        arity,
    })
}

/// Renders `value` as a double-quoted Rhai string literal.
pub fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Compiles a bundled source, reporting syntax errors against `unit`.
pub fn compile(engine: &Engine, unit: &str, source: &str) -> Result<AST, ToolchainError> {
    engine.compile(source).map_err(|err| ToolchainError::Syntax {
        unit: unit.to_string(),
        message: err.to_string(),
    })
}
