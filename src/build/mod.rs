//! Turns command sources into deployable node artifacts.
//!
//! For every requested command the [`Builder`] loads the definition, checks
//! that the id matches the directory, compiles all nodes concurrently and
//! only then replaces the command's output directory with the fresh
//! artifacts and manifest.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::join_all;
use rhai::{Dynamic, Scope};
use tracing::{debug, info, warn};

use crate::{
    command::{CommandDefinition, DefinitionLoader, ENTRY_MODULE, NodeKind},
    config::{CommandConfig, EnvBindings, EnvSource, ProjectPaths},
    proxy::{self, HELPER_FILE, NodeProxy, QueryProxy, RhaiProxy, SCRIPT_ENTRY, cmd_utils_sql, handler_function_name},
    toolchain::{self, CompilationUnit, Toolchain, ToolchainError, shake},
};

pub mod error;
pub mod manifest;

pub use error::BuildError;
pub use manifest::{MANIFEST_FILE, Manifest, ManifestNode, node_file_name};

/// Entry function of the throwaway unit evaluated for query nodes.
const QUERY_DEFINER: &str = "cmdforge_query_definer";

const ORDINALS: [&str; 10] = [
    "first", "second", "third", "fourth", "fifth", "sixth", "seventh", "eighth", "ninth", "tenth",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub minify: bool,
    /// Only applies when not minifying.
    pub format: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            minify: false,
            format: true,
        }
    }
}

impl From<&CommandConfig> for BuildOptions {
    fn from(config: &CommandConfig) -> Self {
        Self {
            minify: config.minify,
            format: config.format,
        }
    }
}

/// One written node artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub index: usize,
    pub kind: NodeKind,
    pub file_name: String,
    pub contents: String,
}

#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub id: String,
    pub output_dir: PathBuf,
    pub manifest: Manifest,
    pub artifacts: Vec<Artifact>,
}

/// Outcome of one invocation. Commands succeed or fail independently.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<BuiltCommand>,
    pub failed: Vec<(String, BuildError)>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Builder {
    paths: ProjectPaths,
    options: BuildOptions,
    env: EnvBindings,
    toolchain: Toolchain,
    loader: DefinitionLoader,
}

impl Builder {
    pub fn new(paths: ProjectPaths, options: BuildOptions, env: EnvBindings, toolchain: Toolchain) -> Self {
        let loader = DefinitionLoader::new(paths.commands_dir.clone(), toolchain.bundler.clone());
        Self {
            paths,
            options,
            env,
            toolchain,
            loader,
        }
    }

    /// Loads the environment bindings from `source` first.
    pub async fn with_env_source(
        paths: ProjectPaths,
        options: BuildOptions,
        source: &dyn EnvSource,
        toolchain: Toolchain,
    ) -> Result<Self, BuildError> {
        let env = source.load().await?;
        Ok(Self::new(paths, options, env, toolchain))
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn options(&self) -> BuildOptions {
        self.options
    }

    pub fn loader(&self) -> &DefinitionLoader {
        &self.loader
    }

    /// Builds every command in `ids` concurrently and writes the shared query
    /// helpers. Only an empty id list or a failure to write the helpers fails
    /// the invocation as a whole.
    #[tracing::instrument(name = "build_all", skip(self))]
    pub async fn build_all(&self, ids: &[String]) -> Result<BuildReport, BuildError> {
        if ids.is_empty() {
            return Err(BuildError::NoCommands);
        }
        self.write_helpers().await?;

        let results = join_all(ids.iter().map(|id| self.build_command(id))).await;
        let mut report = BuildReport::default();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(built) => report.built.push(built),
                Err(err) => {
                    warn!(command = %id, error = %err, "command failed to build");
                    report.failed.push((id.clone(), err));
                }
            }
        }
        info!(built = report.built.len(), failed = report.failed.len(), "build finished");
        Ok(report)
    }

    #[tracing::instrument(name = "build_command", skip(self))]
    pub async fn build_command(&self, id: &str) -> Result<BuiltCommand, BuildError> {
        let definition = self.loader.load(id).await?;
        if definition.id != id {
            return Err(BuildError::IdMismatch {
                id: definition.id,
                directory: id.to_string(),
            });
        }
        info!(name = %definition.name, nodes = definition.nodes.len(), "building command");

        let definition = Arc::new(definition);
        let command_dir = self.loader.command_dir(id);
        let compiled = join_all(
            (0..definition.nodes.len()).map(|index| self.compile_node(&definition, index, &command_dir)),
        )
        .await;

        let mut artifacts = Vec::with_capacity(compiled.len());
        for (index, result) in compiled.into_iter().enumerate() {
            artifacts.push(Artifact {
                index,
                kind: definition.nodes[index].kind,
                file_name: node_file_name(&definition, index, self.options.minify),
                contents: result?,
            });
        }

        let manifest = Manifest::new(&definition, self.options.minify);
        let output_dir = self.paths.output_dir.join(id);
        self.write_command(&output_dir, &manifest, &artifacts).await?;
        info!(output = %output_dir.display(), "command built");

        Ok(BuiltCommand {
            id: id.to_string(),
            output_dir,
            manifest,
            artifacts,
        })
    }

    async fn compile_node(
        &self,
        definition: &Arc<CommandDefinition>,
        index: usize,
        command_dir: &Path,
    ) -> Result<String, BuildError> {
        let node = &definition.nodes[index];
        let unit_error = |source| BuildError::Node {
            command: definition.id.clone(),
            node: node.name.clone(),
            source,
        };
        let proxy = proxy::generate(definition, index).map_err(|source| BuildError::Proxy {
            command: definition.id.clone(),
            node: node.name.clone(),
            source,
        })?;
        match proxy {
            NodeProxy::Script(proxy) => self
                .compile_script(definition, index, command_dir, &proxy)
                .await
                .map_err(unit_error),
            NodeProxy::Query(proxy) => {
                let sql = self
                    .compile_query(definition, index, command_dir)
                    .await
                    .map_err(unit_error)?;
                Ok(query_artifact(definition, index, &sql, &proxy))
            }
        }
    }

    /// Bundles the node's handler with what it calls, substitutes the
    /// environment and appends the node's proxy.
    #[tracing::instrument(name = "compile_script", skip(self, definition, command_dir, proxy), fields(command = %definition.id))]
    async fn compile_script(
        &self,
        definition: &CommandDefinition,
        index: usize,
        command_dir: &Path,
        proxy: &RhaiProxy,
    ) -> Result<String, ToolchainError> {
        let node = &definition.nodes[index];
        let unit = CompilationUnit::new(format!("{} / {}", definition.id, node.name), command_dir, script_unit());

        let bundled = self.toolchain.bundler.bundle(&unit).await?;
        let reachable = shake::retain_reachable(&bundled, &[node.handler.as_str()])?;
        let substituted = self.env.substitute(&reachable)?;
        let source = script_artifact(&substituted, proxy);
        let ast = toolchain::compile(&toolchain::script_engine(), &unit.label, &source)?;
        toolchain::require_function(&ast, &unit.label, &node.handler, 2)?;
        toolchain::require_function(&ast, &unit.label, SCRIPT_ENTRY, 1)?;
        debug!(bundled = bundled.len(), kept = reachable.len(), "script node compiled");

        let header = provenance(definition, index, "//");
        if self.options.minify {
            let minified = self.toolchain.minifier.minify(&source).await?;
            return Ok(format!("{header}\n{minified}\n"));
        }
        let artifact = format!("{header}\n\n{source}");
        if self.options.format {
            self.toolchain.formatter.format(&artifact).await
        } else {
            Ok(artifact)
        }
    }

    /// Evaluates the node's definer and returns the SQL it produced.
    #[tracing::instrument(name = "compile_query", skip(self, definition, command_dir), fields(command = %definition.id))]
    async fn compile_query(
        &self,
        definition: &CommandDefinition,
        index: usize,
        command_dir: &Path,
    ) -> Result<String, ToolchainError> {
        let node = &definition.nodes[index];
        let label = format!("{} / {}", definition.id, node.name);
        let unit = CompilationUnit::new(label.clone(), command_dir, query_unit(&node.handler));

        let bundled = self.toolchain.bundler.bundle(&unit).await?;
        let engine = toolchain::script_engine();
        let ast = toolchain::compile(&engine, &label, &bundled)?;
        toolchain::require_function(&ast, &label, &node.handler, 1)?;

        let evaluation = |message: String| ToolchainError::Evaluation {
            unit: label.clone(),
            message,
        };
        let sql = engine
            .call_fn::<Dynamic>(
                &mut Scope::new(),
                &ast,
                QUERY_DEFINER,
                (handler_function_name(&definition.id, &node.name),),
            )
            .map_err(|err| evaluation(err.to_string()))?
            .into_string()
            .map_err(|found| evaluation(format!("query handler must return SQL text, got {found}")))?;
        debug!(bytes = sql.len(), "query node compiled");
        Ok(sql)
    }

    async fn write_helpers(&self) -> Result<(), BuildError> {
        let output = &self.paths.output_dir;
        tokio::fs::create_dir_all(output)
            .await
            .map_err(BuildError::io(output))?;
        let helpers = cmd_utils_sql().map_err(|source| BuildError::Proxy {
            command: "*".into(),
            node: HELPER_FILE.into(),
            source,
        })?;
        let path = output.join(HELPER_FILE);
        tokio::fs::write(&path, helpers).await.map_err(BuildError::io(&path))
    }

    async fn write_command(
        &self,
        output_dir: &Path,
        manifest: &Manifest,
        artifacts: &[Artifact],
    ) -> Result<(), BuildError> {
        let json = manifest.to_json().map_err(|source| BuildError::Manifest {
            command: manifest.id.clone(),
            source,
        })?;

        match tokio::fs::remove_dir_all(output_dir).await {
            Ok(()) => debug!(dir = %output_dir.display(), "removed previous output"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BuildError::io(output_dir)(err)),
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(BuildError::io(output_dir))?;

        for artifact in artifacts {
            let path = output_dir.join(&artifact.file_name);
            tokio::fs::write(&path, &artifact.contents)
                .await
                .map_err(BuildError::io(&path))?;
        }
        let path = output_dir.join(MANIFEST_FILE);
        tokio::fs::write(&path, json).await.map_err(BuildError::io(&path))
    }
}

fn script_unit() -> String {
    format!("import \"{ENTRY_MODULE}\" as command;\n")
}

fn script_artifact(code: &str, proxy: &RhaiProxy) -> String {
    format!(
        "{}\n\n// -------------------\n// |     PROXY     |\n// -------------------\n{}",
        code.trim_end(),
        proxy.text
    )
}

fn query_unit(handler: &str) -> String {
    format!(
        "import \"{ENTRY_MODULE}\" as command;\n\n\
         fn {QUERY_DEFINER}(handler_function_name) {{\n    command::{handler}(handler_function_name)\n}}\n"
    )
}

fn provenance(definition: &CommandDefinition, index: usize, comment: &str) -> String {
    let ordinal = ORDINALS.get(index).copied().unwrap_or("later");
    format!(
        "{comment} Node parent command: '{}'\n{comment} Node name: '{}'\n{comment} Node index: {index} -- {ordinal} node",
        definition.name, definition.nodes[index].name
    )
}

fn query_artifact(definition: &CommandDefinition, index: usize, sql: &str, proxy: &QueryProxy) -> String {
    format!(
        "{}\n\n{}\n\n-------------------\n-- |   PROXY   | --\n-------------------\n{}\n",
        provenance(definition, index, "--"),
        sql.trim(),
        proxy.text.trim()
    )
}
