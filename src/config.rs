use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::toolchain::{SOURCE_EXTENSION, ToolchainError, scan, string_literal};
use crate::command::ENTRY_MODULE;

/// Project configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "cmdforge.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },

    #[error("environment file {} is missing", path.display())]
    EnvFileMissing { path: PathBuf },

    #[error("environment file {} is invalid: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// Contents of `cmdforge.yaml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProjectConfig {
    /// `true` keeps sources under `./cmdforge`, `false` under `./src/cmdforge`.
    pub root_dir: bool,
    pub command: CommandConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root_dir: false,
            command: CommandConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CommandConfig {
    pub minify: bool,
    /// Whether `commands/.env` must exist.
    pub env: bool,
    /// Tidy readable artifacts.
    pub format: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            minify: false,
            env: true,
            format: true,
        }
    }
}

impl ProjectConfig {
    /// Reads `cmdforge.yaml` from `dir`, falling back to defaults when the
    /// file does not exist.
    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no project configuration, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml_bw::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "loaded project configuration");
        Ok(config)
    }

    pub fn paths(&self, cwd: &Path) -> ProjectPaths {
        let base = if self.root_dir {
            cwd.join("cmdforge")
        } else {
            cwd.join("src").join("cmdforge")
        };
        ProjectPaths::new(base)
    }
}

/// Where sources are read from and artifacts written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub base: PathBuf,
    pub commands_dir: PathBuf,
    pub env_file: PathBuf,
    pub output_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let commands_dir = base.join("commands");
        Self {
            env_file: commands_dir.join(".env"),
            output_dir: base.join(".generated").join("commands"),
            commands_dir,
            base,
        }
    }

    /// Ids of every directory under the commands directory that holds an
    /// entry source, sorted.
    pub async fn command_ids(&self) -> Result<Vec<String>, ConfigError> {
        let io = |source| ConfigError::Io {
            path: self.commands_dir.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.commands_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io(err)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            let entry_file = entry.path().join(ENTRY_MODULE).with_extension(SOURCE_EXTENSION);
            if tokio::fs::try_exists(&entry_file).await.unwrap_or(false) {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bENV\.([A-Za-z_][A-Za-z0-9_]*)\b").expect("env reference pattern"));

/// Values substituted for `ENV.<KEY>` references in script sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBindings {
    values: BTreeMap<String, String>,
}

impl EnvBindings {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replaces `ENV.<KEY>` in code with the bound value as a string literal.
    /// Comments and literals are left alone, as are unbound keys.
    pub fn substitute(&self, source: &str) -> Result<String, ToolchainError> {
        scan::map_code(source, |code| {
            ENV_REFERENCE
                .replace_all(code, |captures: &Captures| match self.get(&captures[1]) {
                    Some(value) => string_literal(value),
                    None => {
                        warn!(key = &captures[1], "no environment binding, reference left as is");
                        captures[0].to_string()
                    }
                })
                .into_owned()
        })
    }
}

/// Somewhere environment bindings come from.
#[async_trait]
pub trait EnvSource: Send + Sync {
    async fn load(&self) -> Result<EnvBindings, ConfigError>;
}

/// A dotenv file, parsed without touching the process environment.
#[derive(Debug, Clone)]
pub struct DotenvFile {
    pub path: PathBuf,
    /// A missing file is an error rather than an empty set of bindings.
    pub required: bool,
}

impl DotenvFile {
    pub fn new(path: impl Into<PathBuf>, required: bool) -> Self {
        Self {
            path: path.into(),
            required,
        }
    }
}

#[async_trait]
impl EnvSource for DotenvFile {
    async fn load(&self) -> Result<EnvBindings, ConfigError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            if self.required {
                return Err(ConfigError::EnvFileMissing {
                    path: self.path.clone(),
                });
            }
            debug!(path = %self.path.display(), "no environment file");
            return Ok(EnvBindings::default());
        }

        let invalid = |source| ConfigError::EnvFile {
            path: self.path.clone(),
            source,
        };
        let mut values = BTreeMap::new();
        for item in dotenvy::from_path_iter(&self.path).map_err(invalid)? {
            let (key, value) = item.map_err(invalid)?;
            values.insert(key, value);
        }
        info!(path = %self.path.display(), keys = values.len(), "loaded environment file");
        Ok(EnvBindings::new(values))
    }
}

/// Fixed bindings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv(pub BTreeMap<String, String>);

impl StaticEnv {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl EnvSource for StaticEnv {
    async fn load(&self) -> Result<EnvBindings, ConfigError> {
        Ok(EnvBindings::new(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaults_apply_without_a_config_file() {
        let dir = tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, ProjectConfig::default());
        assert!(config.command.env);
        assert!(!config.command.minify);

        let paths = config.paths(dir.path());
        assert_eq!(paths.base, dir.path().join("src/cmdforge"));
        assert_eq!(paths.env_file, dir.path().join("src/cmdforge/commands/.env"));
        assert_eq!(paths.output_dir, dir.path().join("src/cmdforge/.generated/commands"));
    }

    #[tokio::test]
    async fn partial_config_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        write(dir.path().join(CONFIG_FILE), "root_dir: true\ncommand:\n  minify: true\n").unwrap();

        let config = ProjectConfig::load(dir.path()).await.unwrap();
        assert!(config.root_dir);
        assert!(config.command.minify);
        assert!(config.command.env);
        assert!(config.command.format);
        assert_eq!(config.paths(dir.path()).base, dir.path().join("cmdforge"));
    }

    #[tokio::test]
    async fn broken_config_is_reported() {
        let dir = tempdir().unwrap();
        write(dir.path().join(CONFIG_FILE), "command: [not, a, map]\n").unwrap();
        assert!(matches!(
            ProjectConfig::load(dir.path()).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn command_ids_are_directories_with_an_entry_source() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        for id in ["b.second", "a.first"] {
            create_dir_all(paths.commands_dir.join(id)).unwrap();
            write(paths.commands_dir.join(id).join("main.rhai"), "").unwrap();
        }
        create_dir_all(paths.commands_dir.join("no.entry")).unwrap();
        write(&paths.env_file, "A=1\n").unwrap();

        assert_eq!(paths.command_ids().await.unwrap(), vec!["a.first", "b.second"]);
    }

    #[tokio::test]
    async fn dotenv_files_do_not_leak_into_the_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        write(&path, "CMDFORGE_TEST_ONLY_KEY=\"quoted value\"\n# comment\nOTHER=plain\n").unwrap();

        let env = DotenvFile::new(&path, true).load().await.unwrap();
        assert_eq!(env.get("CMDFORGE_TEST_ONLY_KEY"), Some("quoted value"));
        assert_eq!(env.get("OTHER"), Some("plain"));
        assert!(std::env::var("CMDFORGE_TEST_ONLY_KEY").is_err());
    }

    #[tokio::test]
    async fn missing_env_file_only_fails_when_required() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        assert!(matches!(
            DotenvFile::new(&path, true).load().await,
            Err(ConfigError::EnvFileMissing { .. })
        ));
        assert!(DotenvFile::new(&path, false).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn substitution_only_touches_code() {
        let env = StaticEnv::default()
            .with("API_KEY", "abc\"123")
            .load()
            .await
            .unwrap();
        let source = "// ENV.API_KEY\nlet key = ENV.API_KEY;\nlet text = \"ENV.API_KEY\";\nlet other = ENV.UNKNOWN;\n";

        assert_eq!(
            env.substitute(source).unwrap(),
            "// ENV.API_KEY\nlet key = \"abc\\\"123\";\nlet text = \"ENV.API_KEY\";\nlet other = ENV.UNKNOWN;\n"
        );
    }
}
