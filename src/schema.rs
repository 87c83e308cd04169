use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::schema_for;
use tracing::info;

use crate::{build::Manifest, command::CommandDefinition, config::ProjectConfig};

/// Writes the JSON Schemas of the command definition, the build manifest and
/// the project configuration into `out_dir`. Returns the written files.
pub async fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let schemas = [
        ("command-definition", serde_json::to_string_pretty(&schema_for!(CommandDefinition))?),
        ("command-manifest", serde_json::to_string_pretty(&schema_for!(Manifest))?),
        ("cmdforge-config", serde_json::to_string_pretty(&schema_for!(ProjectConfig))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, json) in schemas {
        let path = out_dir.join(format!("{name}.schema.json"));
        tokio::fs::write(&path, json + "\n")
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(path = %path.display(), "schema written");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn writes_one_schema_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(dir.path()).await.unwrap();
        assert_eq!(written.len(), 3);

        let text = std::fs::read_to_string(dir.path().join("command-definition.schema.json")).unwrap();
        let schema: Value = serde_json::from_str(&text).unwrap();
        let required = schema["required"].as_array().unwrap();
        for field in ["id", "name", "namespace", "path", "method", "nodes"] {
            assert!(required.contains(&Value::String(field.into())), "{field} should be required");
        }
    }
}
