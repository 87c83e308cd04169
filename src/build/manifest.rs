use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::command::{CommandDefinition, Method, NodeKind};

/// Manifest written next to a command's node artifacts.
pub const MANIFEST_FILE: &str = "command.config.json";

/// File name of node `index`: `node-{index + 1}.{slug}.{extension}`.
pub fn node_file_name(definition: &CommandDefinition, index: usize, minify: bool) -> String {
    let node = &definition.nodes[index];
    format!("node-{}.{}.{}", index + 1, node.slug(), node.kind.extension(minify))
}

/// What the host needs to deploy a built command, nodes in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    pub name: String,
    pub method: Method,
    pub namespace: String,
    pub path: String,
    pub id: String,
    pub nodes: Vec<ManifestNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ManifestNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    pub file: String,
}

impl Manifest {
    pub fn new(definition: &CommandDefinition, minify: bool) -> Self {
        Self {
            name: definition.name.clone(),
            method: definition.method,
            namespace: definition.namespace.clone(),
            path: definition.path.clone(),
            id: definition.id.clone(),
            nodes: definition
                .nodes
                .iter()
                .enumerate()
                .map(|(index, node)| ManifestNode {
                    kind: node.kind,
                    name: node.name.clone(),
                    file: node_file_name(definition, index, minify),
                })
                .collect(),
        }
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self).map(|json| json + "\n")
    }
}
