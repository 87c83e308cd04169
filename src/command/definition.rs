use std::{collections::HashSet, fmt};

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    envelope::{Envelope, ProxyErrorCode},
    proxy::{RESERVED_PREFIX, SCRIPT_ENTRY, handler_function_name},
};

use super::payload::SchemaValidator;

/// Upper bound on the number of nodes in one command.
pub const MAX_NODES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// GET and DELETE read their payload from query parameters.
    pub fn reads_query(self) -> bool {
        matches!(self, Method::Get | Method::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Script,
    Query,
}

impl NodeKind {
    /// Artifact file extension.
    pub fn extension(self, minify: bool) -> &'static str {
        match (self, minify) {
            (NodeKind::Script, false) => "rhai",
            (NodeKind::Script, true) => "min.rhai",
            (NodeKind::Query, _) => "sql",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Script => f.write_str("script"),
            NodeKind::Query => f.write_str("query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HeaderSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// One step of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeConfig {
    /// Human label. Its slug keys the node's result at run time.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Function in the command source implementing this node. Script nodes
    /// take `(request, previous)`, query nodes take the SQL handler name and
    /// return the handler's SQL text.
    pub handler: String,
    /// Script nodes only: the handler runs deferred.
    #[serde(default)]
    pub is_async: bool,
}

impl NodeConfig {
    pub fn slug(&self) -> String {
        slug(&self.name)
    }
}

/// Lowercases a node name and replaces spaces with `-`.
pub fn slug(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// The declarative description of a command, as exported by its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandDefinition {
    /// Must equal the name of the directory holding the command source.
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub path: String,
    pub method: Method,
    pub nodes: Vec<NodeConfig>,
    /// Declared request headers, in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderSpec>>,
    /// Query parameter keys read by GET and DELETE commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<Vec<String>>,
    /// JSON Schema every request payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<Value>,
    #[serde(default)]
    pub problems: Vec<String>,
    #[serde(default)]
    pub exit_codes: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DefinitionError {
    #[error("`{field}` must not be empty")]
    Empty { field: &'static str },

    #[error("id `{id}` must start with its namespace `{namespace}.`")]
    IdOutsideNamespace { id: String, namespace: String },

    #[error("path `{path}` must live under `/{namespace}`")]
    PathOutsideNamespace { path: String, namespace: String },

    #[error("a command needs between 1 and 10 nodes, found {0}")]
    NodeCount(usize),

    #[error("node {index} (`{name}`) breaks the node layout: {reason}")]
    Layout {
        index: usize,
        name: String,
        reason: &'static str,
    },

    #[error("node name `{0}` is empty or contains a path separator")]
    InvalidNodeName(String),

    #[error("nodes `{first}` and `{second}` share the result key `{slug}`")]
    DuplicateSlug {
        first: String,
        second: String,
        slug: String,
    },

    #[error("query nodes `{first}` and `{second}` share the SQL function `{function}`")]
    DuplicateQueryFunction {
        first: String,
        second: String,
        function: String,
    },

    #[error("node `{node}` names handler `{handler}`, which is not an identifier")]
    InvalidHandler { node: String, handler: String },

    #[error("node `{node}` names handler `{handler}`, which clashes with the generated proxy")]
    ReservedHandler { node: String, handler: String },

    #[error("query node `{0}` cannot be async")]
    AsyncQuery(String),

    #[error("header `{0}` is declared more than once")]
    DuplicateHeader(String),

    #[error("{method} commands must declare `query_params`")]
    MissingQueryParams { method: Method },

    #[error("{method} commands read a body and cannot declare `query_params`")]
    UnexpectedQueryParams { method: Method },

    #[error("code `{0}` is empty or reserved for the proxy")]
    InvalidCode(String),

    #[error("payload schema does not compile: {0}")]
    PayloadSchema(String),
}

static HANDLER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("handler name pattern"));

impl CommandDefinition {
    /// Checks the structural rules every command must satisfy.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("path", &self.path),
        ] {
            if value.trim().is_empty() {
                return Err(DefinitionError::Empty { field });
            }
        }

        if !self.id.starts_with(&format!("{}.", self.namespace)) {
            return Err(DefinitionError::IdOutsideNamespace {
                id: self.id.clone(),
                namespace: self.namespace.clone(),
            });
        }
        let prefix = format!("/{}", self.namespace);
        if self.path != prefix && !self.path.starts_with(&format!("{prefix}/")) {
            return Err(DefinitionError::PathOutsideNamespace {
                path: self.path.clone(),
                namespace: self.namespace.clone(),
            });
        }

        self.validate_nodes()?;
        self.validate_request()?;
        Ok(())
    }

    fn validate_nodes(&self) -> Result<(), DefinitionError> {
        let count = self.nodes.len();
        if count == 0 || count > MAX_NODES {
            return Err(DefinitionError::NodeCount(count));
        }

        let mut seen: Vec<(String, &str)> = Vec::with_capacity(count);
        let mut functions: Vec<(String, &str)> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.name.trim().is_empty() || node.name.contains(['/', '\\']) {
                return Err(DefinitionError::InvalidNodeName(node.name.clone()));
            }
            let slug = node.slug();
            if let Some((_, first)) = seen.iter().find(|(existing, _)| *existing == slug) {
                return Err(DefinitionError::DuplicateSlug {
                    first: first.to_string(),
                    second: node.name.clone(),
                    slug,
                });
            }
            seen.push((slug, node.name.as_str()));

            if node.kind == NodeKind::Query {
                let function = handler_function_name(&self.id, &node.name);
                if let Some((_, first)) = functions.iter().find(|(existing, _)| *existing == function) {
                    return Err(DefinitionError::DuplicateQueryFunction {
                        first: first.to_string(),
                        second: node.name.clone(),
                        function,
                    });
                }
                functions.push((function, node.name.as_str()));
            }

            if !HANDLER_NAME.is_match(&node.handler) {
                return Err(DefinitionError::InvalidHandler {
                    node: node.name.clone(),
                    handler: node.handler.clone(),
                });
            }
            if node.handler == SCRIPT_ENTRY || node.handler.starts_with(RESERVED_PREFIX) {
                return Err(DefinitionError::ReservedHandler {
                    node: node.name.clone(),
                    handler: node.handler.clone(),
                });
            }

            let layout_error = |reason| DefinitionError::Layout {
                index,
                name: node.name.clone(),
                reason,
            };
            match node.kind {
                NodeKind::Query if node.is_async => {
                    return Err(DefinitionError::AsyncQuery(node.name.clone()));
                }
                NodeKind::Query if index == 0 => {
                    return Err(layout_error("the first node must be a script node"));
                }
                NodeKind::Query if index + 1 == count => {
                    return Err(layout_error("the last node must be a script node"));
                }
                NodeKind::Query if self.nodes[index - 1].kind == NodeKind::Query => {
                    return Err(layout_error("query nodes cannot follow each other"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_request(&self) -> Result<(), DefinitionError> {
        if let Some(headers) = &self.headers {
            let mut names = HashSet::new();
            for header in headers {
                if header.name.trim().is_empty() {
                    return Err(DefinitionError::Empty { field: "headers.name" });
                }
                if !names.insert(header.name.to_lowercase()) {
                    return Err(DefinitionError::DuplicateHeader(header.name.clone()));
                }
            }
        }

        match (self.method.reads_query(), &self.query_params) {
            (true, None) => {
                return Err(DefinitionError::MissingQueryParams {
                    method: self.method,
                });
            }
            (false, Some(_)) => {
                return Err(DefinitionError::UnexpectedQueryParams {
                    method: self.method,
                });
            }
            _ => {}
        }

        for code in self.problems.iter().chain(&self.exit_codes) {
            if code.trim().is_empty() || ProxyErrorCode::from_code(code).is_some() {
                return Err(DefinitionError::InvalidCode(code.clone()));
            }
        }

        if let Some(schema) = &self.payload_schema {
            SchemaValidator::compile(schema).map_err(DefinitionError::PayloadSchema)?;
        }
        Ok(())
    }

    pub fn node(&self, index: usize) -> Option<&NodeConfig> {
        self.nodes.get(index)
    }

    /// Whether user code may emit this envelope for this command.
    pub fn declares(&self, envelope: &Envelope) -> bool {
        match envelope {
            Envelope::Success(_) => true,
            Envelope::Problem(signal) => self.problems.contains(&signal.code),
            Envelope::Exit(signal) => self.exit_codes.contains(&signal.code),
            Envelope::ProxyError { .. } => false,
        }
    }
}
