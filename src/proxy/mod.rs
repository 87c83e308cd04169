//! Per-node wrappers that enforce the result protocol between nodes.
//!
//! Both kinds are rendered at build time and shipped inside the node's
//! artifact: a [`RhaiProxy`] wraps a script node's handler, a [`QueryProxy`]
//! is PL/pgSQL appended to the node's SQL. [`ScriptProxy`] applies the same
//! protocol in process, around any [`NodeHandler`].

use handlebars::Handlebars;
use serde_json::Value;
use thiserror::Error;

use crate::command::{CommandDefinition, NodeKind};

pub mod handler;
pub mod query;
pub mod rhai_proxy;
pub mod script;

pub use handler::{ArtifactInfo, RhaiHandler};
pub use query::{HELPER_FILE, QueryProxy, cmd_utils_sql, handler_function_name};
pub use rhai_proxy::{DEFINITION_ENTRY, HANDLER_ENTRY, RESERVED_PREFIX, RhaiProxy, SCRIPT_ENTRY};
pub use script::{
    HandlerError, HandlerOutput, HostInput, NodeCall, NodeHandler, NodeRequest, ProxyOutcome, ScriptProxy,
};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("node index {index} is out of range for a command with {count} nodes")]
    NodeOutOfRange { index: usize, count: usize },

    #[error("node {index} is not a {expected} node")]
    WrongKind { index: usize, expected: NodeKind },

    #[error("payload schema does not compile: {0}")]
    PayloadSchema(String),

    #[error("proxy template failed to render: {0}")]
    Template(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeProxy {
    Script(RhaiProxy),
    Query(QueryProxy),
}

impl NodeProxy {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeProxy::Script(_) => NodeKind::Script,
            NodeProxy::Query(_) => NodeKind::Query,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            NodeProxy::Script(proxy) => &proxy.text,
            NodeProxy::Query(proxy) => &proxy.text,
        }
    }
}

/// Renders the proxy matching the kind of node `index`.
pub fn generate(definition: &CommandDefinition, index: usize) -> Result<NodeProxy, GenerateError> {
    let node = definition.node(index).ok_or(GenerateError::NodeOutOfRange {
        index,
        count: definition.nodes.len(),
    })?;
    match node.kind {
        NodeKind::Script => RhaiProxy::generate(definition, index).map(NodeProxy::Script),
        NodeKind::Query => QueryProxy::generate(definition, index).map(NodeProxy::Query),
    }
}

fn render(template: &str, data: &Value) -> Result<String, GenerateError> {
    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    hbs.render_template(template, data)
        .map_err(|err| GenerateError::Template(err.to_string()))
}

/// Trims trailing whitespace, collapses blank runs and ends with one newline.
pub fn tidy(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank = true;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            if !blank {
                out.push('\n');
            }
            blank = true;
        } else {
            out.push_str(line);
            out.push('\n');
            blank = false;
        }
    }
    let body = out.trim_end();
    format!("{body}\n")
}
