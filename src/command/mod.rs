//! Command definitions and how they are read from command sources.
//!
//! A command lives in `<commands>/<id>/main.rhai`. The source exports a
//! `DEFINITION` object map and defines the handler function each node names:
//!
//! ```rhai
//! const DEFINITION = #{
//!     id: "users.lookup",
//!     name: "Lookup user",
//!     namespace: "users",
//!     path: "/users/lookup",
//!     method: "GET",
//!     query_params: ["email"],
//!     nodes: [
//!         #{ name: "Prepare", "type": "script", handler: "prepare" },
//!         #{ name: "Find user", "type": "query", handler: "find_user" },
//!         #{ name: "Respond", "type": "script", handler: "respond" }
//!     ]
//! };
//! export DEFINITION;
//!
//! fn prepare(request, previous) { #{ email: request.payload.email } }
//! fn find_user(handler_function_name) { `CREATE OR REPLACE FUNCTION pg_temp.${handler_function_name}...` }
//! fn respond(request, previous) { previous[1].payload }
//! ```

pub mod definition;
pub mod loader;
pub mod payload;

pub use definition::{
    CommandDefinition, DefinitionError, HeaderSpec, MAX_NODES, Method, NodeConfig, NodeKind, slug,
};
pub use loader::{DEFINITION_EXPORT, DefinitionLoader, ENTRY_MODULE, LoadError};
pub use payload::{AcceptAny, PayloadValidator, SchemaValidator};
