//! Compiles multi-node commands written in Rhai into standalone per-node
//! artifacts: script nodes become self-contained Rhai sources and query nodes
//! become PL/pgSQL text wrapped in a generated proxy.

pub mod build;
pub mod command;
pub mod config;
pub mod envelope;
pub mod logger;
pub mod proxy;
pub mod schema;
pub mod toolchain;
