//! Functions the script engine provides to compiled artifacts.
//!
//! Generated node proxies parse request bodies and prior node results and
//! check payload schemas through these. Any host running an artifact must
//! register them, which [`super::script_engine`] does.

use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::Value;

use crate::{
    command::{PayloadValidator, SchemaValidator},
    envelope,
};

/// `cmd_parse_json(text)`: strict JSON, throws on malformed text.
pub const PARSE_JSON: &str = "cmd_parse_json";
/// `cmd_parse_result(text)`: node result text, tolerating `{<json>}: <status>`.
pub const PARSE_RESULT: &str = "cmd_parse_result";
/// `cmd_matches_schema(value, schema)`: JSON Schema check.
pub const MATCHES_SCHEMA: &str = "cmd_matches_schema";

type HostResult<T> = Result<T, Box<EvalAltResult>>;

pub fn register(engine: &mut Engine) {
    engine.register_fn(PARSE_JSON, parse_json);
    engine.register_fn(PARSE_RESULT, parse_result);
    engine.register_fn(MATCHES_SCHEMA, matches_schema);
}

fn parse_json(text: &str) -> HostResult<Dynamic> {
    let value: Value = serde_json::from_str(text).map_err(|err| format!("invalid JSON: {err}"))?;
    rhai::serde::to_dynamic(value)
}

fn parse_result(text: &str) -> HostResult<Dynamic> {
    let value = envelope::parse_result_text(text).map_err(|err| err.to_string())?;
    rhai::serde::to_dynamic(value)
}

fn matches_schema(value: Dynamic, schema: Dynamic) -> HostResult<bool> {
    let value: Value = rhai::serde::from_dynamic(&value)?;
    let schema: Value = rhai::serde::from_dynamic(&schema)?;
    let validator = SchemaValidator::compile(&schema).map_err(|err| format!("invalid payload schema: {err}"))?;
    Ok(validator.validate(&value))
}
