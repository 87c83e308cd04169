use serde_json::{Value, json};

use crate::{
    command::{CommandDefinition, NodeKind},
    envelope::{DISCRIMINATOR, ERROR_FIELD, EnvelopeKind, INFO_FIELD, SCRIPT_SOURCE},
};

use super::{GenerateError, render, tidy};

/// Schema holding the shared protocol helpers.
pub const HELPER_SCHEMA: &str = "cmd_utils";
/// File the helper schema is written to, at the output root.
pub const HELPER_FILE: &str = "cmd_utils.sql";
/// Temporary table a query proxy leaves its result in.
pub const SCRATCH_TABLE: &str = "__cmd_current_node_result";

const PROXY_TEMPLATE: &str = r#"
CREATE OR REPLACE FUNCTION pg_temp.{{prefix}}__handle_cmd_node(prev_node_result jsonb)
RETURNS boolean AS $$
BEGIN
  DROP TABLE IF EXISTS {{table}};
{{#each branches}}
  {{#if @first}}IF{{else}}ELSIF{{/if}} {{../schema}}.{{this}}(prev_node_result) THEN
    CREATE TEMP TABLE {{../table}} AS
    SELECT * FROM {{../schema}}.get_short_circuit_result(prev_node_result);
{{/each}}
{{#if guarded}}
  ELSE
{{/if}}
    CREATE TEMP TABLE {{table}} AS
    SELECT * FROM pg_temp.{{handler}}(prev_node_result);
{{#if guarded}}
  END IF;
{{/if}}
  RETURN true;
END $$ LANGUAGE plpgsql;

DROP TABLE IF EXISTS __void;
SELECT pg_temp.{{prefix}}__handle_cmd_node({{source}}) INTO __void;
SELECT * FROM {{table}};
"#;

const HELPERS_TEMPLATE: &str = r#"
CREATE SCHEMA IF NOT EXISTS {{schema}};

CREATE OR REPLACE FUNCTION {{schema}}.unwrap_result(result jsonb)
RETURNS jsonb AS $$
BEGIN
  IF result ->> 'source' = '{{script_source}}' THEN
    RETURN result -> 'payload';
  END IF;
  RETURN result #> '{response,items,0}';
END $$ LANGUAGE plpgsql IMMUTABLE;
{{#each predicates}}

CREATE OR REPLACE FUNCTION {{../schema}}.{{name}}(result jsonb)
RETURNS boolean AS $$
BEGIN
  RETURN COALESCE({{../schema}}.unwrap_result(result) ->> '{{../discriminator}}' = '{{tag}}', false);
END $$ LANGUAGE plpgsql IMMUTABLE;
{{/each}}

CREATE OR REPLACE FUNCTION {{schema}}.get_short_circuit_result(result jsonb)
RETURNS TABLE({{discriminator}} text, {{error_field}} jsonb, {{info_field}} jsonb) AS $$
  SELECT body ->> '{{discriminator}}', body -> '{{error_field}}', body -> '{{info_field}}'
  FROM (SELECT {{schema}}.unwrap_result(result) AS body) AS unwrapped;
$$ LANGUAGE sql IMMUTABLE;
"#;

/// Lowercases, maps `.`, space and `-` to `_` and drops anything else that
/// is not `[a-z0-9_]`.
pub fn sanitize(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '.' | ' ' | '-' => Some('_'),
            'a'..='z' | '0'..='9' | '_' => Some(c),
            _ => None,
        })
        .collect()
}

/// SQL function a query node's handler must define: `{command id}__{node name}`.
pub fn handler_function_name(command_id: &str, node_name: &str) -> String {
    format!("{}__{}", sanitize(command_id), sanitize(node_name))
}

/// The generated wrapper of one query node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryProxy {
    pub handler_function_name: String,
    /// Expression the proxy feeds its wrapper function: `NULL` for the first
    /// node, otherwise the preceding node's result placeholder.
    pub placeholder: String,
    pub text: String,
}

impl QueryProxy {
    pub fn generate(definition: &CommandDefinition, index: usize) -> Result<Self, GenerateError> {
        let node = definition.node(index).ok_or(GenerateError::NodeOutOfRange {
            index,
            count: definition.nodes.len(),
        })?;
        if node.kind != NodeKind::Query {
            return Err(GenerateError::WrongKind {
                index,
                expected: NodeKind::Query,
            });
        }

        let handler = handler_function_name(&definition.id, &node.name);
        // the first node has nothing to short-circuit on
        let (placeholder, branches): (String, Vec<&str>) = match index.checked_sub(1) {
            None => ("NULL::jsonb".to_string(), Vec::new()),
            Some(prev) => (
                format!("'{{{{{}}}}}'::jsonb", definition.nodes[prev].slug()),
                EnvelopeKind::SHORT_CIRCUITS
                    .iter()
                    .filter_map(|kind| kind.sql_predicate())
                    .collect(),
            ),
        };

        let data = json!({
            "prefix": format!("p_{handler}"),
            "handler": handler,
            "table": SCRATCH_TABLE,
            "schema": HELPER_SCHEMA,
            "guarded": !branches.is_empty(),
            "branches": branches,
            "source": placeholder,
        });
        let rendered = render(PROXY_TEMPLATE, &data)?;
        let text = rendered
            .lines()
            .filter(|line| !line.trim().is_empty() || line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Self {
            handler_function_name: handler,
            placeholder,
            text: tidy(&text),
        })
    }
}

/// Renders the helper schema every query proxy relies on.
pub fn cmd_utils_sql() -> Result<String, GenerateError> {
    let predicates: Vec<Value> = EnvelopeKind::SHORT_CIRCUITS
        .iter()
        .filter_map(|kind| match (kind.sql_predicate(), kind.tag()) {
            (Some(name), Some(tag)) => Some(json!({ "name": name, "tag": tag })),
            _ => None,
        })
        .collect();

    let data = json!({
        "schema": HELPER_SCHEMA,
        "script_source": SCRIPT_SOURCE,
        "discriminator": DISCRIMINATOR,
        "error_field": ERROR_FIELD,
        "info_field": INFO_FIELD,
        "predicates": predicates,
    });
    render(HELPERS_TEMPLATE, &data).map(|sql| tidy(&sql))
}
