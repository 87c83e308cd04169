use serde_json::{Map, Value, json};

use crate::{
    command::{CommandDefinition, NodeKind},
    envelope::{DISCRIMINATOR, ERROR_FIELD, EnvelopeKind, ProxyErrorCode, SCRIPT_SOURCE},
    toolchain::{host, string_literal},
};

use super::{GenerateError, render, tidy};

/// Entry point of every script artifact: `user_code(inputs)`.
pub const SCRIPT_ENTRY: &str = "user_code";
/// `cmd_node_handler(request, previous)`: the node's handler, unproxied.
pub const HANDLER_ENTRY: &str = "cmd_node_handler";
/// `cmd_node_definition()`: what the proxy knows about its command and node.
pub const DEFINITION_ENTRY: &str = "cmd_node_definition";
/// Every function the proxy adds besides the entry point starts with this.
pub const RESERVED_PREFIX: &str = "cmd_";

const PROXY_TEMPLATE: &str = r#"
fn {{definition_entry}}() {
    {{definition}}
}

fn {{handler_entry}}(request, previous) {
    {{handler}}(request, previous)
}

fn cmd_container(payload) {
    #{ "source": "{{source}}", "payload": payload }
}

fn cmd_proxy_result(code, message) {
    cmd_container(#{
        "{{discriminator}}": "{{proxy_tag}}",
        "{{error_field}}": #{ "code": code, "message": message }
    })
}

fn cmd_join(names) {
    let text = "";
    for name in names {
        if text != "" {
            text += ", ";
        }
        text += name;
    }
    text
}

fn cmd_read_payload(definition, inputs) {
    let payload = ();
    if definition.reads_query {
        payload = #{};
        for key in definition.query_params {
            let value = inputs["request.query." + key];
            if type_of(value) != "()" {
                payload[key] = value;
            }
        }
    } else {
        let body = inputs["request.body"];
        let parsed = false;
        if type_of(body) == "string" {
            try {
                payload = {{parse_json}}(body);
                parsed = true;
            } catch {
            }
        }
        if !parsed {
            return #{ "valid": false };
        }
    }
    if type_of(definition.payload_schema) != "()" && !{{matches_schema}}(payload, definition.payload_schema) {
        return #{ "valid": false };
    }
    #{ "valid": true, "value": payload }
}

fn cmd_read_headers(definition, inputs) {
    if type_of(definition.headers) == "()" {
        return #{ "missing": [], "values": () };
    }
    let values = #{};
    let missing = [];
    for header in definition.headers {
        let value = inputs["request.header." + header.name.to_lower()];
        values[header.name] = value;
        if header.required && type_of(value) == "()" {
            missing.push(header.name);
        }
    }
    #{ "missing": missing, "values": values }
}

fn cmd_check_body(body) {
    if type_of(body) != "map" || !body.contains("{{discriminator}}") {
        return body;
    }
    let tag = body["{{discriminator}}"];
{{#each signals}}
    if tag == "{{tag}}" {
        let inner = body["{{field}}"];
        if type_of(inner) != "map" || type_of(inner.code) != "string" {
            throw "malformed {{field}} body";
        }
{{#if codes}}
        if !{{codes}}.contains(inner.code) {
            throw "unknown proxy error code";
        }
{{/if}}
        let message = inner.message;
        if type_of(message) == "()" {
            message = "";
        } else if type_of(message) != "string" {
            throw "malformed {{field}} body";
        }
        return #{ "{{../discriminator}}": tag, "{{field}}": #{ "code": inner.code, "message": message } };
    }
{{/each}}
    throw "unknown result type";
}

fn cmd_normalize(value) {
    if type_of(value) != "map" {
        throw "not a result container";
    }
    if value.source == "{{source}}" {
        return cmd_container(cmd_check_body(value.payload));
    }
    if type_of(value.success) != "bool" {
        throw "not a result container";
    }
    if !value.success {
        return cmd_container(value);
    }
    let response = value.response;
    if type_of(response) != "map" || type_of(response.items) != "array" {
        throw "query result without items";
    }
    let items = response.items;
    if items.len() > 0 && type_of(items[0]) == "map" && items[0].contains("{{discriminator}}") {
        return cmd_container(cmd_check_body(items[0]));
    }
    cmd_container(items)
}

fn cmd_read_previous(definition, inputs) {
    let values = [];
    let faulty = [];
    for node in definition.previous {
        let text = inputs[node.slug];
        let result = ();
        if type_of(text) == "string" {
            try {
                result = cmd_normalize({{parse_result}}(text));
            } catch {
            }
        }
        if type_of(result) == "()" {
            faulty.push(node.name);
        } else {
            values.push(result);
        }
    }
    #{ "faulty": faulty, "values": values }
}

fn {{entry}}(inputs) {
    let definition = {{definition_entry}}();

    let payload = cmd_read_payload(definition, inputs);
    if !payload.valid {
        return cmd_proxy_result(
            "{{invalid_payload}}",
            "The request '" + definition.payload_source + "' does not match the specified type"
        );
    }

    let headers = cmd_read_headers(definition, inputs);
    if headers.missing.len() > 0 {
        return cmd_proxy_result(
            "{{missing_headers}}",
            "The following headers are missing: " + cmd_join(headers.missing)
        );
    }

    let previous = cmd_read_previous(definition, inputs);
    if previous.faulty.len() > 0 {
        return cmd_proxy_result(
            "{{internal_parsing_error}}",
            "Could not determine the result of nodes '" + cmd_join(previous.faulty) + "' inside node '"
                + definition.node + "' at index " + definition.index.to_string()
        );
    }

    let results = previous.values;
    if results.len() > 0 {
        let last = results[results.len() - 1];
        let body = last.payload;
        if type_of(body) == "map" && body.contains("{{discriminator}}") && {{short_circuits}}.contains(body["{{discriminator}}"]) {
            return last;
        }
    }

    let output = {{handler_entry}}(#{ "payload": payload.value, "headers": headers.values }, results);
    if type_of(output) == "map" && output.source == "{{source}}" {
        return output;
    }
    cmd_container(output)
}
"#;

/// The generated wrapper of one script node.
///
/// Appended to the node's handler source, it makes the artifact standalone:
/// `user_code(inputs)` validates the request, reads the earlier results,
/// short-circuits on the last one and only then calls the handler. `inputs`
/// is the host's flat map of `request.body`, `request.query.<key>`,
/// `request.header.<lowercase name>` and one result text per earlier node,
/// keyed by its slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhaiProxy {
    pub text: String,
}

impl RhaiProxy {
    pub fn generate(definition: &CommandDefinition, index: usize) -> Result<Self, GenerateError> {
        let node = definition.node(index).ok_or(GenerateError::NodeOutOfRange {
            index,
            count: definition.nodes.len(),
        })?;
        if node.kind != NodeKind::Script {
            return Err(GenerateError::WrongKind {
                index,
                expected: NodeKind::Script,
            });
        }

        let signals: Vec<Value> = EnvelopeKind::SHORT_CIRCUITS
            .iter()
            .filter_map(|kind| match (kind.tag(), kind.body_field()) {
                (Some(tag), Some(field)) => Some(json!({
                    "tag": tag,
                    "field": field,
                    "codes": (*kind == EnvelopeKind::ProxyError).then(proxy_codes),
                })),
                _ => None,
            })
            .collect();
        let tags: Vec<Value> = EnvelopeKind::SHORT_CIRCUITS
            .iter()
            .filter_map(|kind| kind.tag())
            .map(|tag| Value::String(tag.into()))
            .collect();

        let data = json!({
            "definition_entry": DEFINITION_ENTRY,
            "definition": definition_literal(&node_definition(definition, index)),
            "handler_entry": HANDLER_ENTRY,
            "handler": node.handler,
            "entry": SCRIPT_ENTRY,
            "source": SCRIPT_SOURCE,
            "discriminator": DISCRIMINATOR,
            "error_field": ERROR_FIELD,
            "proxy_tag": EnvelopeKind::ProxyError.tag(),
            "signals": signals,
            "short_circuits": rhai_literal(&Value::Array(tags)),
            "invalid_payload": ProxyErrorCode::InvalidPayload.as_str(),
            "missing_headers": ProxyErrorCode::MissingHeaders.as_str(),
            "internal_parsing_error": ProxyErrorCode::InternalParsingError.as_str(),
            "parse_json": host::PARSE_JSON,
            "parse_result": host::PARSE_RESULT,
            "matches_schema": host::MATCHES_SCHEMA,
        });
        let text = render(PROXY_TEMPLATE, &data)?;
        Ok(Self { text: tidy(&text) })
    }
}

fn proxy_codes() -> String {
    let codes = ProxyErrorCode::ALL
        .iter()
        .map(|code| Value::String(code.as_str().into()))
        .collect();
    rhai_literal(&Value::Array(codes))
}

/// Everything the proxy needs about the command, fixed at build time.
fn node_definition(definition: &CommandDefinition, index: usize) -> Map<String, Value> {
    let node = &definition.nodes[index];
    let previous: Vec<Value> = definition.nodes[..index]
        .iter()
        .map(|earlier| json!({ "name": earlier.name, "slug": earlier.slug() }))
        .collect();
    let headers = definition.headers.as_ref().map(|headers| {
        headers
            .iter()
            .map(|header| json!({ "name": header.name, "required": header.required }))
            .collect::<Vec<_>>()
    });
    let reads_query = definition.method.reads_query();

    let mut map = Map::new();
    map.insert("command".into(), json!(definition.id));
    map.insert("node".into(), json!(node.name));
    map.insert("index".into(), json!(index));
    map.insert("is_async".into(), json!(node.is_async));
    map.insert("method".into(), json!(definition.method.as_str()));
    map.insert("reads_query".into(), json!(reads_query));
    map.insert("payload_source".into(), json!(if reads_query { "query" } else { "body" }));
    map.insert("query_params".into(), json!(definition.query_params.clone().unwrap_or_default()));
    map.insert("headers".into(), json!(headers));
    map.insert("payload_schema".into(), definition.payload_schema.clone().unwrap_or(Value::Null));
    map.insert("problems".into(), json!(definition.problems));
    map.insert("exit_codes".into(), json!(definition.exit_codes));
    map.insert("previous".into(), Value::Array(previous));
    map
}

/// One field per line, nested values inline.
fn definition_literal(map: &Map<String, Value>) -> String {
    let fields: Vec<String> = map
        .iter()
        .map(|(key, value)| format!("        {}: {}", string_literal(key), rhai_literal(value)))
        .collect();
    format!("#{{\n{}\n    }}", fields.join(",\n"))
}

/// Renders a JSON value as the equivalent Rhai expression. `null` becomes `()`.
pub fn rhai_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".into(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => match number.as_i64() {
            Some(int) => int.to_string(),
            None => float_literal(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => string_literal(text),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(rhai_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) if map.is_empty() => "#{}".into(),
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(key, value)| format!("{}: {}", string_literal(key), rhai_literal(value)))
                .collect();
            format!("#{{ {} }}", fields.join(", "))
        }
    }
}

// Rhai wants a decimal point ahead of any exponent
fn float_literal(value: f64) -> String {
    let text = format!("{value:?}");
    match text.find('e') {
        Some(exponent) if !text[..exponent].contains('.') => {
            format!("{}.0{}", &text[..exponent], &text[exponent..])
        }
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{
            HeaderSpec, Method,
            definition::tests::{definition, node},
        },
        envelope::{self, Envelope, WireShape},
        toolchain::{self, script_engine},
    };
    use rhai::{Dynamic, Scope};

    const HANDLERS: &str = r#"
fn prepare(request, previous) { #{ seen: previous.len(), payload: request.payload } }
fn run_query(name) { "" }
fn shape_rows(request, previous) { previous[1].payload }
fn respond(request, previous) { #{ headers: request.headers, count: previous.len() } }
"#;

    fn command() -> CommandDefinition {
        let mut def = definition(vec![
            node("Prepare", NodeKind::Script),
            node("Run query", NodeKind::Query),
            node("Shape rows", NodeKind::Script),
            node("Respond", NodeKind::Script),
        ]);
        def.headers = Some(vec![
            HeaderSpec { name: "X-Token".into(), required: true },
            HeaderSpec { name: "X-Trace".into(), required: false },
        ]);
        def.payload_schema = Some(json!({"type": "object", "required": ["q"]}));
        def
    }

    fn run(def: &CommandDefinition, index: usize, inputs: Value) -> Envelope {
        let proxy = RhaiProxy::generate(def, index).unwrap();
        let engine = script_engine();
        let ast = toolchain::compile(&engine, "artifact", &format!("{HANDLERS}\n{}", proxy.text)).unwrap();
        let inputs = rhai::serde::to_dynamic(inputs).unwrap();
        let result: Dynamic = engine
            .call_fn(&mut Scope::new(), &ast, SCRIPT_ENTRY, (inputs,))
            .unwrap();
        let value: Value = rhai::serde::from_dynamic(&result).unwrap();
        assert_eq!(value["source"], json!("script"), "{value}");
        envelope::classify(&value).unwrap()
    }

    fn script(payload: Value) -> Value {
        Value::String(envelope::script_container(payload).to_string())
    }

    #[test]
    fn the_handler_runs_once_the_checks_pass() {
        let result = run(
            &command(),
            3,
            json!({
                "request.body": "{\"q\": 1}",
                "request.header.x-token": "secret",
                "prepare": script(json!({"step": 1})),
                "run-query": json!({"success": true, "response": {"items": [{"id": 7}]}}).to_string(),
                "shape-rows": script(json!([{"id": 7}])),
            }),
        );
        assert_eq!(
            result,
            Envelope::Success(json!({"headers": {"X-Token": "secret", "X-Trace": null}, "count": 3}))
        );
    }

    #[test]
    fn request_checks_run_in_order() {
        let def = command();
        let invalid = run(&def, 0, json!({"request.body": "{\"other\": 1}"}));
        assert_eq!(
            invalid,
            Envelope::proxy_error(
                ProxyErrorCode::InvalidPayload,
                "The request 'body' does not match the specified type"
            )
        );

        let missing = run(&def, 0, json!({"request.body": "{\"q\": 1}"}));
        assert_eq!(
            missing,
            Envelope::proxy_error(ProxyErrorCode::MissingHeaders, "The following headers are missing: X-Token")
        );
    }

    #[test]
    fn unreadable_results_are_named_with_the_node() {
        let result = run(
            &command(),
            3,
            json!({
                "request.body": "{\"q\": 1}",
                "request.header.x-token": "secret",
                "prepare": script(json!({})),
                "shape-rows": "{not json",
            }),
        );
        assert_eq!(
            result,
            Envelope::proxy_error(
                ProxyErrorCode::InternalParsingError,
                "Could not determine the result of nodes 'Run query, Shape rows' inside node 'Respond' at index 3"
            )
        );
    }

    #[test]
    fn short_circuits_pass_through_from_either_engine() {
        let problem = Envelope::problem("DEFINED_PROBLEM", "no rows");
        let result = run(
            &command(),
            2,
            json!({
                "request.body": "{\"q\": 1}",
                "request.header.x-token": "secret",
                "prepare": script(json!({})),
                "run-query": problem.to_wire(WireShape::Query).to_string(),
            }),
        );
        assert_eq!(result, problem);
    }

    #[test]
    fn query_commands_read_declared_keys() {
        let mut def = definition(vec![node("Prepare", NodeKind::Script)]);
        def.method = Method::Get;
        def.query_params = Some(vec!["a".into()]);
        let result = run(&def, 0, json!({"request.query.a": "1", "request.query.b": "2"}));
        assert_eq!(result, Envelope::Success(json!({"seen": 0, "payload": {"a": "1"}})));
    }

    #[test]
    fn definitions_become_rhai_literals() {
        assert_eq!(
            rhai_literal(&json!({"a": [1, 2.5, null], "b": {"c": "q\"uote"}, "d": {}})),
            r#"#{ "a": [1, 2.5, ()], "b": #{ "c": "q\"uote" }, "d": #{} }"#
        );
        assert_eq!(float_literal(1e20), "1.0e20");
    }

    #[test]
    fn only_script_nodes_get_a_rhai_proxy() {
        assert!(matches!(
            RhaiProxy::generate(&command(), 1),
            Err(GenerateError::WrongKind { index: 1, .. })
        ));
    }
}
