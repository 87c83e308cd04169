use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    command::{AcceptAny, CommandDefinition, NodeConfig, NodeKind, PayloadValidator, SchemaValidator},
    envelope::{self, Envelope, ProxyErrorCode, WireShape},
};

use super::GenerateError;

/// What the host hands a script node for one invocation.
#[derive(Debug, Clone, Default)]
pub struct HostInput {
    body: Option<String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    results: HashMap<String, String>,
}

impl HostInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Header names match case-insensitively.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    /// Stores the raw result text of an earlier node under its slug.
    pub fn with_result(mut self, slug: impl Into<String>, text: impl Into<String>) -> Self {
        self.results.insert(slug.into(), text.into());
        self
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn result(&self, slug: &str) -> Option<&str> {
        self.results.get(slug).map(String::as_str)
    }

    /// The flat map a script artifact's `user_code` reads: `request.body`,
    /// `request.query.<key>`, `request.header.<lowercase name>` and each
    /// earlier node's result text under its slug.
    pub fn to_inputs(&self) -> Map<String, Value> {
        let mut inputs = Map::new();
        if let Some(body) = &self.body {
            inputs.insert("request.body".into(), Value::String(body.clone()));
        }
        for (key, value) in &self.query {
            inputs.insert(format!("request.query.{key}"), Value::String(value.clone()));
        }
        for (name, value) in &self.headers {
            inputs.insert(format!("request.header.{name}"), Value::String(value.clone()));
        }
        for (slug, text) in &self.results {
            inputs.insert(slug.clone(), Value::String(text.clone()));
        }
        inputs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRequest {
    pub payload: Value,
    /// `None` when the command declares no headers.
    pub headers: Option<Map<String, Value>>,
}

/// Arguments of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCall {
    pub request: NodeRequest,
    /// Results of every earlier node, oldest first.
    pub previous: Vec<Envelope>,
}

impl NodeCall {
    /// Earlier results in the script container shape.
    pub fn previous_wire(&self) -> Vec<Value> {
        self.previous
            .iter()
            .map(|envelope| envelope.to_wire(WireShape::Script))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler `{handler}` failed: {message}")]
    Script { handler: String, message: String },

    #[error("handler value could not be converted: {0}")]
    Conversion(String),

    #[error("deferred handler did not complete: {0}")]
    Join(String),

    #[error("{0}")]
    Failed(String),
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

pub enum HandlerOutput {
    Ready(Result<Value, HandlerError>),
    Deferred(HandlerFuture),
}

/// User logic behind a script node.
pub trait NodeHandler: Send + Sync {
    fn call(&self, call: NodeCall) -> HandlerOutput;
}

impl<F> NodeHandler for F
where
    F: Fn(NodeCall) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, call: NodeCall) -> HandlerOutput {
        HandlerOutput::Ready(self(call))
    }
}

/// Result of running a script node: immediate for synchronous handlers,
/// deferred when the handler is.
pub enum ProxyOutcome {
    Ready(Result<Value, HandlerError>),
    Deferred(HandlerFuture),
}

impl ProxyOutcome {
    fn envelope(envelope: &Envelope) -> Self {
        ProxyOutcome::Ready(Ok(envelope.to_wire(WireShape::Script)))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ProxyOutcome::Deferred(_))
    }

    pub async fn resolve(self) -> Result<Value, HandlerError> {
        match self {
            ProxyOutcome::Ready(result) => result,
            ProxyOutcome::Deferred(future) => future.await,
        }
    }
}

/// Runtime wrapper around one script node.
///
/// Before the handler runs, the proxy validates the payload, checks the
/// declared headers, parses every earlier node's result and inspects the last
/// one. Any failure or short-circuit signal is returned instead of calling the
/// handler. The proxy holds no state between calls.
#[derive(Clone)]
pub struct ScriptProxy {
    definition: Arc<CommandDefinition>,
    index: usize,
    validator: Arc<dyn PayloadValidator>,
}

impl ScriptProxy {
    pub fn new(definition: Arc<CommandDefinition>, index: usize) -> Result<Self, GenerateError> {
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

        let validator: Arc<dyn PayloadValidator> = match &definition.payload_schema {
            Some(schema) => Arc::new(SchemaValidator::compile(schema).map_err(GenerateError::PayloadSchema)?),
            None => Arc::new(AcceptAny),
        };
        Ok(Self {
            definition,
            index,
            validator,
        })
    }

    pub fn node(&self) -> &NodeConfig {
        &self.definition.nodes[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    #[tracing::instrument(name = "script_node_proxy", skip_all, fields(command = %self.definition.id, node = self.index))]
    pub fn run(&self, input: &HostInput, handler: &dyn NodeHandler) -> ProxyOutcome {
        let payload = match self.read_payload(input) {
            Ok(payload) => payload,
            Err(envelope) => return ProxyOutcome::envelope(&envelope),
        };
        let headers = match self.read_headers(input) {
            Ok(headers) => headers,
            Err(envelope) => return ProxyOutcome::envelope(&envelope),
        };
        let previous = match self.read_previous(input) {
            Ok(previous) => previous,
            Err(envelope) => return ProxyOutcome::envelope(&envelope),
        };

        if let Some(last) = previous.last() {
            if last.short_circuits() {
                debug!(kind = ?last.kind(), code = ?last.code(), "short-circuiting");
                return ProxyOutcome::envelope(last);
            }
        }

        let call = NodeCall {
            request: NodeRequest { payload, headers },
            previous,
        };
        match handler.call(call) {
            HandlerOutput::Ready(result) => {
                ProxyOutcome::Ready(result.map(|value| wrap_handler_value(&self.definition, value)))
            }
            HandlerOutput::Deferred(future) => {
                let definition = self.definition.clone();
                ProxyOutcome::Deferred(Box::pin(async move {
                    future.await.map(|value| wrap_handler_value(&definition, value))
                }))
            }
        }
    }

    fn read_payload(&self, input: &HostInput) -> Result<Value, Envelope> {
        let (payload, source) = if self.definition.method.reads_query() {
            let mut object = Map::new();
            for key in self.definition.query_params.iter().flatten() {
                if let Some(value) = input.query(key) {
                    object.insert(key.clone(), Value::String(value.to_string()));
                }
            }
            (Some(Value::Object(object)), "query")
        } else {
            let parsed = input.body().and_then(|body| serde_json::from_str::<Value>(body).ok());
            (parsed, "body")
        };

        match payload {
            Some(payload) if self.validator.validate(&payload) => Ok(payload),
            _ => Err(Envelope::proxy_error(
                ProxyErrorCode::InvalidPayload,
                format!("The request '{source}' does not match the specified type"),
            )),
        }
    }

    fn read_headers(&self, input: &HostInput) -> Result<Option<Map<String, Value>>, Envelope> {
        let Some(declared) = &self.definition.headers else {
            return Ok(None);
        };

        let mut headers = Map::new();
        let mut missing = Vec::new();
        for spec in declared {
            match input.header(&spec.name) {
                Some(value) => {
                    headers.insert(spec.name.clone(), Value::String(value.to_string()));
                }
                None => {
                    if spec.required {
                        missing.push(spec.name.as_str());
                    }
                    headers.insert(spec.name.clone(), Value::Null);
                }
            }
        }

        if missing.is_empty() {
            Ok(Some(headers))
        } else {
            Err(Envelope::proxy_error(
                ProxyErrorCode::MissingHeaders,
                format!("The following headers are missing: {}", missing.join(", ")),
            ))
        }
    }

    fn read_previous(&self, input: &HostInput) -> Result<Vec<Envelope>, Envelope> {
        let mut previous = Vec::with_capacity(self.index);
        let mut faulty = Vec::new();

        for node in &self.definition.nodes[..self.index] {
            let slug = node.slug();
            let envelope = match input.result(&slug) {
                Some(text) => envelope::read_result(text).map_err(|err| err.to_string()),
                None => Err("no result supplied".to_string()),
            };
            match envelope {
                Ok(envelope) => previous.push(envelope),
                Err(reason) => {
                    debug!(node = %node.name, %reason, "unreadable prior result");
                    faulty.push(node.name.as_str());
                }
            }
        }

        if faulty.is_empty() {
            Ok(previous)
        } else {
            Err(Envelope::proxy_error(
                ProxyErrorCode::InternalParsingError,
                format!(
                    "Could not determine the result of nodes '{}' inside node '{}' at index {}",
                    faulty.join(", "),
                    self.node().name,
                    self.index
                ),
            ))
        }
    }
}

/// Puts a handler value into the script container, unless the handler
/// already returned one.
fn wrap_handler_value(definition: &CommandDefinition, value: Value) -> Value {
    let wire = if envelope::is_script_container(&value) {
        value
    } else {
        envelope::script_container(value)
    };

    match envelope::classify(&wire) {
        Ok(envelope) if !definition.declares(&envelope) => {
            warn!(
                command = %definition.id,
                kind = ?envelope.kind(),
                code = ?envelope.code(),
                "handler returned a code the command does not declare"
            );
        }
        Err(err) => warn!(command = %definition.id, error = %err, "handler returned an unreadable envelope"),
        Ok(_) => {}
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{HeaderSpec, Method, definition::tests::{definition, node}};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Spy {
        calls: AtomicUsize,
        reply: Value,
        deferred: bool,
    }

    impl Spy {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
                deferred: false,
            })
        }

        fn deferred(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
                deferred: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NodeHandler for Spy {
        fn call(&self, _call: NodeCall) -> HandlerOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.clone();
            if self.deferred {
                HandlerOutput::Deferred(Box::pin(async move {
                    tokio::task::yield_now().await;
                    Ok(reply)
                }))
            } else {
                HandlerOutput::Ready(Ok(reply))
            }
        }
    }

    fn four_nodes() -> Arc<CommandDefinition> {
        Arc::new(definition(vec![
            node("Prepare", NodeKind::Script),
            node("Run query", NodeKind::Query),
            node("Shape rows", NodeKind::Script),
            node("Respond", NodeKind::Script),
        ]))
    }

    fn success(payload: Value) -> String {
        json!({"source": "script", "payload": payload}).to_string()
    }

    fn rows(items: Value) -> String {
        json!({"success": true, "response": {"items": items}}).to_string()
    }

    async fn run(proxy: &ScriptProxy, input: &HostInput, handler: &dyn NodeHandler) -> Envelope {
        let value = proxy.run(input, handler).resolve().await.unwrap();
        envelope::classify(&value).unwrap()
    }

    #[tokio::test]
    async fn malformed_prior_result_names_the_faulty_node() {
        let proxy = ScriptProxy::new(four_nodes(), 3).unwrap();
        let input = HostInput::new()
            .with_body("{}")
            .with_result("prepare", success(json!({"a": 1})))
            .with_result("run-query", rows(json!([{"id": 1}])))
            .with_result("shape-rows", "{not json");
        let spy = Spy::new(json!({}));

        let result = run(&proxy, &input, spy.as_ref()).await;

        assert_eq!(
            result,
            Envelope::proxy_error(
                ProxyErrorCode::InternalParsingError,
                "Could not determine the result of nodes 'Shape rows' inside node 'Respond' at index 3"
            )
        );
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn every_faulty_node_is_named() {
        let proxy = ScriptProxy::new(four_nodes(), 3).unwrap();
        let input = HostInput::new()
            .with_body("{}")
            .with_result("run-query", "{\"unexpected\": true}")
            .with_result("shape-rows", success(json!(null)));
        let spy = Spy::new(json!({}));

        let result = run(&proxy, &input, spy.as_ref()).await;
        assert_eq!(
            result.message(),
            Some("Could not determine the result of nodes 'Prepare, Run query' inside node 'Respond' at index 3")
        );
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn missing_required_headers_are_listed_in_order() {
        let mut def = definition(vec![node("Only", NodeKind::Script)]);
        def.headers = Some(vec![
            HeaderSpec { name: "X-A".into(), required: true },
            HeaderSpec { name: "X-B".into(), required: true },
            HeaderSpec { name: "X-C".into(), required: false },
        ]);
        let proxy = ScriptProxy::new(Arc::new(def), 0).unwrap();
        let input = HostInput::new().with_body("{}").with_header("x-a", "present");
        let spy = Spy::new(json!({}));

        let result = run(&proxy, &input, spy.as_ref()).await;
        assert_eq!(
            result,
            Envelope::proxy_error(ProxyErrorCode::MissingHeaders, "The following headers are missing: X-B")
        );
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn exit_from_the_last_node_passes_through_unchanged() {
        let proxy = ScriptProxy::new(four_nodes(), 3).unwrap();
        let exit = Envelope::exit("DONE", "nothing left to do");
        let input = HostInput::new()
            .with_body("{}")
            .with_result("prepare", success(json!({})))
            .with_result("run-query", rows(json!([])))
            .with_result("shape-rows", exit.to_wire(WireShape::Script).to_string());
        let spy = Spy::new(json!({}));

        let outcome = proxy.run(&input, spy.as_ref());
        assert!(!outcome.is_deferred());
        let value = outcome.resolve().await.unwrap();

        assert_eq!(value, exit.to_wire(WireShape::Script));
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn signals_from_the_first_node_reach_the_end_of_the_chain() {
        let def = four_nodes();
        let signals = [
            Envelope::problem("DEFINED_PROBLEM", "raised by the first node"),
            Envelope::exit("DONE", "nothing left to do"),
            Envelope::proxy_error(ProxyErrorCode::InternalParsingError, "raised upstream"),
        ];

        for signal in signals {
            let first = Spy::new(signal.body());
            let shape = Spy::new(json!({"shaped": true}));
            let respond = Spy::new(json!({"responded": true}));
            let request = HostInput::new().with_body("{}");

            let origin = ScriptProxy::new(def.clone(), 0)
                .unwrap()
                .run(&request, first.as_ref())
                .resolve()
                .await
                .unwrap();
            // what the query proxy selects when its input short-circuits
            let query = signal.to_wire(WireShape::Query);

            let request = request
                .with_result("prepare", origin.to_string())
                .with_result("run-query", query.to_string());
            let shaped = ScriptProxy::new(def.clone(), 2)
                .unwrap()
                .run(&request, shape.as_ref())
                .resolve()
                .await
                .unwrap();

            let request = request.with_result("shape-rows", shaped.to_string());
            let responded = ScriptProxy::new(def.clone(), 3)
                .unwrap()
                .run(&request, respond.as_ref())
                .resolve()
                .await
                .unwrap();

            assert_eq!(first.calls(), 1);
            assert_eq!(shape.calls(), 0, "{signal:?}");
            assert_eq!(respond.calls(), 0, "{signal:?}");
            assert_eq!(shaped, origin);
            assert_eq!(responded, origin);
            assert_eq!(envelope::classify(&responded).unwrap(), signal);
        }
    }

    #[test]
    fn inputs_use_the_artifact_keys() {
        let input = HostInput::new()
            .with_body("{}")
            .with_query("a", "1")
            .with_header("X-Token", "secret")
            .with_result("prepare", "{}");
        let inputs = Value::Object(input.to_inputs());
        assert_eq!(
            inputs,
            json!({
                "request.body": "{}",
                "request.query.a": "1",
                "request.header.x-token": "secret",
                "prepare": "{}"
            })
        );
    }

    #[tokio::test]
    async fn only_the_last_prior_result_is_inspected() {
        let proxy = ScriptProxy::new(four_nodes(), 3).unwrap();
        let input = HostInput::new()
            .with_body("{}")
            .with_result("prepare", Envelope::problem("DEFINED_PROBLEM", "old").to_wire(WireShape::Script).to_string())
            .with_result("run-query", rows(json!([{"id": 1}])))
            .with_result("shape-rows", success(json!({"ok": true})));
        let spy = Spy::new(json!({"done": true}));

        let result = run(&proxy, &input, spy.as_ref()).await;
        assert_eq!(result, Envelope::Success(json!({"done": true})));
        assert_eq!(spy.calls(), 1);
    }

    #[tokio::test]
    async fn query_problems_short_circuit_script_nodes() {
        let proxy = ScriptProxy::new(four_nodes(), 2).unwrap();
        let problem = Envelope::problem("DEFINED_PROBLEM", "no rows");
        let input = HostInput::new()
            .with_body("{}")
            .with_result("prepare", success(json!({})))
            .with_result("run-query", problem.to_wire(WireShape::Query).to_string());
        let spy = Spy::new(json!({}));

        assert_eq!(run(&proxy, &input, spy.as_ref()).await, problem);
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected() {
        let mut def = definition(vec![node("Only", NodeKind::Script)]);
        def.payload_schema = Some(json!({"type": "object", "required": ["key"]}));
        let proxy = ScriptProxy::new(Arc::new(def), 0).unwrap();
        let spy = Spy::new(json!({}));

        for body in ["{\"other\": 1}", "not json"] {
            let result = run(&proxy, &HostInput::new().with_body(body), spy.as_ref()).await;
            assert_eq!(
                result,
                Envelope::proxy_error(
                    ProxyErrorCode::InvalidPayload,
                    "The request 'body' does not match the specified type"
                )
            );
        }
        let missing_body = run(&proxy, &HostInput::new(), spy.as_ref()).await;
        assert_eq!(missing_body.code(), Some("INVALID_PAYLOAD"));
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test]
    async fn query_payloads_only_carry_declared_keys() {
        let mut def = definition(vec![node("Only", NodeKind::Script)]);
        def.method = Method::Get;
        def.query_params = Some(vec!["a".into(), "b".into()]);
        def.payload_schema = Some(json!({"type": "object", "required": ["a", "b"]}));
        let proxy = ScriptProxy::new(Arc::new(def), 0).unwrap();

        let echo = |call: NodeCall| -> Result<Value, HandlerError> { Ok(call.request.payload) };
        let input = HostInput::new()
            .with_query("a", "1")
            .with_query("b", "2")
            .with_query("ignored", "3");
        let value = proxy.run(&input, &echo).resolve().await.unwrap();
        assert_eq!(value, json!({"source": "script", "payload": {"a": "1", "b": "2"}}));

        let partial = HostInput::new().with_query("a", "1");
        let value = proxy.run(&partial, &echo).resolve().await.unwrap();
        assert_eq!(
            envelope::classify(&value).unwrap().message(),
            Some("The request 'query' does not match the specified type")
        );
    }

    #[tokio::test]
    async fn handler_receives_headers_and_normalized_priors() {
        let mut def = definition(vec![
            node("Prepare", NodeKind::Script),
            node("Run query", NodeKind::Query),
            node("Respond", NodeKind::Script),
        ]);
        def.headers = Some(vec![
            HeaderSpec { name: "X-Token".into(), required: true },
            HeaderSpec { name: "X-Trace".into(), required: false },
        ]);
        let proxy = ScriptProxy::new(Arc::new(def), 2).unwrap();
        let input = HostInput::new()
            .with_body("{\"q\": 1}")
            .with_header("X-TOKEN", "secret")
            .with_result("prepare", success(json!({"step": 1})))
            .with_result("run-query", rows(json!([{"id": 7}])));

        let inspect = |call: NodeCall| -> Result<Value, HandlerError> {
            Ok(json!({
                "headers": call.request.headers,
                "payload": call.request.payload,
                "previous": call.previous_wire(),
            }))
        };
        let value = proxy.run(&input, &inspect).resolve().await.unwrap();
        assert_eq!(
            value["payload"],
            json!({
                "headers": {"X-Token": "secret", "X-Trace": null},
                "payload": {"q": 1},
                "previous": [
                    {"source": "script", "payload": {"step": 1}},
                    {"source": "script", "payload": [{"id": 7}]}
                ]
            })
        );
    }

    #[tokio::test]
    async fn deferred_handlers_behave_like_ready_ones() {
        let proxy = ScriptProxy::new(four_nodes(), 0).unwrap();
        let input = HostInput::new().with_body("{}");
        let ready = Spy::new(json!({"n": 1}));
        let deferred = Spy::deferred(json!({"n": 1}));

        let ready_outcome = proxy.run(&input, ready.as_ref());
        let deferred_outcome = proxy.run(&input, deferred.as_ref());
        assert!(!ready_outcome.is_deferred());
        assert!(deferred_outcome.is_deferred());
        assert_eq!(
            ready_outcome.resolve().await.unwrap(),
            deferred_outcome.resolve().await.unwrap()
        );

        let exit = Spy::deferred(Envelope::exit("DONE", "").body());
        let value = proxy.run(&input, exit.as_ref()).resolve().await.unwrap();
        assert_eq!(envelope::classify(&value).unwrap(), Envelope::exit("DONE", ""));
    }

    #[tokio::test]
    async fn script_containers_from_handlers_are_not_wrapped_twice() {
        let proxy = ScriptProxy::new(four_nodes(), 0).unwrap();
        let spy = Spy::new(json!({"source": "script", "payload": {"already": "wrapped"}}));
        let value = proxy
            .run(&HostInput::new().with_body("{}"), spy.as_ref())
            .resolve()
            .await
            .unwrap();
        assert_eq!(value, json!({"source": "script", "payload": {"already": "wrapped"}}));
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let proxy = ScriptProxy::new(four_nodes(), 0).unwrap();
        let failing = |_call: NodeCall| -> Result<Value, HandlerError> { Err(HandlerError::Failed("boom".into())) };
        let result = proxy.run(&HostInput::new().with_body("{}"), &failing).resolve().await;
        assert!(matches!(result, Err(HandlerError::Failed(message)) if message == "boom"));
    }

    #[test]
    fn proxies_only_wrap_script_nodes() {
        assert!(matches!(
            ScriptProxy::new(four_nodes(), 1),
            Err(GenerateError::WrongKind { index: 1, .. })
        ));
        assert!(matches!(
            ScriptProxy::new(four_nodes(), 4),
            Err(GenerateError::NodeOutOfRange { index: 4, count: 4 })
        ));
    }
}
