//! Result envelopes exchanged between chained nodes.
//!
//! Every node result travels inside one of two containers, depending on the
//! engine that produced it:
//!
//! - script engine: `{"source": "script", "payload": <value>}`
//! - query engine: `{"success": true, "response": {"items": [<row>, ...]}}`
//!
//! A payload (or, for query results, the first row) carrying the reserved
//! [`DISCRIMINATOR`] field is a short-circuit signal rather than data:
//!
//! ```json
//! { "__cmd_type__": "node_proxy_result", "error": { "code": "MISSING_HEADERS", "message": "..." } }
//! { "__cmd_type__": "cmd_problem_result", "error": { "code": "NOT_FOUND", "message": "..." } }
//! { "__cmd_type__": "cmd_exit_result", "info": { "code": "DONE", "message": "..." } }
//! ```
//!
//! Both proxy generators read their vocabulary and precedence from this module.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reserved field marking a payload or row as a short-circuit envelope.
pub const DISCRIMINATOR: &str = "__cmd_type__";
/// `source` value of script engine containers.
pub const SCRIPT_SOURCE: &str = "script";
pub const ERROR_FIELD: &str = "error";
pub const INFO_FIELD: &str = "info";

/// Engine-tagged container shape of a node result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WireShape {
    Script,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    ProxyError,
    Problem,
    Exit,
    Success,
}

impl EnvelopeKind {
    /// Short-circuiting kinds, highest precedence first.
    pub const SHORT_CIRCUITS: [EnvelopeKind; 3] = [
        EnvelopeKind::ProxyError,
        EnvelopeKind::Problem,
        EnvelopeKind::Exit,
    ];

    pub fn tag(self) -> Option<&'static str> {
        match self {
            EnvelopeKind::ProxyError => Some("node_proxy_result"),
            EnvelopeKind::Problem => Some("cmd_problem_result"),
            EnvelopeKind::Exit => Some("cmd_exit_result"),
            EnvelopeKind::Success => None,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::SHORT_CIRCUITS
            .into_iter()
            .find(|kind| kind.tag() == Some(tag))
    }

    /// Field holding the `{code, message}` body.
    pub fn body_field(self) -> Option<&'static str> {
        match self {
            EnvelopeKind::ProxyError | EnvelopeKind::Problem => Some(ERROR_FIELD),
            EnvelopeKind::Exit => Some(INFO_FIELD),
            EnvelopeKind::Success => None,
        }
    }

    /// Name of the SQL helper predicate recognising this kind.
    pub fn sql_predicate(self) -> Option<&'static str> {
        match self {
            EnvelopeKind::ProxyError => Some("is_proxy_error"),
            EnvelopeKind::Problem => Some("is_problem_result"),
            EnvelopeKind::Exit => Some("is_exit_result"),
            EnvelopeKind::Success => None,
        }
    }

    pub fn short_circuits(self) -> bool {
        self != EnvelopeKind::Success
    }
}

/// Codes raised by the proxy itself, never by user handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    InvalidPayload,
    MissingHeaders,
    InternalParsingError,
}

impl ProxyErrorCode {
    pub const ALL: [ProxyErrorCode; 3] = [
        ProxyErrorCode::InvalidPayload,
        ProxyErrorCode::MissingHeaders,
        ProxyErrorCode::InternalParsingError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ProxyErrorCode::MissingHeaders => "MISSING_HEADERS",
            ProxyErrorCode::InternalParsingError => "INTERNAL_PARSING_ERROR",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == code)
    }
}

impl fmt::Display for ProxyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl Signal {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Success(Value),
    Problem(Signal),
    Exit(Signal),
    ProxyError { code: ProxyErrorCode, message: String },
}

impl Envelope {
    pub fn problem(code: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Problem(Signal::new(code, message))
    }

    pub fn exit(code: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Exit(Signal::new(code, message))
    }

    pub fn proxy_error(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Envelope::ProxyError {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Success(_) => EnvelopeKind::Success,
            Envelope::Problem(_) => EnvelopeKind::Problem,
            Envelope::Exit(_) => EnvelopeKind::Exit,
            Envelope::ProxyError { .. } => EnvelopeKind::ProxyError,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Envelope::Success(_) => None,
            Envelope::Problem(signal) | Envelope::Exit(signal) => Some(&signal.code),
            Envelope::ProxyError { code, .. } => Some(code.as_str()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Envelope::Success(_) => None,
            Envelope::Problem(signal) | Envelope::Exit(signal) => Some(&signal.message),
            Envelope::ProxyError { message, .. } => Some(message),
        }
    }

    pub fn short_circuits(&self) -> bool {
        self.kind().short_circuits()
    }

    /// The payload of a success, or the discriminated object of a signal.
    pub fn body(&self) -> Value {
        let (kind, code, message) = match self {
            Envelope::Success(payload) => return payload.clone(),
            Envelope::Problem(signal) | Envelope::Exit(signal) => {
                (self.kind(), signal.code.as_str(), signal.message.as_str())
            }
            Envelope::ProxyError { code, message } => (self.kind(), code.as_str(), message.as_str()),
        };

        let mut inner = Map::new();
        inner.insert("code".into(), Value::String(code.to_string()));
        inner.insert("message".into(), Value::String(message.to_string()));

        let mut body = Map::new();
        if let (Some(tag), Some(field)) = (kind.tag(), kind.body_field()) {
            body.insert(DISCRIMINATOR.into(), Value::String(tag.into()));
            body.insert(field.into(), Value::Object(inner));
        }
        Value::Object(body)
    }

    /// Renders the envelope inside the container of the given engine.
    pub fn to_wire(&self, shape: WireShape) -> Value {
        match shape {
            WireShape::Script => script_container(self.body()),
            WireShape::Query => {
                let items = match self {
                    Envelope::Success(payload) if is_query_container(payload) => return payload.clone(),
                    Envelope::Success(Value::Array(rows)) => rows.clone(),
                    Envelope::Success(Value::Null) => Vec::new(),
                    other => vec![other.body()],
                };
                let mut response = Map::new();
                response.insert("items".into(), Value::Array(items));
                let mut container = Map::new();
                container.insert("success".into(), Value::Bool(true));
                container.insert("response".into(), Value::Object(response));
                Value::Object(container)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("result text is not valid JSON: {0}")]
    Unparsable(String),

    #[error("value is neither a script nor a query result container")]
    UnrecognizedShape,

    #[error("query result container has no `response.items` list")]
    MissingItems,

    #[error("`__cmd_type__` must be a string, found {0}")]
    InvalidDiscriminator(String),

    #[error("unknown `__cmd_type__` value `{0}`")]
    UnknownDiscriminator(String),

    #[error("`{tag}` envelope has a malformed `{field}` body: {reason}")]
    MalformedBody {
        tag: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("unknown proxy error code `{0}`")]
    UnknownProxyCode(String),
}

pub fn script_container(payload: Value) -> Value {
    let mut container = Map::new();
    container.insert("source".into(), Value::String(SCRIPT_SOURCE.into()));
    container.insert("payload".into(), payload);
    Value::Object(container)
}

pub fn is_script_container(value: &Value) -> bool {
    value.get("source").and_then(Value::as_str) == Some(SCRIPT_SOURCE)
}

/// A query engine failure, or a successful container with its row list.
pub fn is_query_container(value: &Value) -> bool {
    match value.get("success").and_then(Value::as_bool) {
        Some(false) => true,
        Some(true) => value
            .get("response")
            .and_then(|response| response.get("items"))
            .is_some_and(Value::is_array),
        None => false,
    }
}

/// Determines which envelope a container carries.
///
/// Query failures (`success: false`) carry no discriminator and are surfaced
/// as [`Envelope::Success`] holding the whole container.
pub fn classify(value: &Value) -> Result<Envelope, EnvelopeError> {
    if is_script_container(value) {
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        return classify_body(payload);
    }

    if let Some(success) = value.get("success").and_then(Value::as_bool) {
        if !success {
            return Ok(Envelope::Success(value.clone()));
        }
        let items = value
            .get("response")
            .and_then(|response| response.get("items"))
            .and_then(Value::as_array)
            .ok_or(EnvelopeError::MissingItems)?;
        return match items.first() {
            Some(row) if row.get(DISCRIMINATOR).is_some() => classify_body(row.clone()),
            _ => Ok(Envelope::Success(Value::Array(items.clone()))),
        };
    }

    Err(EnvelopeError::UnrecognizedShape)
}

/// Classifies a value and renders it in the requested container.
pub fn normalize(value: &Value, shape: WireShape) -> Result<Value, EnvelopeError> {
    classify(value).map(|envelope| envelope.to_wire(shape))
}

fn classify_body(body: Value) -> Result<Envelope, EnvelopeError> {
    let tag = match body.get(DISCRIMINATOR) {
        None => return Ok(Envelope::Success(body)),
        Some(Value::String(tag)) => tag.as_str(),
        Some(other) => return Err(EnvelopeError::InvalidDiscriminator(other.to_string())),
    };
    let kind = EnvelopeKind::from_tag(tag)
        .ok_or_else(|| EnvelopeError::UnknownDiscriminator(tag.to_string()))?;

    // kinds returned by from_tag always carry a tag and a body field
    let (tag, field) = match (kind.tag(), kind.body_field()) {
        (Some(tag), Some(field)) => (tag, field),
        _ => return Err(EnvelopeError::UnknownDiscriminator(tag.to_string())),
    };
    let inner = body.get(field).cloned().ok_or_else(|| EnvelopeError::MalformedBody {
        tag,
        field,
        reason: "field is missing".into(),
    })?;
    let signal: Signal = serde_json::from_value(inner).map_err(|err| EnvelopeError::MalformedBody {
        tag,
        field,
        reason: err.to_string(),
    })?;

    match kind {
        EnvelopeKind::ProxyError => {
            let code = ProxyErrorCode::from_code(&signal.code)
                .ok_or_else(|| EnvelopeError::UnknownProxyCode(signal.code.clone()))?;
            Ok(Envelope::ProxyError {
                code,
                message: signal.message,
            })
        }
        EnvelopeKind::Problem => Ok(Envelope::Problem(signal)),
        EnvelopeKind::Exit => Ok(Envelope::Exit(signal)),
        EnvelopeKind::Success => Ok(Envelope::Success(body)),
    }
}

/// Engines occasionally report `{<json>}: <status>`; the outer braces and the
/// status suffix are dropped before parsing.
static MALFORMED_RESULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\{(.+)\}:\s*\d{3}\s*$").expect("malformed result pattern"));

/// Parses host-supplied result text.
pub fn parse_result_text(text: &str) -> Result<Value, EnvelopeError> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(err) => {
            let repaired = MALFORMED_RESULT
                .captures(text)
                .and_then(|captures| captures.get(1))
                .map(|inner| inner.as_str());
            match repaired {
                Some(inner) => serde_json::from_str(inner)
                    .map_err(|_| EnvelopeError::Unparsable(err.to_string())),
                None => Err(EnvelopeError::Unparsable(err.to_string())),
            }
        }
    }
}

/// Parses and classifies a result in one step.
pub fn read_result(text: &str) -> Result<Envelope, EnvelopeError> {
    parse_result_text(text).and_then(|value| classify(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_success_carries_payload() {
        let value = json!({"source": "script", "payload": {"a": 1}});
        assert_eq!(classify(&value).unwrap(), Envelope::Success(json!({"a": 1})));
    }

    #[test]
    fn script_problem_is_recognised() {
        let value = json!({
            "source": "script",
            "payload": {"__cmd_type__": "cmd_problem_result", "error": {"code": "NOT_FOUND", "message": "gone"}}
        });
        assert_eq!(classify(&value).unwrap(), Envelope::problem("NOT_FOUND", "gone"));
    }

    #[test]
    fn query_rows_are_success_unless_first_row_is_tagged() {
        let rows = json!({"success": true, "response": {"items": [{"id": 1}, {"id": 2}]}});
        assert_eq!(
            classify(&rows).unwrap(),
            Envelope::Success(json!([{"id": 1}, {"id": 2}]))
        );

        let exit = json!({"success": true, "response": {"items": [
            {"__cmd_type__": "cmd_exit_result", "error": null, "info": {"code": "DONE", "message": "ok"}}
        ]}});
        assert_eq!(classify(&exit).unwrap(), Envelope::exit("DONE", "ok"));
    }

    #[test]
    fn query_failure_is_handed_on_as_success() {
        let failure = json!({"success": false, "error": {"message": "relation does not exist"}});
        assert_eq!(classify(&failure).unwrap(), Envelope::Success(failure.clone()));
        assert_eq!(Envelope::Success(failure.clone()).to_wire(WireShape::Query), failure);
    }

    #[test]
    fn unrecognised_values_are_errors_not_success() {
        assert_eq!(classify(&json!({"a": 1})), Err(EnvelopeError::UnrecognizedShape));
        assert_eq!(classify(&json!("text")), Err(EnvelopeError::UnrecognizedShape));
        assert_eq!(
            classify(&json!({"success": true})),
            Err(EnvelopeError::MissingItems)
        );
        assert_eq!(
            classify(&json!({"source": "script", "payload": {"__cmd_type__": "mystery"}})),
            Err(EnvelopeError::UnknownDiscriminator("mystery".into()))
        );
        assert!(matches!(
            classify(&json!({"source": "script", "payload": {"__cmd_type__": "cmd_exit_result"}})),
            Err(EnvelopeError::MalformedBody { .. })
        ));
        assert_eq!(
            classify(&json!({"source": "script", "payload": {
                "__cmd_type__": "node_proxy_result", "error": {"code": "NOPE", "message": ""}
            }})),
            Err(EnvelopeError::UnknownProxyCode("NOPE".into()))
        );
    }

    #[test]
    fn normalization_preserves_kind_and_code_across_engines() {
        let envelopes = [
            Envelope::Success(json!({"value": 42})),
            Envelope::Success(json!([{"id": 1}])),
            Envelope::Success(json!({"success": true, "count": 2})),
            Envelope::Success(json!({"success": false, "error": "relation does not exist"})),
            Envelope::problem("NOT_FOUND", "missing"),
            Envelope::exit("DONE", "finished"),
            Envelope::proxy_error(ProxyErrorCode::MissingHeaders, "The following headers are missing: X-B"),
        ];

        for envelope in envelopes {
            for shape in [WireShape::Script, WireShape::Query] {
                let wire = envelope.to_wire(shape);
                let normalized = normalize(&wire, shape).unwrap();
                let reclassified = classify(&normalized).unwrap();
                assert_eq!(reclassified.kind(), envelope.kind(), "{wire}");
                assert_eq!(reclassified.code(), envelope.code(), "{wire}");
                assert_eq!(reclassified.message(), envelope.message(), "{wire}");
            }
        }
    }

    #[test]
    fn script_payloads_shaped_like_flags_are_wrapped_as_rows() {
        let payload = json!({"success": true, "count": 2});
        assert_eq!(
            Envelope::Success(payload.clone()).to_wire(WireShape::Query),
            json!({"success": true, "response": {"items": [payload]}})
        );

        let failure = json!({"success": false, "error": "timeout"});
        assert_eq!(Envelope::Success(failure.clone()).to_wire(WireShape::Query), failure);
    }

    #[test]
    fn precedence_puts_proxy_errors_first() {
        assert_eq!(
            EnvelopeKind::SHORT_CIRCUITS,
            [EnvelopeKind::ProxyError, EnvelopeKind::Problem, EnvelopeKind::Exit]
        );
        assert!(!EnvelopeKind::Success.short_circuits());
        assert_eq!(EnvelopeKind::from_tag("cmd_exit_result"), Some(EnvelopeKind::Exit));
    }

    #[test]
    fn proxy_codes_serialize_as_wire_names() {
        let encoded = serde_json::to_value(ProxyErrorCode::InternalParsingError).unwrap();
        assert_eq!(encoded, json!("INTERNAL_PARSING_ERROR"));
    }

    #[test]
    fn malformed_engine_output_is_recovered() {
        let text = r#"{{"success": true, "response": {"items": []}}}: 409"#;
        let value = parse_result_text(text).unwrap();
        assert_eq!(value, json!({"success": true, "response": {"items": []}}));

        assert!(matches!(
            parse_result_text("{not json}: 500"),
            Err(EnvelopeError::Unparsable(_))
        ));
        assert!(read_result("").is_err());
    }
}
