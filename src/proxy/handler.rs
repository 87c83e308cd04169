use std::{path::Path, sync::Arc};

use rhai::{AST, Dynamic, Engine, Scope};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    envelope::{self, Envelope},
    toolchain::{self, ToolchainError},
};

use super::{
    rhai_proxy::{DEFINITION_ENTRY, HANDLER_ENTRY, SCRIPT_ENTRY},
    script::{HandlerError, HandlerOutput, HostInput, NodeCall, NodeHandler, ProxyOutcome},
};

/// What a script artifact reports about itself through `cmd_node_definition`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ArtifactInfo {
    pub command: String,
    pub node: String,
    pub index: usize,
    pub is_async: bool,
    #[serde(default)]
    pub problems: Vec<String>,
    #[serde(default)]
    pub exit_codes: Vec<String>,
}

/// Runs a compiled script artifact.
///
/// [`RhaiHandler::run`] goes through the artifact's own proxy, the way a
/// deployed node runs. As a [`NodeHandler`] it calls the bare handler with
/// `request` as `#{ payload, headers }` and `previous` as an array of script
/// containers. Async nodes run on the blocking pool and yield deferred
/// results either way.
#[derive(Clone)]
pub struct RhaiHandler {
    name: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    is_async: bool,
    info: Option<ArtifactInfo>,
}

impl RhaiHandler {
    pub fn compile(name: impl Into<String>, source: &str, is_async: bool) -> Result<Self, ToolchainError> {
        let name = name.into();
        let engine = toolchain::script_engine();
        let ast = toolchain::compile(&engine, &name, source)?;
        Ok(Self {
            name,
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            is_async,
            info: None,
        })
    }

    /// Compiles a built artifact; whether it is async comes from the artifact.
    pub fn from_artifact(name: impl Into<String>, artifact: &str) -> Result<Self, ToolchainError> {
        let mut handler = Self::compile(name, artifact, false)?;
        toolchain::require_function(&handler.ast, &handler.name, SCRIPT_ENTRY, 1)?;
        toolchain::require_function(&handler.ast, &handler.name, DEFINITION_ENTRY, 0)?;

        let evaluation = |message: String| ToolchainError::Evaluation {
            unit: handler.name.clone(),
            message,
        };
        let described: Dynamic = handler
            .engine
            .call_fn(&mut Scope::new(), &handler.ast, DEFINITION_ENTRY, ())
            .map_err(|err| evaluation(err.to_string()))?;
        let info: ArtifactInfo = rhai::serde::from_dynamic(&described).map_err(|err| evaluation(err.to_string()))?;

        handler.is_async = info.is_async;
        handler.info = Some(info);
        Ok(handler)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ToolchainError> {
        let name = path.display().to_string();
        let artifact = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ToolchainError::Io {
                unit: name.clone(),
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_artifact(name, &artifact)
    }

    pub fn info(&self) -> Option<&ArtifactInfo> {
        self.info.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Runs the artifact's `user_code` over the host input.
    pub fn run(&self, input: &HostInput) -> ProxyOutcome {
        let inputs = Value::Object(input.to_inputs());
        if !self.is_async {
            return ProxyOutcome::Ready(Self::run_entry(&self.engine, &self.ast, &self.name, self.info.as_ref(), inputs));
        }

        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let name = self.name.clone();
        let info = self.info.clone();
        ProxyOutcome::Deferred(Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::run_entry(&engine, &ast, &name, info.as_ref(), inputs))
                .await
                .map_err(|err| HandlerError::Join(err.to_string()))?
        }))
    }

    fn run_entry(
        engine: &Engine,
        ast: &AST,
        name: &str,
        info: Option<&ArtifactInfo>,
        inputs: Value,
    ) -> Result<Value, HandlerError> {
        let conversion = |err: Box<rhai::EvalAltResult>| HandlerError::Conversion(err.to_string());
        let inputs = rhai::serde::to_dynamic(inputs).map_err(conversion)?;
        let result: Dynamic = engine
            .call_fn(&mut Scope::new(), ast, SCRIPT_ENTRY, (inputs,))
            .map_err(|err| HandlerError::Script {
                handler: name.to_string(),
                message: err.to_string(),
            })?;
        let value: Value = rhai::serde::from_dynamic(&result).map_err(conversion)?;
        if let Some(info) = info {
            warn_undeclared(info, &value);
        }
        Ok(value)
    }

    fn invoke(engine: &Engine, ast: &AST, name: &str, call: NodeCall) -> Result<Value, HandlerError> {
        let conversion = |err: Box<rhai::EvalAltResult>| HandlerError::Conversion(err.to_string());
        let request = rhai::serde::to_dynamic(&call.request).map_err(conversion)?;
        let previous = rhai::serde::to_dynamic(call.previous_wire()).map_err(conversion)?;

        let result: Dynamic = engine
            .call_fn(&mut Scope::new(), ast, HANDLER_ENTRY, (request, previous))
            .map_err(|err| HandlerError::Script {
                handler: name.to_string(),
                message: err.to_string(),
            })?;
        rhai::serde::from_dynamic(&result).map_err(conversion)
    }
}

fn warn_undeclared(info: &ArtifactInfo, value: &Value) {
    let declared = match envelope::classify(value) {
        Ok(Envelope::Problem(signal)) => info.problems.contains(&signal.code),
        Ok(Envelope::Exit(signal)) => info.exit_codes.contains(&signal.code),
        Ok(_) => true,
        Err(err) => {
            warn!(command = %info.command, node = %info.node, error = %err, "artifact returned an unreadable envelope");
            true
        }
    };
    if !declared {
        warn!(command = %info.command, node = %info.node, "artifact returned a code the command does not declare");
    }
}

impl NodeHandler for RhaiHandler {
    fn call(&self, call: NodeCall) -> HandlerOutput {
        if !self.is_async {
            return HandlerOutput::Ready(Self::invoke(&self.engine, &self.ast, &self.name, call));
        }

        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let name = self.name.clone();
        HandlerOutput::Deferred(Box::pin(async move {
            tokio::task::spawn_blocking(move || Self::invoke(&engine, &ast, &name, call))
                .await
                .map_err(|err| HandlerError::Join(err.to_string()))?
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{
            NodeKind,
            definition::tests::{definition, node},
        },
        envelope::{self, Envelope},
        proxy::{rhai_proxy::RhaiProxy, script::ScriptProxy},
    };
    use serde_json::json;

    const RESPOND: &str = r#"
// Node name: 'Respond'
fn respond(request, previous) {
    if previous.len() > 0 && previous[0].payload.stop == true {
        return #{ "__cmd_type__": "cmd_exit_result", info: #{ code: "DONE", message: "stopped" } };
    }
    #{ echoed: request.payload.value, seen: previous.len() }
}
"#;

    fn bare() -> String {
        format!("{RESPOND}\nfn cmd_node_handler(request, previous) {{ respond(request, previous) }}\n")
    }

    fn proxy() -> ScriptProxy {
        let def = definition(vec![node("Prepare", NodeKind::Script), node("Respond", NodeKind::Script)]);
        ScriptProxy::new(Arc::new(def), 1).unwrap()
    }

    #[tokio::test]
    async fn runs_the_artifact_entry_point() {
        let handler = RhaiHandler::compile("respond", &bare(), false).unwrap();
        let input = HostInput::new()
            .with_body(r#"{"value": "hello"}"#)
            .with_result("prepare", r#"{"source": "script", "payload": {"stop": false}}"#);

        let outcome = proxy().run(&input, &handler);
        assert!(!outcome.is_deferred());
        let value = outcome.resolve().await.unwrap();
        assert_eq!(value, json!({"source": "script", "payload": {"echoed": "hello", "seen": 1}}));
    }

    #[tokio::test]
    async fn async_nodes_are_deferred() {
        let handler = RhaiHandler::compile("respond", &bare(), true).unwrap();
        let input = HostInput::new()
            .with_body(r#"{"value": 1}"#)
            .with_result("prepare", r#"{"source": "script", "payload": {"stop": true}}"#);

        let outcome = proxy().run(&input, &handler);
        assert!(outcome.is_deferred());
        let value = outcome.resolve().await.unwrap();
        assert_eq!(envelope::classify(&value).unwrap(), Envelope::exit("DONE", "stopped"));
    }

    #[tokio::test]
    async fn script_failures_become_handler_errors() {
        let handler = RhaiHandler::compile("broken", "fn cmd_node_handler(request, previous) { missing() }", false).unwrap();
        let result = proxy()
            .run(
                &HostInput::new()
                    .with_body("{}")
                    .with_result("prepare", r#"{"source": "script", "payload": {}}"#),
                &handler,
            )
            .resolve()
            .await;
        assert!(matches!(result, Err(HandlerError::Script { handler, .. }) if handler == "broken"));
    }

    #[tokio::test]
    async fn artifacts_run_through_their_own_proxy() {
        let mut def = definition(vec![node("Prepare", NodeKind::Script), node("Respond", NodeKind::Script)]);
        def.nodes[1].is_async = true;
        let proxy = RhaiProxy::generate(&def, 1).unwrap();
        let handler = RhaiHandler::from_artifact("respond", &format!("{RESPOND}\n{}", proxy.text)).unwrap();

        assert_eq!(
            handler.info(),
            Some(&ArtifactInfo {
                command: "test.example".into(),
                node: "Respond".into(),
                index: 1,
                is_async: true,
                problems: vec!["DEFINED_PROBLEM".into()],
                exit_codes: vec!["DONE".into()],
            })
        );

        let input = HostInput::new()
            .with_body(r#"{"value": "hello"}"#)
            .with_result("prepare", r#"{"source": "script", "payload": {"stop": false}}"#);
        let outcome = handler.run(&input);
        assert!(outcome.is_deferred());
        assert_eq!(
            outcome.resolve().await.unwrap(),
            json!({"source": "script", "payload": {"echoed": "hello", "seen": 1}})
        );

        let missing = handler.run(&HostInput::new().with_body("{}")).resolve().await.unwrap();
        assert_eq!(
            envelope::classify(&missing).unwrap().code(),
            Some("INTERNAL_PARSING_ERROR")
        );
    }

    #[test]
    fn bare_handler_sources_are_not_artifacts() {
        assert!(matches!(
            RhaiHandler::from_artifact("respond", &bare()),
            Err(ToolchainError::MissingHandler { .. })
        ));
    }

    #[test]
    fn artifacts_with_syntax_errors_are_rejected() {
        assert!(matches!(
            RhaiHandler::compile("broken", "fn user_code( {", false),
            Err(ToolchainError::Syntax { .. })
        ));
    }
}
