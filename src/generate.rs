use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::client::Endpoints;
use crate::consolidate::GroupedFile;
use crate::constants::{
    BLOCKED_FINISH_REASONS, DEFAULT_MAX_FUNCTION_ROUNDS, DEFAULT_RETRY_BACKOFF,
    DEFAULT_RETRY_BUDGET, NO_VALUE, OUTPUT_FUNCTION_PREFIX,
};
use crate::error::{Error, Result};
use crate::http::{BatchExecutor, HttpRequest, HttpResponse};
use crate::telemetry::{RequestEvent, RunMonitor};
use crate::types::{Candidate, Content, FunctionCall, GenerateContentResponse, Part, Role, UsageMetadata};

pub type FunctionHandler = Box<dyn Fn(Option<&Value>) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Scalar,
    Array,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Tool,
    /// Its arguments are the final answer; the loop stops as soon as it is called.
    Output(OutputShape),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

struct RegisteredFunction {
    declaration: FunctionDeclaration,
    kind: FunctionKind,
    handler: FunctionHandler,
}

#[derive(Default)]
pub struct FunctionTable {
    entries: Vec<RegisteredFunction>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Option<Value>,
        handler: F,
    ) -> Self
    where
        F: Fn(Option<&Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(RegisteredFunction {
            declaration: FunctionDeclaration {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            kind: FunctionKind::Tool,
            handler: Box::new(handler),
        });
        self
    }

    /// Registers `customType_<name>`, whose `items` argument must match `item_schema`.
    pub fn register_output(
        mut self,
        name: &str,
        shape: OutputShape,
        description: impl Into<String>,
        item_schema: Value,
    ) -> Self {
        let items = match shape {
            OutputShape::Array => json!({ "type": "array", "items": item_schema }),
            OutputShape::Scalar | OutputShape::Object => item_schema,
        };
        self.insert(RegisteredFunction {
            declaration: FunctionDeclaration {
                name: format!("{OUTPUT_FUNCTION_PREFIX}{name}"),
                description: description.into(),
                parameters: Some(json!({
                    "type": "object",
                    "properties": { "items": items },
                    "required": ["items"],
                })),
            },
            kind: FunctionKind::Output(shape),
            handler: Box::new(|args| Ok(args.cloned().unwrap_or(Value::Null))),
        });
        self
    }

    fn insert(&mut self, function: RegisteredFunction) {
        self.entries
            .retain(|f| f.declaration.name != function.declaration.name);
        self.entries.push(function);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|f| f.declaration.name.clone())
            .collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.entries.iter().map(|f| f.declaration.clone()).collect()
    }

    pub fn has_output(&self) -> bool {
        self.entries
            .iter()
            .any(|f| matches!(f.kind, FunctionKind::Output(_)))
    }

    fn call(&self, call: &FunctionCall) -> Result<(FunctionKind, Value)> {
        let function = self
            .entries
            .iter()
            .find(|f| f.declaration.name == call.name)
            .ok_or_else(|| Error::UnknownFunction(call.name.clone()))?;
        let result = (function.handler)(call.args.as_ref()).map_err(|source| Error::Function {
            name: call.name.clone(),
            source,
        })?;
        Ok((function.kind, result))
    }
}

/// `{"items": x}` -> `x`; `[{"items": a}, {"items": b}]` -> `[a, b]`; anything else unchanged.
pub fn unwrap_output(shape: OutputShape, value: Value) -> Value {
    let value = match value {
        Value::Object(mut map) if is_items_wrapper(&map) => map.remove("items").unwrap_or(Value::Null),
        Value::Array(values)
            if values
                .iter()
                .all(|v| v.as_object().is_some_and(is_items_wrapper)) =>
        {
            Value::Array(
                values
                    .into_iter()
                    .map(|mut v| v.get_mut("items").map(Value::take).unwrap_or(Value::Null))
                    .collect(),
            )
        }
        other => other,
    };
    match (shape, value) {
        (OutputShape::Array, Value::Array(values)) => Value::Array(values),
        (OutputShape::Array, other) => Value::Array(vec![other]),
        (_, other) => other,
    }
}

fn is_items_wrapper(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.contains_key("items")
}

/// Resend policy for 5xx responses. Total attempts are `budget + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub budget: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_RETRY_BUDGET,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub response_mime_type: Option<String>,
    pub response_schema: Option<Value>,
    pub temperature: Option<f64>,
    pub system_instruction: Option<Value>,
    /// Merged under the generated `functionCallingConfig`.
    pub tool_config: Option<Value>,
    pub tools: Vec<Value>,
    pub count_tokens: bool,
    pub raw_response: bool,
    pub include_usage: bool,
    pub parse_json: bool,
    pub retry: RetryPolicy,
    pub max_function_rounds: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            response_mime_type: None,
            response_schema: None,
            temperature: None,
            system_instruction: None,
            tool_config: None,
            tools: Vec::new(),
            count_tokens: false,
            raw_response: false,
            include_usage: false,
            parse_json: true,
            retry: RetryPolicy::default(),
            max_function_rounds: DEFAULT_MAX_FUNCTION_ROUNDS,
        }
    }
}

impl GenerationConfig {
    fn wire(&self) -> Map<String, Value> {
        let mut config = Map::new();
        if let Some(mime) = &self.response_mime_type {
            config.insert("responseMimeType".into(), json!(mime));
        }
        if let Some(schema) = &self.response_schema {
            config.insert("responseSchema".into(), schema.clone());
            config.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(temperature) = self.temperature {
            config.insert("temperature".into(), json!(temperature));
        }
        config
    }
}

/// What to ask. A question wins over parts; a schema alone becomes the question.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub q: Option<String>,
    pub json_schema: Option<Value>,
    pub parts: Option<Vec<Part>>,
}

impl GenerateRequest {
    pub fn question(q: impl Into<String>) -> Self {
        Self {
            q: Some(q.into()),
            ..Self::default()
        }
    }

    pub fn schema(schema: Value) -> Self {
        Self {
            json_schema: Some(schema),
            ..Self::default()
        }
    }

    pub fn parts(parts: Vec<Part>) -> Self {
        Self {
            parts: Some(parts),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    fn prompt(&self) -> Result<Vec<Part>> {
        if let Some(q) = self.q.as_deref().filter(|q| !q.trim().is_empty()) {
            return Ok(vec![Part::text(q)]);
        }
        if let Some(parts) = self.parts.as_ref().filter(|p| !p.is_empty()) {
            let mut prompt = parts.clone();
            prompt.extend(self.json_schema.as_ref().map(schema_prompt));
            return Ok(prompt);
        }
        if let Some(schema) = &self.json_schema {
            return Ok(vec![schema_prompt(schema)]);
        }
        Err(Error::InvalidInput(
            "a question, a JSON schema or parts are required".into(),
        ))
    }
}

fn schema_prompt(schema: &Value) -> Part {
    Part::text(format!("Follow JSON schema.<JSONSchema>{schema}</JSONSchema>"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Json(Value),
    Text(String),
    NoValue,
    Raw(Value),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Json(value) | Output::Raw(value) => match serde_json::to_string_pretty(value) {
                Ok(text) => f.write_str(&text),
                Err(_) => write!(f, "{value}"),
            },
            Output::Text(text) => f.write_str(text),
            Output::NoValue => f.write_str(NO_VALUE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub output: Output,
    /// Set only when `include_usage` is on.
    pub usage: Option<UsageMetadata>,
}

enum LoopState {
    Sending,
    AwaitingTool(FunctionCall),
    Done(Output),
}

pub struct Generator {
    executor: Arc<dyn BatchExecutor>,
    credentials: Credentials,
    endpoints: Endpoints,
    config: GenerationConfig,
    functions: FunctionTable,
    files: Vec<GroupedFile>,
    history: Vec<Content>,
    monitor: Option<RunMonitor>,
}

impl Generator {
    pub fn new(executor: Arc<dyn BatchExecutor>, credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            executor,
            credentials,
            endpoints,
            config: GenerationConfig::default(),
            functions: FunctionTable::default(),
            files: Vec::new(),
            history: Vec::new(),
            monitor: None,
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_functions(mut self, functions: FunctionTable) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_files(mut self, files: Vec<GroupedFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_history(mut self, history: Vec<Content>) -> Self {
        self.history = history;
        self
    }

    pub fn with_monitor(mut self, monitor: RunMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.config
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn set_history(&mut self, history: Vec<Content>) {
        self.history = history;
    }

    pub fn generate(&mut self, request: &GenerateRequest) -> Result<Generation> {
        let mut user_parts = request.prompt()?;
        if !self.files.is_empty() {
            let pages: usize = self.files.iter().map(GroupedFile::page_count).sum();
            info!("attaching {} document(s), {} file(s)", self.files.len(), pages);
            user_parts.extend(self.files.iter().flat_map(GroupedFile::parts));
        }

        let url = self.endpoints.generate_url(&self.credentials)?;
        let started_at = OffsetDateTime::now_utc();
        let mut contents = self.history.clone();
        contents.push(Content::new(Role::User, user_parts));
        self.history = contents.clone();

        let mut retries = 0u32;
        let mut rounds = 0usize;
        let mut usage: Option<UsageMetadata> = None;
        let mut state = LoopState::Sending;
        let output = loop {
            state = match state {
                LoopState::Sending => {
                    if self.config.count_tokens {
                        match self.count_tokens(&contents) {
                            Ok(count) => info!("token count: {count}"),
                            Err(err) => warn!("token count failed: {err}"),
                        }
                    }
                    let payload = self.payload(&contents)?;
                    let resp = self.send_with_retry(&url, &payload, &mut retries)?;
                    if self.config.raw_response {
                        break Output::Raw(resp.json()?);
                    }
                    let body: GenerateContentResponse = resp.json()?;
                    if body.usage_metadata.is_some() {
                        usage = body.usage_metadata;
                    }
                    match body.candidates.into_iter().next() {
                        None => {
                            warn!("response carried no candidates");
                            LoopState::Done(Output::NoValue)
                        }
                        Some(candidate) => self.classify(candidate, &mut contents),
                    }
                }
                LoopState::AwaitingTool(call) => {
                    rounds += 1;
                    if rounds > self.config.max_function_rounds {
                        return Err(Error::FunctionRoundsExceeded(self.config.max_function_rounds));
                    }
                    debug!("calling function {} (round {rounds})", call.name);
                    let (kind, result) = self.functions.call(&call)?;
                    contents.push(Content::new(
                        Role::Function,
                        vec![Part::function_response(&call.name, result.clone())],
                    ));
                    self.history = contents.clone();
                    match kind {
                        FunctionKind::Output(shape) => LoopState::Done(Output::Json(unwrap_output(shape, result))),
                        FunctionKind::Tool => LoopState::Sending,
                    }
                }
                LoopState::Done(output) => break output,
            };
        };

        if let Some(monitor) = &self.monitor {
            monitor.record(RequestEvent {
                model: self.endpoints.model.clone(),
                started_at,
                finished_at: OffsetDateTime::now_utc(),
                input_tokens: usage.as_ref().and_then(|u| u.prompt_token_count),
                output_tokens: usage.as_ref().and_then(|u| u.candidates_token_count),
                total_tokens: usage.as_ref().and_then(|u| u.total_token_count),
                retries,
                function_rounds: rounds,
            });
        }

        Ok(Generation {
            output,
            usage: if self.config.include_usage { usage } else { None },
        })
    }

    fn classify(&mut self, candidate: Candidate, contents: &mut Vec<Content>) -> LoopState {
        let parts = match candidate.parts() {
            Some(parts) if !parts.is_empty() => parts.to_vec(),
            _ => {
                warn!(
                    "candidate carried no content (finish reason {})",
                    candidate.finish_reason.as_deref().unwrap_or("unknown")
                );
                return LoopState::Done(Output::NoValue);
            }
        };
        let turn = Content::new(Role::Model, parts);
        let call = turn.function_call().cloned();
        contents.push(turn);
        self.history = contents.clone();
        match call {
            Some(call) => LoopState::AwaitingTool(call),
            None => LoopState::Done(self.finish(&candidate)),
        }
    }

    fn finish(&self, candidate: &Candidate) -> Output {
        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|reason| BLOCKED_FINISH_REASONS.contains(reason))
        {
            warn!("generation stopped with finish reason {reason}");
            return Output::NoValue;
        }
        let Some(text) = candidate.parts().and_then(|p| p.last()).and_then(Part::as_text) else {
            warn!("final part carried no text");
            return Output::NoValue;
        };
        let text = text.trim();
        if self.config.parse_json {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                return Output::Json(value);
            }
        }
        Output::Text(text.to_string())
    }

    fn payload(&self, contents: &[Content]) -> Result<Value> {
        let mut payload = Map::new();
        payload.insert("contents".into(), serde_json::to_value(contents)?);

        let mut tools = Vec::new();
        if !self.functions.is_empty() {
            tools.push(json!({ "functionDeclarations": self.functions.declarations() }));
        }
        tools.extend(self.config.tools.iter().cloned());
        if !tools.is_empty() {
            payload.insert("tools".into(), Value::Array(tools));
        }

        let generation_config = self.config.wire();
        if !generation_config.is_empty() {
            payload.insert("generationConfig".into(), Value::Object(generation_config));
        }
        if let Some(instruction) = &self.config.system_instruction {
            payload.insert("systemInstruction".into(), instruction.clone());
        }
        if let Some(tool_config) = self.tool_config() {
            payload.insert("toolConfig".into(), tool_config);
        }
        Ok(Value::Object(payload))
    }

    fn tool_config(&self) -> Option<Value> {
        let mut config = match &self.config.tool_config {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if !self.functions.is_empty() {
            let mode = if self.functions.has_output() { "ANY" } else { "AUTO" };
            config.insert(
                "functionCallingConfig".into(),
                json!({ "mode": mode, "allowedFunctionNames": self.functions.names() }),
            );
        }
        (!config.is_empty()).then_some(Value::Object(config))
    }

    fn send_with_retry(&self, url: &str, payload: &Value, retries: &mut u32) -> Result<HttpResponse> {
        let policy = self.config.retry;
        loop {
            let request = self.credentials.authorize(HttpRequest::post(url).json(payload)?)?;
            match self.executor.send(request).and_then(HttpResponse::ensure_ok) {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() && *retries < policy.budget => {
                    *retries += 1;
                    warn!(
                        "generate failed ({err}); retry {}/{} in {:?}",
                        retries, policy.budget, policy.backoff
                    );
                    if let Some(monitor) = &self.monitor {
                        monitor.note_event(
                            "retry.generateContent",
                            json!({
                                "attempt": *retries,
                                "delay_ms": policy.backoff.as_millis() as u64,
                                "model": self.endpoints.model,
                            }),
                        );
                    }
                    thread::sleep(policy.backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn count_tokens(&self, contents: &[Content]) -> Result<Value> {
        let url = self.endpoints.count_tokens_url(&self.credentials)?;
        let request = self
            .credentials
            .authorize(HttpRequest::post(url).json(&json!({ "contents": contents }))?)?;
        self.executor.send(request)?.ensure_ok()?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKey;
    use crate::testing::ScriptedExecutor;
    use crate::types::{FileState, UploadedFile};

    fn text_response(text: &str) -> HttpResponse {
        HttpResponse::new(
            200,
            json!({
                "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
            })
            .to_string(),
        )
    }

    fn call_response(name: &str, args: Value) -> HttpResponse {
        HttpResponse::new(
            200,
            json!({"candidates": [{"content": {"parts": [{"functionCall": {"name": name, "args": args}}], "role": "model"}}]})
                .to_string(),
        )
    }

    fn generator(executor: Arc<ScriptedExecutor>) -> Generator {
        Generator::new(executor, Credentials::api_key("k"), Endpoints::default()).with_config(
            GenerationConfig {
                retry: RetryPolicy {
                    budget: 5,
                    backoff: Duration::ZERO,
                },
                ..GenerationConfig::default()
            },
        )
    }

    fn body(req: &HttpRequest) -> Value {
        serde_json::from_slice(req.body.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn plain_question_parses_json_answer() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response("4")]));
        let mut gen = generator(executor.clone());
        let result = gen.generate(&GenerateRequest::question("2+2?")).unwrap();
        assert_eq!(result.output, Output::Json(json!(4)));
        assert!(result.usage.is_none());

        let requests = executor.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.ends_with(":generateContent?key=k"));
        let sent = body(&requests[0]);
        assert_eq!(sent["contents"], json!([{"role": "user", "parts": [{"text": "2+2?"}]}]));
        assert!(sent.get("tools").is_none());
        assert_eq!(gen.history().len(), 2);
        assert_eq!(gen.history()[1].role, Role::Model);
    }

    #[test]
    fn temperature_is_sent_as_configured() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response("ok")]));
        let mut gen = generator(executor.clone());
        gen.config_mut().temperature = Some(0.7);
        gen.generate(&GenerateRequest::question("hi")).unwrap();
        let wire = String::from_utf8_lossy(executor.requests()[0].body.as_ref().unwrap()).to_string();
        assert!(wire.contains(r#""temperature":0.7"#), "{wire}");
    }

    #[test]
    fn json_parsing_can_be_disabled() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response(" 4 \n")]));
        let mut gen = generator(executor);
        gen.config_mut().parse_json = false;
        gen.config_mut().include_usage = true;
        let result = gen.generate(&GenerateRequest::question("2+2?")).unwrap();
        assert_eq!(result.output, Output::Text("4".into()));
        assert_eq!(result.usage.unwrap().total_token_count, Some(4));
    }

    #[test]
    fn server_errors_retry_up_to_budget() {
        let executor = Arc::new(ScriptedExecutor::new(|_| HttpResponse::new(503, "overloaded")));
        let mut gen = generator(executor.clone());
        let err = gen.generate(&GenerateRequest::question("hi")).unwrap_err();
        assert!(matches!(err, Error::Service { status: 503, ref body } if body == "overloaded"));
        assert_eq!(executor.requests().len(), 6);
        // every attempt resends the same conversation
        let bodies: Vec<Value> = executor.requests().iter().map(body).collect();
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn retry_recovers_before_budget() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![
            HttpResponse::new(500, "x"),
            HttpResponse::new(500, "x"),
            text_response("\"done\""),
        ]));
        let monitor = RunMonitor::new();
        let mut gen = generator(executor.clone()).with_monitor(monitor.clone());
        let result = gen.generate(&GenerateRequest::question("hi")).unwrap();
        assert_eq!(result.output, Output::Json(json!("done")));
        assert_eq!(monitor.events()[0].retries, 2);
        assert_eq!(monitor.note_names().len(), 2);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let executor = Arc::new(ScriptedExecutor::new(|_| {
            HttpResponse::new(400, r#"{"error":{"message":"bad"}}"#)
        }));
        let err = generator(executor.clone())
            .generate(&GenerateRequest::question("hi"))
            .unwrap_err();
        assert!(matches!(err, Error::Service { status: 400, .. }));
        assert_eq!(executor.requests().len(), 1);
    }

    #[test]
    fn empty_request_fails_before_network() {
        let executor = Arc::new(ScriptedExecutor::new(|_| text_response("x")));
        let mut gen = generator(executor.clone());
        let err = gen.generate(&GenerateRequest::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = gen.generate(&GenerateRequest::question("  ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(executor.requests().is_empty());
        assert!(gen.history().is_empty());
    }

    #[test]
    fn function_call_runs_tool_and_sends_result_back() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![
            call_response("lookupWeather", json!({"city": "Tokyo"})),
            text_response("It is 18C in Tokyo."),
        ]));
        let functions = FunctionTable::new().register(
            "lookupWeather",
            "Current weather for a city",
            Some(json!({"type": "object", "properties": {"city": {"type": "string"}}})),
            |args| {
                assert_eq!(args.and_then(|a| a["city"].as_str()), Some("Tokyo"));
                Ok(json!({"tempC": 18}))
            },
        );
        let mut gen = generator(executor.clone()).with_functions(functions);
        let result = gen.generate(&GenerateRequest::question("Weather in Tokyo?")).unwrap();
        assert_eq!(result.output, Output::Text("It is 18C in Tokyo.".into()));

        let requests = executor.requests();
        assert_eq!(requests.len(), 2);
        let first = body(&requests[0]);
        assert_eq!(first["tools"][0]["functionDeclarations"][0]["name"], json!("lookupWeather"));
        assert_eq!(
            first["toolConfig"]["functionCallingConfig"],
            json!({"mode": "AUTO", "allowedFunctionNames": ["lookupWeather"]})
        );

        let second = body(&requests[1]);
        let contents = second["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[2]["role"], json!("function"));
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"],
            json!({"name": "lookupWeather", "response": {"name": "lookupWeather", "content": {"tempC": 18}}})
        );
        assert_eq!(gen.history().len(), 4);
    }

    #[test]
    fn output_function_short_circuits() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![call_response(
            "customType_number",
            json!({"items": 42}),
        )]));
        let functions = FunctionTable::new().register_output(
            "number",
            OutputShape::Scalar,
            "Return the answer as a number",
            json!({"type": "number"}),
        );
        let mut gen = generator(executor.clone()).with_functions(functions);
        let result = gen.generate(&GenerateRequest::question("6*7?")).unwrap();
        assert_eq!(result.output, Output::Json(json!(42)));
        assert_eq!(executor.requests().len(), 1);
        let sent = body(&executor.requests()[0]);
        assert_eq!(sent["toolConfig"]["functionCallingConfig"]["mode"], json!("ANY"));
        assert_eq!(gen.history().last().unwrap().role, Role::Function);
    }

    #[test]
    fn unwrap_rule() {
        assert_eq!(unwrap_output(OutputShape::Object, json!({"items": {"a": 1}})), json!({"a": 1}));
        assert_eq!(
            unwrap_output(OutputShape::Array, json!([{"items": 1}, {"items": 2}])),
            json!([1, 2])
        );
        assert_eq!(
            unwrap_output(OutputShape::Object, json!({"items": 1, "other": 2})),
            json!({"items": 1, "other": 2})
        );
        assert_eq!(unwrap_output(OutputShape::Array, json!({"items": 5})), json!([5]));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![call_response("nope", json!({}))]));
        let err = generator(executor)
            .generate(&GenerateRequest::question("x"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(ref name) if name == "nope"));
    }

    #[test]
    fn function_rounds_are_bounded() {
        let executor = Arc::new(ScriptedExecutor::new(|_| call_response("tick", json!({}))));
        let functions = FunctionTable::new().register("tick", "", None, |_| Ok(json!(null)));
        let mut gen = generator(executor.clone()).with_functions(functions);
        gen.config_mut().max_function_rounds = 2;
        let err = gen.generate(&GenerateRequest::question("loop")).unwrap_err();
        assert!(matches!(err, Error::FunctionRoundsExceeded(2)));
        assert_eq!(executor.requests().len(), 3);
    }

    #[test]
    fn blocked_completion_yields_no_value() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![
            HttpResponse::new(200, r#"{"candidates":[{"finishReason":"SAFETY"}]}"#),
            HttpResponse::new(
                200,
                r#"{"candidates":[{"content":{"parts":[{"text":"partial"}]},"finishReason":"RECITATION"}]}"#,
            ),
        ]));
        let mut gen = generator(executor);
        let first = gen.generate(&GenerateRequest::question("a")).unwrap();
        assert_eq!(first.output, Output::NoValue);
        assert_eq!(first.output.to_string(), "No values.");
        let second = gen.generate(&GenerateRequest::question("b")).unwrap();
        assert_eq!(second.output, Output::NoValue);
        // first call: user turn only; second call: user + model turns
        assert_eq!(gen.history().len(), 3);
    }

    #[test]
    fn schema_only_request_synthesizes_prompt() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response(r#"{"n":1}"#)]));
        let mut gen = generator(executor.clone());
        gen.config_mut().response_schema = Some(json!({"type": "object"}));
        let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        let result = gen.generate(&GenerateRequest::schema(schema.clone())).unwrap();
        assert_eq!(result.output, Output::Json(json!({"n": 1})));

        let sent = body(&executor.requests()[0]);
        assert_eq!(
            sent["contents"][0]["parts"][0]["text"],
            json!(format!("Follow JSON schema.<JSONSchema>{schema}</JSONSchema>"))
        );
        assert_eq!(sent["generationConfig"]["responseMimeType"], json!("application/json"));
    }

    #[test]
    fn attached_files_follow_the_prompt() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response("ok")]));
        let page = |n: u32| UploadedFile {
            name: format!("files/p{n}"),
            key: DocumentKey::paged("deck", n, 2),
            mime_type: "image/png".into(),
            uri: format!("https://g/p{n}"),
            state: FileState::Active,
            extra: Map::new(),
        };
        let files = crate::consolidate::group_files(&[page(2), page(1)]);
        let mut gen = generator(executor.clone()).with_files(files);
        gen.generate(&GenerateRequest::parts(vec![Part::text("Summarize")]))
            .unwrap();
        let sent = body(&executor.requests()[0]);
        let parts = sent["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0]["text"], json!("Summarize"));
        assert_eq!(
            parts[1]["text"],
            json!("[Filename of the following file is deck. Total pages are 2.]")
        );
        assert_eq!(parts[2]["fileData"]["fileUri"], json!("https://g/p1"));
        assert_eq!(parts[3]["fileData"]["fileUri"], json!("https://g/p2"));
    }

    #[test]
    fn raw_response_is_returned_untouched() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response("4")]));
        let mut gen = generator(executor);
        gen.config_mut().raw_response = true;
        let result = gen.generate(&GenerateRequest::question("2+2?")).unwrap();
        let Output::Raw(raw) = result.output else {
            panic!("expected raw output");
        };
        assert_eq!(raw["usageMetadata"]["totalTokenCount"], json!(4));
    }

    #[test]
    fn token_count_failure_is_not_fatal() {
        let executor = Arc::new(ScriptedExecutor::new(|req| {
            if req.url.contains(":countTokens") {
                HttpResponse::new(403, "PERMISSION_DENIED")
            } else {
                text_response("true")
            }
        }));
        let mut gen = generator(executor.clone());
        gen.config_mut().count_tokens = true;
        let result = gen.generate(&GenerateRequest::question("ok?")).unwrap();
        assert_eq!(result.output, Output::Json(json!(true)));
        assert_eq!(executor.requests().len(), 2);
    }

    #[test]
    fn caller_tool_config_is_merged() {
        let executor = Arc::new(ScriptedExecutor::sequence(vec![text_response("1")]));
        let mut gen = generator(executor.clone()).with_functions(
            FunctionTable::new().register("f", "", None, |_| Ok(json!(1))),
        );
        gen.config_mut().tool_config = Some(json!({"retrievalConfig": {"languageCode": "en"}}));
        gen.config_mut().tools = vec![json!({"googleSearch": {}})];
        gen.generate(&GenerateRequest::question("q")).unwrap();
        let sent = body(&executor.requests()[0]);
        assert_eq!(sent["toolConfig"]["retrievalConfig"]["languageCode"], json!("en"));
        assert_eq!(sent["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"], json!(["f"]));
        assert_eq!(sent["tools"][1], json!({"googleSearch": {}}));
    }
}
