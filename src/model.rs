//! Canonical domain model shared by importers, dispatch, templates and runners.
//!
//! Every collection that carries insertion order (operations, exchanges,
//! headers as declared) is a `Vec`; every collection whose order is
//! irrelevant but must be deterministic (header values, bindings, binding
//! attributes) is a `BTree*`. Re-importing identical bytes therefore yields
//! an identical model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Service / Operation
// ============================================================================

/// Kind of API a service describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Rest,
    Soap,
    Event,
    Graphql,
    GenericRest,
    GenericEvent,
}

/// One versioned API definition.
///
/// Identity is `(name, version)`. A service is never mutated field by field
/// once published: re-import builds a new value and swaps it in whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            service_type,
            operations: Vec::new(),
        }
    }

    /// Repository key for this service.
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    /// Find an operation by its unique name.
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// Add an operation, keeping names unique. Returns `false` if an
    /// operation with the same name already exists.
    pub fn add_operation(&mut self, operation: Operation) -> bool {
        if self.operation(&operation.name).is_some() {
            return false;
        }
        self.operations.push(operation);
        true
    }
}

/// `(name, version)` identity of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub version: String,
}

impl ServiceKey {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Strategy used to pick an exchange for a runtime request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatcherKind {
    #[default]
    None,
    /// Named path variables.
    UriParts,
    /// Path variables and query arguments.
    UriParams,
    /// Query arguments only.
    QueryArgs,
    /// A location inside a JSON request body.
    JsonBody,
    /// One or more request headers.
    QueryHeader,
}

impl DispatcherKind {
    /// Parse a dispatcher name as found in documents (`URI_PARTS`, `json_body`...).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NONE" | "" => Some(Self::None),
            "URI_PARTS" => Some(Self::UriParts),
            "URI_PARAMS" => Some(Self::UriParams),
            "QUERY_ARGS" => Some(Self::QueryArgs),
            "JSON_BODY" => Some(Self::JsonBody),
            "QUERY_HEADER" => Some(Self::QueryHeader),
            _ => None,
        }
    }
}

/// One addressable action within a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// `"<VERB> <resourcePath>"`
    pub name: String,
    pub method: String,
    #[serde(default)]
    pub dispatcher: DispatcherKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_rules: Option<String>,
    #[serde(default)]
    pub resource_paths: Vec<String>,
    #[serde(default)]
    pub bindings: BTreeMap<BindingType, Binding>,
    /// Name of the exchange returned when dispatching finds no exact match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
}

impl Operation {
    pub fn new(method: &str, path: &str) -> Self {
        let method = method.to_uppercase();
        Self {
            name: format!("{} {}", method, path.trim()),
            method,
            dispatcher: DispatcherKind::None,
            dispatcher_rules: None,
            resource_paths: Vec::new(),
            bindings: BTreeMap::new(),
            fallback: None,
            exchanges: Vec::new(),
        }
    }

    /// The path part of the operation name (the verb prefix removed).
    pub fn path_pattern(&self) -> &str {
        match self.name.split_once(' ') {
            Some((_, path)) if !path.is_empty() => path,
            _ => &self.name,
        }
    }

    pub fn add_resource_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.resource_paths.contains(&path) {
            self.resource_paths.push(path);
        }
    }

    /// Return the binding for `binding_type`, creating an empty one if absent.
    pub fn binding_mut(&mut self, binding_type: BindingType) -> &mut Binding {
        self.bindings
            .entry(binding_type)
            .or_insert_with(|| Binding::new(binding_type))
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.name() == name)
    }
}

// ============================================================================
// Bindings
// ============================================================================

/// Protocol a binding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingType {
    Kafka,
    Amqp,
    Amqp1,
    Mqtt,
    Nats,
    Ws,
    Http,
}

impl BindingType {
    /// Map a document binding key (`kafka`, `amqp1`...) to a binding type.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "kafka" => Some(Self::Kafka),
            "amqp" => Some(Self::Amqp),
            "amqp1" => Some(Self::Amqp1),
            "mqtt" => Some(Self::Mqtt),
            "nats" => Some(Self::Nats),
            "ws" => Some(Self::Ws),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Scope a binding attribute was discovered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingScope {
    /// Declared on the channel/operation.
    Operation,
    /// Declared on a message; refines operation-level attributes.
    Message,
}

/// Protocol-specific attribute bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    #[serde(rename = "type")]
    pub binding_type: BindingType,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Binding {
    pub fn new(binding_type: BindingType) -> Self {
        Self {
            binding_type,
            attributes: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Merge discovered attributes.
    ///
    /// Keys are never removed. Operation-scope attributes only fill missing
    /// keys; message-scope attributes overwrite.
    pub fn merge<I>(&mut self, attributes: I, scope: BindingScope)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in attributes {
            match scope {
                BindingScope::Operation => {
                    self.attributes.entry(key).or_insert(value);
                }
                BindingScope::Message => {
                    self.attributes.insert(key, value);
                }
            }
        }
    }
}

// ============================================================================
// Exchanges
// ============================================================================

/// Multi-valued header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub values: BTreeSet<String>,
}

impl Header {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a header from a comma separated value, trimming and
    /// deduplicating each part.
    pub fn from_csv(name: impl Into<String>, csv: &str) -> Self {
        Self::new(name, csv.split(',').map(str::trim).filter(|v| !v.is_empty()))
    }

    /// Values joined back into a single header line.
    pub fn joined(&self) -> String {
        self.values.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Find a header by case-insensitive name.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name))
}

/// Merge header layers in precedence order.
///
/// A header name appearing in a later layer replaces the value set of the
/// same name (case-insensitive) from earlier layers. Order of first
/// appearance is preserved.
pub fn merge_headers<'a, I>(layers: I) -> Vec<Header>
where
    I: IntoIterator<Item = &'a [Header]>,
{
    let mut merged: Vec<Header> = Vec::new();
    for layer in layers {
        for header in layer {
            match merged
                .iter_mut()
                .find(|h| h.name.eq_ignore_ascii_case(&header.name))
            {
                Some(existing) => existing.values = header.values.clone(),
                None => merged.push(header.clone()),
            }
        }
    }
    merged
}

/// Name/value pair used for dispatch and URI substitution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Recorded request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Path and query parameter values, in declaration order.
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Recorded (or captured) response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
}

/// Single message of an event-driven operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Channel variable values.
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Recorded example attached to exactly one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Exchange {
    RequestResponse { request: Request, response: Response },
    Event { message: EventMessage },
}

impl Exchange {
    pub fn name(&self) -> &str {
        match self {
            Exchange::RequestResponse { request, .. } => &request.name,
            Exchange::Event { message } => &message.name,
        }
    }

    /// Parameters recorded for dispatch matching.
    pub fn parameters(&self) -> &[Parameter] {
        match self {
            Exchange::RequestResponse { request, .. } => &request.parameters,
            Exchange::Event { message } => &message.parameters,
        }
    }

    /// Headers recorded on the inbound side.
    pub fn request_headers(&self) -> &[Header] {
        match self {
            Exchange::RequestResponse { request, .. } => &request.headers,
            Exchange::Event { message } => &message.headers,
        }
    }

    /// Body recorded on the inbound side.
    pub fn request_content(&self) -> Option<&str> {
        match self {
            Exchange::RequestResponse { request, .. } => request.content.as_deref(),
            Exchange::Event { message } => message.content.as_deref(),
        }
    }

    pub fn request(&self) -> Option<&Request> {
        match self {
            Exchange::RequestResponse { request, .. } => Some(request),
            Exchange::Event { .. } => None,
        }
    }
}

// ============================================================================
// Test results
// ============================================================================

/// Runner family used for a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerType {
    Http,
    SoapHttp,
}

/// Outcome code of a single replayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestCode {
    Success,
    Failure,
    /// Not executed because the test was cancelled.
    Skipped,
}

/// Per-request outcome produced by a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReturn {
    pub code: TestCode,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The request as sent (headers include merged overrides).
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl TestReturn {
    pub fn skipped(request: Request) -> Self {
        Self {
            code: TestCode::Skipped,
            elapsed_ms: 0,
            message: Some("Skipped: test cancelled".to_string()),
            request,
            response: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == TestCode::Success
    }
}

/// Result for one replayed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStepResult {
    pub request_name: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&TestReturn> for TestStepResult {
    fn from(ret: &TestReturn) -> Self {
        Self {
            request_name: ret.request.name.clone(),
            success: ret.code == TestCode::Success,
            skipped: ret.code == TestCode::Skipped,
            elapsed_ms: ret.elapsed_ms,
            message: ret.message.clone(),
        }
    }
}

/// Result for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub operation_name: String,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub steps: Vec<TestStepResult>,
}

impl TestCaseResult {
    /// Build a terminal case result from its steps.
    ///
    /// Successful only if at least one step exists and none failed or was
    /// skipped.
    pub fn from_steps(operation_name: impl Into<String>, steps: Vec<TestStepResult>) -> Self {
        let success = !steps.is_empty() && steps.iter().all(|s| s.success);
        let elapsed_ms = steps.iter().map(|s| s.elapsed_ms).sum();
        Self {
            operation_name: operation_name.into(),
            success,
            elapsed_ms,
            steps,
        }
    }
}

/// Header overrides attached to a test.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsHeaders {
    #[serde(default)]
    pub globals: Vec<Header>,
    #[serde(default)]
    pub operations: BTreeMap<String, Vec<Header>>,
}

impl OperationsHeaders {
    pub fn for_operation(&self, operation: &str) -> &[Header] {
        self.operations
            .get(operation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Whole-service test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub service: ServiceKey,
    pub test_endpoint: String,
    pub runner_type: RunnerType,
    pub success: bool,
    pub in_progress: bool,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub operations_headers: OperationsHeaders,
    #[serde(default)]
    pub test_case_results: Vec<TestCaseResult>,
}

impl TestResult {
    pub fn new(
        id: impl Into<String>,
        service: ServiceKey,
        test_endpoint: impl Into<String>,
        runner_type: RunnerType,
    ) -> Self {
        Self {
            id: id.into(),
            service,
            test_endpoint: test_endpoint.into(),
            runner_type,
            success: false,
            in_progress: true,
            elapsed_ms: 0,
            operations_headers: OperationsHeaders::default(),
            test_case_results: Vec::new(),
        }
    }

    /// Mark the result terminal once every scheduled case is recorded.
    pub fn complete(&mut self, elapsed_ms: u64) {
        self.success = !self.test_case_results.is_empty()
            && self.test_case_results.iter().all(|c| c.success);
        self.elapsed_ms = elapsed_ms;
        self.in_progress = false;
    }
}
