//! Dispatch engine.
//!
//! Selects the stored exchange answering a runtime request. The operation's
//! dispatcher kind and rule reduce both the stored exchange and the runtime
//! request to a canonical discriminator string, computed by the same
//! function on both sides; the first exchange (insertion order) whose
//! discriminator equals the request's wins.

use crate::model::{find_header, DispatcherKind, Exchange, Header, Operation, Parameter};
use crate::uri;
use jsonpath_rust::JsonPath;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Request as seen by the serving layer.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRequest {
    pub method: String,
    /// Path without query string.
    pub path: String,
    pub query: Vec<Parameter>,
    pub headers: Vec<Header>,
    pub body: Option<String>,
}

impl RuntimeRequest {
    /// Build from a method and a raw target (`/path?query`).
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, uri::parse_query_string(query)),
            None => (target, Vec::new()),
        };
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            query,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Header::from_csv(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Result of resolving a request against an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome<'a> {
    /// An exchange's discriminator equals the request's.
    Matched(&'a Exchange),
    /// Nothing matched; the operation's designated fallback answers.
    Fallback(&'a Exchange),
    /// Nothing matched and no fallback is configured.
    Miss,
}

impl<'a> MatchOutcome<'a> {
    pub fn exchange(&self) -> Option<&'a Exchange> {
        match self {
            MatchOutcome::Matched(e) | MatchOutcome::Fallback(e) => Some(e),
            MatchOutcome::Miss => None,
        }
    }
}

/// The values a discriminator is computed from.
#[derive(Debug, Default)]
pub struct CriteriaInput<'a> {
    /// Path variable and query values by name; first occurrence wins.
    pub params: BTreeMap<String, String>,
    pub headers: &'a [Header],
    pub body: Option<&'a str>,
}

impl<'a> CriteriaInput<'a> {
    /// Inputs recorded on a stored exchange.
    pub fn from_exchange(exchange: &'a Exchange) -> Self {
        Self {
            params: first_wins(exchange.parameters().iter().map(|p| (&p.name, &p.value))),
            headers: exchange.request_headers(),
            body: exchange.request_content(),
        }
    }

    /// Inputs of a runtime request; path variables come from `pattern`.
    pub fn from_request(pattern: &str, request: &'a RuntimeRequest) -> Self {
        let path_vars = uri::extract_variables(pattern, &request.path).unwrap_or_default();
        let params = first_wins(
            path_vars
                .iter()
                .chain(request.query.iter().map(|p| (&p.name, &p.value))),
        );
        Self {
            params,
            headers: &request.headers,
            body: request.body.as_deref(),
        }
    }
}

fn first_wins<'s, I>(pairs: I) -> BTreeMap<String, String>
where
    I: Iterator<Item = (&'s String, &'s String)>,
{
    let mut map = BTreeMap::new();
    for (name, value) in pairs {
        map.entry(name.clone()).or_insert_with(|| value.clone());
    }
    map
}

/// Compute the canonical discriminator of `input` for `operation`.
///
/// `None` means the input lacks something the rule needs; such an input
/// never matches exactly.
pub fn dispatch_criteria(operation: &Operation, input: &CriteriaInput<'_>) -> Option<String> {
    let pattern = operation.path_pattern();
    let rule_names = rule_names(operation.dispatcher_rules.as_deref());

    match operation.dispatcher {
        DispatcherKind::None => None,
        DispatcherKind::UriParts => {
            let names = if rule_names.is_empty() {
                uri::variable_names(pattern)
            } else {
                rule_names
            };
            uri_parts(&names, input)
        }
        DispatcherKind::QueryArgs => {
            let names = if rule_names.is_empty() {
                input.params.keys().cloned().collect()
            } else {
                rule_names
            };
            query_args(&names, input)
        }
        DispatcherKind::UriParams => {
            let path_vars = uri::variable_names(pattern);
            let (path_names, query_names): (Vec<String>, Vec<String>) = if rule_names.is_empty() {
                let query = input
                    .params
                    .keys()
                    .filter(|k| !path_vars.contains(k))
                    .cloned()
                    .collect();
                (path_vars, query)
            } else {
                rule_names.into_iter().partition(|n| path_vars.contains(n))
            };
            let mut criteria = uri_parts(&path_names, input)?;
            if !query_names.is_empty() {
                criteria.push_str(&query_args(&query_names, input)?);
            }
            Some(criteria)
        }
        DispatcherKind::JsonBody => json_body(operation.dispatcher_rules.as_deref()?, input.body?),
        DispatcherKind::QueryHeader => query_header(&rule_names, input.headers),
    }
}

/// Rule names joined with `&&`.
fn rule_names(rules: Option<&str>) -> Vec<String> {
    rules
        .unwrap_or("")
        .split("&&")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// `/a=1/b=2`, names sorted.
fn uri_parts(names: &[String], input: &CriteriaInput<'_>) -> Option<String> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    let mut criteria = String::new();
    for name in sorted {
        let value = input.params.get(name)?;
        criteria.push('/');
        criteria.push_str(name);
        criteria.push('=');
        criteria.push_str(&uri::encode_path(value));
    }
    Some(criteria)
}

/// `?a=1&b=2`, names sorted.
fn query_args(names: &[String], input: &CriteriaInput<'_>) -> Option<String> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    if sorted.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(sorted.len());
    for name in sorted {
        let value = input.params.get(name)?;
        parts.push(format!("{}={}", uri::encode_query(name), uri::encode_query(value)));
    }
    Some(format!("?{}", parts.join("&")))
}

/// Value at a JSON pointer (`/a/b`) or JSONPath (`$.a.b`) within the body.
fn json_body(rule: &str, body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let rule = rule.trim();

    let found = if rule.starts_with('$') {
        let path = JsonPath::try_from(rule).ok()?;
        match path.find(&json) {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            Value::Array(_) | Value::Null => return None,
            other => other,
        }
    } else {
        json.pointer(rule)?.clone()
    };

    match found {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// `?name=v1,v2&other=v`, in rule order.
fn query_header(names: &[String], headers: &[Header]) -> Option<String> {
    if names.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        let header = find_header(headers, name)?;
        parts.push(format!("{}={}", name.to_ascii_lowercase(), header.joined()));
    }
    Some(format!("?{}", parts.join("&")))
}

/// Matches runtime requests against an operation's exchanges.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchEngine;

impl DispatchEngine {
    pub fn new() -> Self {
        Self
    }

    /// Select the exchange answering `request`.
    pub fn resolve<'a>(&self, operation: &'a Operation, request: &RuntimeRequest) -> MatchOutcome<'a> {
        if operation.dispatcher == DispatcherKind::None {
            return match operation.exchanges.first() {
                Some(exchange) => MatchOutcome::Matched(exchange),
                None => MatchOutcome::Miss,
            };
        }

        let input = CriteriaInput::from_request(operation.path_pattern(), request);
        let wanted = dispatch_criteria(operation, &input);
        trace!(operation = %operation.name, criteria = ?wanted, "Computed request criteria");

        if let Some(wanted) = &wanted {
            for exchange in &operation.exchanges {
                let recorded = dispatch_criteria(operation, &CriteriaInput::from_exchange(exchange));
                if recorded.as_deref() == Some(wanted.as_str()) {
                    debug!(
                        operation = %operation.name,
                        exchange = %exchange.name(),
                        criteria = %wanted,
                        "Exchange matched"
                    );
                    return MatchOutcome::Matched(exchange);
                }
            }
        }

        match operation.fallback.as_deref().and_then(|name| operation.exchange(name)) {
            Some(exchange) => {
                debug!(
                    operation = %operation.name,
                    exchange = %exchange.name(),
                    criteria = ?wanted,
                    "No exact match, using fallback"
                );
                MatchOutcome::Fallback(exchange)
            }
            None => MatchOutcome::Miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Request, Response};

    fn exchange(name: &str, params: &[(&str, &str)]) -> Exchange {
        Exchange::RequestResponse {
            request: Request {
                name: name.to_string(),
                parameters: params.iter().map(|(n, v)| Parameter::new(*n, *v)).collect(),
                ..Request::default()
            },
            response: Response {
                name: name.to_string(),
                content: Some(format!("response-{}", name)),
                ..Response::default()
            },
        }
    }

    fn with_body(name: &str, body: &str) -> Exchange {
        Exchange::RequestResponse {
            request: Request {
                name: name.to_string(),
                content: Some(body.to_string()),
                ..Request::default()
            },
            response: Response::default(),
        }
    }

    fn operation(path: &str, kind: DispatcherKind, rules: Option<&str>, exchanges: Vec<Exchange>) -> Operation {
        let mut op = Operation::new("GET", path);
        op.dispatcher = kind;
        op.dispatcher_rules = rules.map(str::to_string);
        op.exchanges = exchanges;
        op
    }

    fn name_of(outcome: MatchOutcome<'_>) -> Option<&str> {
        outcome.exchange().map(Exchange::name)
    }

    #[test]
    fn test_uri_parts_all_permutations() {
        let engine = DispatchEngine::new();
        for pattern in ["/a/{x}/b/{y}", "/a/{y}/b/{x}", "/a/:x/b/:y"] {
            let op = operation(
                pattern,
                DispatcherKind::UriParts,
                Some("x && y"),
                vec![
                    exchange("first", &[("x", "1"), ("y", "2")]),
                    exchange("second", &[("y", "1"), ("x", "2")]),
                ],
            );
            // Whichever position x takes, the value bound to x decides.
            let req = RuntimeRequest::new("GET", "/a/1/b/2");
            let got = name_of(engine.resolve(&op, &req)).unwrap();
            let vars = uri::extract_variables(pattern, "/a/1/b/2").unwrap();
            let expected = if vars["x"] == "1" { "first" } else { "second" };
            assert_eq!(got, expected, "pattern {}", pattern);
        }
    }

    #[test]
    fn test_uri_parts_without_rules_uses_pattern() {
        let op = operation(
            "/pets/{id}",
            DispatcherKind::UriParts,
            None,
            vec![exchange("one", &[("id", "1")]), exchange("two", &[("id", "2")])],
        );
        let outcome = DispatchEngine::new().resolve(&op, &RuntimeRequest::new("GET", "/pets/2"));
        assert!(matches!(outcome, MatchOutcome::Matched(e) if e.name() == "two"));
    }

    #[test]
    fn test_first_registered_wins_on_ties() {
        let op = operation(
            "/pets/{id}",
            DispatcherKind::UriParts,
            Some("id"),
            vec![exchange("a", &[("id", "1")]), exchange("b", &[("id", "1")])],
        );
        let outcome = DispatchEngine::new().resolve(&op, &RuntimeRequest::new("GET", "/pets/1"));
        assert_eq!(name_of(outcome), Some("a"));
    }

    #[test]
    fn test_fallback_then_miss() {
        let mut op = operation(
            "/pets/{id}",
            DispatcherKind::UriParts,
            Some("id"),
            vec![exchange("one", &[("id", "1")]), exchange("default", &[("id", "0")])],
        );
        let engine = DispatchEngine::new();
        let req = RuntimeRequest::new("GET", "/pets/42");
        assert_eq!(engine.resolve(&op, &req), MatchOutcome::Miss);

        op.fallback = Some("default".to_string());
        assert!(matches!(engine.resolve(&op, &req), MatchOutcome::Fallback(e) if e.name() == "default"));

        op.fallback = Some("missing".to_string());
        assert_eq!(engine.resolve(&op, &req), MatchOutcome::Miss);
    }

    #[test]
    fn test_empty_segment_is_not_absent() {
        let op = operation(
            "/users/{id}",
            DispatcherKind::UriParts,
            Some("id"),
            vec![exchange("no-id", &[]), exchange("empty-id", &[("id", "")])],
        );
        let outcome = DispatchEngine::new().resolve(&op, &RuntimeRequest::new("GET", "/users/"));
        assert_eq!(name_of(outcome), Some("empty-id"));

        let op = operation("/users/{id}", DispatcherKind::UriParts, Some("id"), vec![exchange("no-id", &[])]);
        let outcome = DispatchEngine::new().resolve(&op, &RuntimeRequest::new("GET", "/users/"));
        assert_eq!(outcome, MatchOutcome::Miss);
    }

    #[test]
    fn test_query_args_order_insensitive() {
        let op = operation(
            "/search",
            DispatcherKind::QueryArgs,
            Some("q && page"),
            vec![
                exchange("p1", &[("q", "rust lang"), ("page", "1")]),
                exchange("p2", &[("page", "2"), ("q", "rust lang")]),
            ],
        );
        let req = RuntimeRequest::new("GET", "/search?page=2&q=rust+lang&ignored=x");
        assert_eq!(name_of(DispatchEngine::new().resolve(&op, &req)), Some("p2"));
    }

    #[test]
    fn test_uri_params_combines_both() {
        let op = operation(
            "/orders/{id}",
            DispatcherKind::UriParams,
            Some("id && expand"),
            vec![
                exchange("full", &[("id", "7"), ("expand", "true")]),
                exchange("short", &[("id", "7"), ("expand", "false")]),
            ],
        );
        let req = RuntimeRequest::new("GET", "/orders/7?expand=false");
        let input = CriteriaInput::from_request(op.path_pattern(), &req);
        assert_eq!(dispatch_criteria(&op, &input).as_deref(), Some("/id=7?expand=false"));
        assert_eq!(name_of(DispatchEngine::new().resolve(&op, &req)), Some("short"));
    }

    #[test]
    fn test_json_body_pointer_and_jsonpath() {
        let exchanges = vec![
            with_body("cat", r#"{"pet": {"kind": "cat"}}"#),
            with_body("dog", r#"{"pet": {"kind": "dog"}}"#),
        ];
        let engine = DispatchEngine::new();
        let req = RuntimeRequest::new("POST", "/pets").with_body(r#"{"pet": {"kind": "dog", "age": 3}}"#);

        let pointer = operation("/pets", DispatcherKind::JsonBody, Some("/pet/kind"), exchanges.clone());
        assert_eq!(name_of(engine.resolve(&pointer, &req)), Some("dog"));

        let path = operation("/pets", DispatcherKind::JsonBody, Some("$.pet.kind"), exchanges);
        assert_eq!(name_of(engine.resolve(&path, &req)), Some("dog"));

        let bad = RuntimeRequest::new("POST", "/pets").with_body("not json");
        assert_eq!(engine.resolve(&path, &bad), MatchOutcome::Miss);
    }

    #[test]
    fn test_query_header() {
        let tagged = |name: &str, region: &str| Exchange::RequestResponse {
            request: Request {
                name: name.to_string(),
                headers: vec![Header::new("X-Region", [region])],
                ..Request::default()
            },
            response: Response::default(),
        };
        let op = operation(
            "/items",
            DispatcherKind::QueryHeader,
            Some("x-region"),
            vec![tagged("eu", "eu-west"), tagged("us", "us-east")],
        );
        let req = RuntimeRequest::new("GET", "/items").with_header("X-REGION", "us-east");
        assert_eq!(name_of(DispatchEngine::new().resolve(&op, &req)), Some("us"));

        let req = RuntimeRequest::new("GET", "/items");
        assert_eq!(DispatchEngine::new().resolve(&op, &req), MatchOutcome::Miss);
    }

    #[test]
    fn test_no_dispatcher_returns_first() {
        let op = operation("/x", DispatcherKind::None, None, vec![exchange("only", &[]), exchange("other", &[])]);
        let outcome = DispatchEngine::new().resolve(&op, &RuntimeRequest::new("GET", "/x"));
        assert_eq!(name_of(outcome), Some("only"));

        let empty = operation("/x", DispatcherKind::None, None, vec![]);
        assert_eq!(DispatchEngine::new().resolve(&empty, &RuntimeRequest::new("GET", "/x")), MatchOutcome::Miss);
    }
}
