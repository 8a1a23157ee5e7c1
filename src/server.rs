//! Mock serving facade.
//!
//! Resolves an inbound request to a stored exchange of a published service
//! and renders the exchange's response through the template engine.

use crate::config::GlobalSettings;
use crate::dispatch::{DispatchEngine, MatchOutcome, RuntimeRequest};
use crate::model::{Exchange, Header, Operation, Service, ServiceKey};
use crate::store::ServiceRepository;
use crate::template::{EvalContext, EvaluableRequest, TemplateEngine};
use crate::uri;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A rendered mock response.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<Header>,
    pub body: Option<String>,
    pub media_type: Option<String>,
    /// Name of the exchange that answered.
    pub exchange: String,
    /// Answered by the operation's fallback rather than an exact match.
    pub fallback: bool,
}

/// Why no response could be produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MissReason {
    UnknownService(ServiceKey),
    NoOperation { method: String, path: String },
    NoExchange { operation: String },
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::UnknownService(key) => write!(f, "no service {}", key),
            MissReason::NoOperation { method, path } => write!(f, "no operation for {} {}", method, path),
            MissReason::NoExchange { operation } => write!(f, "no exchange of {} matches", operation),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServeOutcome {
    Response(MockResponse),
    Miss(MissReason),
}

/// Serves mock requests from the published services.
pub struct MockServer {
    repository: Arc<dyn ServiceRepository>,
    dispatcher: DispatchEngine,
    templates: TemplateEngine,
    settings: GlobalSettings,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Requests answered by an exchange, fallbacks included.
    requests_matched: AtomicU64,
    /// Requests nothing answered.
    requests_unmatched: AtomicU64,
}

impl MockServer {
    pub fn new(repository: Arc<dyn ServiceRepository>, settings: GlobalSettings) -> Self {
        Self::with_templates(repository, settings, TemplateEngine::new())
    }

    /// Use a template engine carrying extra registered functions.
    pub fn with_templates(
        repository: Arc<dyn ServiceRepository>,
        settings: GlobalSettings,
        templates: TemplateEngine,
    ) -> Self {
        Self {
            repository,
            dispatcher: DispatchEngine::new(),
            templates,
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get requests answered, fallbacks included.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get requests nothing answered.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Answer `request` from the exchanges of service `name`/`version`.
    pub async fn serve(&self, name: &str, version: &str, request: &RuntimeRequest) -> ServeOutcome {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let key = ServiceKey::new(name, version);
        let outcome = match self.repository.get(&key).await {
            Some(service) => self.serve_from(&service, request),
            None => ServeOutcome::Miss(MissReason::UnknownService(key.clone())),
        };

        match &outcome {
            ServeOutcome::Response(response) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        service = %key,
                        method = %request.method,
                        path = %request.path,
                        exchange = %response.exchange,
                        fallback = response.fallback,
                        status = response.status,
                        "Mock request answered"
                    );
                }
            }
            ServeOutcome::Miss(reason) => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        service = %key,
                        method = %request.method,
                        path = %request.path,
                        reason = %reason,
                        "Mock request unmatched"
                    );
                }
            }
        }
        outcome
    }

    fn serve_from(&self, service: &Service, request: &RuntimeRequest) -> ServeOutcome {
        let Some((operation, path_vars)) = find_operation(service, request) else {
            return ServeOutcome::Miss(MissReason::NoOperation {
                method: request.method.clone(),
                path: request.path.clone(),
            });
        };

        let (exchange, fallback) = match self.dispatcher.resolve(operation, request) {
            MatchOutcome::Matched(exchange) => (exchange, false),
            MatchOutcome::Fallback(exchange) => (exchange, true),
            MatchOutcome::Miss => {
                return ServeOutcome::Miss(MissReason::NoExchange {
                    operation: operation.name.clone(),
                })
            }
        };

        let ctx = EvalContext::with_request(&evaluable(request, path_vars));
        ServeOutcome::Response(self.render(exchange, fallback, &ctx))
    }

    fn render(&self, exchange: &Exchange, fallback: bool, ctx: &EvalContext) -> MockResponse {
        let (status, headers, content, media_type) = match exchange {
            Exchange::RequestResponse { response, .. } => (
                response.status.as_deref().and_then(|s| s.trim().parse().ok()).unwrap_or(200),
                &response.headers,
                response.content.as_deref(),
                response.media_type.clone(),
            ),
            Exchange::Event { message } => {
                (200, &message.headers, message.content.as_deref(), message.media_type.clone())
            }
        };

        let headers = headers
            .iter()
            .map(|h| Header::new(h.name.clone(), h.values.iter().map(|v| self.templates.render(v, ctx))))
            .collect();

        MockResponse {
            status,
            headers,
            body: content.map(|c| self.templates.render(c, ctx)),
            media_type,
            exchange: exchange.name().to_string(),
            fallback,
        }
    }
}

/// Operation answering the request's method and path, with the path
/// variables it extracted. Literal paths win over templated ones, whatever
/// the declaration order.
fn find_operation<'a>(
    service: &'a Service,
    request: &RuntimeRequest,
) -> Option<(&'a Operation, BTreeMap<String, String>)> {
    let candidates = || {
        service
            .operations
            .iter()
            .filter(|op| op.method.eq_ignore_ascii_case(&request.method))
    };

    let literal = candidates().find(|op| {
        op.resource_paths.iter().any(|p| *p == request.path)
            || (!uri::has_variables(op.path_pattern()) && op.path_pattern() == request.path)
    });
    if let Some(op) = literal {
        return Some((op, BTreeMap::new()));
    }

    candidates().find_map(|op| uri::extract_variables(op.path_pattern(), &request.path).map(|vars| (op, vars)))
}

fn evaluable(request: &RuntimeRequest, path_vars: BTreeMap<String, String>) -> EvaluableRequest {
    let mut params = path_vars;
    for p in &request.query {
        params.entry(p.name.clone()).or_insert_with(|| p.value.clone());
    }
    EvaluableRequest {
        body: request.body.clone(),
        path: request.path.clone(),
        method: request.method.clone(),
        headers: request.headers.iter().map(|h| (h.name.clone(), h.joined())).collect(),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DispatcherKind, Parameter, Request, Response, ServiceType};
    use crate::store::InMemoryServiceStore;

    fn pet(name: &str, id: &str, status: &str, body: &str) -> Exchange {
        Exchange::RequestResponse {
            request: Request {
                name: name.to_string(),
                parameters: vec![Parameter::new("id", id)],
                ..Request::default()
            },
            response: Response {
                name: name.to_string(),
                status: Some(status.to_string()),
                content: Some(body.to_string()),
                media_type: Some("application/json".to_string()),
                headers: vec![Header::new("X-Trace", ["{{ request.headers[x-trace] }}"])],
            },
        }
    }

    async fn server() -> MockServer {
        let mut service = Service::new("Petstore", "1.0", ServiceType::Rest);

        let mut get = Operation::new("GET", "/pets/{id}");
        get.dispatcher = DispatcherKind::UriParts;
        get.dispatcher_rules = Some("id".to_string());
        get.exchanges = vec![
            pet("rex", "1", "200", r#"{"id": {{ request.params[id] }}, "name": "Rex"}"#),
            pet("unknown", "0", "404", r#"{"error": "no pet {{request.params[id]}}"}"#),
        ];
        get.fallback = Some("unknown".to_string());

        let mut list = Operation::new("GET", "/pets");
        list.add_resource_path("/pets");
        list.exchanges = vec![pet("all", "", "200", "[]")];

        let mut delete = Operation::new("DELETE", "/pets/{id}");
        delete.dispatcher = DispatcherKind::UriParts;
        delete.dispatcher_rules = Some("id".to_string());
        delete.exchanges = vec![pet("gone", "1", "204", "")];

        service.add_operation(get);
        service.add_operation(list);
        service.add_operation(delete);

        let store = Arc::new(InMemoryServiceStore::new());
        store.publish(service).await;
        MockServer::new(store, GlobalSettings::default())
    }

    fn response(outcome: ServeOutcome) -> MockResponse {
        match outcome {
            ServeOutcome::Response(r) => r,
            ServeOutcome::Miss(reason) => panic!("unexpected miss: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_matched_exchange_is_rendered() {
        let server = server().await;
        let request = RuntimeRequest::new("GET", "/pets/1").with_header("X-Trace", "abc");
        let r = response(server.serve("Petstore", "1.0", &request).await);

        assert_eq!(r.exchange, "rex");
        assert!(!r.fallback);
        assert_eq!(r.status, 200);
        assert_eq!(r.body.as_deref(), Some(r#"{"id": 1, "name": "Rex"}"#));
        assert_eq!(r.media_type.as_deref(), Some("application/json"));
        assert_eq!(r.headers[0].joined(), "abc");
    }

    #[tokio::test]
    async fn test_fallback_answers_unknown_value() {
        let server = server().await;
        let r = response(server.serve("Petstore", "1.0", &RuntimeRequest::new("get", "/pets/42")).await);

        assert_eq!(r.exchange, "unknown");
        assert!(r.fallback);
        assert_eq!(r.status, 404);
        assert_eq!(r.body.as_deref(), Some(r#"{"error": "no pet 42"}"#));
    }

    #[tokio::test]
    async fn test_literal_resource_path() {
        let server = server().await;
        let r = response(server.serve("Petstore", "1.0", &RuntimeRequest::new("GET", "/pets?limit=2")).await);
        assert_eq!(r.exchange, "all");
        assert_eq!(r.body.as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_literal_path_wins_over_template_declared_first() {
        let mut service = Service::new("Petstore", "1.0", ServiceType::Rest);

        let mut by_id = Operation::new("GET", "/pets/{id}");
        by_id.exchanges = vec![pet("byid", "1", "200", "one")];
        let mut mine = Operation::new("GET", "/pets/mine");
        mine.add_resource_path("/pets/mine");
        mine.exchanges = vec![pet("mine", "", "200", "mine")];
        service.add_operation(by_id);
        service.add_operation(mine);

        let store = Arc::new(InMemoryServiceStore::new());
        store.publish(service).await;
        let server = MockServer::new(store, GlobalSettings::default());

        let r = response(server.serve("Petstore", "1.0", &RuntimeRequest::new("GET", "/pets/mine")).await);
        assert_eq!(r.exchange, "mine");
        let r = response(server.serve("Petstore", "1.0", &RuntimeRequest::new("GET", "/pets/1")).await);
        assert_eq!(r.exchange, "byid");
    }

    #[tokio::test]
    async fn test_misses_and_counters() {
        let server = server().await;

        let outcome = server.serve("Nope", "1.0", &RuntimeRequest::new("GET", "/pets/1")).await;
        assert!(matches!(outcome, ServeOutcome::Miss(MissReason::UnknownService(_))));

        let outcome = server.serve("Petstore", "1.0", &RuntimeRequest::new("PUT", "/pets/1")).await;
        assert!(matches!(outcome, ServeOutcome::Miss(MissReason::NoOperation { .. })));

        let outcome = server.serve("Petstore", "1.0", &RuntimeRequest::new("DELETE", "/pets/7")).await;
        assert_eq!(
            outcome,
            ServeOutcome::Miss(MissReason::NoExchange {
                operation: "DELETE /pets/{id}".to_string()
            })
        );

        let r = response(server.serve("Petstore", "1.0", &RuntimeRequest::new("DELETE", "/pets/1")).await);
        assert_eq!(r.status, 204);

        assert_eq!(server.total_requests(), 4);
        assert_eq!(server.total_matched(), 1);
        assert_eq!(server.total_unmatched(), 3);
    }

    #[tokio::test]
    async fn test_custom_template_function() {
        let mut templates = TemplateEngine::new();
        templates.register("petCount", |_| Ok("3".to_string()));

        let mut service = Service::new("Counter", "1", ServiceType::Rest);
        let mut op = Operation::new("GET", "/count");
        op.exchanges = vec![pet("count", "", "200", "{{ petCount() }}")];
        service.add_operation(op);

        let store = Arc::new(InMemoryServiceStore::new());
        store.publish(service).await;
        let server = MockServer::with_templates(store, GlobalSettings::default(), templates);

        let r = response(server.serve("Counter", "1", &RuntimeRequest::new("GET", "/count")).await);
        assert_eq!(r.body.as_deref(), Some("3"));
    }
}
