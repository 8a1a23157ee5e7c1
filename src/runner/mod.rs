//! Test runners.
//!
//! A [`ProtocolRunner`] replays stored requests against a live endpoint
//! through a [`Transport`] and turns each call into a [`TestReturn`]. The
//! per-request contract is fixed for every protocol: transport failures
//! become FAILURE returns and never stop the batch. What varies per
//! protocol (target URL, request preparation, classification, message) is
//! plugged in as strategy functions.

pub mod cancel;
pub mod executor;
pub mod http;
pub mod soap;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CancelRegistry, CancelToken};
pub use executor::{TestExecutor, TestRequest};
pub use http::HttpTransport;

use crate::model::{
    find_header, merge_headers, Header, Operation, Request, Response, RunnerType, Service, ServiceKey,
    ServiceType, TestCode, TestResult, TestReturn,
};
use crate::uri;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

/// Transport-level failure of one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response: {0}")]
    Body(String),

    #[error("failed to build client: {0}")]
    Client(String),
}

/// Errors preventing a test from running at all.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no runner for {0:?} services")]
    Unsupported(ServiceType),

    #[error("unknown service {0}")]
    UnknownService(ServiceKey),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("test '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Protocol-specific invocation descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Overrides the operation's method.
    pub method: Option<String>,
    pub soap_action: Option<String>,
}

impl Invocation {
    pub fn http(method: &str) -> Self {
        Self {
            method: Some(method.to_uppercase()),
            soap_action: None,
        }
    }

    pub fn soap(action: &str) -> Self {
        Self {
            method: None,
            soap_action: Some(action.to_string()),
        }
    }
}

/// Outbound call as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<Header>,
    pub body: Option<String>,
}

/// Response captured in full by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<Header>,
    pub media_type: Option<String>,
    pub body: String,
}

/// Executes outbound calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request`. The response body must be fully read before returning.
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Build the call target for a request.
pub type TargetFn = fn(endpoint: &str, operation: &Operation, request: &Request) -> String;
/// Adjust a request before sending.
pub type PrepareFn = fn(request: &mut TransportRequest, operation: &Operation, invocation: &Invocation);
/// Classify a transport-level success.
pub type ClassifyFn = fn(response: &TransportResponse) -> TestCode;
/// Human-readable result message.
pub type DescribeFn = fn(response: &TransportResponse) -> String;

/// A runner: a transport plus per-protocol strategies.
#[derive(Clone)]
pub struct ProtocolRunner {
    runner_type: RunnerType,
    transport: Arc<dyn Transport>,
    target: TargetFn,
    prepare: PrepareFn,
    classify: ClassifyFn,
    describe: DescribeFn,
}

impl ProtocolRunner {
    /// HTTP runner for REST-like services.
    pub fn http(transport: Arc<dyn Transport>) -> Self {
        Self {
            runner_type: RunnerType::Http,
            transport,
            target: path_target,
            prepare: http::prepare,
            classify: classify_by_status,
            describe: describe_status,
        }
    }

    /// SOAP over HTTP runner.
    pub fn soap(transport: Arc<dyn Transport>) -> Self {
        Self {
            runner_type: RunnerType::SoapHttp,
            transport,
            target: endpoint_target,
            prepare: soap::prepare,
            classify: soap::classify,
            describe: soap::describe,
        }
    }

    pub fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    pub fn with_classifier(mut self, classify: ClassifyFn) -> Self {
        self.classify = classify;
        self
    }

    pub fn with_describer(mut self, describe: DescribeFn) -> Self {
        self.describe = describe;
        self
    }

    /// Replay `requests` for `operation`. An empty list yields no returns.
    pub async fn run_test(
        &self,
        service: &Service,
        operation: &Operation,
        test_result: &TestResult,
        requests: &[Request],
        endpoint: &str,
        invocation: &Invocation,
    ) -> Vec<TestReturn> {
        self.run_test_cancellable(
            service,
            operation,
            test_result,
            requests,
            endpoint,
            invocation,
            &CancelToken::new(),
        )
        .await
    }

    /// Like [`run_test`](Self::run_test); requests not completed when
    /// `cancel` fires are returned as SKIPPED.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_test_cancellable(
        &self,
        service: &Service,
        operation: &Operation,
        test_result: &TestResult,
        requests: &[Request],
        endpoint: &str,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Vec<TestReturn> {
        let mut returns = Vec::with_capacity(requests.len());

        for request in requests {
            if cancel.is_cancelled() {
                returns.push(TestReturn::skipped(request.clone()));
                continue;
            }

            let ret = tokio::select! {
                ret = self.run_one(operation, test_result, request, endpoint, invocation) => ret,
                _ = cancel.cancelled() => TestReturn::skipped(request.clone()),
            };
            returns.push(ret);
        }

        info!(
            service = %service.key(),
            operation = %operation.name,
            requests = requests.len(),
            failures = returns.iter().filter(|r| r.code == TestCode::Failure).count(),
            "Operation replayed"
        );
        returns
    }

    async fn run_one(
        &self,
        operation: &Operation,
        test_result: &TestResult,
        request: &Request,
        endpoint: &str,
        invocation: &Invocation,
    ) -> TestReturn {
        let mut headers = merge_headers([
            request.headers.as_slice(),
            test_result.operations_headers.globals.as_slice(),
            test_result.operations_headers.for_operation(&operation.name),
        ]);
        if let (Some(media_type), Some(_)) = (&request.media_type, &request.content) {
            if find_header(&headers, "content-type").is_none() {
                headers.push(Header::new("Content-Type", [media_type.as_str()]));
            }
        }

        let mut outbound = TransportRequest {
            method: operation.method.clone(),
            url: (self.target)(endpoint, operation, request),
            headers,
            body: request.content.clone(),
        };
        (self.prepare)(&mut outbound, operation, invocation);

        // The request as sent, headers included.
        let mut sent = request.clone();
        sent.headers = outbound.headers.clone();

        debug!(method = %outbound.method, url = %outbound.url, request = %request.name, "Sending request");
        let started = Instant::now();
        let result = self.transport.execute(&outbound).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let code = (self.classify)(&response);
                let message = (self.describe)(&response);
                debug!(request = %request.name, status = response.status, ?code, elapsed_ms, "Response received");
                TestReturn {
                    code,
                    elapsed_ms,
                    message: Some(message),
                    request: sent,
                    response: Some(Response {
                        name: request.name.clone(),
                        status: Some(response.status.to_string()),
                        content: Some(response.body),
                        media_type: response.media_type,
                        headers: response.headers,
                    }),
                }
            }
            Err(e) => {
                error!(request = %request.name, url = %outbound.url, error = %e, "Request failed");
                TestReturn {
                    code: TestCode::Failure,
                    elapsed_ms,
                    message: Some(e.to_string()),
                    request: sent,
                    response: None,
                }
            }
        }
    }
}

/// Endpoint plus the operation path instantiated with the request's parameters.
fn path_target(endpoint: &str, operation: &Operation, request: &Request) -> String {
    let path = uri::instantiate(operation.path_pattern(), &request.parameters);
    let base = endpoint.trim_end_matches('/');
    if path.starts_with('/') || path.starts_with('?') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn endpoint_target(endpoint: &str, _: &Operation, _: &Request) -> String {
    endpoint.to_string()
}

/// SUCCESS for 200..=399.
pub fn classify_by_status(response: &TransportResponse) -> TestCode {
    if (200..400).contains(&response.status) {
        TestCode::Success
    } else {
        TestCode::Failure
    }
}

pub fn describe_status(response: &TransportResponse) -> String {
    response.status.to_string()
}

/// Selects the runner variant for a service type.
#[derive(Clone)]
pub struct RunnerRegistry {
    transport: Arc<dyn Transport>,
}

impl RunnerRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn runner_for(&self, service_type: ServiceType) -> Result<ProtocolRunner, RunnerError> {
        match service_type {
            ServiceType::Rest | ServiceType::GenericRest | ServiceType::Graphql => {
                Ok(ProtocolRunner::http(self.transport.clone()))
            }
            ServiceType::Soap => Ok(ProtocolRunner::soap(self.transport.clone())),
            other => Err(RunnerError::Unsupported(other)),
        }
    }
}
