//! Test execution.
//!
//! Runs the selected operations of a service against a test endpoint and
//! maintains the [`TestResult`] tree while doing so.

use super::{CancelRegistry, CancelToken, Invocation, ProtocolRunner, RunnerError, RunnerRegistry};
use crate::config::RunnerSettings;
use crate::model::{
    Exchange, Operation, OperationsHeaders, Request, Service, ServiceKey, TestCaseResult, TestResult,
    TestStepResult,
};
use crate::store::ServiceRepository;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

/// What to test.
#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Caller-chosen id, used for `snapshot` and `cancel`.
    pub id: String,
    pub service: ServiceKey,
    pub endpoint: String,
    /// Operation names to run; empty runs every operation.
    pub operations: Vec<String>,
    pub headers: OperationsHeaders,
}

/// Launches tests and keeps their results.
pub struct TestExecutor {
    repository: Arc<dyn ServiceRepository>,
    registry: RunnerRegistry,
    settings: RunnerSettings,
    results: RwLock<HashMap<String, TestResult>>,
    cancels: CancelRegistry,
}

impl TestExecutor {
    pub fn new(repository: Arc<dyn ServiceRepository>, registry: RunnerRegistry, settings: RunnerSettings) -> Self {
        Self {
            repository,
            registry,
            settings,
            results: RwLock::new(HashMap::new()),
            cancels: CancelRegistry::new(),
        }
    }

    /// Run a test to completion and return its terminal result.
    ///
    /// Case results are recorded as operations finish; `in_progress` is
    /// cleared only once every operation has been joined.
    pub async fn launch(&self, request: TestRequest) -> Result<TestResult, RunnerError> {
        let service = self
            .repository
            .get(&request.service)
            .await
            .ok_or_else(|| RunnerError::UnknownService(request.service.clone()))?;
        let runner = self.registry.runner_for(service.service_type)?;
        let operations = select_operations(&service, &request.operations)?;

        let mut result = TestResult::new(
            request.id.clone(),
            request.service.clone(),
            request.endpoint.clone(),
            runner.runner_type(),
        );
        result.operations_headers = request.headers;

        {
            let mut results = self.results.write().await;
            if results.get(&request.id).is_some_and(|r| r.in_progress) {
                return Err(RunnerError::AlreadyRunning(request.id));
            }
            results.insert(request.id.clone(), result.clone());
        }
        let token = self.cancels.register(&request.id);

        info!(
            test = %request.id,
            service = %request.service,
            endpoint = %request.endpoint,
            operations = operations.len(),
            parallel = self.settings.parallel_operations,
            "Test launched"
        );

        let started = Instant::now();
        if self.settings.parallel_operations {
            join_all(
                operations
                    .iter()
                    .map(|op| self.run_operation(&runner, &service, op, &result, &request.endpoint, &token)),
            )
            .await;
        } else {
            for op in &operations {
                self.run_operation(&runner, &service, op, &result, &request.endpoint, &token)
                    .await;
            }
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.cancels.remove(&request.id);

        let mut results = self.results.write().await;
        let stored = results.entry(request.id.clone()).or_insert(result);
        stored
            .test_case_results
            .sort_by_key(|case| operations.iter().position(|op| op.name == case.operation_name));
        stored.complete(elapsed_ms);

        info!(
            test = %request.id,
            success = stored.success,
            elapsed_ms,
            cancelled = token.is_cancelled(),
            "Test completed"
        );
        Ok(stored.clone())
    }

    async fn run_operation(
        &self,
        runner: &ProtocolRunner,
        service: &Service,
        operation: &Operation,
        template: &TestResult,
        endpoint: &str,
        token: &CancelToken,
    ) {
        let requests: Vec<Request> = operation
            .exchanges
            .iter()
            .filter_map(Exchange::request)
            .cloned()
            .collect();

        let returns = runner
            .run_test_cancellable(service, operation, template, &requests, endpoint, &Invocation::default(), token)
            .await;
        let steps: Vec<TestStepResult> = returns.iter().map(TestStepResult::from).collect();
        let case = TestCaseResult::from_steps(operation.name.clone(), steps);

        if let Some(result) = self.results.write().await.get_mut(&template.id) {
            result.test_case_results.push(case);
        }
    }

    /// Current state of a test, partial while it runs.
    pub async fn snapshot(&self, id: &str) -> Option<TestResult> {
        self.results.read().await.get(id).cloned()
    }

    /// Cancel a running test. Remaining requests are reported as skipped.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.cancels.cancel(id);
        if cancelled {
            info!(test = %id, "Test cancellation requested");
        }
        cancelled
    }
}

fn select_operations<'a>(service: &'a Service, names: &[String]) -> Result<Vec<&'a Operation>, RunnerError> {
    if names.is_empty() {
        return Ok(service.operations.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            service
                .operation(name)
                .ok_or_else(|| RunnerError::UnknownOperation(name.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Parameter, Response, ServiceType};
    use crate::runner::testing::FakeTransport;
    use crate::runner::TransportError;
    use crate::store::InMemoryServiceStore;
    use std::time::Duration;

    fn exchange(name: &str, id: &str) -> Exchange {
        Exchange::RequestResponse {
            request: Request {
                name: name.to_string(),
                parameters: vec![Parameter::new("id", id)],
                ..Request::default()
            },
            response: Response::default(),
        }
    }

    fn orders_service(service_type: ServiceType) -> Service {
        let mut service = Service::new("Orders", "1.0", service_type);
        let mut get = Operation::new("GET", "/orders/{id}");
        get.exchanges = vec![exchange("one", "1"), exchange("two", "2")];
        let mut delete = Operation::new("DELETE", "/orders/{id}");
        delete.exchanges = vec![exchange("gone", "9")];
        service.add_operation(get);
        service.add_operation(delete);
        service
    }

    async fn executor(transport: Arc<FakeTransport>, parallel: bool, service: Service) -> TestExecutor {
        let store = Arc::new(InMemoryServiceStore::new());
        store.publish(service).await;
        let settings = RunnerSettings {
            parallel_operations: parallel,
            ..RunnerSettings::default()
        };
        TestExecutor::new(store, RunnerRegistry::new(transport), settings)
    }

    fn request(id: &str, operations: &[&str]) -> TestRequest {
        TestRequest {
            id: id.to_string(),
            service: ServiceKey::new("Orders", "1.0"),
            endpoint: "http://orders.local".to_string(),
            operations: operations.iter().map(|s| s.to_string()).collect(),
            headers: OperationsHeaders::default(),
        }
    }

    #[tokio::test]
    async fn test_all_operations_succeed() {
        for parallel in [true, false] {
            let exec = executor(FakeTransport::new(), parallel, orders_service(ServiceType::Rest)).await;
            let result = exec.launch(request("t1", &[])).await.unwrap();

            assert!(!result.in_progress);
            assert!(result.success);
            let names: Vec<&str> = result
                .test_case_results
                .iter()
                .map(|c| c.operation_name.as_str())
                .collect();
            assert_eq!(names, vec!["GET /orders/{id}", "DELETE /orders/{id}"]);
            assert_eq!(result.test_case_results[0].steps.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_failing_step_fails_case_and_test() {
        let transport = FakeTransport::new().fail("/orders/2", TransportError::Timeout("slow".to_string()));
        let exec = executor(transport, true, orders_service(ServiceType::Rest)).await;
        let result = exec.launch(request("t1", &[])).await.unwrap();

        assert!(!result.success);
        let get = &result.test_case_results[0];
        assert!(!get.success);
        assert!(get.steps[0].success);
        assert!(!get.steps[1].success);
        assert!(get.steps[1].message.as_deref().unwrap().contains("slow"));
        assert!(result.test_case_results[1].success);
    }

    #[tokio::test]
    async fn test_selected_operations_only() {
        let transport = FakeTransport::new();
        let exec = executor(transport.clone(), true, orders_service(ServiceType::Rest)).await;
        let result = exec.launch(request("t1", &["DELETE /orders/{id}"])).await.unwrap();

        assert_eq!(result.test_case_results.len(), 1);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].method, "DELETE");

        let err = exec.launch(request("t2", &["PATCH /nope"])).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_unsupported_services() {
        let exec = executor(FakeTransport::new(), true, orders_service(ServiceType::Event)).await;
        let err = exec.launch(request("t1", &[])).await.unwrap_err();
        assert!(matches!(err, RunnerError::Unsupported(ServiceType::Event)));

        let mut missing = request("t2", &[]);
        missing.service = ServiceKey::new("Nope", "1");
        assert!(matches!(
            exec.launch(missing).await.unwrap_err(),
            RunnerError::UnknownService(_)
        ));
        assert!(exec.snapshot("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_requests() {
        let transport = FakeTransport::new().delayed(Duration::from_millis(300));
        let exec = Arc::new(executor(transport, false, orders_service(ServiceType::Rest)).await);

        let running = exec.clone();
        let handle = tokio::spawn(async move { running.launch(request("t1", &[])).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let partial = exec.snapshot("t1").await.unwrap();
        assert!(partial.in_progress);
        assert!(partial.test_case_results.is_empty());

        assert!(exec.cancel("t1"));
        let result = handle.await.unwrap().unwrap();

        assert!(!result.in_progress);
        assert!(!result.success);
        assert_eq!(result.test_case_results.len(), 2);
        for case in &result.test_case_results {
            assert!(case.steps.iter().all(|s| s.skipped && !s.success));
        }
        assert!(!exec.cancel("t1"));
    }
}
