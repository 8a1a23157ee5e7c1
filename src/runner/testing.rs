//! Scripted transport for runner tests.

use super::{Transport, TransportError, TransportRequest, TransportResponse};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Scripted {
    Respond(u16, String),
    Fail(TransportError),
}

/// Answers by the first rule whose fragment occurs in the URL; 200 "ok" otherwise.
#[derive(Default)]
pub(crate) struct FakeTransport {
    rules: Mutex<Vec<(String, Scripted)>>,
    delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<TransportRequest>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(self: Arc<Self>, url_part: &str, status: u16, body: &str) -> Arc<Self> {
        self.rules
            .lock()
            .unwrap()
            .push((url_part.to_string(), Scripted::Respond(status, body.to_string())));
        self
    }

    pub(crate) fn fail(self: Arc<Self>, url_part: &str, error: TransportError) -> Arc<Self> {
        self.rules
            .lock()
            .unwrap()
            .push((url_part.to_string(), Scripted::Fail(error)));
        self
    }

    pub(crate) fn delayed(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub(crate) fn sent(&self) -> Vec<TransportRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rules = self.rules.lock().unwrap();
        match rules.iter().find(|(part, _)| request.url.contains(part.as_str())) {
            Some((_, Scripted::Respond(status, body))) => Ok(TransportResponse {
                status: *status,
                body: body.clone(),
                media_type: Some("text/plain".to_string()),
                headers: Vec::new(),
            }),
            Some((_, Scripted::Fail(error))) => Err(error.clone()),
            None => Ok(TransportResponse {
                status: 200,
                body: "ok".to_string(),
                media_type: Some("text/plain".to_string()),
                headers: Vec::new(),
            }),
        }
    }
}
