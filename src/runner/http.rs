//! HTTP transport and request preparation.

use super::{Invocation, Transport, TransportError, TransportRequest, TransportResponse};
use crate::config::RunnerSettings;
use crate::model::{Header, Operation};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::warn;

/// Transport over reqwest with connect/read timeouts and transport-level retries.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    retries: u32,
    retry_delay: Duration,
}

impl HttpTransport {
    pub fn new(settings: &RunnerSettings) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.read_timeout())
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            retries: settings.retries,
            retry_delay: settings.retry_delay(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("method '{}': {}", request.method, e)))?;
        let headers = build_headers(&request.headers)?;

        let mut last_error = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let mut builder = self
                .client
                .request(method.clone(), &request.url)
                .headers(headers.clone());
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => return read_response(response).await,
                Err(e) => {
                    let error = transport_error(&e);
                    warn!(url = %request.url, attempt, error = %error, "Transport failure");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Request("no attempt made".to_string())))
    }
}

fn transport_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// Multi-valued headers are sent as one comma joined line.
fn build_headers(headers: &[Header]) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("header name '{}': {}", header.name, e)))?;
        let value = HeaderValue::from_str(&header.joined())
            .map_err(|e| TransportError::InvalidRequest(format!("header value for '{}': {}", header.name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Capture status, headers and the whole body once.
async fn read_response(response: reqwest::Response) -> Result<TransportResponse, TransportError> {
    let status = response.status().as_u16();
    let media_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut headers = Vec::new();
    for name in response.headers().keys() {
        let values = response
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok());
        headers.push(Header::new(name.as_str(), values));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::Body(e.to_string()))?;

    Ok(TransportResponse {
        status,
        headers,
        media_type,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Apply the invocation's method override.
pub(super) fn prepare(request: &mut TransportRequest, _operation: &Operation, invocation: &Invocation) {
    if let Some(method) = &invocation.method {
        request.method = method.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings(retries: u32) -> RunnerSettings {
        RunnerSettings {
            connect_timeout_ms: 500,
            read_timeout_ms: 2_000,
            retries,
            retry_delay_ms: 10,
            parallel_operations: true,
        }
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_execute_captures_response() {
        let (base, server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nX-Multi: a\r\nX-Multi: b\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
        )
        .await;

        let transport = HttpTransport::new(&settings(0)).unwrap();
        let response = transport
            .execute(&TransportRequest {
                method: "POST".to_string(),
                url: format!("{}/orders?x=1", base),
                headers: vec![Header::new("X-Env", ["dev", "eu"])],
                body: Some("hello".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, "nope");
        assert_eq!(response.media_type.as_deref(), Some("text/plain"));
        let multi = crate::model::find_header(&response.headers, "x-multi").unwrap();
        assert_eq!(multi.values.len(), 2);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /orders?x=1 HTTP/1.1"));
        assert!(raw.to_ascii_lowercase().contains("x-env: dev,eu"));
    }

    #[tokio::test]
    async fn test_connection_refused_after_retries() {
        // Grab a free port then release it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&settings(2)).unwrap();
        let err = transport
            .execute(&TransportRequest {
                method: "GET".to_string(),
                url: format!("http://{}/", addr),
                headers: vec![],
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_) | TransportError::Request(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever answering.
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let transport = HttpTransport::new(&RunnerSettings {
            read_timeout_ms: 50,
            ..settings(0)
        })
        .unwrap();
        let err = transport
            .execute(&TransportRequest {
                method: "GET".to_string(),
                url: format!("http://{}/slow", addr),
                headers: vec![],
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_invalid_header_is_rejected() {
        let transport = HttpTransport::new(&settings(0)).unwrap();
        let err = transport
            .execute(&TransportRequest {
                method: "GET".to_string(),
                url: "http://127.0.0.1:1/".to_string(),
                headers: vec![Header::new("bad header", ["x"])],
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[test]
    fn test_prepare_overrides_method() {
        let mut request = TransportRequest {
            method: "GET".to_string(),
            url: "http://x".to_string(),
            headers: vec![],
            body: None,
        };
        prepare(&mut request, &Operation::new("GET", "/x"), &Invocation::http("delete"));
        assert_eq!(request.method, "DELETE");
    }
}
