//! SOAP over HTTP strategies.
//!
//! Calls are POSTed to the endpoint as-is with a `SOAPAction` header. A
//! response carrying a `Fault` element is a failure whatever its status.

use super::{Invocation, TransportRequest, TransportResponse};
use crate::model::{Header, Operation, TestCode};
use regex::Regex;
use std::sync::OnceLock;

const SOAP_CONTENT_TYPE: &str = "text/xml;charset=UTF-8";

fn fault_regex() -> &'static Regex {
    static FAULT: OnceLock<Regex> = OnceLock::new();
    FAULT.get_or_init(|| Regex::new(r"<(?:[\w.-]+:)?Fault[\s/>]").expect("fault pattern is valid"))
}

fn fault_string_regex() -> &'static Regex {
    static FAULT_STRING: OnceLock<Regex> = OnceLock::new();
    FAULT_STRING.get_or_init(|| {
        Regex::new(r"(?s)<(?:[\w.-]+:)?(?:faultstring|Text)[^>]*>(.*?)</").expect("faultstring pattern is valid")
    })
}

pub(super) fn prepare(request: &mut TransportRequest, operation: &Operation, invocation: &Invocation) {
    request.method = "POST".to_string();

    let action = invocation
        .soap_action
        .clone()
        .unwrap_or_else(|| operation.path_pattern().to_string());
    request.headers.retain(|h| !h.name.eq_ignore_ascii_case("SOAPAction"));
    request.headers.push(Header::new("SOAPAction", [format!("\"{}\"", action)]));

    if !request.headers.iter().any(|h| h.name.eq_ignore_ascii_case("content-type")) {
        request.headers.push(Header::new("Content-Type", [SOAP_CONTENT_TYPE]));
    }
}

pub(super) fn classify(response: &TransportResponse) -> TestCode {
    if fault_regex().is_match(&response.body) {
        return TestCode::Failure;
    }
    super::classify_by_status(response)
}

pub(super) fn describe(response: &TransportResponse) -> String {
    if fault_regex().is_match(&response.body) {
        let reason = fault_string_regex()
            .captures(&response.body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        return format!("SOAP Fault ({}): {}", response.status, reason);
    }
    response.status.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::find_header;

    const FAULT: &str = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <soapenv:Fault>
      <faultcode>soapenv:Server</faultcode>
      <faultstring>Unknown customer</faultstring>
    </soapenv:Fault>
  </soapenv:Body>
</soapenv:Envelope>"#;

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            body: body.to_string(),
            ..TransportResponse::default()
        }
    }

    #[test]
    fn test_fault_is_failure_even_with_200() {
        assert_eq!(classify(&response(200, FAULT)), TestCode::Failure);
        assert_eq!(describe(&response(200, FAULT)), "SOAP Fault (200): Unknown customer");
    }

    #[test]
    fn test_plain_envelope_uses_status() {
        let ok = "<Envelope><Body><sayHelloResponse/></Body></Envelope>";
        assert_eq!(classify(&response(200, ok)), TestCode::Success);
        assert_eq!(classify(&response(500, ok)), TestCode::Failure);
        assert_eq!(describe(&response(200, ok)), "200");
        // A FaultDetail-like element name is not a fault.
        assert_eq!(classify(&response(200, "<FaultyWidget/>")), TestCode::Success);
    }

    #[test]
    fn test_prepare_sets_action_and_content_type() {
        let mut request = TransportRequest {
            method: "GET".to_string(),
            url: "http://x/ws".to_string(),
            headers: vec![Header::new("soapaction", ["old"])],
            body: Some("<Envelope/>".to_string()),
        };
        prepare(&mut request, &Operation::new("", "sayHello"), &Invocation::default());

        assert_eq!(request.method, "POST");
        assert_eq!(find_header(&request.headers, "SOAPAction").unwrap().joined(), "\"sayHello\"");
        assert_eq!(
            find_header(&request.headers, "content-type").unwrap().joined(),
            SOAP_CONTENT_TYPE
        );

        prepare(&mut request, &Operation::new("", "sayHello"), &Invocation::soap("urn:hello"));
        assert_eq!(find_header(&request.headers, "soapaction").unwrap().joined(), "\"urn:hello\"");
    }
}
