//! OpenAPI 3.x importer.
//!
//! Each `(verb, path)` pair becomes an operation. Named examples found on
//! parameters, request bodies and responses are aligned by name into
//! request/response exchanges.

use super::{
    payload_text, ImportError, ImportOutcome, NodeExt, ReferenceResolver, SpecImporter, Warnings,
};
use crate::config::{DocumentFormat, ImporterSettings};
use crate::importer::Dialect;
use crate::model::{
    DispatcherKind, Exchange, Header, Operation, Parameter, Request, Response, Service,
    ServiceType,
};
use crate::uri;
use serde_json::Value;
use tracing::{debug, info};

const VERBS: [&str; 8] = ["get", "put", "post", "delete", "patch", "head", "options", "trace"];

/// Importer for OpenAPI 3 documents (JSON or YAML).
pub struct OpenApiImporter {
    settings: ImporterSettings,
}

impl OpenApiImporter {
    pub fn new(settings: ImporterSettings) -> Self {
        Self { settings }
    }
}

impl SpecImporter for OpenApiImporter {
    fn dialect(&self) -> Dialect {
        Dialect::OpenApi
    }

    fn settings(&self) -> &ImporterSettings {
        &self.settings
    }

    fn import_tree(&self, spec: &Value) -> Result<ImportOutcome, ImportError> {
        let title = spec.path("info").path("title").as_text();
        if title.trim().is_empty() {
            return Err(ImportError::SpecParse {
                format: DocumentFormat::Yaml,
                message: "OpenAPI document has no info.title".to_string(),
            });
        }
        let version = spec.path("info").path("version").as_text();

        let mut service = Service::new(title.trim(), version.trim(), ServiceType::Rest);
        let mut warnings = Warnings::default();
        let resolver = ReferenceResolver::new(spec, self.settings.max_reference_depth);

        for (path, path_item) in spec.path("paths").fields() {
            let path_item = match resolver.resolve(path_item, "$ref") {
                Ok(item) => item,
                Err(e) => {
                    warnings.reference(path.as_str(), &e);
                    continue;
                }
            };
            let shared = resolve_parameters(&resolver, path, path_item.path("parameters"), &mut warnings);

            for (verb, node) in path_item.fields() {
                if !VERBS.contains(&verb.as_str()) {
                    continue;
                }
                let mut params = shared.clone();
                let own = resolve_parameters(&resolver, path, node.path("parameters"), &mut warnings);
                for param in own {
                    // Operation level parameters override path level ones.
                    params.retain(|p| !(p.name == param.name && p.location == param.location));
                    params.push(param);
                }

                let operation = build_operation(&resolver, path, verb, node, &params, &mut warnings);
                let name = operation.name.clone();
                if !service.add_operation(operation) {
                    warnings.partial(name, "duplicate operation name");
                }
            }
        }

        info!(
            service = %service.name,
            version = %service.version,
            operations = service.operations.len(),
            "OpenAPI service imported"
        );

        Ok(ImportOutcome {
            services: vec![service],
            warnings: warnings.into_vec(),
        })
    }
}

/// A declared parameter with its resolved node.
#[derive(Clone)]
struct ParamDecl<'a> {
    name: String,
    location: String,
    node: &'a Value,
}

fn resolve_parameters<'a>(
    resolver: &ReferenceResolver<'a>,
    unit: &str,
    parameters: &'a Value,
    warnings: &mut Warnings,
) -> Vec<ParamDecl<'a>> {
    let mut decls = Vec::new();
    for param in parameters.elements() {
        match resolver.resolve(param, "$ref") {
            Ok(node) => {
                let name = node.path("name").as_text();
                if name.is_empty() {
                    warnings.partial(unit, "parameter without a name");
                    continue;
                }
                decls.push(ParamDecl {
                    name,
                    location: node.path("in").as_text(),
                    node,
                });
            }
            Err(e) => warnings.reference(format!("{}#parameters", unit), &e),
        }
    }
    decls
}

fn build_operation<'a>(
    resolver: &ReferenceResolver<'a>,
    path: &str,
    verb: &str,
    node: &'a Value,
    params: &[ParamDecl<'a>],
    warnings: &mut Warnings,
) -> Operation {
    let mut operation = Operation::new(verb, path);

    let path_names: Vec<&str> = params
        .iter()
        .filter(|p| p.location == "path")
        .map(|p| p.name.as_str())
        .collect();
    let query_names: Vec<&str> = params
        .iter()
        .filter(|p| p.location == "query")
        .map(|p| p.name.as_str())
        .collect();

    let (dispatcher, rules) = match (path_names.is_empty(), query_names.is_empty()) {
        (false, true) => (DispatcherKind::UriParts, Some(path_names.join(" && "))),
        (true, false) => (DispatcherKind::QueryArgs, Some(query_names.join(" && "))),
        (false, false) => {
            let all: Vec<&str> = path_names.iter().chain(query_names.iter()).copied().collect();
            (DispatcherKind::UriParams, Some(all.join(" && ")))
        }
        (true, true) => (DispatcherKind::None, None),
    };
    operation.dispatcher = dispatcher;
    operation.dispatcher_rules = rules;

    if !uri::has_variables(path) {
        operation.add_resource_path(path.trim());
    }

    apply_dispatch_extension(&mut operation, node.path("x-dispatch"), warnings);

    // Responses define which exchanges exist; requests are attached by name.
    for (code, response) in node.path("responses").fields() {
        let response = match resolver.resolve(response, "$ref") {
            Ok(r) => r,
            Err(e) => {
                warnings.reference(format!("{}#responses.{}", operation.name, code), &e);
                continue;
            }
        };

        for (media_type, content) in response.path("content").fields() {
            for (example_name, example) in content.path("examples").fields() {
                let unit = format!("{}#{}", operation.name, example_name);
                if operation.exchange(example_name).is_some() {
                    warnings.partial(unit, "example name already used by another response");
                    continue;
                }
                let Some(body) = example_value(resolver, &unit, example, warnings) else {
                    continue;
                };

                let recorded = Response {
                    name: example_name.clone(),
                    status: Some(code.clone()),
                    content: Some(payload_text(body)),
                    media_type: Some(media_type.clone()),
                    headers: response_headers(resolver, &unit, response, example_name, warnings),
                };
                let request = build_request(resolver, &unit, node, params, example_name, warnings);
                operation.exchanges.push(Exchange::RequestResponse {
                    request,
                    response: recorded,
                });
            }
        }
    }

    for (_, content) in node.path("requestBody").path("content").fields() {
        for (example_name, _) in content.path("examples").fields() {
            if operation.exchange(example_name).is_none() {
                warnings.partial(
                    format!("{}#{}", operation.name, example_name),
                    "request example has no matching response example",
                );
            }
        }
    }

    if let Some(fallback) = &operation.fallback {
        if operation.exchange(fallback).is_none() {
            warnings.partial(
                format!("{}#x-dispatch", operation.name),
                format!("fallback '{}' names no example", fallback),
            );
        }
    }

    debug!(
        operation = %operation.name,
        dispatcher = ?operation.dispatcher,
        exchanges = operation.exchanges.len(),
        "Operation built"
    );
    operation
}

/// `x-dispatch: {dispatcher, rule, fallback}`
fn apply_dispatch_extension(operation: &mut Operation, ext: &Value, warnings: &mut Warnings) {
    if ext.is_null() {
        return;
    }
    if let Some(kind) = ext.get("dispatcher").and_then(Value::as_str) {
        match DispatcherKind::parse(kind) {
            Some(kind) => operation.dispatcher = kind,
            None => {
                warnings.partial(
                    format!("{}#x-dispatch", operation.name),
                    format!("unknown dispatcher '{}'", kind),
                );
                return;
            }
        }
    }
    if let Some(rule) = ext.get("rule").and_then(Value::as_str) {
        operation.dispatcher_rules = Some(rule.to_string());
    }
    if let Some(fallback) = ext.get("fallback").and_then(Value::as_str) {
        operation.fallback = Some(fallback.to_string());
    }
}

/// The `value` of a (possibly referenced) example object.
fn example_value<'a>(
    resolver: &ReferenceResolver<'a>,
    unit: &str,
    example: &'a Value,
    warnings: &mut Warnings,
) -> Option<&'a Value> {
    match resolver.resolve(example, "$ref") {
        Ok(resolved) => match resolved.get("value") {
            Some(value) => Some(value),
            None => {
                warnings.partial(unit, "example has no value");
                None
            }
        },
        Err(e) => {
            warnings.reference(unit, &e);
            None
        }
    }
}

fn build_request<'a>(
    resolver: &ReferenceResolver<'a>,
    unit: &str,
    node: &'a Value,
    params: &[ParamDecl<'a>],
    example_name: &str,
    warnings: &mut Warnings,
) -> Request {
    let mut request = Request {
        name: example_name.to_string(),
        ..Request::default()
    };

    for (media_type, content) in node.path("requestBody").path("content").fields() {
        let Some(example) = content.path("examples").get(example_name) else {
            continue;
        };
        if let Some(body) = example_value(resolver, unit, example, warnings) {
            request.content = Some(payload_text(body));
            request.media_type = Some(media_type.clone());
            break;
        }
    }

    for param in params {
        let Some(example) = param.node.path("examples").get(example_name) else {
            continue;
        };
        let Some(value) = example_value(resolver, unit, example, warnings) else {
            continue;
        };
        match param.location.as_str() {
            "header" => request.headers.push(Header::from_csv(param.name.clone(), &value.as_text())),
            "path" | "query" => request.parameters.push(Parameter::new(param.name.clone(), value.as_text())),
            _ => {}
        }
    }
    request
}

fn response_headers<'a>(
    resolver: &ReferenceResolver<'a>,
    unit: &str,
    response: &'a Value,
    example_name: &str,
    warnings: &mut Warnings,
) -> Vec<Header> {
    let mut headers = Vec::new();
    for (name, header) in response.path("headers").fields() {
        let header = match resolver.resolve(header, "$ref") {
            Ok(h) => h,
            Err(e) => {
                warnings.reference(format!("{}#headers.{}", unit, name), &e);
                continue;
            }
        };
        let Some(example) = header.path("examples").get(example_name) else {
            continue;
        };
        if let Some(value) = example_value(resolver, unit, example, warnings) {
            headers.push(Header::from_csv(name.clone(), &value.as_text()));
        }
    }
    headers
}
