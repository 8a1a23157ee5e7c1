//! AsyncAPI 2.x importer.
//!
//! Channels and their `subscribe`/`publish` verbs become operations; message
//! examples become unidirectional event exchanges; protocol bindings found at
//! the channel/operation level and at the message level are merged into the
//! operation's bindings.

use super::{
    payload_text, ImportError, ImportOutcome, NodeExt, ReferenceError, ReferenceResolver,
    SpecImporter, Warnings,
};
use crate::config::{DocumentFormat, ImporterSettings};
use crate::importer::Dialect;
use crate::model::{
    BindingScope, BindingType, DispatcherKind, EventMessage, Exchange, Header, Operation,
    Parameter, Service, ServiceType,
};
use crate::uri;
use serde_json::Value;
use tracing::{debug, info};

const VALID_VERBS: [&str; 2] = ["subscribe", "publish"];

/// Keys identifying an example written in the AsyncAPI 2.x object form
/// (`- name: x, payload: ...`) rather than the named map form (`- x: {payload: ...}`).
const EXAMPLE_OBJECT_KEYS: [&str; 5] = ["payload", "$payloadRef", "headers", "name", "summary"];

/// Importer for AsyncAPI documents (JSON or YAML).
pub struct AsyncApiImporter {
    settings: ImporterSettings,
}

impl AsyncApiImporter {
    pub fn new(settings: ImporterSettings) -> Self {
        Self { settings }
    }
}

impl SpecImporter for AsyncApiImporter {
    fn dialect(&self) -> Dialect {
        Dialect::AsyncApi
    }

    fn settings(&self) -> &ImporterSettings {
        &self.settings
    }

    fn import_tree(&self, spec: &Value) -> Result<ImportOutcome, ImportError> {
        let title = spec.path("info").path("title").as_text();
        if title.trim().is_empty() {
            return Err(ImportError::SpecParse {
                format: DocumentFormat::Yaml,
                message: "AsyncAPI document has no info.title".to_string(),
            });
        }
        let version = spec.path("info").path("version").as_text();

        let mut service = Service::new(title.trim(), version.trim(), ServiceType::Event);
        let mut warnings = Warnings::default();
        let ctx = DocumentContext {
            resolver: ReferenceResolver::new(spec, self.settings.max_reference_depth),
            default_content_type: spec
                .path("defaultContentType")
                .as_str()
                .unwrap_or(&self.settings.default_content_type)
                .to_string(),
        };

        for (channel_name, channel) in spec.path("channels").fields() {
            if !channel.is_object() {
                warnings.partial(channel_name.as_str(), "channel is not an object");
                continue;
            }

            for (verb, verb_node) in channel.fields() {
                // Only deal with real verbs; parameters, description... are not operations.
                if !VALID_VERBS.contains(&verb.as_str()) {
                    continue;
                }

                let operation = build_operation(&ctx, channel_name, channel, verb, verb_node, &mut warnings);
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
            "AsyncAPI service imported"
        );

        Ok(ImportOutcome {
            services: vec![service],
            warnings: warnings.into_vec(),
        })
    }
}

struct DocumentContext<'a> {
    resolver: ReferenceResolver<'a>,
    default_content_type: String,
}

fn build_operation<'a>(
    ctx: &DocumentContext<'a>,
    channel_name: &str,
    channel: &'a Value,
    verb: &str,
    verb_node: &'a Value,
    warnings: &mut Warnings,
) -> Operation {
    let mut operation = Operation::new(verb, channel_name);

    if uri::has_variables(channel_name) {
        operation.dispatcher = DispatcherKind::UriParts;
        let declared: Vec<String> = channel
            .path("parameters")
            .fields()
            .map(|(name, _)| name.clone())
            .collect();
        let names = if declared.is_empty() {
            uri::variable_names(channel_name)
        } else {
            declared
        };
        operation.dispatcher_rules = Some(names.join(" && "));
    } else {
        operation.add_resource_path(channel_name.trim());
    }

    // Channel/operation level bindings first: message level ones refine them.
    for bindings in [verb_node.path("bindings"), channel.path("bindings")] {
        merge_bindings(&mut operation, bindings, BindingScope::Operation, warnings);
    }

    let message = match ctx.resolver.resolve(verb_node.path("message"), "$ref") {
        Ok(message) => message,
        Err(e) => {
            warnings.reference(format!("{}#message", operation.name), &e);
            return operation;
        }
    };

    for message in flatten_messages(ctx, &operation.name, message, warnings) {
        let content_type = message
            .path("contentType")
            .as_str()
            .unwrap_or(&ctx.default_content_type)
            .to_string();

        for (index, entry) in message.path("examples").elements().enumerate() {
            for (example_name, example) in named_examples(message, index, entry) {
                let unit = format!("{}#{}", operation.name, example_name);
                match extract_example(ctx, &unit, example, warnings) {
                    Ok(Some((content, headers, parameters))) => {
                        operation.exchanges.push(Exchange::Event {
                            message: EventMessage {
                                name: example_name,
                                content: Some(content),
                                media_type: Some(content_type.clone()),
                                headers,
                                parameters,
                            },
                        });
                    }
                    Ok(None) => warnings.partial(unit, "example has no payload"),
                    Err(e) => warnings.reference(unit, &e),
                }
            }
        }

        merge_bindings(&mut operation, message.path("bindings"), BindingScope::Message, warnings);
    }

    debug!(
        operation = %operation.name,
        exchanges = operation.exchanges.len(),
        bindings = operation.bindings.len(),
        "Operation built"
    );
    operation
}

/// A message may be a `oneOf` list of (possibly referenced) messages.
fn flatten_messages<'a>(
    ctx: &DocumentContext<'a>,
    operation: &str,
    message: &'a Value,
    warnings: &mut Warnings,
) -> Vec<&'a Value> {
    if !message.has("oneOf") {
        return vec![message];
    }
    message
        .path("oneOf")
        .elements()
        .filter_map(|candidate| match ctx.resolver.resolve(candidate, "$ref") {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                warnings.reference(format!("{}#oneOf", operation), &e);
                None
            }
        })
        .collect()
}

/// Expand one `examples` array entry into `(name, example)` pairs.
fn named_examples<'a>(message: &Value, index: usize, entry: &'a Value) -> Vec<(String, &'a Value)> {
    let object_form = entry
        .fields()
        .any(|(key, _)| EXAMPLE_OBJECT_KEYS.contains(&key.as_str()));

    if object_form {
        let name = entry
            .path("name")
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| {
                let base = message.path("name").as_str().unwrap_or("example");
                format!("{}-{}", base, index + 1)
            });
        vec![(name, entry)]
    } else {
        entry.fields().map(|(name, ex)| (name.clone(), ex)).collect()
    }
}

type ExtractedExample = (String, Vec<Header>, Vec<Parameter>);

fn extract_example<'a>(
    ctx: &DocumentContext<'a>,
    unit: &str,
    example: &'a Value,
    warnings: &mut Warnings,
) -> Result<Option<ExtractedExample>, ReferenceError> {
    let payload = match example_payload(ctx, example)? {
        Some(payload) => payload_text(payload),
        None => return Ok(None),
    };
    let headers = example_headers(unit, example, warnings);
    let parameters = example
        .path("parameters")
        .fields()
        .map(|(name, value)| Parameter::new(name.clone(), value.as_text()))
        .collect();
    Ok(Some((payload, headers, parameters)))
}

/// Inline `payload`, or the payload found by following `$payloadRef`.
fn example_payload<'a>(
    ctx: &DocumentContext<'a>,
    example: &'a Value,
) -> Result<Option<&'a Value>, ReferenceError> {
    if let Some(payload) = example.get("payload") {
        return Ok(Some(payload));
    }
    if !example.has("$payloadRef") {
        return Ok(None);
    }

    let target = ctx.resolver.resolve(example, "$payloadRef")?;
    if let Some(payload) = target.get("payload") {
        return Ok(Some(payload));
    }
    if let Some(value) = target.get("value") {
        return Ok(Some(value));
    }
    Ok(Some(target))
}

/// Headers declared as a map, or as a string holding a JSON object.
fn example_headers(unit: &str, example: &Value, warnings: &mut Warnings) -> Vec<Header> {
    let parsed;
    let headers = match example.path("headers") {
        Value::Null => return Vec::new(),
        node @ Value::Object(_) => node,
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(node @ Value::Object(_)) => {
                parsed = node;
                &parsed
            }
            _ => {
                warnings.partial(
                    format!("{}#headers", unit),
                    format!("headers value '{}' is a string but not a JSON object", raw),
                );
                return Vec::new();
            }
        },
        _ => {
            warnings.partial(format!("{}#headers", unit), "headers is neither a map nor a string");
            return Vec::new();
        }
    };

    headers
        .fields()
        .map(|(name, value)| Header::from_csv(name.clone(), &value.as_text()))
        .collect()
}

fn merge_bindings(
    operation: &mut Operation,
    bindings: &Value,
    scope: BindingScope,
    warnings: &mut Warnings,
) {
    for (key, binding) in bindings.fields() {
        match BindingType::from_key(key) {
            Some(binding_type) => {
                let attributes = flatten_binding(binding);
                operation.binding_mut(binding_type).merge(attributes, scope);
            }
            None => warnings.partial(
                format!("{}#bindings.{}", operation.name, key),
                "unsupported binding type",
            ),
        }
    }
}

/// Flatten binding attributes: scalars as-is, nested scalar fields as
/// `<parent><Child>` (`key.type` becomes `keyType`), arrays as CSV.
fn flatten_binding(binding: &Value) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    for (key, value) in binding.fields() {
        if key == "bindingVersion" {
            continue;
        }
        match value {
            Value::Null => {}
            Value::Object(_) => {
                for (child, child_value) in value.fields() {
                    if is_scalar(child_value) {
                        attributes.push((format!("{}{}", key, capitalize(child)), child_value.as_text()));
                    }
                }
            }
            Value::Array(items) => {
                let joined: Vec<String> = items.iter().filter(|v| is_scalar(v)).map(|v| v.as_text()).collect();
                attributes.push((key.clone(), joined.join(",")));
            }
            scalar => attributes.push((key.clone(), scalar.as_text())),
        }
    }
    attributes
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
